use std::{
    fmt,
    io::{self, ErrorKind as IoErrorKind, Write},
    str::FromStr,
};

use bitflags::bitflags;

use crate::{
    FsStatError,
    filesystems::{FS_PROBES, FsInfo},
    image::Image,
    probe::{Magic, Probe},
    util::{Endianness, to_hex},
    volume::{PartitionRef, VolumeSystem},
};

/// Marker stored in every populated descriptor.
pub const FS_TAG: u32 = 0x10101010;

bitflags! {
    /// Filesystem type codes.
    ///
    /// Single bits name a concrete filesystem, `FAT_DETECT` and `EXT_DETECT`
    /// are the auto-detecting families.
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct FsType: u32 {
        const NTFS = 0x0001;
        const FAT12 = 0x0002;
        const FAT16 = 0x0004;
        const FAT32 = 0x0008;
        const EXT2 = 0x0080;
        const EXT3 = 0x0100;
        const SWAP = 0x0200;
        const RAW = 0x0400;
        const HFS = 0x1000;
        const EXT4 = 0x2000;
        const EXFAT = 0x8000;

        const FAT_DETECT = Self::FAT12.bits()
            | Self::FAT16.bits()
            | Self::FAT32.bits()
            | Self::EXFAT.bits();
        const EXT_DETECT = Self::EXT2.bits() | Self::EXT3.bits() | Self::EXT4.bits();
    }
}

/// One line of the supported type catalogue.
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub struct FsTypeEntry {
    pub name: &'static str,
    pub code: FsType,
    pub comment: &'static str,
}

const fn entry(name: &'static str, code: FsType, comment: &'static str) -> FsTypeEntry {
    return FsTypeEntry {
        name,
        code,
        comment,
    };
}

/// Supported filesystem types, in listing order.
pub const FS_TYPES: &[FsTypeEntry] = &[
    entry("ntfs", FsType::NTFS, "NTFS"),
    entry("fat", FsType::FAT_DETECT, "FAT (Auto Detection)"),
    entry("ext", FsType::EXT_DETECT, "ExtX (Auto Detection)"),
    entry("hfs", FsType::HFS, "HFS+"),
    entry("raw", FsType::RAW, "Raw Data"),
    entry("swap", FsType::SWAP, "Swap Space"),
    entry("fat12", FsType::FAT12, "FAT12"),
    entry("fat16", FsType::FAT16, "FAT16"),
    entry("fat32", FsType::FAT32, "FAT32"),
    entry("exfat", FsType::EXFAT, "exFAT"),
    entry("ext2", FsType::EXT2, "Ext2"),
    entry("ext3", FsType::EXT3, "Ext3"),
    entry("ext4", FsType::EXT4, "Ext4"),
];

impl FsType {
    fn catalogue_entry(&self) -> Option<&'static FsTypeEntry> {
        if let Some(found) = FS_TYPES.iter().find(|e| e.code == *self) {
            return Some(found);
        }
        return FS_TYPES.iter().find(|e| e.code.intersects(*self));
    }

    /// Short name, e.g. `"hfs"`. Exact catalogue matches win over families.
    pub fn name(&self) -> &'static str {
        return self.catalogue_entry().map_or("unsupported", |e| e.name);
    }

    pub fn comment(&self) -> &'static str {
        return self.catalogue_entry().map_or("Unsupported", |e| e.comment);
    }

    /// Reverse of [`FsType::name`], case insensitive.
    pub fn from_short_name(name: &str) -> Option<FsType> {
        return FS_TYPES
            .iter()
            .find(|e| e.name.eq_ignore_ascii_case(name))
            .map(|e| e.code);
    }
}

impl fmt::Display for FsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// Lists every supported filesystem type, one `\t<name> (<comment>)` line each.
pub fn type_print() -> String {
    let mut out = String::from("Supported file system types:\n");
    for fs_type in FS_TYPES {
        out.push_str(&format!("\t{} ({})\n", fs_type.name, fs_type.comment));
    }
    return out;
}

bitflags! {
    /// General properties of a recognised filesystem.
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct FsFlags: u32 {
        /// Metadata entries carry sequence numbers.
        const HAVE_SEQ = 0x01;
        /// Timestamps carry nanoseconds.
        const HAVE_NANOSEC = 0x02;
    }
}

bitflags! {
    /// Optional attribute groups available in this build.
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Hash)]
    pub struct Capabilities: u32 {
        /// `block_pre_size` and `block_post_size`.
        const BLOCK_PRE_POST = 1 << 0;
        /// `is_orphan_hunting`.
        const ORPHAN_HUNTING = 1 << 1;
    }
}

impl Capabilities {
    /// Capabilities selected by crate features at build time.
    pub fn linked() -> Capabilities {
        let mut caps = Capabilities::empty();

        if cfg!(feature = "block-pre-post") {
            caps |= Capabilities::BLOCK_PRE_POST;
        }
        if cfg!(feature = "orphan-hunting") {
            caps |= Capabilities::ORPHAN_HUNTING;
        }

        return caps;
    }
}

/// Attributes whose presence depends on [`Capabilities`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum GatedAttr {
    BlockPreSize,
    BlockPostSize,
    IsOrphanHunting,
}

impl GatedAttr {
    pub fn required(&self) -> Capabilities {
        match self {
            Self::BlockPreSize | Self::BlockPostSize => Capabilities::BLOCK_PRE_POST,
            Self::IsOrphanHunting => Capabilities::ORPHAN_HUNTING,
        }
    }
}

#[derive(Debug, Copy, Clone, Default, Eq, PartialEq)]
pub struct FsOptions {
    /// Raw [`FsType`] bits; `0` auto-detects.
    pub type_flag: u32,
}

impl FsOptions {
    pub fn with_type(fs_type: FsType) -> FsOptions {
        return FsOptions {
            type_flag: fs_type.bits(),
        };
    }
}

/// What a [`FileSystem`] is opened on.
#[derive(Debug, Copy, Clone)]
pub enum FsSource<'a> {
    Image(&'a Image),
    Volume(&'a VolumeSystem<'a>),
    Partition(PartitionRef<'a>),
}

impl<'a> FsSource<'a> {
    pub fn image(&self) -> &'a Image {
        match *self {
            Self::Image(image) => return image,
            Self::Volume(vs) => return vs.image(),
            Self::Partition(part) => return part.image(),
        }
    }
}

impl<'a> From<&'a Image> for FsSource<'a> {
    fn from(image: &'a Image) -> Self {
        FsSource::Image(image)
    }
}

impl<'a> From<&'a VolumeSystem<'a>> for FsSource<'a> {
    fn from(vs: &'a VolumeSystem<'a>) -> Self {
        FsSource::Volume(vs)
    }
}

impl<'a> From<PartitionRef<'a>> for FsSource<'a> {
    fn from(part: PartitionRef<'a>) -> Self {
        FsSource::Partition(part)
    }
}

/// Textual form of an [`FsSource`]: `image`, `volume` or `part:N`.
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum SourceSelector {
    Image,
    Volume,
    Partition(usize),
}

impl FromStr for SourceSelector {
    type Err = FsStatError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "image" => return Ok(Self::Image),
            "volume" => return Ok(Self::Volume),
            _ => (),
        }

        match s.strip_prefix("part:").map(str::parse::<usize>) {
            Some(Ok(index)) => return Ok(Self::Partition(index)),
            _ => return Err(FsStatError::InvalidSource(s.to_string())),
        }
    }
}

impl fmt::Display for SourceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Image => write!(f, "image"),
            Self::Volume => write!(f, "volume"),
            Self::Partition(index) => write!(f, "part:{index}"),
        }
    }
}

impl SourceSelector {
    /// Turn the selector into a source.
    ///
    /// # Errors
    /// Returns [`FsStatError::InvalidSource`] if the selector needs a volume
    /// system and none is given, or if the partition index is out of range.
    pub fn resolve<'a>(
        &self,
        image: &'a Image,
        volume: Option<&'a VolumeSystem<'a>>,
    ) -> Result<FsSource<'a>, FsStatError> {
        match self {
            Self::Image => return Ok(FsSource::Image(image)),
            Self::Volume => {
                return volume
                    .map(FsSource::Volume)
                    .ok_or_else(|| FsStatError::InvalidSource(self.to_string()));
            }
            Self::Partition(index) => {
                return volume
                    .and_then(|vs| vs.part(*index))
                    .map(FsSource::Partition)
                    .ok_or_else(|| FsStatError::InvalidSource(self.to_string()));
            }
        }
    }
}

/// Outcome of opening a [`FileSystem`].
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum FsState {
    Found(FsInfo),
    NotFound,
    /// A volume system with several allocated partitions; the candidates
    /// are partition indexes. Nothing was probed.
    Ambiguous { candidates: Vec<usize> },
}

fn probe_window(probe: &Probe, type_flag: FsType) -> Result<FsState, FsStatError> {
    for info in FS_PROBES {
        if type_flag.is_empty() {
            if !info.auto {
                continue;
            }
        } else if !type_flag.intersects(info.ftype) {
            continue;
        }

        let magic = match probe.get_magic(info.magics) {
            Ok(magic) => magic.unwrap_or(Magic::EMPTY_MAGIC),
            Err(e) if e.kind() == IoErrorKind::NotFound => {
                log::debug!("FileSystem::open - NO MAGIC: \"{}\"", info.name);
                continue;
            }
            Err(e) => return Err(e.into()),
        };

        match (info.probe_fn)(probe, magic) {
            Ok(fs) => {
                if !type_flag.is_empty() && !type_flag.intersects(fs.ftype) {
                    log::debug!(
                        "FileSystem::open - REJECTED: \"{}\" is outside of the requested {type_flag:?}",
                        fs.ftype.name()
                    );
                    continue;
                }

                log::debug!(
                    "FileSystem::open - FOUND: \"{}\" at offset {}",
                    fs.ftype.name(),
                    fs.offset
                );
                return Ok(FsState::Found(fs));
            }
            Err(e) => {
                log::debug!("FileSystem::open - REJECTED: \"{}\", Error: {e}", info.name);
                continue;
            }
        }
    }

    return Ok(FsState::NotFound);
}

fn partition_window<'a>(part: PartitionRef<'a>) -> Probe<'a> {
    return Probe::new(part.image(), part.start(), part.len());
}

/// Filesystem metadata read from an image, a volume system or a partition.
///
/// Every accessor returns `None` unless a filesystem was found, see
/// [`FileSystem::state`].
#[derive(Debug)]
pub struct FileSystem<'a> {
    parent: FsSource<'a>,
    state: FsState,
    capabilities: Capabilities,
}

impl<'a> FileSystem<'a> {
    /// Locate and parse a filesystem in `source`.
    ///
    /// Not finding a filesystem is not an error, the descriptor is then in
    /// the [`FsState::NotFound`] state.
    ///
    /// # Errors
    /// Returns [`FsStatError::InvalidTypeFlag`] for unknown type bits, or
    /// [`FsStatError::IoError`] if the image cannot be read.
    pub fn open<S>(source: S, options: FsOptions) -> Result<FileSystem<'a>, FsStatError>
    where
        S: Into<FsSource<'a>>,
    {
        return FileSystem::open_with_capabilities(source.into(), options, Capabilities::linked());
    }

    pub(crate) fn open_with_capabilities(
        parent: FsSource<'a>,
        options: FsOptions,
        capabilities: Capabilities,
    ) -> Result<FileSystem<'a>, FsStatError> {
        let type_flag = FsType::from_bits(options.type_flag)
            .ok_or(FsStatError::InvalidTypeFlag(options.type_flag))?;

        let state = match parent {
            FsSource::Image(image) => probe_window(&Probe::whole(image), type_flag)?,
            FsSource::Partition(part) => probe_window(&partition_window(part), type_flag)?,
            FsSource::Volume(vs) => {
                let allocated: Vec<PartitionRef<'a>> = vs.allocated().collect();

                match allocated.as_slice() {
                    [] => {
                        log::debug!("FileSystem::open - volume system has no allocated partition");
                        FsState::NotFound
                    }
                    [part] => probe_window(&partition_window(*part), type_flag)?,
                    parts => {
                        let candidates: Vec<usize> = parts.iter().map(|p| p.index()).collect();
                        log::debug!("FileSystem::open - AMBIGUOUS: partitions {candidates:?}");
                        FsState::Ambiguous { candidates }
                    }
                }
            }
        };

        return Ok(FileSystem {
            parent,
            state,
            capabilities,
        });
    }

    pub fn parent(&self) -> FsSource<'a> {
        return self.parent;
    }

    pub fn state(&self) -> &FsState {
        return &self.state;
    }

    pub fn is_found(&self) -> bool {
        return matches!(self.state, FsState::Found(_));
    }

    pub fn info(&self) -> Option<&FsInfo> {
        match &self.state {
            FsState::Found(info) => return Some(info),
            _ => return None,
        }
    }

    pub fn capabilities(&self) -> Capabilities {
        return self.capabilities;
    }

    pub fn supports(&self, attr: GatedAttr) -> bool {
        return self.capabilities.contains(attr.required());
    }

    fn gated<T>(&self, attr: GatedAttr, value: T) -> Option<T> {
        if self.supports(attr) {
            return self.info().map(|_| value);
        }
        return None;
    }

    pub fn ftype(&self) -> Option<FsType> {
        return self.info().map(|i| i.ftype);
    }

    /// Short type name, e.g. `"hfs"`.
    pub fn description(&self) -> Option<&'static str> {
        return self.ftype().map(|t| t.name());
    }

    pub fn system_name(&self) -> Option<&'static str> {
        return self.description();
    }

    /// Byte offset of the filesystem in the image.
    pub fn offset(&self) -> Option<u64> {
        return self.info().map(|i| i.offset);
    }

    pub fn block_size(&self) -> Option<u32> {
        return self.info().map(|i| i.block_size);
    }

    pub fn block_count(&self) -> Option<u64> {
        return self.info().map(|i| i.block_count);
    }

    pub fn first_block(&self) -> Option<u64> {
        return self.info().map(|i| i.first_block);
    }

    pub fn last_block(&self) -> Option<u64> {
        return self.info().map(|i| i.last_block());
    }

    /// Last block actually present in the image.
    pub fn last_block_act(&self) -> Option<u64> {
        return self.info().map(|i| i.last_block_act);
    }

    pub fn block_pre_size(&self) -> Option<u32> {
        return self.gated(GatedAttr::BlockPreSize, 0);
    }

    pub fn block_post_size(&self) -> Option<u32> {
        return self.gated(GatedAttr::BlockPostSize, 0);
    }

    /// Size of the underlying device's addressing unit.
    pub fn dev_bsize(&self) -> Option<u32> {
        return self.info().map(|i| i.dev_bsize);
    }

    pub fn data_unit_name(&self) -> Option<&'static str> {
        return self.info().map(|i| i.data_unit_name);
    }

    pub fn endian(&self) -> Option<Endianness> {
        return self.info().map(|i| i.endian);
    }

    pub fn first_inum(&self) -> Option<u64> {
        return self.info().map(|i| i.first_inum);
    }

    pub fn last_inum(&self) -> Option<u64> {
        return self.info().map(|i| i.last_inum);
    }

    pub fn inum_count(&self) -> Option<u64> {
        return self.info().map(|i| i.inum_count);
    }

    pub fn root_inum(&self) -> Option<u64> {
        return self.info().map(|i| i.root_inum);
    }

    pub fn journ_inum(&self) -> Option<u64> {
        return self.info().map(|i| i.journ_inum);
    }

    /// Volume identifier as lower case hex, in on-disk byte order.
    pub fn fs_id(&self) -> Option<String> {
        return self.info().map(|i| to_hex(&i.fs_id));
    }

    pub fn fs_id_used(&self) -> Option<usize> {
        return self.fs_id().map(|id| id.len());
    }

    pub fn flags(&self) -> Option<FsFlags> {
        return self.info().map(|i| i.flags);
    }

    pub fn tag(&self) -> Option<u32> {
        return self.info().map(|_| FS_TAG);
    }

    pub fn is_orphan_hunting(&self) -> Option<bool> {
        return self.gated(GatedAttr::IsOrphanHunting, false);
    }

    pub fn label(&self) -> Option<&str> {
        return self.info().and_then(|i| i.label.as_deref());
    }

    /// Write a human readable summary of the descriptor.
    ///
    /// # Errors
    /// Returns any error of `out`.
    pub fn write_report<W: Write>(&self, out: &mut W) -> io::Result<()> {
        let info = match &self.state {
            FsState::Found(info) => info,
            FsState::NotFound => {
                writeln!(out, "No file system found")?;
                return Ok(());
            }
            FsState::Ambiguous { candidates } => {
                writeln!(
                    out,
                    "Ambiguous source: {} allocated partitions {candidates:?}, select one",
                    candidates.len()
                )?;
                return Ok(());
            }
        };

        writeln!(out, "FILE SYSTEM INFORMATION")?;
        writeln!(out, "--------------------------------------------")?;
        writeln!(out, "File System Type: {}", info.ftype.comment())?;
        if let Some(label) = &info.label {
            writeln!(out, "Volume Name: {label}")?;
        }
        if !info.fs_id.is_empty() {
            writeln!(out, "Volume ID: {}", to_hex(&info.fs_id))?;
        }
        writeln!(out, "Offset: {}", info.offset)?;
        writeln!(out, "Endian: {}", info.endian)?;
        writeln!(out)?;

        writeln!(out, "METADATA INFORMATION")?;
        writeln!(out, "--------------------------------------------")?;
        writeln!(out, "Range: {} - {}", info.first_inum, info.last_inum)?;
        writeln!(out, "Root Directory: {}", info.root_inum)?;
        if info.journ_inum != 0 {
            writeln!(out, "Journal Inode: {}", info.journ_inum)?;
        }
        writeln!(out)?;

        writeln!(out, "CONTENT INFORMATION")?;
        writeln!(out, "--------------------------------------------")?;
        writeln!(out, "{} Range: {} - {}", info.data_unit_name, info.first_block, info.last_block())?;
        if info.last_block_act != info.last_block() {
            writeln!(
                out,
                "Total Range in Image: {} - {}",
                info.first_block, info.last_block_act
            )?;
        }
        writeln!(out, "{} Size: {}", info.data_unit_name, info.block_size)?;
        writeln!(out, "Device Block Size: {}", info.dev_bsize)?;

        return Ok(());
    }
}

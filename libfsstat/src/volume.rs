use std::{fmt, io::ErrorKind as IoErrorKind};

use bitflags::bitflags;

use crate::{
    FsStatError,
    image::Image,
    partitions::{PT_PROBES, PartEntry, PartTable},
    probe::Probe,
    util::Endianness,
};

/// Partition table formats recognised by [`VolumeSystem::scan`].
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash)]
pub enum VsType {
    Dos,
    Gpt,
    Mac,
}

impl VsType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Dos => "dos",
            Self::Gpt => "gpt",
            Self::Mac => "mac",
        }
    }

    pub fn description(&self) -> &'static str {
        match self {
            Self::Dos => "DOS Partition Table",
            Self::Gpt => "GUID Partition Table (EFI)",
            Self::Mac => "Mac Partition Map",
        }
    }
}

impl fmt::Display for VsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.name())
    }
}

bitflags! {
    /// Allocation status of a [`Partition`].
    #[derive(Debug, Default, Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash)]
    pub struct PartFlags: u32 {
        /// Allocated partition holding data.
        const ALLOC = 1 << 0;
        /// Space not covered by any table entry, or marked free.
        const UNALLOC = 1 << 1;
        /// Space holding the partition table itself.
        const META = 1 << 2;
    }
}

/// One entry of a [`VolumeSystem`].
#[derive(Debug, Clone, Eq, PartialEq, Hash)]
pub struct Partition {
    index: usize,
    block_start: u64,
    block_len: u64,
    start: u64,
    len: u64,
    description: String,
    flags: PartFlags,
    slot: Option<u32>,
}

impl Partition {
    /// Position in [`VolumeSystem::parts`].
    #[inline]
    pub fn index(&self) -> usize {
        return self.index;
    }

    /// Byte offset of the partition from the start of the image.
    #[inline]
    pub fn start(&self) -> u64 {
        return self.start;
    }

    /// Length in bytes.
    #[inline]
    pub fn len(&self) -> u64 {
        return self.len;
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        return self.len == 0;
    }

    /// Start in partition table blocks.
    #[inline]
    pub fn block_start(&self) -> u64 {
        return self.block_start;
    }

    /// Length in partition table blocks.
    #[inline]
    pub fn block_len(&self) -> u64 {
        return self.block_len;
    }

    pub fn description(&self) -> &str {
        return &self.description;
    }

    #[inline]
    pub fn flags(&self) -> PartFlags {
        return self.flags;
    }

    /// Slot number of the entry inside its on-disk table, if it came from one.
    #[inline]
    pub fn slot(&self) -> Option<u32> {
        return self.slot;
    }

    #[inline]
    pub fn is_allocated(&self) -> bool {
        return self.flags.contains(PartFlags::ALLOC);
    }
}

/// A [`Partition`] together with the [`VolumeSystem`] it belongs to.
#[derive(Debug, Copy, Clone)]
pub struct PartitionRef<'a> {
    vs: &'a VolumeSystem<'a>,
    index: usize,
}

impl<'a> PartitionRef<'a> {
    pub fn volume(&self) -> &'a VolumeSystem<'a> {
        return self.vs;
    }

    pub fn partition(&self) -> &'a Partition {
        return &self.vs.parts[self.index];
    }

    pub fn image(&self) -> &'a Image {
        return self.vs.image;
    }

    #[inline]
    pub fn index(&self) -> usize {
        return self.index;
    }

    pub fn start(&self) -> u64 {
        return self.partition().start();
    }

    pub fn len(&self) -> u64 {
        return self.partition().len();
    }

    pub fn is_empty(&self) -> bool {
        return self.partition().is_empty();
    }

    pub fn description(&self) -> &'a str {
        return self.partition().description();
    }

    pub fn flags(&self) -> PartFlags {
        return self.partition().flags();
    }
}

fn push_part(
    parts: &mut Vec<Partition>,
    block_size: u64,
    start: u64,
    len: u64,
    description: String,
    flags: PartFlags,
    slot: Option<u32>,
) {
    let index = parts.len();
    parts.push(Partition {
        index,
        block_start: start,
        block_len: len,
        start: start * block_size,
        len: len * block_size,
        description,
        flags,
        slot,
    });
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
struct TableInfo {
    vs_type: VsType,
    block_size: u64,
    endian: Endianness,
}

/// The partition table of an [`Image`].
///
/// Partitions are sorted by start offset and never overlap. Space not
/// described by the table is reported as `Unallocated` entries so that the
/// partition list covers the whole image.
#[derive(Debug)]
pub struct VolumeSystem<'a> {
    image: &'a Image,
    table: Option<TableInfo>,
    parts: Vec<Partition>,
}

impl<'a> VolumeSystem<'a> {
    /// Scan `image` for a partition table.
    ///
    /// Tables are tried in order: GPT, DOS, Mac. An image without any
    /// recognised table yields a volume system in the "no partitions found"
    /// state, see [`VolumeSystem::is_found`].
    ///
    /// # Errors
    /// Returns [`FsStatError::IoError`] if the image cannot be read.
    pub fn scan(image: &'a Image) -> Result<VolumeSystem<'a>, FsStatError> {
        let probe = Probe::whole(image);

        for info in PT_PROBES {
            match probe.get_magic(info.magics) {
                Ok(_) => (),
                Err(e) if e.kind() == IoErrorKind::NotFound => {
                    log::debug!("VolumeSystem::scan - NO MAGIC: \"{}\"", info.name);
                    continue;
                }
                Err(e) => return Err(e.into()),
            }

            match (info.probe_fn)(&probe) {
                Ok(table) => {
                    log::debug!(
                        "VolumeSystem::scan - FOUND: \"{}\" ({}), ENTRIES: {}",
                        info.name,
                        info.vs_type.description(),
                        table.entries.len()
                    );
                    return Ok(VolumeSystem::from_table(image, table));
                }
                Err(e) => {
                    log::debug!("VolumeSystem::scan - REJECTED: \"{}\", Error: {e}", info.name);
                    continue;
                }
            }
        }

        return Ok(VolumeSystem {
            image,
            table: None,
            parts: Vec::new(),
        });
    }

    fn from_table(image: &'a Image, table: PartTable) -> VolumeSystem<'a> {
        let block_size = table.block_size;
        let total_blocks = image.size() / block_size;

        let mut entries: Vec<PartEntry> = table
            .entries
            .into_iter()
            .filter(|e| e.len != 0)
            .collect();
        entries.sort_by_key(|e| (e.start, e.len));

        let mut parts: Vec<Partition> = Vec::with_capacity(entries.len() * 2);
        let mut next = 0u64;

        for entry in entries {
            let end = match entry.start.checked_add(entry.len) {
                Some(end) if end.checked_mul(block_size).is_some() => end,
                _ => {
                    log::warn!(
                        "VolumeSystem - entry past addressable range skipped: \"{}\" at block {}",
                        entry.description,
                        entry.start
                    );
                    continue;
                }
            };

            if entry.start < next {
                log::warn!(
                    "VolumeSystem - overlapping entry skipped: \"{}\" at block {}",
                    entry.description,
                    entry.start
                );
                continue;
            }

            if entry.start > next {
                push_part(
                    &mut parts,
                    block_size,
                    next,
                    entry.start - next,
                    String::from("Unallocated"),
                    PartFlags::UNALLOC,
                    None,
                );
            }

            next = end;
            push_part(
                &mut parts,
                block_size,
                entry.start,
                entry.len,
                entry.description,
                entry.flags,
                entry.slot,
            );
        }

        if next < total_blocks {
            push_part(
                &mut parts,
                block_size,
                next,
                total_blocks - next,
                String::from("Unallocated"),
                PartFlags::UNALLOC,
                None,
            );
        }

        return VolumeSystem {
            image,
            table: Some(TableInfo {
                vs_type: table.vs_type,
                block_size,
                endian: table.endian,
            }),
            parts,
        };
    }

    /// `false` when no partition table was recognised.
    pub fn is_found(&self) -> bool {
        return self.table.is_some();
    }

    pub fn image(&self) -> &'a Image {
        return self.image;
    }

    pub fn vs_type(&self) -> Option<VsType> {
        return self.table.map(|t| t.vs_type);
    }

    /// Human readable table description, e.g. `"Mac Partition Map"`.
    pub fn description(&self) -> Option<&'static str> {
        return self.table.map(|t| t.vs_type.description());
    }

    /// Size in bytes of the table's addressing unit.
    pub fn block_size(&self) -> Option<u64> {
        return self.table.map(|t| t.block_size);
    }

    pub fn endian(&self) -> Option<Endianness> {
        return self.table.map(|t| t.endian);
    }

    /// Byte offset of the table in the image.
    pub fn offset(&self) -> Option<u64> {
        return self.table.map(|_| 0);
    }

    pub fn parts(&self) -> &[Partition] {
        return &self.parts;
    }

    pub fn partition_count(&self) -> usize {
        return self.parts.len();
    }

    pub fn part(&self, index: usize) -> Option<PartitionRef<'_>> {
        if index < self.parts.len() {
            return Some(PartitionRef { vs: self, index });
        }
        return None;
    }

    /// Partitions flagged [`PartFlags::ALLOC`].
    pub fn allocated(&self) -> impl Iterator<Item = PartitionRef<'_>> {
        self.parts
            .iter()
            .filter(|p| p.is_allocated())
            .map(|p| PartitionRef {
                vs: self,
                index: p.index,
            })
    }
}

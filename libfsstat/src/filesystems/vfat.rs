use std::io::Error as IoError;

use bitflags::bitflags;
use thiserror::Error;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::{LittleEndian, U16, U32},
};

use crate::{
    filesystem::FsType,
    filesystems::{FsError, FsIdinfo, FsInfo},
    probe::{Magic, Probe},
    util::{Endianness, decode_utf8_lossy_from, is_power_2},
};

#[derive(Debug, Error)]
pub enum FatError {
    #[error("I/O operation failed: {0}")]
    IoError(#[from] IoError),
    #[error("FAT header error: {0}")]
    FatHeaderError(&'static str),
    #[error("Not a FAT superblock: {0}")]
    UnknownFilesystem(&'static str),
}

pub(crate) const VFAT_ID_INFO: FsIdinfo = FsIdinfo {
    name: "vfat",
    ftype: FsType::FAT12.union(FsType::FAT16).union(FsType::FAT32),
    auto: true,
    probe_fn: |probe, magic| probe_vfat(probe, magic).map_err(FsError::from),
    magics: Some(&[
        Magic {
            magic: b"MSWIN",
            len: 5,
            b_offset: 0x52,
        },
        Magic {
            magic: b"FAT32   ",
            len: 8,
            b_offset: 0x52,
        },
        Magic {
            magic: b"MSDOS",
            len: 5,
            b_offset: 0x36,
        },
        Magic {
            magic: b"FAT16   ",
            len: 8,
            b_offset: 0x36,
        },
        Magic {
            magic: b"FAT12   ",
            len: 8,
            b_offset: 0x36,
        },
        Magic {
            magic: b"FAT     ",
            len: 8,
            b_offset: 0x36,
        },
        Magic {
            magic: &[0x55, 0xAA],
            len: 2,
            b_offset: 0x1fe,
        },
    ]),
};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct VFatSuperBlock {
    pub vs_ignored: [u8; 3],
    pub vs_sysid: [u8; 8],
    pub vs_sector_size: U16<LittleEndian>,
    pub vs_cluster_size: u8,
    pub vs_reserved: U16<LittleEndian>,
    pub vs_fats: u8,
    pub vs_dir_entries: U16<LittleEndian>,
    pub vs_sectors: U16<LittleEndian>,
    pub vs_media: u8,
    pub vs_fat_length: U16<LittleEndian>,
    pub vs_secs_track: U16<LittleEndian>,
    pub vs_heads: U16<LittleEndian>,
    pub vs_hidden: U32<LittleEndian>,
    pub vs_total_sect: U32<LittleEndian>,

    pub vs_fat32_length: U32<LittleEndian>,
    pub vs_flags: U16<LittleEndian>,
    pub vs_version: U16<LittleEndian>,
    pub vs_root_cluster: U32<LittleEndian>,
    pub vs_fsinfo_sector: U16<LittleEndian>,
    pub vs_backup_boot: U16<LittleEndian>,
    pub vs_reserved2: [u8; 12],
    pub vs_drive_number: u8,
    pub vs_boot_flags: u8,
    pub vs_ext_boot_sign: u8, /* 0x28 - without vs_label/vs_magic; 0x29 - with */
    pub vs_serno: [u8; 4],
    pub vs_label: [u8; 11],
    pub vs_magic: [u8; 8],
    pub vs_dummy2: [u8; 420],
    pub vs_pmagic: [u8; 2],
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct MsDosSuperBlock {
    /* DOS 2.0 BPB */
    pub ms_ignored: [u8; 3],
    pub ms_sysid: [u8; 8],
    pub ms_sector_size: U16<LittleEndian>,
    pub ms_cluster_size: u8,
    pub ms_reserved: U16<LittleEndian>,
    pub ms_fats: u8,
    pub ms_dir_entries: U16<LittleEndian>,
    pub ms_sectors: U16<LittleEndian>, /* =0 iff V3 or later */
    pub ms_media: u8,
    pub ms_fat_length: U16<LittleEndian>, /* Sectors per FAT */
    /* DOS 3.0 BPB */
    pub ms_secs_track: U16<LittleEndian>,
    pub ms_heads: U16<LittleEndian>,
    pub ms_hidden: U32<LittleEndian>,
    /* DOS 3.31 BPB */
    pub ms_total_sect: U32<LittleEndian>,
    /* DOS 3.4 EBPB */
    pub ms_drive_number: u8,
    pub ms_boot_flags: u8,
    pub ms_ext_boot_sign: u8,
    pub ms_serno: [u8; 4],
    /* DOS 4.0 EBPB */
    pub ms_label: [u8; 11],
    pub ms_magic: [u8; 8],
    /* padding */
    pub ms_dummy2: [u8; 448],
    pub ms_pmagic: [u8; 2],
}

bitflags! {
    #[repr(transparent)]
    #[derive(Copy, Clone, Debug, PartialEq, Eq)]
    pub struct FatAttr: u8 {
        const FAT_ATTR_VOLUME_ID = 0x08;
        const FAT_ATTR_DIR = 0x10;
        const FAT_ATTR_LONG_NAME = 0x0f;
        const FAT_ATTR_MASK = 0x3f;
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct VfatDirEntry {
    pub name: [u8; 11],
    pub attr: u8,
    pub time_creat: U16<LittleEndian>,
    pub date_creat: U16<LittleEndian>,
    pub time_acc: U16<LittleEndian>,
    pub date_acc: U16<LittleEndian>,
    pub cluster_high: U16<LittleEndian>,
    pub time_write: U16<LittleEndian>,
    pub date_write: U16<LittleEndian>,
    pub cluster_low: U16<LittleEndian>,
    pub size: U32<LittleEndian>,
}

impl VfatDirEntry {
    fn attr(&self) -> FatAttr {
        return FatAttr::from_bits_retain(self.attr);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct Fat32FsInfo {
    pub signature1: [u8; 4],
    pub reserved1: [u8; 480],
    pub signature2: [u8; 4],
    pub free_clusters: U32<LittleEndian>,
    pub next_cluster: U32<LittleEndian>,
}

const FAT_ENTRY_FREE: u8 = 0xe5;
const FAT_DIR_ENTRY_SIZE: u64 = 32;

const FAT12_MAX: u32 = 0xFF4;
const FAT16_MAX: u32 = 0xFFF4;
const FAT32_MAX: u32 = 0x0FFFFFF6;

/* Inode numbering: 2 is the root directory, normal entries start at 3 and
 * four virtual files (MBR, both FATs, orphans) follow the last real one. */
const FAT_FIRST_INUM: u64 = 2;
const FAT_ROOT_INUM: u64 = 2;
const FAT_FIRST_NORMAL_INUM: u64 = 3;
const FAT_NUM_VIRT_FILES: u64 = 4;

fn get_fat_size(ms: &MsDosSuperBlock, vs: &VFatSuperBlock) -> u32 {
    let num_fat = u32::from(ms.ms_fats);
    let fat_length = if u16::from(ms.ms_fat_length) == 0 {
        u32::from(vs.vs_fat32_length)
    } else {
        u32::from(u16::from(ms.ms_fat_length))
    };

    return fat_length.saturating_mul(num_fat);
}

fn get_sect_count(ms: &MsDosSuperBlock) -> u32 {
    if u16::from(ms.ms_sectors) == 0 {
        return u32::from(ms.ms_total_sect);
    }
    return u32::from(u16::from(ms.ms_sectors));
}

fn get_root_dir_sectors(ms: &MsDosSuperBlock) -> u32 {
    let sector_size = u32::from(u16::from(ms.ms_sector_size));
    return (u32::from(u16::from(ms.ms_dir_entries)) * 32).div_ceil(sector_size);
}

fn get_cluster_count(ms: &MsDosSuperBlock, vs: &VFatSuperBlock) -> Result<u32, FatError> {
    let meta = u32::from(u16::from(ms.ms_reserved))
        .saturating_add(get_fat_size(ms, vs))
        .saturating_add(get_root_dir_sectors(ms));

    let data = get_sect_count(ms)
        .checked_sub(meta)
        .ok_or(FatError::FatHeaderError("Filesystem metadata larger than volume"))?;

    return Ok(data / u32::from(ms.ms_cluster_size));
}

fn valid_fat(ms: &MsDosSuperBlock, vs: &VFatSuperBlock, mag: Magic) -> Result<FsType, FatError> {
    if mag.len <= 2 {
        if ms.ms_pmagic != [0x55, 0xAA] {
            return Err(FatError::UnknownFilesystem("Given block is not FAT, likely MBR"));
        }

        /* OS/2 and DFSee place a FAT12/16-like pseudo-superblock in the
         * first sector of JFS and HPFS volumes. */
        if &ms.ms_magic == b"JFS     " || &ms.ms_magic == b"HPFS    " {
            return Err(FatError::UnknownFilesystem("JFS/HPFS found"));
        }
    }

    if ms.ms_fats == 0 {
        return Err(FatError::FatHeaderError("Should be atleast one fat table"));
    }
    if u16::from(ms.ms_reserved) == 0 {
        return Err(FatError::FatHeaderError("ms_reserved should not be 0"));
    }

    let sector_size = u64::from(u16::from(ms.ms_sector_size));
    if !(512..=4096).contains(&sector_size) || !is_power_2(sector_size) {
        return Err(FatError::FatHeaderError("sector_size is not a power of 2 in 512..=4096"));
    }

    if !is_power_2(u64::from(ms.ms_cluster_size)) {
        return Err(FatError::FatHeaderError("cluster_size is not ^2"));
    }

    let cluster_count = get_cluster_count(ms, vs)?;

    let is_fat32 = u16::from(ms.ms_fat_length) == 0 && u32::from(vs.vs_fat32_length) > 0;

    let max_count = if is_fat32 {
        FAT32_MAX
    } else if cluster_count > FAT12_MAX {
        FAT16_MAX
    } else {
        FAT12_MAX
    };

    if cluster_count > max_count {
        return Err(FatError::FatHeaderError("Too many clusters"));
    }

    if is_fat32 {
        return Ok(FsType::FAT32);
    } else if cluster_count <= FAT12_MAX {
        return Ok(FsType::FAT12);
    } else {
        return Ok(FsType::FAT16);
    }
}

pub fn probe_is_vfat(probe: &Probe) -> Result<(), FatError> {
    let mag = probe
        .get_magic(VFAT_ID_INFO.magics)?
        .unwrap_or(Magic::EMPTY_MAGIC);

    let ms: MsDosSuperBlock = probe.map_from(0)?;
    let vs: VFatSuperBlock = probe.map_from(0)?;

    valid_fat(&ms, &vs, mag)?;

    return Ok(());
}

fn search_fat_label(
    probe: &Probe,
    root_start: u64,
    root_dir_entries: u64,
) -> Result<Option<String>, FatError> {
    for i in 0..root_dir_entries {
        let entry: VfatDirEntry = probe.map_from(root_start + (i * FAT_DIR_ENTRY_SIZE))?;

        if entry.name[0] == 0x00 {
            break;
        }

        let attr = entry.attr();

        if entry.name[0] == FAT_ENTRY_FREE
            || (u16::from(entry.cluster_high) != 0 || u16::from(entry.cluster_low) != 0)
            || attr.intersection(FatAttr::FAT_ATTR_MASK) == FatAttr::FAT_ATTR_LONG_NAME
        {
            continue;
        }

        if attr.contains(FatAttr::FAT_ATTR_VOLUME_ID) && !attr.contains(FatAttr::FAT_ATTR_DIR) {
            let mut label = entry.name;
            if label[0] == 0x05 {
                label[0] = 0xE5;
            }
            let label = decode_utf8_lossy_from(&label).trim_end().to_string();
            if label.is_empty() {
                return Ok(None);
            }
            return Ok(Some(label));
        }
    }

    return Ok(None);
}

fn probe_fat16(
    probe: &Probe,
    ms: &MsDosSuperBlock,
    fat_size: u32,
) -> Result<(Option<String>, [u8; 4]), FatError> {
    let reserved = u64::from(u16::from(ms.ms_reserved));
    let sector_size = u64::from(u16::from(ms.ms_sector_size));

    let root_start = (reserved + u64::from(fat_size)) * sector_size;

    let vol_label = search_fat_label(probe, root_start, u64::from(u16::from(ms.ms_dir_entries)))?;

    if ms.ms_ext_boot_sign != 0x28 && ms.ms_ext_boot_sign != 0x29 {
        return Err(FatError::FatHeaderError("ext_boot_sign not 0x28 or 0x29"));
    }

    return Ok((vol_label, ms.ms_serno));
}

fn probe_fat32(
    probe: &Probe,
    ms: &MsDosSuperBlock,
    vs: &VFatSuperBlock,
    fat_size: u32,
) -> Result<(Option<String>, [u8; 4]), FatError> {
    let reserved = u64::from(u16::from(vs.vs_reserved));
    let sector_size = u64::from(u16::from(ms.ms_sector_size));
    let cluster_size = u64::from(vs.vs_cluster_size);

    let buf_size = cluster_size * sector_size;
    let start_data_sect = reserved + u64::from(fat_size);
    let entries = u64::from(vs.vs_fat32_length) * sector_size / 4;

    let mut next = u64::from(vs.vs_root_cluster);
    let mut maxloop = 100;

    let vol_label = loop {
        if next < 2 || next >= entries || maxloop == 0 {
            break None;
        }

        maxloop -= 1;

        let next_off = (start_data_sect + (next - 2) * cluster_size) * sector_size;

        match search_fat_label(probe, next_off, buf_size / FAT_DIR_ENTRY_SIZE)? {
            Some(label) => break Some(label),
            None => {
                let fat_entry_off = (reserved * sector_size) + (next * 4);
                let buf: [u8; 4] = probe.read_exact_at(fat_entry_off)?;

                next = u64::from(u32::from_le_bytes(buf) & 0x0FFFFFFF);
            }
        }
    };

    let fsinfo_sect = u64::from(u16::from(vs.vs_fsinfo_sector));
    if fsinfo_sect != 0 {
        let fsinfo: Fat32FsInfo = probe.map_from(fsinfo_sect * sector_size)?;

        if &fsinfo.signature1 != b"\x52\x52\x61\x41"
            && &fsinfo.signature1 != b"\x52\x52\x64\x41"
            && &fsinfo.signature1 != b"\x00\x00\x00\x00"
        {
            return Err(FatError::FatHeaderError("Invalid fsinfo.signature1"));
        }

        if &fsinfo.signature2 != b"\x72\x72\x41\x61" && &fsinfo.signature2 != b"\x00\x00\x00\x00" {
            return Err(FatError::FatHeaderError("Invalid fsinfo.signature2"));
        }

        log::debug!(
            "probe_fat32 - FREE CLUSTERS: {}, NEXT CLUSTER: {}",
            u32::from(fsinfo.free_clusters),
            u32::from(fsinfo.next_cluster)
        );
    }

    return Ok((vol_label, vs.vs_serno));
}

pub fn probe_vfat(probe: &Probe, mag: Magic) -> Result<FsInfo, FatError> {
    let ms: MsDosSuperBlock = probe.map_from(0)?;
    let vs: VFatSuperBlock = probe.map_from(0)?;

    let ftype = valid_fat(&ms, &vs, mag)?;

    let fat_size = get_fat_size(&ms, &vs);

    let (label, serno) = if u16::from(ms.ms_fat_length) != 0 {
        probe_fat16(probe, &ms, fat_size)?
    } else if u32::from(vs.vs_fat32_length) != 0 {
        probe_fat32(probe, &ms, &vs, fat_size)?
    } else {
        return Err(FatError::UnknownFilesystem("Block is not fat filesystem"));
    };

    let sector_size = u32::from(u16::from(ms.ms_sector_size));
    let sect_count = u64::from(get_sect_count(&ms));

    log::debug!(
        "probe_vfat - TYPE: {}, SECTORS: {sect_count}, CREATOR: \"{}\"",
        ftype.name(),
        decode_utf8_lossy_from(&ms.ms_sysid)
    );

    let mut info = FsInfo::new(probe, ftype, sector_size, sect_count, "Sector");

    /* FAT12/16 root directory entries sit right after the FATs and count as
     * inodes, so numbering starts at the end of the FAT region. */
    let first_data_sect = u64::from(u16::from(ms.ms_reserved)) + u64::from(fat_size);
    let dentry_per_sect = u64::from(sector_size) / FAT_DIR_ENTRY_SIZE;

    info.endian = Endianness::Little;
    info.first_inum = FAT_FIRST_INUM;
    info.root_inum = FAT_ROOT_INUM;
    info.last_inum = (info.last_block_act + 1).saturating_sub(first_data_sect) * dentry_per_sect
        + FAT_FIRST_NORMAL_INUM
        - 1
        + FAT_NUM_VIRT_FILES;
    info.inum_count = info.last_inum - info.first_inum + 1;
    info.fs_id = serno.to_vec();
    info.label = label;

    return Ok(info);
}

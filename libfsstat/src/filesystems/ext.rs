use std::io::Error as IoError;

use bitflags::bitflags;
use thiserror::Error;
use uuid::Uuid;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::{LittleEndian, U16, U32, U64},
};

use crate::{
    checksum::{CsumAlgorium, get_crc32c_raw},
    filesystem::{FsFlags, FsType},
    filesystems::{FsError, FsIdinfo, FsInfo},
    probe::{Magic, Probe},
    util::{Endianness, decode_utf8_lossy_from},
};

/*
https://www.kernel.org/doc/html/latest/filesystems/ext4/globals.html
*/

#[derive(Debug, Error)]
pub enum ExtError {
    #[error("I/O operation failed: {0}")]
    IoError(#[from] IoError),
    #[error("Not an ext superblock: {0}")]
    UnknownFilesystem(&'static str),
    #[error("Ext header error: {0}")]
    ExtHeaderError(&'static str),
}

pub(crate) const EXT_ID_INFO: FsIdinfo = FsIdinfo {
    name: "ext",
    ftype: FsType::EXT2.union(FsType::EXT3).union(FsType::EXT4),
    auto: true,
    probe_fn: |probe, magic| probe_ext(probe, magic).map_err(FsError::from),
    magics: Some(&[Magic {
        magic: &[0x53, 0xEF],
        len: 2,
        b_offset: EXT_SB_OFFSET + 0x38,
    }]),
};

const EXT_SB_OFFSET: u64 = 1024;

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct Ext2SuperBlock {
    pub s_inodes_count: U32<LittleEndian>,
    pub s_blocks_count: U32<LittleEndian>,
    pub s_r_blocks_count: U32<LittleEndian>,
    pub s_free_blocks_count: U32<LittleEndian>,
    pub s_free_inodes_count: U32<LittleEndian>,
    pub s_first_data_block: U32<LittleEndian>,
    pub s_log_block_size: U32<LittleEndian>,
    pub s_log_cluster_size: U32<LittleEndian>,
    pub s_blocks_per_group: U32<LittleEndian>,
    pub s_clusters_per_group: U32<LittleEndian>,
    pub s_inodes_per_group: U32<LittleEndian>,
    pub s_mtime: U32<LittleEndian>,
    pub s_wtime: U32<LittleEndian>,
    pub s_mnt_count: U16<LittleEndian>,
    pub s_max_mnt_count: U16<LittleEndian>,
    pub s_magic: [u8; 2],
    pub s_state: U16<LittleEndian>,
    pub s_errors: U16<LittleEndian>,
    pub s_minor_rev_level: U16<LittleEndian>,
    pub s_lastcheck: U32<LittleEndian>,
    pub s_checkinterval: U32<LittleEndian>,
    pub s_creator_os: U32<LittleEndian>,
    pub s_rev_level: U32<LittleEndian>,
    pub s_def_resuid: U16<LittleEndian>,
    pub s_def_resgid: U16<LittleEndian>,
    pub s_first_ino: U32<LittleEndian>,
    pub s_inode_size: U16<LittleEndian>,
    pub s_block_group_nr: U16<LittleEndian>,
    pub s_feature_compat: U32<LittleEndian>,
    pub s_feature_incompat: U32<LittleEndian>,
    pub s_feature_ro_compat: U32<LittleEndian>,
    pub s_uuid: [u8; 16],
    pub s_volume_name: [u8; 16],
    pub s_last_mounted: [u8; 64],
    pub s_algorithm_usage_bitmap: U32<LittleEndian>,
    pub s_prealloc_blocks: u8,
    pub s_prealloc_dir_blocks: u8,
    pub s_reserved_gdt_blocks: U16<LittleEndian>,
    pub s_journal_uuid: [u8; 16],
    pub s_journal_inum: U32<LittleEndian>,
    pub s_journal_dev: U32<LittleEndian>,
    pub s_last_orphan: U32<LittleEndian>,
    pub s_hash_seed: [U32<LittleEndian>; 4],
    pub s_def_hash_version: u8,
    pub s_jnl_backup_type: u8,
    pub s_desc_size: U16<LittleEndian>,
    pub s_default_mount_opts: U32<LittleEndian>,
    pub s_first_meta_bg: U32<LittleEndian>,
    pub s_mkfs_time: U32<LittleEndian>,
    pub s_jnl_blocks: [U32<LittleEndian>; 17],
    pub s_blocks_count_hi: U32<LittleEndian>,
    pub s_r_blocks_count_hi: U32<LittleEndian>,
    pub s_free_blocks_hi: U32<LittleEndian>,
    pub s_min_extra_isize: U16<LittleEndian>,
    pub s_want_extra_isize: U16<LittleEndian>,
    pub s_flags: U32<LittleEndian>,
    pub s_raid_stride: U16<LittleEndian>,
    pub s_mmp_interval: U16<LittleEndian>,
    pub s_mmp_block: U64<LittleEndian>,
    pub s_raid_stripe_width: U32<LittleEndian>,
    pub s_reserved: [U32<LittleEndian>; 162],
    pub s_checksum: U32<LittleEndian>,
}

impl Ext2SuperBlock {
    fn compat(&self) -> FeatureCompat {
        return FeatureCompat::from_bits_truncate(u32::from(self.s_feature_compat));
    }

    fn incompat(&self) -> FeatureIncompat {
        return FeatureIncompat::from_bits_truncate(u32::from(self.s_feature_incompat));
    }

    fn ro_compat(&self) -> FeatureRoCompat {
        return FeatureRoCompat::from_bits_truncate(u32::from(self.s_feature_ro_compat));
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct FeatureCompat: u32 {
        const EXT3_FEATURE_COMPAT_HAS_JOURNAL = 0x0004;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct FeatureIncompat: u32 {
        const EXT2_FEATURE_INCOMPAT_FILETYPE         = 0x0002;
        const EXT3_FEATURE_INCOMPAT_RECOVER          = 0x0004;
        const EXT3_FEATURE_INCOMPAT_JOURNAL_DEV      = 0x0008;
        const EXT2_FEATURE_INCOMPAT_META_BG          = 0x0010;
        const EXT4_FEATURE_INCOMPAT_EXTENTS          = 0x0040;
        const EXT4_FEATURE_INCOMPAT_64BIT            = 0x0080;
        const EXT4_FEATURE_INCOMPAT_MMP              = 0x0100;
        const EXT4_FEATURE_INCOMPAT_FLEX_BG          = 0x0200;
    }
}

bitflags! {
    #[derive(Debug, Copy, Clone, Eq, PartialEq)]
    pub struct FeatureRoCompat: u32 {
        const EXT2_FEATURE_RO_COMPAT_SPARSE_SUPER     = 0x0001;
        const EXT2_FEATURE_RO_COMPAT_LARGE_FILE       = 0x0002;
        const EXT2_FEATURE_RO_COMPAT_BTREE_DIR        = 0x0004;
        const EXT4_FEATURE_RO_COMPAT_HUGE_FILE        = 0x0008;
        const EXT4_FEATURE_RO_COMPAT_GDT_CSUM         = 0x0010;
        const EXT4_FEATURE_RO_COMPAT_DIR_NLINK        = 0x0020;
        const EXT4_FEATURE_RO_COMPAT_EXTRA_ISIZE      = 0x0040;
        const EXT4_FEATURE_RO_COMPAT_METADATA_CSUM    = 0x0400;
    }
}

const EXT4_INCOMPAT_MARKERS: FeatureIncompat = FeatureIncompat::EXT4_FEATURE_INCOMPAT_EXTENTS
    .union(FeatureIncompat::EXT4_FEATURE_INCOMPAT_64BIT)
    .union(FeatureIncompat::EXT4_FEATURE_INCOMPAT_FLEX_BG);

const EXT4_RO_COMPAT_MARKERS: FeatureRoCompat = FeatureRoCompat::EXT4_FEATURE_RO_COMPAT_HUGE_FILE
    .union(FeatureRoCompat::EXT4_FEATURE_RO_COMPAT_GDT_CSUM)
    .union(FeatureRoCompat::EXT4_FEATURE_RO_COMPAT_DIR_NLINK)
    .union(FeatureRoCompat::EXT4_FEATURE_RO_COMPAT_EXTRA_ISIZE)
    .union(FeatureRoCompat::EXT4_FEATURE_RO_COMPAT_METADATA_CSUM);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
enum ExtCreator {
    Linux,
    Hurd,
    Masix,
    FreeBSD,
    Lites,
    Unknown(u32),
}

impl From<u32> for ExtCreator {
    fn from(os: u32) -> Self {
        match os {
            0 => Self::Linux,
            1 => Self::Hurd,
            2 => Self::Masix,
            3 => Self::FreeBSD,
            4 => Self::Lites,
            other => Self::Unknown(other),
        }
    }
}

const EXT_FIRST_INUM: u64 = 1;
const EXT_ROOT_INUM: u64 = 2;
const EXT_GOOD_OLD_INODE_SIZE: u16 = 128;
const EXT_MAX_LOG_BLOCK_SIZE: u32 = 6;

/// The stored checksum of a metadata_csum superblock covers everything in
/// front of it. A mismatch is logged and otherwise ignored.
fn ext_check_csum(es: &Ext2SuperBlock) {
    if !es
        .ro_compat()
        .contains(FeatureRoCompat::EXT4_FEATURE_RO_COMPAT_METADATA_CSUM)
    {
        return;
    }

    let bytes = es.as_bytes();
    let covered = &bytes[..bytes.len() - size_of::<U32<LittleEndian>>()];

    let csum = get_crc32c_raw(covered);
    let stored = u32::from(es.s_checksum);

    if csum != stored {
        log::warn!(
            "ext_check_csum - superblock checksum mismatch, expected: {:X}, got: {:X}",
            CsumAlgorium::Crc32c(stored),
            CsumAlgorium::Crc32c(csum)
        );
    }
}

fn ext_get_type(es: &Ext2SuperBlock) -> FsType {
    if es.incompat().intersects(EXT4_INCOMPAT_MARKERS)
        || es.ro_compat().intersects(EXT4_RO_COMPAT_MARKERS)
    {
        return FsType::EXT4;
    }

    if es.compat().contains(FeatureCompat::EXT3_FEATURE_COMPAT_HAS_JOURNAL) {
        return FsType::EXT3;
    }

    return FsType::EXT2;
}

pub fn probe_ext(probe: &Probe, _magic: Magic) -> Result<FsInfo, ExtError> {
    let es: Ext2SuperBlock = probe.map_from(EXT_SB_OFFSET)?;

    if es.s_magic != [0x53, 0xEF] {
        return Err(ExtError::UnknownFilesystem("Missing ext superblock magic"));
    }

    if es
        .incompat()
        .contains(FeatureIncompat::EXT3_FEATURE_INCOMPAT_JOURNAL_DEV)
    {
        return Err(ExtError::UnknownFilesystem("External journal device"));
    }

    let log_block_size = u32::from(es.s_log_block_size);
    if log_block_size > EXT_MAX_LOG_BLOCK_SIZE {
        return Err(ExtError::ExtHeaderError("s_log_block_size out of range"));
    }
    let block_size = 1024u32 << log_block_size;

    let block_count = u64::from(es.s_blocks_count)
        | if es
            .incompat()
            .contains(FeatureIncompat::EXT4_FEATURE_INCOMPAT_64BIT)
        {
            u64::from(es.s_blocks_count_hi) << 32
        } else {
            0
        };

    if block_count == 0 {
        return Err(ExtError::ExtHeaderError("s_blocks_count is 0"));
    }

    let inodes = u64::from(es.s_inodes_count);
    if inodes == 0 {
        return Err(ExtError::ExtHeaderError("s_inodes_count is 0"));
    }

    ext_check_csum(&es);

    let ftype = ext_get_type(&es);

    let inode_size = if u32::from(es.s_rev_level) == 0 {
        EXT_GOOD_OLD_INODE_SIZE
    } else {
        u16::from(es.s_inode_size)
    };

    log::debug!(
        "probe_ext - TYPE: {}, UUID: {}, CREATOR: {:?}, REV: {}.{}",
        ftype.name(),
        Uuid::from_bytes(es.s_uuid),
        ExtCreator::from(u32::from(es.s_creator_os)),
        u32::from(es.s_rev_level),
        u16::from(es.s_minor_rev_level)
    );

    let mut info = FsInfo::new(probe, ftype, block_size, block_count, "Fragment");

    info.endian = Endianness::Little;
    info.first_inum = EXT_FIRST_INUM;
    info.root_inum = EXT_ROOT_INUM;
    /* The inode past the last real one is the virtual orphan directory */
    info.inum_count = inodes + 1;
    info.last_inum = info.inum_count;
    info.journ_inum = if es
        .compat()
        .contains(FeatureCompat::EXT3_FEATURE_COMPAT_HAS_JOURNAL)
    {
        u64::from(es.s_journal_inum)
    } else {
        0
    };
    info.fs_id = es.s_uuid.to_vec();

    if ftype == FsType::EXT4 && inode_size > EXT_GOOD_OLD_INODE_SIZE {
        info.flags |= FsFlags::HAVE_NANOSEC;
    }

    let label = decode_utf8_lossy_from(&es.s_volume_name);
    if !label.is_empty() {
        info.label = Some(label);
    }

    return Ok(info);
}

pub mod exfat;
pub mod ext;
pub mod hfs;
pub mod ntfs;
pub mod raw;
pub mod vfat;

use std::io::Error as IoError;

use thiserror::Error;

use crate::{
    filesystem::{FsFlags, FsType},
    filesystems::{
        exfat::{EXFAT_ID_INFO, ExFatError},
        ext::{EXT_ID_INFO, ExtError},
        hfs::{HFS_ID_INFO, HfsError},
        ntfs::{NTFS_ID_INFO, NtfsError},
        raw::{RAW_ID_INFO, RawError, SWAP_ID_INFO},
        vfat::{FatError, VFAT_ID_INFO},
    },
    probe::{Magic, Probe},
    util::Endianness,
};

#[derive(Debug, Error)]
pub enum FsError {
    #[error("I/O operation failed: {0}")]
    IoError(#[from] IoError),
    #[error("NTFS error: {0}")]
    Ntfs(#[from] NtfsError),
    #[error("FAT error: {0}")]
    Fat(#[from] FatError),
    #[error("exFAT error: {0}")]
    ExFat(#[from] ExFatError),
    #[error("Ext error: {0}")]
    Ext(#[from] ExtError),
    #[error("HFS+ error: {0}")]
    Hfs(#[from] HfsError),
    #[error("Raw error: {0}")]
    Raw(#[from] RawError),
}

type FsProbeFn = fn(&Probe, Magic) -> Result<FsInfo, FsError>;

#[derive(Debug, Copy, Clone)]
pub(crate) struct FsIdinfo {
    pub name: &'static str,
    /// Every type this probe can report.
    pub ftype: FsType,
    /// Tried when no type is forced.
    pub auto: bool,
    pub probe_fn: FsProbeFn,
    pub magics: Option<&'static [Magic]>,
}

/// Order of filesystem detection attempts.
pub(crate) const FS_PROBES: &[FsIdinfo] = &[
    NTFS_ID_INFO,
    VFAT_ID_INFO,
    EXFAT_ID_INFO,
    EXT_ID_INFO,
    HFS_ID_INFO,
    RAW_ID_INFO,
    SWAP_ID_INFO,
];

/// Metadata of a recognised filesystem.
///
/// Block numbers are in units of `block_size`, relative to `offset`.
#[derive(Debug, Clone, Default, Eq, PartialEq)]
pub struct FsInfo {
    pub(crate) ftype: FsType,
    pub(crate) offset: u64,
    pub(crate) block_size: u32,
    pub(crate) block_count: u64,
    pub(crate) first_block: u64,
    pub(crate) last_block_act: u64,
    pub(crate) dev_bsize: u32,
    pub(crate) endian: Endianness,
    pub(crate) first_inum: u64,
    pub(crate) last_inum: u64,
    pub(crate) root_inum: u64,
    pub(crate) inum_count: u64,
    pub(crate) journ_inum: u64,
    pub(crate) fs_id: Vec<u8>,
    pub(crate) flags: FsFlags,
    pub(crate) data_unit_name: &'static str,
    pub(crate) label: Option<String>,
}

impl FsInfo {
    /// Geometry shared by every format.
    ///
    /// `last_block_act` is clamped to what the image really holds past the
    /// window start, so a truncated image reports fewer blocks.
    pub(crate) fn new(
        probe: &Probe,
        ftype: FsType,
        block_size: u32,
        block_count: u64,
        data_unit_name: &'static str,
    ) -> FsInfo {
        let last_block = block_count.saturating_sub(1);
        let present = probe.image().size().saturating_sub(probe.offset()) / u64::from(block_size.max(1));

        let last_block_act = if present < block_count {
            present.saturating_sub(1)
        } else {
            last_block
        };

        return FsInfo {
            ftype,
            offset: probe.offset(),
            block_size,
            block_count,
            first_block: 0,
            last_block_act,
            dev_bsize: probe.ssz() as u32,
            data_unit_name,
            ..FsInfo::default()
        };
    }

    #[inline]
    pub(crate) fn last_block(&self) -> u64 {
        return self.block_count.saturating_sub(1);
    }
}

pub mod filesystem;
pub mod filesystems;
pub mod image;
pub mod partitions;
pub mod volume;

pub(crate) mod checksum;
pub(crate) mod probe;
pub(crate) mod util;

#[cfg(test)]
mod tests;

use std::{io::Error as IoError, path::PathBuf};

use thiserror::Error;

pub use crate::{
    filesystem::{
        Capabilities, FileSystem, FsFlags, FsOptions, FsSource, FsState, FsType, FsTypeEntry,
        GatedAttr, SourceSelector, FS_TAG, FS_TYPES, type_print,
    },
    filesystems::{FsError, FsInfo},
    image::{Image, ImageType},
    partitions::PtError,
    util::Endianness,
    volume::{PartFlags, Partition, PartitionRef, VolumeSystem, VsType},
};

/// Errors returned by the public API.
///
/// "No filesystem found" and "attribute not supported" are never errors,
/// they are states on [`FileSystem`].
#[derive(Debug, Error)]
pub enum FsStatError {
    #[error("I/O operation failed: {0}")]
    IoError(#[from] IoError),
    #[error("No image segments given")]
    NoSegments,
    #[error("Unable to open image segment \"{}\": {source}", path.display())]
    SegmentOpen { path: PathBuf, source: IoError },
    #[error("Invalid filesystem source: \"{0}\"")]
    InvalidSource(String),
    #[error("Invalid filesystem type flag: {0:#x}")]
    InvalidTypeFlag(u32),
    #[error("Invalid segment pattern: {0}")]
    Pattern(#[from] glob::PatternError),
    #[error("Unable to expand segment pattern: {0}")]
    Glob(#[from] glob::GlobError),
    #[error("Partition table error: {0}")]
    PtError(#[from] PtError),
    #[error("Filesystem error: {0}")]
    FsError(#[from] FsError),
}

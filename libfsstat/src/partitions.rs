pub mod dos;
pub mod gpt;
pub mod mac;

use thiserror::Error;

use crate::{
    partitions::{
        dos::{DOS_PT_ID_INFO, DosError},
        gpt::{GPT_PT_ID_INFO, GptError},
        mac::{MAC_PT_ID_INFO, MacError},
    },
    probe::{Magic, Probe},
    util::Endianness,
    volume::{PartFlags, VsType},
};

#[derive(Debug, Error)]
pub enum PtError {
    #[error("DOS partition table error: {0}")]
    Dos(#[from] DosError),
    #[error("GPT partition table error: {0}")]
    Gpt(#[from] GptError),
    #[error("Mac partition map error: {0}")]
    Mac(#[from] MacError),
}

type PtProbeFn = fn(&Probe) -> Result<PartTable, PtError>;

#[derive(Debug, Copy, Clone)]
pub(crate) struct PtIdinfo {
    pub name: &'static str,
    pub vs_type: VsType,
    pub probe_fn: PtProbeFn,
    pub magics: Option<&'static [Magic]>,
}

/// Order of partition table detection attempts.
pub(crate) const PT_PROBES: &[PtIdinfo] = &[GPT_PT_ID_INFO, DOS_PT_ID_INFO, MAC_PT_ID_INFO];

/// An entry as read from disk, in units of the table's block size.
#[derive(Debug, Clone, Eq, PartialEq)]
pub(crate) struct PartEntry {
    pub start: u64,
    pub len: u64,
    pub description: String,
    pub flags: PartFlags,
    pub slot: Option<u32>,
}

impl PartEntry {
    pub(crate) fn meta(start: u64, len: u64, description: impl Into<String>) -> PartEntry {
        return PartEntry {
            start,
            len,
            description: description.into(),
            flags: PartFlags::META,
            slot: None,
        };
    }
}

#[derive(Debug, Clone)]
pub(crate) struct PartTable {
    pub vs_type: VsType,
    pub block_size: u64,
    pub endian: Endianness,
    pub entries: Vec<PartEntry>,
}

use std::io::Error as IoError;

use thiserror::Error;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::{BigEndian, U16, U32},
};

use crate::{
    partitions::{PartEntry, PartTable, PtError, PtIdinfo},
    probe::{Magic, Probe},
    util::{Endianness, decode_utf8_lossy_from, is_power_2},
    volume::{PartFlags, VsType},
};

#[derive(Debug, Error)]
pub enum MacError {
    #[error("I/O operation failed: {0}")]
    IoError(#[from] IoError),
    #[error("Not a Mac partition map: {0}")]
    UnknownPartitionTable(&'static str),
    #[error("Mac partition map header error: {0}")]
    MacHeaderError(&'static str),
}

pub(crate) const MAC_PT_ID_INFO: PtIdinfo = PtIdinfo {
    name: "mac",
    vs_type: VsType::Mac,
    probe_fn: |probe| probe_mac_pt(probe).map_err(PtError::from),
    magics: Some(&[
        Magic {
            magic: b"ER",
            len: 2,
            b_offset: 0,
        },
        Magic {
            magic: b"PM",
            len: 2,
            b_offset: 512,
        },
    ]),
};

/// Driver descriptor map, block 0.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct MacDriverDescriptor {
    pub signature: [u8; 2],
    pub block_size: U16<BigEndian>,
    pub block_count: U32<BigEndian>,
}

/// One partition map entry, one per block starting at block 1.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct MacPartitionEntry {
    pub signature: [u8; 2],
    pub sig_pad: U16<BigEndian>,
    pub map_blk_count: U32<BigEndian>,
    pub start_block: U32<BigEndian>,
    pub block_count: U32<BigEndian>,
    pub name: [u8; 32],
    pub part_type: [u8; 32],
    pub data_start: U32<BigEndian>,
    pub data_count: U32<BigEndian>,
    pub status: U32<BigEndian>,
}

const MAC_DEFAULT_BLOCK_SIZE: u64 = 512;
const MAC_MAX_ENTRIES: u32 = 4096;

const MAC_TYPE_PARTITION_MAP: &str = "Apple_partition_map";
const MAC_TYPE_FREE: &str = "Apple_Free";

fn part_flags(part_type: &str) -> PartFlags {
    match part_type {
        MAC_TYPE_PARTITION_MAP => PartFlags::META,
        MAC_TYPE_FREE => PartFlags::UNALLOC,
        _ => PartFlags::ALLOC,
    }
}

fn get_block_size(probe: &Probe) -> Result<u64, MacError> {
    let ddm: MacDriverDescriptor = probe.map_from(0)?;

    if &ddm.signature != b"ER" {
        return Ok(MAC_DEFAULT_BLOCK_SIZE);
    }

    let block_size = u64::from(u16::from(ddm.block_size));

    if block_size < MAC_DEFAULT_BLOCK_SIZE || !is_power_2(block_size) {
        log::debug!("get_block_size - invalid driver descriptor block size {block_size}");
        return Ok(MAC_DEFAULT_BLOCK_SIZE);
    }

    return Ok(block_size);
}

pub fn probe_mac_pt(probe: &Probe) -> Result<PartTable, MacError> {
    let block_size = get_block_size(probe)?;

    let first: MacPartitionEntry = probe.map_from(block_size)?;

    if &first.signature != b"PM" {
        return Err(MacError::UnknownPartitionTable("missing partition map signature"));
    }

    let count = u32::from(first.map_blk_count);

    if count == 0 || count > MAC_MAX_ENTRIES {
        return Err(MacError::MacHeaderError("partition map entry count out of range"));
    }

    let mut entries = Vec::with_capacity(count as usize);

    for slot in 0..count {
        let entry: MacPartitionEntry = if slot == 0 {
            first
        } else {
            probe.map_from((1 + u64::from(slot)) * block_size)?
        };

        if &entry.signature != b"PM" {
            log::warn!("probe_mac_pt - entry {slot} missing signature, map cut short");
            break;
        }

        let part_type = decode_utf8_lossy_from(&entry.part_type);
        let part_type = part_type.trim_end_matches('\0').trim().to_string();

        log::debug!(
            "probe_mac_pt - ENTRY {slot}: \"{}\", TYPE: \"{part_type}\"",
            decode_utf8_lossy_from(&entry.name)
        );

        entries.push(PartEntry {
            start: u64::from(u32::from(entry.start_block)),
            len: u64::from(u32::from(entry.block_count)),
            flags: part_flags(&part_type),
            description: part_type,
            slot: Some(slot),
        });
    }

    return Ok(PartTable {
        vs_type: VsType::Mac,
        block_size,
        endian: Endianness::Big,
        entries,
    });
}

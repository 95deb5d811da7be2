use std::io::Error as IoError;

use thiserror::Error;
use uuid::Uuid;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::{LittleEndian, U16, U32, U64},
};

use crate::{
    checksum::{CsumAlgorium, get_crc32_iso_hdlc, verify_crc32_iso_hdlc},
    partitions::{PartEntry, PartTable, PtError, PtIdinfo},
    probe::{Magic, Probe},
    util::{Endianness, decode_utf16_lossy_from},
    volume::{PartFlags, VsType},
};

#[derive(Debug, Error)]
pub enum GptError {
    #[error("I/O operation failed: {0}")]
    IoError(#[from] IoError),
    #[error("GPT table header error: {0}")]
    GptHeaderError(&'static str),
    #[error("GPT header checksum failed, expected: \"{expected:X}\" and got: \"{got:X}\"")]
    ChecksumError {
        expected: CsumAlgorium,
        got: CsumAlgorium,
    },
}

pub(crate) const GPT_PT_ID_INFO: PtIdinfo = PtIdinfo {
    name: "gpt",
    vs_type: VsType::Gpt,
    probe_fn: |probe| probe_gpt_pt(probe).map_err(PtError::from),
    magics: Some(&[Magic {
        magic: b"EFI PART",
        len: 8,
        b_offset: 512,
    }]),
};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout, PartialEq)]
pub struct EfiGuid {
    pub time_low: U32<LittleEndian>,
    pub time_mid: U16<LittleEndian>,
    pub time_hi_and_version: U16<LittleEndian>,
    pub clock_seq_hi: u8,
    pub clock_seq_low: u8,
    pub node: [u8; 6],
}

impl EfiGuid {
    fn is_zero(&self) -> bool {
        return self.as_bytes() == [0u8; 16];
    }
}

impl From<EfiGuid> for Uuid {
    fn from(uuid: EfiGuid) -> Self {
        Uuid::from_fields(
            u32::from(uuid.time_low),
            u16::from(uuid.time_mid),
            u16::from(uuid.time_hi_and_version),
            &[
                uuid.clock_seq_hi,
                uuid.clock_seq_low,
                uuid.node[0],
                uuid.node[1],
                uuid.node[2],
                uuid.node[3],
                uuid.node[4],
                uuid.node[5],
            ],
        )
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct GptHeader {
    pub signature: [u8; 8],
    pub revision: U32<LittleEndian>,
    pub header_size: U32<LittleEndian>,
    pub header_crc32: U32<LittleEndian>,

    pub reserved1: U32<LittleEndian>,

    pub my_lba: U64<LittleEndian>,
    pub alternate_lba: U64<LittleEndian>,
    pub first_usable_lba: U64<LittleEndian>,
    pub last_usable_lba: U64<LittleEndian>,

    pub disk_guid: EfiGuid,

    pub partition_entries_lba: U64<LittleEndian>,
    pub num_partition_entries: U32<LittleEndian>,
    pub sizeof_partition_entry: U32<LittleEndian>,
    pub partition_entry_array_crc32: U32<LittleEndian>,
}

impl GptHeader {
    const HEADER_SIGNATURE: &'static [u8; 8] = b"EFI PART";
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct GptEntry {
    pub partition_type_guid: EfiGuid,
    pub unique_partition_guid: EfiGuid,
    pub starting_lba: U64<LittleEndian>,
    pub ending_lba: U64<LittleEndian>,

    pub attributes: U64<LittleEndian>,
    pub partition_name: [u8; 72],
}

/* Sanity bound for the partition entry array */
const GPT_MAX_ENTRIES: u32 = 4096;

fn last_lba(probe: &Probe) -> Option<u64> {
    let sz = probe.size();
    let ssz = probe.ssz();

    if sz < ssz {
        return None;
    }

    return Some((sz / ssz) - 1);
}

fn get_gpt_header(probe: &Probe, lba: u64, last_lba: u64) -> Result<GptHeader, GptError> {
    let ssz = probe.ssz();

    let raw = probe.read_vec_at(lba * ssz, ssz as usize)?;

    let header = GptHeader::read_from_bytes(&raw[..size_of::<GptHeader>()])
        .map_err(|_| GptError::GptHeaderError("Unable to map bytes to GPT header"))?;

    if &header.signature != GptHeader::HEADER_SIGNATURE {
        return Err(GptError::GptHeaderError("Invalid GPT header signature"));
    }

    let hsz = u64::from(header.header_size);

    if hsz > ssz || hsz < size_of::<GptHeader>() as u64 {
        return Err(GptError::GptHeaderError("GPT header size out of range"));
    }

    let stored_crc = u32::from(header.header_crc32);

    let mut header_bytes = raw[..hsz as usize].to_vec();
    header_bytes[16..20].fill(0);

    let crc = get_crc32_iso_hdlc(&header_bytes);
    if crc != stored_crc {
        return Err(GptError::ChecksumError {
            expected: CsumAlgorium::Crc32(stored_crc),
            got: CsumAlgorium::Crc32(crc),
        });
    }

    if u64::from(header.my_lba) != lba {
        return Err(GptError::GptHeaderError("GPT->MyLBA mismatch with real position"));
    }

    let fu = u64::from(header.first_usable_lba);
    let lu = u64::from(header.last_usable_lba);

    if lu < fu || fu > last_lba || lu > last_lba {
        return Err(GptError::GptHeaderError("GPT->{First,Last}UsableLBA out of range"));
    }

    if fu < lba && lba < lu {
        return Err(GptError::GptHeaderError("GPT header is inside usable area"));
    }

    return Ok(header);
}

pub fn probe_gpt_pt(probe: &Probe) -> Result<PartTable, GptError> {
    let ssz = probe.ssz();

    let lastlba = match last_lba(probe) {
        Some(t) => t,
        None => return Err(GptError::GptHeaderError("Unable to get last lba")),
    };

    let header = get_gpt_header(probe, 1, lastlba)?;

    let count = u32::from(header.num_partition_entries);
    let entry_size = u32::from(header.sizeof_partition_entry);

    if count == 0 || count > GPT_MAX_ENTRIES || entry_size as usize != size_of::<GptEntry>() {
        return Err(GptError::GptHeaderError("GPT entries undefined"));
    }

    let esz = count as usize * size_of::<GptEntry>();
    let entries_lba = u64::from(header.partition_entries_lba);
    if entries_lba <= 1 || entries_lba > lastlba {
        return Err(GptError::GptHeaderError("GPT entries LBA out of range"));
    }

    let entries_off = entries_lba
        .checked_mul(ssz)
        .ok_or(GptError::GptHeaderError("GPT entries offset overflows"))?;
    let entry_buffers = probe.read_vec_at(entries_off, esz)?;

    if !verify_crc32_iso_hdlc(&entry_buffers, u32::from(header.partition_entry_array_crc32)) {
        return Err(GptError::GptHeaderError("GPT entries array checksum mismatch"));
    }

    log::debug!(
        "probe_gpt_pt - DISK GUID: {}, ENTRIES: {count}",
        Uuid::from(header.disk_guid)
    );

    let fu = u64::from(header.first_usable_lba);
    let lu = u64::from(header.last_usable_lba);

    let mut entries = vec![
        PartEntry::meta(0, 1, "Safety Table"),
        PartEntry::meta(1, 1, "GPT Header"),
        PartEntry::meta(entries_lba, (esz as u64).div_ceil(ssz), "Partition Table"),
    ];

    let partitions = entry_buffers
        .chunks_exact(size_of::<GptEntry>())
        .enumerate()
        .filter_map(|(slot, buf)| {
            let entry = GptEntry::read_from_bytes(buf).ok()?;

            if entry.partition_type_guid.is_zero() {
                return None;
            }

            let start = u64::from(entry.starting_lba);
            let end = u64::from(entry.ending_lba);

            if end < start || start < fu || end > lu {
                log::warn!("probe_gpt_pt - entry {slot} out of usable range, skipped");
                return None;
            }

            let name = decode_utf16_lossy_from(&entry.partition_name, Endianness::Little).to_string();
            let description = if name.is_empty() {
                Uuid::from(entry.partition_type_guid).to_string()
            } else {
                name
            };

            return Some(PartEntry {
                start,
                len: end - start + 1,
                description,
                flags: PartFlags::ALLOC,
                slot: Some(slot as u32),
            });
        });

    entries.extend(partitions);

    return Ok(PartTable {
        vs_type: VsType::Gpt,
        block_size: ssz,
        endian: Endianness::Little,
        entries,
    });
}

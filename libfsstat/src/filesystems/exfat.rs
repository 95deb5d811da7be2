use std::io::Error as IoError;

use thiserror::Error;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::{LittleEndian, U16, U32, U64},
};

use crate::{
    checksum::{CsumAlgorium, get_exfatcsum},
    filesystem::FsType,
    filesystems::{FsError, FsIdinfo, FsInfo, vfat::VFAT_ID_INFO},
    probe::{Magic, Probe},
    util::{Endianness, decode_utf16_lossy_from},
};

#[derive(Debug, Error)]
pub enum ExFatError {
    #[error("I/O operation failed: {0}")]
    IoError(#[from] IoError),
    #[error("Not an exFAT superblock: {0}")]
    UnknownFilesystem(&'static str),
    #[error("exFAT header error: {0}")]
    ExfatHeaderError(&'static str),
    #[error("exFAT checksum failed, expected: \"{expected:X}\" and got: \"{got:X}\"")]
    ChecksumError {
        expected: CsumAlgorium,
        got: CsumAlgorium,
    },
}

pub(crate) const EXFAT_ID_INFO: FsIdinfo = FsIdinfo {
    name: "exfat",
    ftype: FsType::EXFAT,
    auto: true,
    probe_fn: |probe, magic| probe_exfat(probe, magic).map_err(FsError::from),
    magics: Some(&[Magic {
        magic: b"EXFAT   ",
        len: 8,
        b_offset: 3,
    }]),
};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct ExFatSuperBlock {
    pub bootjmp: [u8; 3],
    pub fs_name: [u8; 8],
    pub must_be_zero: [u8; 53],
    pub partition_offset: U64<LittleEndian>,
    pub volume_length: U64<LittleEndian>,
    pub fat_offset: U32<LittleEndian>,
    pub fat_length: U32<LittleEndian>,
    pub cluster_heap_offset: U32<LittleEndian>,
    pub cluster_count: U32<LittleEndian>,
    pub first_cluster_of_root: U32<LittleEndian>,
    pub volume_serial: [u8; 4],
    pub vermin: u8,
    pub vermaj: u8,
    pub volume_flags: U16<LittleEndian>,
    pub bytes_per_sector_shift: u8,
    pub sectors_per_cluster_shift: u8,
    pub number_of_fats: u8,
    pub drive_select: u8,
    pub percent_in_use: u8,
    pub reserved: [u8; 7],
    pub boot_code: [u8; 390],
    pub boot_signature: U16<LittleEndian>,
}

impl ExFatSuperBlock {
    fn block_size(&self) -> u64 {
        if self.bytes_per_sector_shift < 32 {
            return 1u64 << self.bytes_per_sector_shift;
        }
        return 0;
    }

    fn cluster_size(&self) -> u64 {
        if self.sectors_per_cluster_shift < 32 {
            return self.block_size() << self.sectors_per_cluster_shift;
        }
        return 0;
    }

    fn block_to_offset(&self, block: u64) -> u64 {
        return block << self.bytes_per_sector_shift;
    }

    fn cluster_to_block(&self, cluster: u32) -> u64 {
        return u64::from(self.cluster_heap_offset)
            + (u64::from(cluster - EXFAT_FIRST_DATA_CLUSTER) << self.sectors_per_cluster_shift);
    }

    fn cluster_to_offset(&self, cluster: u32) -> u64 {
        return self.block_to_offset(self.cluster_to_block(cluster));
    }

    fn next_cluster(&self, probe: &Probe, cluster: u32) -> Result<u32, ExFatError> {
        let fat_offset =
            self.block_to_offset(u64::from(self.fat_offset)) + (u64::from(cluster) * 4);
        let next: [u8; 4] = probe.read_exact_at(fat_offset)?;

        return Ok(u32::from_le_bytes(next));
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct ExfatEntryLabel {
    pub label_type: u8,
    pub length: u8,
    pub name: [u8; 22],
    pub reserved: [u8; 8],
}

const EXFAT_FIRST_DATA_CLUSTER: u32 = 2;
const EXFAT_LAST_DATA_CLUSTER: u32 = 0x0FFFFFF6;
const EXFAT_ENTRY_SIZE: u64 = 32;
/* 256 MiB directory cap, in entries */
const EXFAT_MAX_DIR_ENTRIES: u64 = 8388608;

const EXFAT_ENTRY_EOD: u8 = 0x00;
const EXFAT_ENTRY_LABEL: u8 = 0x83;

const EXFAT_FIRST_INUM: u64 = 2;
const EXFAT_ROOT_INUM: u64 = 2;
const EXFAT_FIRST_NORMAL_INUM: u64 = 3;
const EXFAT_NUM_VIRT_FILES: u64 = 4;

fn verify_exfat_checksum(probe: &Probe, sb: &ExFatSuperBlock) -> Result<(), ExFatError> {
    let sector_size = sb.block_size() as usize;
    let data = probe.read_vec_at(0, sector_size * 12)?;
    let checksum = get_exfatcsum(&data, sector_size);

    for stored in data[sector_size * 11..].chunks_exact(4) {
        let expected = u32::from_le_bytes([stored[0], stored[1], stored[2], stored[3]]);

        if checksum != expected {
            return Err(ExFatError::ChecksumError {
                expected: CsumAlgorium::Exfat(expected),
                got: CsumAlgorium::Exfat(checksum),
            });
        }
    }

    return Ok(());
}

#[inline]
fn in_range_inclusive<T: PartialOrd>(val: T, start: T, stop: T) -> bool {
    return val >= start && val <= stop;
}

fn valid_exfat(probe: &Probe, sb: &ExFatSuperBlock) -> Result<(), ExFatError> {
    if u16::from(sb.boot_signature) != 0xAA55 {
        return Err(ExFatError::UnknownFilesystem("Block is not exfat likely a mbr partiton table"));
    }

    if sb.bootjmp != [0xEB, 0x76, 0x90] {
        return Err(ExFatError::ExfatHeaderError("Boot jump should be \\xEB\\x76\\x90"));
    }

    if &sb.fs_name != b"EXFAT   " {
        return Err(ExFatError::ExfatHeaderError("fs_name should be \"EXFAT   \""));
    }

    if sb.must_be_zero != [0u8; 53] {
        return Err(ExFatError::ExfatHeaderError("must_be_zero region is not all zero"));
    }

    if !in_range_inclusive(sb.number_of_fats, 1, 2) {
        return Err(ExFatError::ExfatHeaderError("number of fats needs to be 1 or 2"));
    }

    if !in_range_inclusive(sb.bytes_per_sector_shift, 9, 12) {
        return Err(ExFatError::ExfatHeaderError("bytes_per_sector_shift needs to be in 9..=12"));
    }

    if !in_range_inclusive(sb.sectors_per_cluster_shift, 0, 25 - sb.bytes_per_sector_shift) {
        return Err(ExFatError::ExfatHeaderError(
            "sectors_per_cluster_shift needs to be <= 25 - bytes_per_sector_shift",
        ));
    }

    let fat_offset = u64::from(sb.fat_offset);
    let fats_len = u64::from(sb.fat_length) * u64::from(sb.number_of_fats);
    let heap_offset = u64::from(sb.cluster_heap_offset);

    if fat_offset < 24 || fat_offset + fats_len > heap_offset {
        return Err(ExFatError::ExfatHeaderError(
            "fat_offset needs to be >= 24 and the FATs must end before the cluster heap",
        ));
    }

    if heap_offset > 1u64 << 31 {
        return Err(ExFatError::ExfatHeaderError("cluster_heap_offset out of range"));
    }

    if !in_range_inclusive(
        u64::from(sb.first_cluster_of_root),
        2,
        u64::from(sb.cluster_count) + 1,
    ) {
        return Err(ExFatError::ExfatHeaderError(
            "first_cluster_of_root needs to be in 2..=cluster_count + 1",
        ));
    }

    verify_exfat_checksum(probe, sb)?;

    return Ok(());
}

pub fn probe_is_exfat(probe: &Probe) -> Result<(), ExFatError> {
    if probe.get_magic(VFAT_ID_INFO.magics).is_ok_and(|m| m.is_some_and(|m| m.len > 2)) {
        return Err(ExFatError::UnknownFilesystem("Block is detected with a VFAT magic"));
    }

    probe.get_magic(EXFAT_ID_INFO.magics)?;

    let sb: ExFatSuperBlock = probe.map_from(0)?;
    valid_exfat(probe, &sb)?;

    return Ok(());
}

fn find_label(probe: &Probe, sb: &ExFatSuperBlock) -> Result<Option<String>, ExFatError> {
    let mut cluster = u32::from(sb.first_cluster_of_root);
    let mut offset = sb.cluster_to_offset(cluster);

    for _ in 0..EXFAT_MAX_DIR_ENTRIES {
        let entry: ExfatEntryLabel = match probe.map_from(offset) {
            Ok(t) => t,
            Err(_) => return Ok(None),
        };

        if entry.label_type == EXFAT_ENTRY_EOD {
            return Ok(None);
        }
        if entry.label_type == EXFAT_ENTRY_LABEL {
            let len = usize::from(entry.length).min(entry.name.len() / 2);
            let label = decode_utf16_lossy_from(&entry.name[..len * 2], Endianness::Little);
            return Ok(Some(label.to_string()));
        }

        offset += EXFAT_ENTRY_SIZE;

        if sb.cluster_size() != 0 && offset % sb.cluster_size() == 0 {
            cluster = sb.next_cluster(probe, cluster)?;
            if !(EXFAT_FIRST_DATA_CLUSTER..=EXFAT_LAST_DATA_CLUSTER).contains(&cluster) {
                return Ok(None);
            }
            offset = sb.cluster_to_offset(cluster);
        }
    }

    return Ok(None);
}

pub fn probe_exfat(probe: &Probe, _mag: Magic) -> Result<FsInfo, ExFatError> {
    let sb: ExFatSuperBlock = probe.map_from(0)?;

    valid_exfat(probe, &sb)?;

    let label = find_label(probe, &sb)?;

    log::debug!(
        "probe_exfat - VERSION: {}.{}, CLUSTERS: {}, CLUSTER SIZE: {}",
        sb.vermaj,
        sb.vermin,
        u32::from(sb.cluster_count),
        sb.cluster_size()
    );

    let sector_size = sb.block_size();
    let mut info = FsInfo::new(
        probe,
        FsType::EXFAT,
        sector_size as u32,
        u64::from(sb.volume_length),
        "Sector",
    );

    let dentry_per_sect = sector_size / EXFAT_ENTRY_SIZE;

    info.endian = Endianness::Little;
    info.first_inum = EXFAT_FIRST_INUM;
    info.root_inum = EXFAT_ROOT_INUM;
    info.last_inum = (info.last_block_act + 1)
        .saturating_sub(u64::from(sb.cluster_heap_offset))
        * dentry_per_sect
        + EXFAT_FIRST_NORMAL_INUM
        - 1
        + EXFAT_NUM_VIRT_FILES;
    info.inum_count = info.last_inum - info.first_inum + 1;
    info.fs_id = sb.volume_serial.to_vec();
    info.label = label;

    return Ok(info);
}

use std::io::Error as IoError;

use thiserror::Error;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::{LittleEndian, U16, U32, U64},
};

use crate::{
    filesystem::{FsFlags, FsType},
    filesystems::{FsError, FsIdinfo, FsInfo},
    probe::{Magic, Probe},
    util::{Endianness, decode_utf16_lossy_from, is_power_2},
};

#[derive(Debug, Error)]
pub enum NtfsError {
    #[error("I/O operation failed: {0}")]
    IoError(#[from] IoError),
    #[error("Not an NTFS superblock: {0}")]
    UnknownFilesystem(&'static str),
    #[error("NTFS header error: {0}")]
    NtfsHeaderError(&'static str),
}

pub(crate) const NTFS_ID_INFO: FsIdinfo = FsIdinfo {
    name: "ntfs",
    ftype: FsType::NTFS,
    auto: true,
    probe_fn: |probe, magic| probe_ntfs(probe, magic).map_err(FsError::from),
    magics: Some(&[Magic {
        magic: b"NTFS    ",
        len: 8,
        b_offset: 3,
    }]),
};

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct NtfsSuperBlock {
    pub bootjmp: [u8; 3],
    pub oem_id: [u8; 8],

    pub sector_size: U16<LittleEndian>,
    pub sectors_per_cluster: u8,
    pub reserved_sectors: U16<LittleEndian>,
    pub fats: u8,
    pub root_entries: U16<LittleEndian>,
    pub sectors: U16<LittleEndian>,
    pub media_type: u8,
    pub sectors_per_fat: U16<LittleEndian>,
    pub sectors_per_track: U16<LittleEndian>,
    pub heads: U16<LittleEndian>,
    pub hidden_sectors: U32<LittleEndian>,
    pub large_sectors: U32<LittleEndian>,

    pub unused: [U16<LittleEndian>; 2],
    pub number_of_sectors: U64<LittleEndian>,
    pub mft_cluster_location: U64<LittleEndian>,
    pub mft_mirror_cluster_location: U64<LittleEndian>,
    pub clusters_per_mft_record: i8,
    pub reserved1: [u8; 3],
    pub cluster_per_index_record: i8,
    pub reserved2: [u8; 3],
    pub volume_serial: [u8; 8],
    pub checksum: U32<LittleEndian>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct MasterFileTableRecord {
    pub magic: [u8; 4],
    pub usa_ofs: U16<LittleEndian>,
    pub usa_count: U16<LittleEndian>,
    pub lsn: U64<LittleEndian>,
    pub sequence_number: U16<LittleEndian>,
    pub link_count: U16<LittleEndian>,
    pub attrs_offset: U16<LittleEndian>,
    pub flags: U16<LittleEndian>,
    pub bytes_in_use: U32<LittleEndian>,
    pub bytes_allocated: U32<LittleEndian>,
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct FileAttribute {
    pub file_type: U32<LittleEndian>,
    pub len: U32<LittleEndian>,
    pub non_resident: u8,
    pub name_len: u8,
    pub name_offset: U16<LittleEndian>,
    pub flags: U16<LittleEndian>,
    pub instance: U16<LittleEndian>,
    pub value_len: U32<LittleEndian>,
    pub value_offset: U16<LittleEndian>,
}

const MFT_RECORD_MFT: u64 = 0;
const MFT_RECORD_VOLUME: u64 = 3;
const NTFS_MAX_CLUSTER_SIZE: u64 = 2097152; //2 * 1024 * 1024

const MFT_RECORD_ATTR_VOLUME_NAME: u32 = 0x60;
const MFT_RECORD_ATTR_DATA: u32 = 0x80;
const MFT_RECORD_ATTR_END: u32 = 0xffffffff;

/* Real size of the stream, in the non-resident attribute header */
const NONRESIDENT_REAL_SIZE_OFFSET: usize = 0x30;

const NTFS_FIRST_INUM: u64 = 0;
const NTFS_ROOT_INUM: u64 = 5;

/// Sizes derived from a valid boot sector.
#[derive(Debug, Copy, Clone)]
struct NtfsGeometry {
    sector_size: u64,
    sectors_per_cluster: u64,
    mft_record_size: u64,
}

impl NtfsGeometry {
    fn cluster_size(&self) -> u64 {
        return self.sector_size * self.sectors_per_cluster;
    }
}

fn check_ntfs(ns: &NtfsSuperBlock) -> Result<NtfsGeometry, NtfsError> {
    let sector_size = u64::from(ns.sector_size);

    if !(256..=4096).contains(&sector_size) || !is_power_2(sector_size) {
        return Err(NtfsError::NtfsHeaderError("Sector size is wrong"));
    }

    let sectors_per_cluster = match ns.sectors_per_cluster {
        1 | 2 | 4 | 8 | 16 | 32 | 64 | 128 => u64::from(ns.sectors_per_cluster),
        240..=249 => 1u64 << (256 - u16::from(ns.sectors_per_cluster)),
        _ => return Err(NtfsError::NtfsHeaderError("Sector Per Cluster wrong")),
    };

    if (sector_size * sectors_per_cluster) > NTFS_MAX_CLUSTER_SIZE {
        return Err(NtfsError::NtfsHeaderError("Cluster size too large"));
    }

    if u16::from(ns.reserved_sectors) != 0
        || u16::from(ns.root_entries) != 0
        || u16::from(ns.sectors) != 0
        || u16::from(ns.sectors_per_fat) != 0
        || u32::from(ns.large_sectors) != 0
        || ns.fats != 0
    {
        return Err(NtfsError::NtfsHeaderError("Unused fields must be zero"));
    }

    /* Positive values count clusters, negative ones are a power of two
     * in bytes. */
    let mft_record_size = match ns.clusters_per_mft_record {
        1 | 2 | 4 | 8 | 16 | 32 | 64 => {
            ns.clusters_per_mft_record as u64 * sectors_per_cluster * sector_size
        }
        -31..=-9 => 1u64 << (-i16::from(ns.clusters_per_mft_record)),
        _ => {
            return Err(NtfsError::NtfsHeaderError("wrong value: clusters_per_mft_record"));
        }
    };

    return Ok(NtfsGeometry {
        sector_size,
        sectors_per_cluster,
        mft_record_size,
    });
}

/// Undo the update sequence array protection on a multi-sector record.
fn apply_fixups(buf: &mut [u8], mft: &MasterFileTableRecord, sector_size: usize) {
    let usa_ofs = usize::from(mft.usa_ofs);
    let usa_count = usize::from(mft.usa_count);

    if usa_count < 2 || usa_ofs + usa_count * 2 > buf.len() {
        return;
    }

    let usn = [buf[usa_ofs], buf[usa_ofs + 1]];

    for i in 1..usa_count {
        let end = i * sector_size;
        if end > buf.len() {
            break;
        }

        if buf[end - 2..end] != usn {
            log::warn!("apply_fixups - sector {i} update sequence mismatch");
        }

        let fix = usa_ofs + i * 2;
        buf[end - 2] = buf[fix];
        buf[end - 1] = buf[fix + 1];
    }
}

fn read_mft_record(
    probe: &Probe,
    ns: &NtfsSuperBlock,
    geo: &NtfsGeometry,
    record: u64,
) -> Result<(MasterFileTableRecord, Vec<u8>), NtfsError> {
    let off = u64::from(ns.mft_cluster_location)
        .checked_mul(geo.cluster_size())
        .and_then(|base| base.checked_add(record.checked_mul(geo.mft_record_size)?))
        .ok_or(NtfsError::NtfsHeaderError("MFT record offset overflows"))?;

    let mut buf = probe.read_vec_at(off, geo.mft_record_size as usize)?;

    let mft = MasterFileTableRecord::read_from_bytes(&buf[..size_of::<MasterFileTableRecord>()])
        .map_err(|_| NtfsError::NtfsHeaderError("Unable to map bytes to Master File Table Record"))?;

    if &mft.magic != b"FILE" {
        return Err(NtfsError::NtfsHeaderError("MFT record missing sig: \"FILE\""));
    }

    apply_fixups(&mut buf, &mft, geo.sector_size as usize);

    return Ok((mft, buf));
}

/// Offset and header of the first attribute of type `attr_type`.
fn find_attribute(
    buf: &[u8],
    mft: &MasterFileTableRecord,
    attr_type: u32,
) -> Result<Option<(usize, FileAttribute)>, NtfsError> {
    let mut attr_off = usize::from(mft.attrs_offset);
    let limit = buf.len().min(u32::from(mft.bytes_allocated) as usize);

    while attr_off + size_of::<FileAttribute>() <= limit {
        let attr = FileAttribute::read_from_bytes(&buf[attr_off..attr_off + size_of::<FileAttribute>()])
            .map_err(|_| NtfsError::NtfsHeaderError("Unable to map bytes to File Attribute"))?;

        let attr_len = u32::from(attr.len) as usize;
        let file_type = u32::from(attr.file_type);

        if attr_len == 0 || file_type == MFT_RECORD_ATTR_END {
            break;
        }

        if file_type == attr_type {
            return Ok(Some((attr_off, attr)));
        }

        attr_off += attr_len;
    }

    return Ok(None);
}

fn find_label(
    probe: &Probe,
    ns: &NtfsSuperBlock,
    geo: &NtfsGeometry,
) -> Result<Option<String>, NtfsError> {
    let (mft, buf) = read_mft_record(probe, ns, geo, MFT_RECORD_VOLUME)?;

    let (attr_off, attr) = match find_attribute(&buf, &mft, MFT_RECORD_ATTR_VOLUME_NAME)? {
        Some(t) => t,
        None => return Err(NtfsError::NtfsHeaderError("Unable to find offset of label")),
    };

    let val_start = attr_off + usize::from(attr.value_offset);
    let val_end = val_start + u32::from(attr.value_len) as usize;

    let val = buf
        .get(val_start..val_end)
        .ok_or(NtfsError::NtfsHeaderError("Volume name outside of MFT record"))?;

    if val.is_empty() {
        return Ok(None);
    }

    return Ok(Some(decode_utf16_lossy_from(val, Endianness::Little).to_string()));
}

/// Number of entries in the MFT, from the size of its own `$DATA` stream.
fn mft_entry_count(
    probe: &Probe,
    ns: &NtfsSuperBlock,
    geo: &NtfsGeometry,
) -> Result<u64, NtfsError> {
    let (mft, buf) = read_mft_record(probe, ns, geo, MFT_RECORD_MFT)?;

    let (attr_off, attr) = match find_attribute(&buf, &mft, MFT_RECORD_ATTR_DATA)? {
        Some(t) => t,
        None => return Err(NtfsError::NtfsHeaderError("$MFT has no $DATA attribute")),
    };

    if attr.non_resident == 0 {
        return Err(NtfsError::NtfsHeaderError("$MFT $DATA attribute is resident"));
    }

    let size_off = attr_off + NONRESIDENT_REAL_SIZE_OFFSET;
    let size_bytes: [u8; 8] = buf
        .get(size_off..size_off + 8)
        .and_then(|b| b.try_into().ok())
        .ok_or(NtfsError::NtfsHeaderError("$MFT $DATA header truncated"))?;

    return Ok(u64::from_le_bytes(size_bytes) / geo.mft_record_size);
}

pub fn probe_is_ntfs(probe: &Probe) -> Result<(), NtfsError> {
    probe.get_magic(NTFS_ID_INFO.magics)?;

    let ns: NtfsSuperBlock = probe.map_from(0)?;
    check_ntfs(&ns)?;

    return Ok(());
}

pub fn probe_ntfs(probe: &Probe, _magic: Magic) -> Result<FsInfo, NtfsError> {
    let ns: NtfsSuperBlock = probe.map_from(0)?;

    let geo = check_ntfs(&ns)?;

    let nr_clusters = u64::from(ns.number_of_sectors) / geo.sectors_per_cluster;

    if u64::from(ns.mft_cluster_location) > nr_clusters
        || u64::from(ns.mft_mirror_cluster_location) > nr_clusters
    {
        return Err(NtfsError::NtfsHeaderError("MFT location past end of volume"));
    }

    let entries = mft_entry_count(probe, &ns, &geo)?;

    if entries == 0 {
        return Err(NtfsError::NtfsHeaderError("$MFT is empty"));
    }

    let label = match find_label(probe, &ns, &geo) {
        Ok(label) => label,
        Err(e) => {
            log::debug!("probe_ntfs - no volume label: {e}");
            None
        }
    };

    log::debug!(
        "probe_ntfs - CLUSTERS: {nr_clusters}, CLUSTER SIZE: {}, MFT ENTRIES: {entries}",
        geo.cluster_size()
    );

    let mut info = FsInfo::new(
        probe,
        FsType::NTFS,
        geo.cluster_size() as u32,
        nr_clusters,
        "Cluster",
    );

    info.dev_bsize = geo.sector_size as u32;
    info.endian = Endianness::Little;
    info.first_inum = NTFS_FIRST_INUM;
    info.root_inum = NTFS_ROOT_INUM;
    /* One past the last MFT entry is the virtual orphan directory */
    info.last_inum = entries;
    info.inum_count = info.last_inum - info.first_inum + 1;
    info.fs_id = ns.volume_serial.to_vec();
    info.flags = FsFlags::HAVE_SEQ;
    info.label = label;

    return Ok(info);
}

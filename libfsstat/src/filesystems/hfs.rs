use std::io::Error as IoError;

use thiserror::Error;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::{BigEndian, U16, U32, U64},
};

use crate::{
    filesystem::FsType,
    filesystems::{FsError, FsIdinfo, FsInfo},
    probe::{Magic, Probe},
    util::{Endianness, is_power_2},
};

/*
https://developer.apple.com/library/archive/technotes/tn/tn1150.html
*/

#[derive(Debug, Error)]
pub enum HfsError {
    #[error("I/O operation failed: {0}")]
    IoError(#[from] IoError),
    #[error("Not an HFS+ volume header: {0}")]
    UnknownFilesystem(&'static str),
    #[error("HFS+ header error: {0}")]
    HfsHeaderError(&'static str),
}

pub(crate) const HFS_ID_INFO: FsIdinfo = FsIdinfo {
    name: "hfs",
    ftype: FsType::HFS,
    auto: true,
    probe_fn: |probe, magic| probe_hfs(probe, magic).map_err(FsError::from),
    magics: Some(&[
        Magic {
            magic: b"H+",
            len: 2,
            b_offset: HFS_HEADER_OFFSET,
        },
        Magic {
            magic: b"HX",
            len: 2,
            b_offset: HFS_HEADER_OFFSET,
        },
        Magic {
            magic: b"BD",
            len: 2,
            b_offset: HFS_HEADER_OFFSET,
        },
    ]),
};

const HFS_HEADER_OFFSET: u64 = 1024;

const HFS_PLUS_VERSION: u16 = 4;
const HFSX_VERSION: u16 = 5;

/* Catalog node IDs: 2 is the root folder, user files start at 16 */
const HFS_FIRST_INUM: u64 = 2;
const HFS_ROOT_INUM: u64 = 2;

const HFS_MIN_BLOCK_SIZE: u64 = 512;
const HFS_WRAPPER_SECTOR: u64 = 512;

/// HFS+ volume header, up to the finder info. The fork data records that
/// follow are not needed here.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct HfsPlusVolumeHeader {
    pub signature: [u8; 2],
    pub version: U16<BigEndian>,
    pub attributes: U32<BigEndian>,
    pub last_mounted_version: [u8; 4],
    pub journal_info_block: U32<BigEndian>,
    pub create_date: U32<BigEndian>,
    pub modify_date: U32<BigEndian>,
    pub backup_date: U32<BigEndian>,
    pub checked_date: U32<BigEndian>,
    pub file_count: U32<BigEndian>,
    pub folder_count: U32<BigEndian>,
    pub block_size: U32<BigEndian>,
    pub total_blocks: U32<BigEndian>,
    pub free_blocks: U32<BigEndian>,
    pub next_allocation: U32<BigEndian>,
    pub rsrc_clump_size: U32<BigEndian>,
    pub data_clump_size: U32<BigEndian>,
    pub next_catalog_id: U32<BigEndian>,
    pub write_count: U32<BigEndian>,
    pub encodings_bitmap: U64<BigEndian>,
    pub finder_info: [u8; 32],
}

/// Classic HFS master directory block, only as far as the embedded
/// volume extent used by HFS+ wrappers.
#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct HfsMasterDirectoryBlock {
    pub dr_sig_word: [u8; 2],
    pub dr_cr_date: U32<BigEndian>,
    pub dr_ls_mod: U32<BigEndian>,
    pub dr_atrb: U16<BigEndian>,
    pub dr_nm_fls: U16<BigEndian>,
    pub dr_vbm_st: U16<BigEndian>,
    pub dr_alloc_ptr: U16<BigEndian>,
    pub dr_nm_al_blks: U16<BigEndian>,
    pub dr_al_blk_siz: U32<BigEndian>,
    pub dr_clp_siz: U32<BigEndian>,
    pub dr_al_bl_st: U16<BigEndian>,
    pub dr_nxt_cnid: U32<BigEndian>,
    pub dr_free_bks: U16<BigEndian>,
    pub dr_vn: [u8; 28],
    pub dr_vol_bk_up: U32<BigEndian>,
    pub dr_v_seq_num: U16<BigEndian>,
    pub dr_wr_cnt: U32<BigEndian>,
    pub dr_xt_clp_siz: U32<BigEndian>,
    pub dr_ct_clp_siz: U32<BigEndian>,
    pub dr_nm_rt_dirs: U16<BigEndian>,
    pub dr_fil_cnt: U32<BigEndian>,
    pub dr_dir_cnt: U32<BigEndian>,
    pub dr_fndr_info: [u8; 32],
    pub dr_embed_sig_word: [u8; 2],
    pub dr_embed_start_block: U16<BigEndian>,
    pub dr_embed_block_count: U16<BigEndian>,
}

/// Offset of the HFS+ volume embedded in an HFS wrapper, relative to the
/// wrapper start.
fn hfs_embedded_offset(probe: &Probe) -> Result<u64, HfsError> {
    let mdb: HfsMasterDirectoryBlock = probe.map_from(HFS_HEADER_OFFSET)?;

    if &mdb.dr_sig_word != b"BD" {
        return Err(HfsError::UnknownFilesystem("Missing HFS signature"));
    }

    if &mdb.dr_embed_sig_word != b"H+" {
        return Err(HfsError::UnknownFilesystem("Plain HFS volume without embedded HFS+"));
    }

    let al_blk_siz = u64::from(mdb.dr_al_blk_siz);
    if al_blk_siz == 0 || al_blk_siz % HFS_WRAPPER_SECTOR != 0 {
        return Err(HfsError::HfsHeaderError("Invalid wrapper allocation block size"));
    }

    let offset = u64::from(mdb.dr_al_bl_st) * HFS_WRAPPER_SECTOR
        + u64::from(mdb.dr_embed_start_block) * al_blk_siz;

    log::debug!(
        "hfs_embedded_offset - EMBEDDED HFS+ AT: {offset}, BLOCKS: {}",
        u16::from(mdb.dr_embed_block_count)
    );

    return Ok(offset);
}

fn hfs_get_header(probe: &Probe) -> Result<HfsPlusVolumeHeader, HfsError> {
    let vh: HfsPlusVolumeHeader = probe.map_from(HFS_HEADER_OFFSET)?;

    match (&vh.signature, u16::from(vh.version)) {
        (b"H+", HFS_PLUS_VERSION) | (b"HX", HFSX_VERSION) => (),
        (b"H+", _) | (b"HX", _) => {
            return Err(HfsError::HfsHeaderError("Volume header version does not match signature"));
        }
        _ => return Err(HfsError::UnknownFilesystem("Missing HFS+ signature")),
    }

    let block_size = u64::from(vh.block_size);
    if block_size < HFS_MIN_BLOCK_SIZE || !is_power_2(block_size) {
        return Err(HfsError::HfsHeaderError("block_size is not a power of 2 >= 512"));
    }

    if u32::from(vh.total_blocks) == 0 {
        return Err(HfsError::HfsHeaderError("total_blocks is 0"));
    }

    return Ok(vh);
}

pub fn probe_hfs(probe: &Probe, magic: Magic) -> Result<FsInfo, HfsError> {
    let window = if magic.magic == b"BD" {
        let offset = hfs_embedded_offset(probe)?;
        probe
            .sub(offset)
            .ok_or(HfsError::HfsHeaderError("Embedded volume past end of wrapper"))?
    } else {
        *probe
    };

    let vh = hfs_get_header(&window)?;

    let block_size = u32::from(vh.block_size);
    let next_catalog_id = u64::from(vh.next_catalog_id);

    log::debug!(
        "probe_hfs - SIGNATURE: \"{}\", BLOCK SIZE: {block_size}, FILES: {}, FOLDERS: {}",
        String::from_utf8_lossy(&vh.signature),
        u32::from(vh.file_count),
        u32::from(vh.folder_count)
    );

    let mut info = FsInfo::new(
        &window,
        FsType::HFS,
        block_size,
        u64::from(u32::from(vh.total_blocks)),
        "Allocation Block",
    );

    info.dev_bsize = block_size;
    info.endian = Endianness::Big;
    info.first_inum = HFS_FIRST_INUM;
    info.root_inum = HFS_ROOT_INUM;
    info.last_inum = next_catalog_id.saturating_sub(1);
    info.inum_count = info.last_inum + 1;
    /* Volume identifier: the last two finder info words, as stored */
    info.fs_id = vh.finder_info[24..32].to_vec();

    return Ok(info);
}

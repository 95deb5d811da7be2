use thiserror::Error;

use crate::{
    filesystem::FsType,
    filesystems::{FsError, FsIdinfo, FsInfo},
    probe::{Magic, Probe},
};

/* Raw and swap views have no on-disk structure: they only split the window
 * into fixed size units and are never picked by auto-detection. */

#[derive(Debug, Error)]
pub enum RawError {
    #[error("Window of {size} bytes holds no {unit} byte unit")]
    TooSmall { size: u64, unit: u32 },
}

pub(crate) const RAW_ID_INFO: FsIdinfo = FsIdinfo {
    name: "raw",
    ftype: FsType::RAW,
    auto: false,
    probe_fn: |probe, magic| probe_raw(probe, magic).map_err(FsError::from),
    magics: None,
};

pub(crate) const SWAP_ID_INFO: FsIdinfo = FsIdinfo {
    name: "swap",
    ftype: FsType::SWAP,
    auto: false,
    probe_fn: |probe, magic| probe_swap(probe, magic).map_err(FsError::from),
    magics: None,
};

const RAW_BLOCK_SIZE: u32 = 512;
const SWAP_PAGE_SIZE: u32 = 4096;

fn probe_units(
    probe: &Probe,
    ftype: FsType,
    unit: u32,
    data_unit_name: &'static str,
) -> Result<FsInfo, RawError> {
    let present = probe.image().size().saturating_sub(probe.offset());
    let size = probe.size().min(present);
    let block_count = size / u64::from(unit);

    if block_count == 0 {
        return Err(RawError::TooSmall { size, unit });
    }

    return Ok(FsInfo::new(probe, ftype, unit, block_count, data_unit_name));
}

pub fn probe_raw(probe: &Probe, _magic: Magic) -> Result<FsInfo, RawError> {
    return probe_units(probe, FsType::RAW, RAW_BLOCK_SIZE, "Sector");
}

pub fn probe_swap(probe: &Probe, _magic: Magic) -> Result<FsInfo, RawError> {
    return probe_units(probe, FsType::SWAP, SWAP_PAGE_SIZE, "Page");
}

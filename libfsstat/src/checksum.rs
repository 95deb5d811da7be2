use std::fmt;

use crc::{CRC_32_ISCSI, CRC_32_ISO_HDLC, Crc};

const CRC32_ISO_HDLC: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);
const CRC32C: Crc<u32> = Crc::<u32>::new(&CRC_32_ISCSI);

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum CsumAlgorium {
    Crc32(u32),
    Crc32c(u32),
    Exfat(u32),
}

impl fmt::Display for CsumAlgorium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CsumAlgorium::Crc32(checksum) => write!(f, "{checksum}"),
            CsumAlgorium::Crc32c(checksum) => write!(f, "{checksum}"),
            CsumAlgorium::Exfat(checksum) => write!(f, "{checksum}"),
        }
    }
}

impl fmt::UpperHex for CsumAlgorium {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CsumAlgorium::Crc32(checksum) => write!(f, "{checksum:X}"),
            CsumAlgorium::Crc32c(checksum) => write!(f, "{checksum:X}"),
            CsumAlgorium::Exfat(checksum) => write!(f, "{checksum:X}"),
        }
    }
}

pub fn get_crc32_iso_hdlc(bytes: &[u8]) -> u32 {
    return CRC32_ISO_HDLC.checksum(bytes);
}

pub fn verify_crc32_iso_hdlc(bytes: &[u8], checksum: u32) -> bool {
    return get_crc32_iso_hdlc(bytes) == checksum;
}

/// Raw CRC-32C register value (no final inversion), as stored by ext4
/// metadata checksums.
pub fn get_crc32c_raw(bytes: &[u8]) -> u32 {
    return !CRC32C.checksum(bytes);
}

/// exFAT boot region checksum over the first eleven sectors, skipping the
/// volume flags and percent-in-use bytes.
pub fn get_exfatcsum(sectors: &[u8], sector_size: usize) -> u32 {
    let n_bytes = sector_size * 11;

    let mut checksum: u32 = 0;

    for (i, byte) in sectors.iter().enumerate().take(n_bytes) {
        if i == 106 || i == 107 || i == 112 {
            continue;
        }

        checksum = checksum.rotate_right(1).wrapping_add(u32::from(*byte));
    }

    return checksum;
}

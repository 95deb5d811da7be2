use std::fmt;

use widestring::utfstring::Utf16String;

/// Byte order of on-disk structures.
///
/// The numeric codes match the ones used by forensic tooling:
/// `0` unknown, `1` little endian, `2` big endian.
#[derive(Debug, Copy, Clone, Default, Eq, PartialEq, Ord, PartialOrd, Hash)]
pub enum Endianness {
    #[default]
    Unknown,
    Little,
    Big,
}

impl Endianness {
    pub fn code(&self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Little => 1,
            Self::Big => 2,
        }
    }
}

impl fmt::Display for Endianness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unknown => write!(f, "Unknown"),
            Self::Little => write!(f, "Little Endian"),
            Self::Big => write!(f, "Big Endian"),
        }
    }
}

pub fn decode_utf16_lossy_from(bytes: &[u8], endian: Endianness) -> Utf16String {
    let data: Vec<u16> = bytes
        .chunks_exact(2)
        .map(|chunk| match endian {
            Endianness::Big => u16::from_be_bytes([chunk[0], chunk[1]]),
            _ => u16::from_le_bytes([chunk[0], chunk[1]]),
        })
        .take_while(|val| *val != 0)
        .collect();

    return Utf16String::from_slice_lossy(&data).into();
}

pub fn decode_utf8_lossy_from(bytes: &[u8]) -> String {
    return String::from_utf8_lossy(bytes)
        .trim_end_matches('\0')
        .to_string();
}

pub fn is_power_2(num: u64) -> bool {
    return num != 0 && ((num & (num - 1)) == 0);
}

/// Lower case hex rendering of raw identifier bytes, in on-disk order.
pub fn to_hex(bytes: &[u8]) -> String {
    return bytes.iter().map(|byte| format!("{byte:02x}")).collect();
}

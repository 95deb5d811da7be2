use std::io::Error as IoError;

use thiserror::Error;
use zerocopy::{
    FromBytes, Immutable, IntoBytes, KnownLayout, Unaligned,
    byteorder::{LittleEndian, U32},
};

use crate::{
    filesystems::{exfat::probe_is_exfat, ntfs::probe_is_ntfs, vfat::probe_is_vfat},
    partitions::{PartEntry, PartTable, PtError, PtIdinfo},
    probe::{Magic, Probe},
    util::Endianness,
    volume::{PartFlags, VsType},
};

/*
Info from https://en.wikipedia.org/wiki/Master_boot_record
*/

#[derive(Debug, Error)]
pub enum DosError {
    #[error("I/O operation failed: {0}")]
    IoError(#[from] IoError),
    #[error("Not a DOS partition table: {0}")]
    UnknownPartitionTable(&'static str),
    #[error("DOS partition table header error: {0}")]
    DosHeaderError(&'static str),
}

pub(crate) const DOS_PT_ID_INFO: PtIdinfo = PtIdinfo {
    name: "dos",
    vs_type: VsType::Dos,
    probe_fn: |probe| probe_dos_pt(probe).map_err(PtError::from),
    magics: Some(&[
        /* DOS master boot sector:
         *
         *     0 | Code Area
         *   440 | Optional Disk signature
         *   446 | Partition table
         *   510 | 0x55
         *   511 | 0xAA
         */
        Magic {
            magic: b"\x55\xAA",
            len: 2,
            b_offset: 510,
        },
    ]),
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MbrPartitionType(u8);

impl MbrPartitionType {
    pub const MBR_EMPTY_PARTITION: Self = Self(0x00);
    pub const MBR_FAT12_PARTITION: Self = Self(0x01);
    pub const MBR_FAT16_LESS32M_PARTITION: Self = Self(0x04);
    pub const MBR_DOS_EXTENDED_PARTITION: Self = Self(0x05);
    pub const MBR_FAT16_PARTITION: Self = Self(0x06);
    pub const MBR_HPFS_NTFS_PARTITION: Self = Self(0x07);
    pub const MBR_W95_FAT32_PARTITION: Self = Self(0x0b);
    pub const MBR_W95_FAT32_LBA_PARTITION: Self = Self(0x0c);
    pub const MBR_W95_FAT16_LBA_PARTITION: Self = Self(0x0e);
    pub const MBR_W95_EXTENDED_PARTITION: Self = Self(0x0f);
    pub const MBR_HIDDEN_FAT12_PARTITION: Self = Self(0x11);
    pub const MBR_HIDDEN_FAT16_PARTITION: Self = Self(0x16);
    pub const MBR_HIDDEN_HPFS_NTFS_PARTITION: Self = Self(0x17);
    pub const MBR_HIDDEN_W95_FAT32_PARTITION: Self = Self(0x1b);
    pub const MBR_LINUX_SWAP_PARTITION: Self = Self(0x82);
    pub const MBR_LINUX_DATA_PARTITION: Self = Self(0x83);
    pub const MBR_LINUX_EXTENDED_PARTITION: Self = Self(0x85);
    pub const MBR_LINUX_LVM_PARTITION: Self = Self(0x8e);
    pub const MBR_FREEBSD_PARTITION: Self = Self(0xa5);
    pub const MBR_OPENBSD_PARTITION: Self = Self(0xa6);
    pub const MBR_NETBSD_PARTITION: Self = Self(0xa9);
    pub const MBR_DARWIN_BOOT_PARTITION: Self = Self(0xab);
    pub const MBR_HFS_HFS_PARTITION: Self = Self(0xaf);
    pub const MBR_GPT_PARTITION: Self = Self(0xee);
    pub const MBR_EFI_SYSTEM_PARTITION: Self = Self(0xef);
    pub const MBR_LINUX_RAID_PARTITION: Self = Self(0xfd);

    pub fn from_byte(byte: u8) -> Self {
        Self(byte)
    }

    pub const fn as_byte(&self) -> u8 {
        self.0
    }

    pub fn is_extended(&self) -> bool {
        return matches!(
            *self,
            Self::MBR_DOS_EXTENDED_PARTITION
                | Self::MBR_W95_EXTENDED_PARTITION
                | Self::MBR_LINUX_EXTENDED_PARTITION
        );
    }

    pub fn name(&self) -> &'static str {
        match *self {
            Self::MBR_EMPTY_PARTITION => "Empty",
            Self::MBR_FAT12_PARTITION => "DOS FAT12",
            Self::MBR_FAT16_LESS32M_PARTITION => "DOS FAT16 (<32MB)",
            Self::MBR_DOS_EXTENDED_PARTITION => "DOS Extended",
            Self::MBR_FAT16_PARTITION => "DOS FAT16",
            Self::MBR_HPFS_NTFS_PARTITION => "NTFS / exFAT",
            Self::MBR_W95_FAT32_PARTITION => "Win95 FAT32",
            Self::MBR_W95_FAT32_LBA_PARTITION => "Win95 FAT32 (LBA)",
            Self::MBR_W95_FAT16_LBA_PARTITION => "Win95 FAT16 (LBA)",
            Self::MBR_W95_EXTENDED_PARTITION => "Win95 Extended",
            Self::MBR_HIDDEN_FAT12_PARTITION => "Hidden FAT12",
            Self::MBR_HIDDEN_FAT16_PARTITION => "Hidden FAT16",
            Self::MBR_HIDDEN_HPFS_NTFS_PARTITION => "Hidden NTFS",
            Self::MBR_HIDDEN_W95_FAT32_PARTITION => "Hidden Win95 FAT32",
            Self::MBR_LINUX_SWAP_PARTITION => "Linux Swap / Solaris x86",
            Self::MBR_LINUX_DATA_PARTITION => "Linux",
            Self::MBR_LINUX_EXTENDED_PARTITION => "Linux Extended",
            Self::MBR_LINUX_LVM_PARTITION => "Linux Logical Volume Manager",
            Self::MBR_FREEBSD_PARTITION => "FreeBSD",
            Self::MBR_OPENBSD_PARTITION => "OpenBSD",
            Self::MBR_NETBSD_PARTITION => "NetBSD",
            Self::MBR_DARWIN_BOOT_PARTITION => "Mac OS X Boot",
            Self::MBR_HFS_HFS_PARTITION => "Mac OS X HFS",
            Self::MBR_GPT_PARTITION => "GPT Safety Partition",
            Self::MBR_EFI_SYSTEM_PARTITION => "EFI File System",
            Self::MBR_LINUX_RAID_PARTITION => "Linux RAID",
            _ => "Unknown Type",
        }
    }

    /// Description in the form `"Linux (0x83)"`.
    pub fn description(&self) -> String {
        return format!("{} (0x{:02x})", self.name(), self.0);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct DosPartitionEntry {
    pub boot_ind: u8, /* 0x80 - active */
    pub begin_head: u8,
    pub begin_sector: u8,
    pub begin_cylinder: u8,
    pub sys_ind: u8, /* https://en.wikipedia.org/wiki/Partition_type */
    pub end_head: u8,
    pub end_sector: u8,
    pub end_cylinder: u8,
    pub start_sect: U32<LittleEndian>,
    pub nr_sects: U32<LittleEndian>,
}

impl DosPartitionEntry {
    fn is_unused(&self) -> bool {
        return self.sys_ind == MbrPartitionType::MBR_EMPTY_PARTITION.as_byte()
            || u32::from(self.nr_sects) == 0;
    }

    fn part_type(&self) -> MbrPartitionType {
        return MbrPartitionType::from_byte(self.sys_ind);
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, FromBytes, IntoBytes, Unaligned, Immutable, KnownLayout)]
pub struct DosTable {
    pub bootstrap_code_area: [u8; 440],
    pub disk_id: U32<LittleEndian>,
    pub reserved: [u8; 2],
    pub entries: [DosPartitionEntry; 4],
    pub boot_signature: [u8; 2],
}

impl DosTable {
    fn is_signed(&self) -> bool {
        return self.boot_signature == [0x55, 0xAA];
    }
}

const DOS_SECTOR_SIZE: u64 = 512;
/* Upper bound on extended boot records followed in one chain */
const DOS_MAX_EXTENDED: u32 = 128;

fn walk_extended(
    probe: &Probe,
    ext_base: u64,
    entries: &mut Vec<PartEntry>,
) -> Result<(), DosError> {
    let mut ebr_lba = ext_base;
    let mut table_num = 1u32;

    loop {
        if table_num > DOS_MAX_EXTENDED {
            log::warn!("walk_extended - too many extended tables, chain cut at {ebr_lba}");
            break;
        }

        let ebr: DosTable = match probe.map_from(ebr_lba * DOS_SECTOR_SIZE) {
            Ok(t) => t,
            Err(e) => {
                log::warn!("walk_extended - unreadable extended table at {ebr_lba}: {e}");
                break;
            }
        };

        if !ebr.is_signed() {
            log::warn!("walk_extended - extended table at {ebr_lba} has no signature");
            break;
        }

        entries.push(PartEntry::meta(
            ebr_lba,
            1,
            format!("Extended Table (#{table_num})"),
        ));

        let mut next: Option<u64> = None;

        for (slot, entry) in ebr.entries.iter().enumerate() {
            if entry.is_unused() {
                continue;
            }

            if entry.part_type().is_extended() {
                next = Some(ext_base + u64::from(entry.start_sect));
            } else {
                entries.push(PartEntry {
                    start: ebr_lba + u64::from(entry.start_sect),
                    len: u64::from(entry.nr_sects),
                    description: entry.part_type().description(),
                    flags: PartFlags::ALLOC,
                    slot: Some(slot as u32),
                });
            }
        }

        match next {
            Some(lba) if lba > ebr_lba => ebr_lba = lba,
            _ => break,
        }
        table_num += 1;
    }

    return Ok(());
}

pub fn probe_dos_pt(probe: &Probe) -> Result<PartTable, DosError> {
    let mbr: DosTable = probe.map_from(0)?;

    if !mbr.is_signed() {
        return Err(DosError::UnknownPartitionTable("missing boot signature"));
    }

    for entry in &mbr.entries {
        if entry.boot_ind != 0 && entry.boot_ind != 0x80 {
            return Err(DosError::DosHeaderError("missing boot indicator"));
        }

        if entry.sys_ind == MbrPartitionType::MBR_GPT_PARTITION.as_byte() {
            return Err(DosError::UnknownPartitionTable("protective MBR, probably GPT"));
        }
    }

    if probe_is_vfat(probe).is_ok() || probe_is_ntfs(probe).is_ok() || probe_is_exfat(probe).is_ok()
    {
        return Err(DosError::UnknownPartitionTable("probably a filesystem boot sector"));
    }

    if mbr.entries.iter().all(|e| e.is_unused()) {
        return Err(DosError::UnknownPartitionTable("no partition entries"));
    }

    log::debug!("probe_dos_pt - DISK ID: {:08X}", u32::from(mbr.disk_id));

    let mut entries = vec![PartEntry::meta(0, 1, "Primary Table (#0)")];

    for (slot, entry) in mbr.entries.iter().enumerate() {
        if entry.is_unused() {
            continue;
        }

        if entry.part_type().is_extended() {
            walk_extended(probe, u64::from(entry.start_sect), &mut entries)?;
            continue;
        }

        entries.push(PartEntry {
            start: u64::from(entry.start_sect),
            len: u64::from(entry.nr_sects),
            description: entry.part_type().description(),
            flags: PartFlags::ALLOC,
            slot: Some(slot as u32),
        });
    }

    return Ok(PartTable {
        vs_type: VsType::Dos,
        block_size: DOS_SECTOR_SIZE,
        endian: Endianness::Little,
        entries,
    });
}

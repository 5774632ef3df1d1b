use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use serde::Serialize;

use crate::mft::boot::NTFS_OEM_ID;

const REFS_OEM_ID: &[u8; 4] = b"ReFS";
const BITLOCKER_OEM_ID: &[u8; 8] = b"-FVE-FS-";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum FileSystemType {
    Ntfs,
    Fat12,
    Fat16,
    Fat32,
    Refs,
    BitLocker,
    Unknown,
}

impl FileSystemType {
    pub fn is_fat(self) -> bool {
        matches!(self, Self::Fat12 | Self::Fat16 | Self::Fat32)
    }

    pub fn is_known(self) -> bool {
        self != Self::Unknown
    }
}

impl fmt::Display for FileSystemType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Ntfs => "NTFS",
            Self::Fat12 => "FAT12",
            Self::Fat16 => "FAT16",
            Self::Fat32 => "FAT32",
            Self::Refs => "ReFS",
            Self::BitLocker => "BitLocker",
            Self::Unknown => "Unknown",
        };
        f.write_str(name)
    }
}

/// What a volume boot record says about itself.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootSectorInfo {
    pub fs_type: FileSystemType,
    pub serial_number: u64,
}

impl BootSectorInfo {
    pub const UNKNOWN: Self = Self {
        fs_type: FileSystemType::Unknown,
        serial_number: 0,
    };
}

fn has_boot_signature(sector: &[u8]) -> bool {
    sector.len() >= 512 && sector[510] == 0x55 && sector[511] == 0xAA
}

/// Identifies the filesystem of a boot sector. Unrecognized bytes are `Unknown`,
/// never an error: recovery and vendor partitions are routine.
pub fn identify_boot_sector(sector: &[u8]) -> BootSectorInfo {
    if sector.len() < 512 {
        return BootSectorInfo::UNKNOWN;
    }
    let oem = &sector[3..11];

    // ReFS boot records do not carry 0x55AA
    if &oem[..4] == REFS_OEM_ID {
        return BootSectorInfo {
            fs_type: FileSystemType::Refs,
            serial_number: LittleEndian::read_u64(&sector[0x38..0x40]),
        };
    }
    if !has_boot_signature(sector) {
        return BootSectorInfo::UNKNOWN;
    }
    if oem == NTFS_OEM_ID {
        return BootSectorInfo {
            fs_type: FileSystemType::Ntfs,
            serial_number: LittleEndian::read_u64(&sector[0x48..0x50]),
        };
    }
    if oem == BITLOCKER_OEM_ID {
        return BootSectorInfo {
            fs_type: FileSystemType::BitLocker,
            serial_number: 0,
        };
    }

    let ext_signature = |at: usize| matches!(sector[at], 0x28 | 0x29);
    if ext_signature(0x42) && sector[0x52..0x5A].starts_with(b"FAT32") {
        return BootSectorInfo {
            fs_type: FileSystemType::Fat32,
            serial_number: u64::from(LittleEndian::read_u32(&sector[0x43..0x47])),
        };
    }
    if ext_signature(0x26) {
        let system_id = &sector[0x36..0x3E];
        let fs_type = if system_id.starts_with(b"FAT12") {
            Some(FileSystemType::Fat12)
        } else if system_id.starts_with(b"FAT16") {
            Some(FileSystemType::Fat16)
        } else {
            None
        };
        if let Some(fs_type) = fs_type {
            return BootSectorInfo {
                fs_type,
                serial_number: u64::from(LittleEndian::read_u32(&sector[0x27..0x2B])),
            };
        }
    }

    BootSectorInfo::UNKNOWN
}

pub fn get_file_system_type(sector: &[u8]) -> FileSystemType {
    identify_boot_sector(sector).fs_type
}

//! On-disk layout of Windows shadow storage.
//!
//! Every structure lives in 16 KiB blocks that start with a 128-byte block
//! header. Blocks of the same kind are chained through the header's next offset.

use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{ForgeError, Result};
use crate::mft::utils::{decode_utf16le, filetime_to_datetime, read_guid};

pub const VSS_BLOCK_SIZE: u64 = 0x4000;
pub const VOLUME_HEADER_OFFSET: u64 = 0x1E00;
pub const BLOCK_HEADER_SIZE: usize = 128;
pub const CATALOG_ENTRY_SIZE: usize = 128;
pub const STORE_ENTRY_SIZE: usize = 32;

/// `{3808876B-C176-4E48-B7AE-04046E6CC752}`, the signature of every block header.
pub const VSS_IDENTIFIER: Uuid = Uuid::from_u128(0x3808876B_C176_4E48_B7AE_04046E6CC752);

const MICROSOFT_INFO_GUID: Uuid = Uuid::from_u128(0xE5DE7D45_49F2_40A4_817C_7DC82B72587F);
const MICROSOFT_HIDDEN_INFO_GUID: Uuid = Uuid::from_u128(0xF12142B4_9A4B_49AF_A851_700C42FDC2BE);

/// Snapshot flag: free blocks read as zeros. Without it they keep volume data.
pub const SNAPSHOT_FLAG_ZERO_FREE_BLOCKS: u64 = 0x40;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum RecordType {
    VolumeHeader = 1,
    Catalog = 2,
    StoreIndex = 3,
    StoreHeader = 4,
    StoreBlockRange = 5,
    StoreBitmap = 6,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockHeader {
    pub version: u32,
    pub record_type: u32,
    pub relative_offset: u64,
    pub current_offset: u64,
    pub next_offset: u64,
}

impl BlockHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < BLOCK_HEADER_SIZE {
            return Err(ForgeError::corrupt("vss block", "truncated block header"));
        }
        if read_guid(&bytes[0..16]) != Some(VSS_IDENTIFIER) {
            return Err(ForgeError::corrupt("vss block", "missing shadow storage identifier"));
        }
        Ok(Self {
            version: LittleEndian::read_u32(&bytes[16..20]),
            record_type: LittleEndian::read_u32(&bytes[20..24]),
            relative_offset: LittleEndian::read_u64(&bytes[24..32]),
            current_offset: LittleEndian::read_u64(&bytes[32..40]),
            next_offset: LittleEndian::read_u64(&bytes[40..48]),
        })
    }

    pub fn require_type(self, record_type: RecordType) -> Result<Self> {
        if self.record_type != record_type as u32 {
            return Err(ForgeError::corrupt(
                "vss block",
                format!("record type {} where {:?} was expected", self.record_type, record_type),
            ));
        }
        Ok(self)
    }
}

/// The header at 0x1E00 of a volume carrying shadow storage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeHeader {
    pub block: BlockHeader,
    pub catalog_offset: u64,
    pub maximum_size: u64,
    pub volume_id: Uuid,
    pub store_volume_id: Uuid,
}

impl VolumeHeader {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        let block = BlockHeader::parse(bytes)?.require_type(RecordType::VolumeHeader)?;
        if bytes.len() < 96 {
            return Err(ForgeError::corrupt("vss volume header", "truncated"));
        }
        Ok(Self {
            block,
            catalog_offset: LittleEndian::read_u64(&bytes[48..56]),
            maximum_size: LittleEndian::read_u64(&bytes[56..64]),
            volume_id: read_guid(&bytes[64..80]).unwrap_or_default(),
            store_volume_id: read_guid(&bytes[80..96]).unwrap_or_default(),
        })
    }

    pub fn has_catalog(&self) -> bool {
        self.catalog_offset != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotInfoEntry {
    pub volume_size: u64,
    pub guid: Uuid,
    pub position: u64,
    pub flags: u64,
    pub creation_time: Option<DateTime<Utc>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiffAreaEntry {
    pub store_index_offset: u64,
    pub guid: Uuid,
    pub store_header_offset: u64,
    pub block_range_offset: u64,
    pub bitmap_offset: u64,
    pub store_file_reference: u64,
    pub allocated_size: u64,
    pub previous_bitmap_offset: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CatalogEntry {
    End,
    Free,
    SnapshotInfo(SnapshotInfoEntry),
    DiffArea(DiffAreaEntry),
    Unknown(u32),
}

fn block_offset(bytes: &[u8], field: &'static str) -> Result<u64> {
    let offset = LittleEndian::read_u64(bytes);
    if offset == 0 || offset % VSS_BLOCK_SIZE != 0 || offset > i64::MAX as u64 {
        return Err(ForgeError::corrupt(
            "vss catalog entry",
            format!("{} {:#x} is not a block offset", field, offset),
        ));
    }
    Ok(offset)
}

impl CatalogEntry {
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < CATALOG_ENTRY_SIZE {
            return Err(ForgeError::corrupt("vss catalog entry", "truncated"));
        }
        match LittleEndian::read_u32(&bytes[0..4]) {
            0 => Ok(Self::End),
            1 => Ok(Self::Free),
            2 => {
                let volume_size = LittleEndian::read_i64(&bytes[8..16]);
                if volume_size <= 0 {
                    return Err(ForgeError::corrupt(
                        "vss catalog entry",
                        format!("snapshot volume size {}", volume_size),
                    ));
                }
                let position = LittleEndian::read_i64(&bytes[32..40]);
                if position < 0 {
                    return Err(ForgeError::corrupt(
                        "vss catalog entry",
                        format!("snapshot position {}", position),
                    ));
                }
                Ok(Self::SnapshotInfo(SnapshotInfoEntry {
                    volume_size: volume_size as u64,
                    guid: read_guid(&bytes[16..32]).unwrap_or_default(),
                    position: position as u64,
                    flags: LittleEndian::read_u64(&bytes[40..48]),
                    creation_time: filetime_to_datetime(LittleEndian::read_u64(&bytes[48..56])),
                }))
            }
            3 => {
                let previous = LittleEndian::read_u64(&bytes[72..80]);
                Ok(Self::DiffArea(DiffAreaEntry {
                    store_index_offset: block_offset(&bytes[8..16], "store index offset")?,
                    guid: read_guid(&bytes[16..32]).unwrap_or_default(),
                    store_header_offset: block_offset(&bytes[32..40], "store header offset")?,
                    block_range_offset: block_offset(&bytes[40..48], "block range offset")?,
                    bitmap_offset: block_offset(&bytes[48..56], "bitmap offset")?,
                    store_file_reference: LittleEndian::read_u64(&bytes[56..64]),
                    allocated_size: LittleEndian::read_u64(&bytes[64..72]),
                    previous_bitmap_offset: (previous != 0).then_some(previous),
                }))
            }
            other => Ok(Self::Unknown(other)),
        }
    }
}

/// `VSS_VOLUME_SNAPSHOT_ATTRIBUTES` of a snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct VolumeSnapshotAttributes(pub u32);

impl VolumeSnapshotAttributes {
    const NAMES: [(u32, &'static str); 19] = [
        (0x0000_0001, "persistent"),
        (0x0000_0002, "no_auto_recovery"),
        (0x0000_0004, "client_accessible"),
        (0x0000_0008, "no_auto_release"),
        (0x0000_0010, "no_writers"),
        (0x0000_0020, "transportable"),
        (0x0000_0040, "not_surfaced"),
        (0x0000_0080, "not_transacted"),
        (0x0001_0000, "hardware_assisted"),
        (0x0002_0000, "differential"),
        (0x0004_0000, "plex"),
        (0x0008_0000, "imported"),
        (0x0010_0000, "exposed_locally"),
        (0x0020_0000, "exposed_remotely"),
        (0x0040_0000, "auto_recover"),
        (0x0080_0000, "rollback_recovery"),
        (0x0100_0000, "delayed_post_snapshot"),
        (0x0200_0000, "txf_recovery"),
        (0x0400_0000, "file_share"),
    ];

    pub fn names(self) -> Vec<&'static str> {
        Self::NAMES
            .iter()
            .filter(|(bit, _)| self.0 & bit != 0)
            .map(|(_, name)| *name)
            .collect()
    }
}

impl fmt::Display for VolumeSnapshotAttributes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names = self.names();
        if names.is_empty() {
            f.write_str("<none>")
        } else {
            f.write_str(&names.join(", "))
        }
    }
}

/// Application information stored in the store header block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoreInfo {
    pub info_guid: Uuid,
    pub shadow_copy_id: Uuid,
    pub shadow_copy_set_id: Uuid,
    pub context: u32,
    pub snapshot_count: u32,
    pub attributes: VolumeSnapshotAttributes,
    pub machine: String,
    pub service: String,
}

fn length_prefixed_utf16(bytes: &[u8], at: usize) -> Result<(String, usize)> {
    let length = bytes
        .get(at..at + 2)
        .map(LittleEndian::read_u16)
        .ok_or_else(|| ForgeError::corrupt("vss store header", "truncated string length"))? as usize;
    let text = bytes
        .get(at + 2..at + 2 + length)
        .ok_or_else(|| ForgeError::corrupt("vss store header", "string runs past the block"))?;
    Ok((decode_utf16le(text), at + 2 + length))
}

impl StoreInfo {
    pub fn parse(block: &[u8]) -> Result<Self> {
        BlockHeader::parse(block)?.require_type(RecordType::StoreHeader)?;
        const LOCAL_INFO: usize = BLOCK_HEADER_SIZE;
        if block.len() < LOCAL_INFO + 64 {
            return Err(ForgeError::corrupt("vss store header", "truncated local info"));
        }
        let info = &block[LOCAL_INFO..];
        let info_guid = read_guid(&info[0..16]).unwrap_or_default();
        if info_guid != MICROSOFT_INFO_GUID && info_guid != MICROSOFT_HIDDEN_INFO_GUID {
            log::debug!("unexpected shadow copy application info {}", info_guid);
        }
        let (machine, next) = length_prefixed_utf16(info, 64)?;
        let (service, _) = length_prefixed_utf16(info, next)?;
        Ok(Self {
            info_guid,
            shadow_copy_id: read_guid(&info[16..32]).unwrap_or_default(),
            shadow_copy_set_id: read_guid(&info[32..48]).unwrap_or_default(),
            context: LittleEndian::read_u32(&info[48..52]),
            snapshot_count: LittleEndian::read_u32(&info[52..56]),
            attributes: VolumeSnapshotAttributes(LittleEndian::read_u32(&info[56..60])),
            machine,
            service,
        })
    }
}

pub const STORE_FLAG_FORWARDER: u32 = 0x1;
pub const STORE_FLAG_OVERLAY: u32 = 0x2;
pub const STORE_FLAG_UNUSED: u32 = 0x4;

/// One block descriptor of a store index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreIndexEntry {
    pub original_offset: u64,
    pub relative_offset: u64,
    pub data_offset: u64,
    pub flags: u32,
    pub overlay_bitmap: u32,
}

impl StoreIndexEntry {
    pub fn parse(bytes: &[u8]) -> Option<Self> {
        let bytes = bytes.get(..STORE_ENTRY_SIZE)?;
        if bytes.iter().all(|b| *b == 0) {
            return None;
        }
        Some(Self {
            original_offset: LittleEndian::read_u64(&bytes[0..8]),
            relative_offset: LittleEndian::read_u64(&bytes[8..16]),
            data_offset: LittleEndian::read_u64(&bytes[16..24]),
            flags: LittleEndian::read_u32(&bytes[24..28]),
            overlay_bitmap: LittleEndian::read_u32(&bytes[28..32]),
        })
    }

    pub fn is_forwarder(&self) -> bool {
        self.flags & STORE_FLAG_FORWARDER != 0
    }

    pub fn is_overlay(&self) -> bool {
        self.flags & STORE_FLAG_OVERLAY != 0
    }

    pub fn is_unused(&self) -> bool {
        self.flags & STORE_FLAG_UNUSED != 0
    }
}

/// Used entries of one store index block.
pub fn parse_store_entries(block: &[u8]) -> Vec<StoreIndexEntry> {
    block
        .get(BLOCK_HEADER_SIZE..)
        .unwrap_or_default()
        .chunks_exact(STORE_ENTRY_SIZE)
        .filter_map(StoreIndexEntry::parse)
        .filter(|entry| !entry.is_unused())
        .collect()
}

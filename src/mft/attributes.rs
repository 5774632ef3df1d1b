use std::fmt;

use byteorder::{ByteOrder, LittleEndian};
use chrono::{DateTime, Utc};

use super::runlist::{parse_data_runs, DataRun};
use super::utils::{decode_utf16le, filetime_to_datetime};
use crate::error::{ForgeError, Result};

pub const END_OF_ATTRIBUTES: u32 = 0xFFFF_FFFF;

pub const STANDARD_INFORMATION: u32 = 0x10;
pub const ATTRIBUTE_LIST: u32 = 0x20;
pub const FILE_NAME: u32 = 0x30;
pub const OBJECT_ID: u32 = 0x40;
pub const SECURITY_DESCRIPTOR: u32 = 0x50;
pub const VOLUME_NAME: u32 = 0x60;
pub const VOLUME_INFORMATION: u32 = 0x70;
pub const DATA: u32 = 0x80;
pub const INDEX_ROOT: u32 = 0x90;
pub const INDEX_ALLOCATION: u32 = 0xA0;
pub const BITMAP: u32 = 0xB0;
pub const REPARSE_POINT: u32 = 0xC0;
pub const EA_INFORMATION: u32 = 0xD0;
pub const EA: u32 = 0xE0;
pub const LOGGED_UTILITY_STREAM: u32 = 0x100;

/// Display name of a type code; unknown codes are kept as-is by the parser.
pub fn type_name(type_code: u32) -> &'static str {
    match type_code {
        STANDARD_INFORMATION => "$STANDARD_INFORMATION",
        ATTRIBUTE_LIST => "$ATTRIBUTE_LIST",
        FILE_NAME => "$FILE_NAME",
        OBJECT_ID => "$OBJECT_ID",
        SECURITY_DESCRIPTOR => "$SECURITY_DESCRIPTOR",
        VOLUME_NAME => "$VOLUME_NAME",
        VOLUME_INFORMATION => "$VOLUME_INFORMATION",
        DATA => "$DATA",
        INDEX_ROOT => "$INDEX_ROOT",
        INDEX_ALLOCATION => "$INDEX_ALLOCATION",
        BITMAP => "$BITMAP",
        REPARSE_POINT => "$REPARSE_POINT",
        EA_INFORMATION => "$EA_INFORMATION",
        EA => "$EA",
        LOGGED_UTILITY_STREAM => "$LOGGED_UTILITY_STREAM",
        _ => "$UNKNOWN",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct AttributeFlags(pub u16);

impl AttributeFlags {
    pub const COMPRESSION_MASK: u16 = 0x00FF;
    pub const ENCRYPTED: u16 = 0x4000;
    pub const SPARSE: u16 = 0x8000;

    pub fn is_compressed(self) -> bool {
        self.0 & Self::COMPRESSION_MASK != 0
    }

    pub fn is_encrypted(self) -> bool {
        self.0 & Self::ENCRYPTED != 0
    }

    pub fn is_sparse(self) -> bool {
        self.0 & Self::SPARSE != 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResidentValue {
    pub value_length: u32,
    pub value_offset: u16,
    pub value: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NonresidentExtent {
    pub lowest_vcn: u64,
    pub highest_vcn: u64,
    pub mapping_pairs_offset: u16,
    /// log2 of the compression unit in clusters, 0 when uncompressed.
    pub compression_unit: u8,
    pub allocated_length: u64,
    /// Only authoritative when `lowest_vcn == 0`.
    pub file_size: u64,
    pub valid_data_length: u64,
    pub total_allocated: Option<u64>,
    pub runs: Vec<DataRun>,
}

impl NonresidentExtent {
    pub fn is_first_extent(&self) -> bool {
        self.lowest_vcn == 0
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DataAttribute {
    Resident(ResidentValue),
    Nonresident(NonresidentExtent),
}

/// One decoded attribute record header plus its form-specific part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Attribute {
    pub type_code: u32,
    pub record_length: u32,
    pub name: String,
    pub flags: AttributeFlags,
    pub instance: u16,
    pub data: DataAttribute,
}

const RESIDENT_HEADER_LEN: usize = 0x18;
const NONRESIDENT_HEADER_LEN: usize = 0x40;
const COMPRESSED_HEADER_LEN: usize = 0x48;

impl Attribute {
    /// Decodes the attribute at the start of `bytes`, which is bounded by the
    /// attribute's own record length.
    pub fn parse(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 16 {
            return Err(ForgeError::corrupt("attribute", "header truncated"));
        }
        let type_code = LittleEndian::read_u32(&bytes[0..4]);
        let record_length = LittleEndian::read_u32(&bytes[4..8]);
        let nonresident = bytes[8] != 0;
        let name_len = bytes[9] as usize;
        let name_off = LittleEndian::read_u16(&bytes[10..12]) as usize;
        let flags = AttributeFlags(LittleEndian::read_u16(&bytes[12..14]));
        let instance = LittleEndian::read_u16(&bytes[14..16]);

        let name = if name_len == 0 {
            String::new()
        } else {
            let end = name_off + name_len * 2;
            if end > bytes.len() {
                return Err(ForgeError::corrupt(
                    "attribute",
                    format!("name of {} outside the attribute", type_name(type_code)),
                ));
            }
            decode_utf16le(&bytes[name_off..end])
        };

        let data = if nonresident {
            DataAttribute::Nonresident(parse_nonresident(bytes, flags)?)
        } else {
            DataAttribute::Resident(parse_resident(bytes)?)
        };

        Ok(Self {
            type_code,
            record_length,
            name,
            flags,
            instance,
            data,
        })
    }

    pub fn is_resident(&self) -> bool {
        matches!(self.data, DataAttribute::Resident(_))
    }

    pub fn resident_value(&self) -> Option<&[u8]> {
        match &self.data {
            DataAttribute::Resident(r) => Some(&r.value),
            DataAttribute::Nonresident(_) => None,
        }
    }

    pub fn nonresident(&self) -> Option<&NonresidentExtent> {
        match &self.data {
            DataAttribute::Nonresident(n) => Some(n),
            DataAttribute::Resident(_) => None,
        }
    }

    pub fn type_name(&self) -> &'static str {
        type_name(self.type_code)
    }
}

fn parse_resident(bytes: &[u8]) -> Result<ResidentValue> {
    if bytes.len() < RESIDENT_HEADER_LEN {
        return Err(ForgeError::corrupt("attribute", "resident header truncated"));
    }
    let value_length = LittleEndian::read_u32(&bytes[16..20]);
    let value_offset = LittleEndian::read_u16(&bytes[20..22]);
    let start = value_offset as usize;
    let end = start
        .checked_add(value_length as usize)
        .filter(|end| *end <= bytes.len())
        .ok_or_else(|| {
            ForgeError::corrupt(
                "attribute",
                format!("resident value {}+{} outside the attribute", start, value_length),
            )
        })?;
    Ok(ResidentValue {
        value_length,
        value_offset,
        value: bytes[start..end].to_vec(),
    })
}

fn parse_nonresident(bytes: &[u8], flags: AttributeFlags) -> Result<NonresidentExtent> {
    if bytes.len() < NONRESIDENT_HEADER_LEN {
        return Err(ForgeError::corrupt("attribute", "nonresident header truncated"));
    }
    let lowest_vcn = LittleEndian::read_u64(&bytes[0x10..0x18]);
    let highest_vcn = LittleEndian::read_u64(&bytes[0x18..0x20]);
    let mapping_pairs_offset = LittleEndian::read_u16(&bytes[0x20..0x22]);
    let compression_unit = bytes[0x22];

    let has_total = compression_unit != 0 || flags.is_sparse();
    let total_allocated = if has_total && bytes.len() >= COMPRESSED_HEADER_LEN {
        Some(LittleEndian::read_u64(&bytes[0x40..0x48]))
    } else {
        None
    };

    let mp = mapping_pairs_offset as usize;
    if mp < NONRESIDENT_HEADER_LEN || mp > bytes.len() {
        return Err(ForgeError::corrupt(
            "attribute",
            format!("mapping pairs offset {:#x} outside the attribute", mp),
        ));
    }
    let runs = parse_data_runs(&bytes[mp..], lowest_vcn)?;

    Ok(NonresidentExtent {
        lowest_vcn,
        highest_vcn,
        mapping_pairs_offset,
        compression_unit,
        allocated_length: LittleEndian::read_u64(&bytes[0x28..0x30]),
        file_size: LittleEndian::read_u64(&bytes[0x30..0x38]),
        valid_data_length: LittleEndian::read_u64(&bytes[0x38..0x40]),
        total_allocated,
        runs,
    })
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} ({:#x})", self.type_name(), self.type_code)?;
        if !self.name.is_empty() {
            write!(f, " \"{}\"", self.name)?;
        }
        match &self.data {
            DataAttribute::Resident(r) => write!(f, " resident, {} bytes", r.value_length),
            DataAttribute::Nonresident(n) => {
                write!(f, " nonresident, vcn {:#x}-{:#x}, {} runs", n.lowest_vcn, n.highest_vcn, n.runs.len())?;
                if n.is_first_extent() {
                    write!(f, ", {} bytes", n.file_size)?;
                }
                if self.flags.is_compressed() {
                    write!(f, ", compressed")?;
                }
                Ok(())
            }
        }
    }
}

/// A 48-bit record number and the 16-bit sequence number it must carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FileReference {
    pub record: u64,
    pub sequence: u16,
}

impl FileReference {
    pub fn from_raw(raw: u64) -> Self {
        Self {
            record: raw & 0x0000_FFFF_FFFF_FFFF,
            sequence: (raw >> 48) as u16,
        }
    }

    pub fn to_raw(self) -> u64 {
        (self.record & 0x0000_FFFF_FFFF_FFFF) | ((self.sequence as u64) << 48)
    }
}

/// An `$ATTRIBUTE_LIST` entry: where an attribute of the base record lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AttributeListEntry {
    pub type_code: u32,
    pub start_vcn: u64,
    pub reference: FileReference,
    pub instance: u16,
    pub name: String,
}

const LIST_ENTRY_MIN_LEN: usize = 0x1A;

pub fn parse_attribute_list(bytes: &[u8]) -> Result<Vec<AttributeListEntry>> {
    let mut entries = Vec::new();
    let mut pos = 0usize;
    while pos + LIST_ENTRY_MIN_LEN <= bytes.len() {
        let type_code = LittleEndian::read_u32(&bytes[pos..pos + 4]);
        if type_code == 0 || type_code == END_OF_ATTRIBUTES {
            break;
        }
        let entry_len = LittleEndian::read_u16(&bytes[pos + 4..pos + 6]) as usize;
        if entry_len < LIST_ENTRY_MIN_LEN || pos + entry_len > bytes.len() {
            return Err(ForgeError::corrupt(
                "attribute list",
                format!("entry at {} has length {}", pos, entry_len),
            ));
        }
        let entry = &bytes[pos..pos + entry_len];
        let name_len = entry[6] as usize;
        let name_off = entry[7] as usize;
        let name = if name_len == 0 {
            String::new()
        } else if name_off + name_len * 2 <= entry_len {
            decode_utf16le(&entry[name_off..name_off + name_len * 2])
        } else {
            return Err(ForgeError::corrupt("attribute list", "entry name outside the entry"));
        };
        entries.push(AttributeListEntry {
            type_code,
            start_vcn: LittleEndian::read_u64(&entry[8..16]),
            reference: FileReference::from_raw(LittleEndian::read_u64(&entry[16..24])),
            instance: LittleEndian::read_u16(&entry[24..26]),
            name,
        });
        pos += entry_len;
    }
    Ok(entries)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StandardInformation {
    pub creation_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
    pub mft_modified_time: Option<DateTime<Utc>>,
    pub accessed_time: Option<DateTime<Utc>>,
    pub file_attributes: u32,
    pub security_id: Option<u32>,
}

impl StandardInformation {
    pub fn parse(data: &[u8]) -> Option<Self> {
        // NT4 layout is 48 bytes; security id arrived with the 72 byte layout
        if data.len() < 48 {
            return None;
        }
        Some(Self {
            creation_time: filetime_to_datetime(LittleEndian::read_u64(&data[0..8])),
            modified_time: filetime_to_datetime(LittleEndian::read_u64(&data[8..16])),
            mft_modified_time: filetime_to_datetime(LittleEndian::read_u64(&data[16..24])),
            accessed_time: filetime_to_datetime(LittleEndian::read_u64(&data[24..32])),
            file_attributes: LittleEndian::read_u32(&data[32..36]),
            security_id: (data.len() >= 56).then(|| LittleEndian::read_u32(&data[52..56])),
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileNameAttribute {
    pub parent: FileReference,
    pub creation_time: Option<DateTime<Utc>>,
    pub modified_time: Option<DateTime<Utc>>,
    pub mft_modified_time: Option<DateTime<Utc>>,
    pub accessed_time: Option<DateTime<Utc>>,
    pub allocated_size: u64,
    pub logical_size: u64,
    pub name_type: u8,
    pub name: String,
}

impl FileNameAttribute {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < 66 {
            return None;
        }
        let name_end = 66 + data[64] as usize * 2;
        if data.len() < name_end {
            return None;
        }
        Some(Self {
            parent: FileReference::from_raw(LittleEndian::read_u64(&data[0..8])),
            creation_time: filetime_to_datetime(LittleEndian::read_u64(&data[8..16])),
            modified_time: filetime_to_datetime(LittleEndian::read_u64(&data[16..24])),
            mft_modified_time: filetime_to_datetime(LittleEndian::read_u64(&data[24..32])),
            accessed_time: filetime_to_datetime(LittleEndian::read_u64(&data[32..40])),
            allocated_size: LittleEndian::read_u64(&data[40..48]),
            logical_size: LittleEndian::read_u64(&data[48..56]),
            name_type: data[65],
            name: decode_utf16le(&data[66..name_end]),
        })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    pub(crate) fn resident_attribute(type_code: u32, instance: u16, value: &[u8]) -> Vec<u8> {
        let value_off = 0x18usize;
        let len = (value_off + value.len() + 7) & !7;
        let mut attr = vec![0u8; len];
        LittleEndian::write_u32(&mut attr[0..4], type_code);
        LittleEndian::write_u32(&mut attr[4..8], len as u32);
        LittleEndian::write_u16(&mut attr[14..16], instance);
        LittleEndian::write_u32(&mut attr[16..20], value.len() as u32);
        LittleEndian::write_u16(&mut attr[20..22], value_off as u16);
        attr[value_off..value_off + value.len()].copy_from_slice(value);
        attr
    }

    pub(crate) fn nonresident_attribute(
        type_code: u32,
        lowest_vcn: u64,
        highest_vcn: u64,
        file_size: u64,
        compression_unit: u8,
        runs: &[u8],
    ) -> Vec<u8> {
        let mp = if compression_unit != 0 { 0x48 } else { 0x40 };
        let len = (mp + runs.len() + 1 + 7) & !7;
        let mut attr = vec![0u8; len];
        LittleEndian::write_u32(&mut attr[0..4], type_code);
        LittleEndian::write_u32(&mut attr[4..8], len as u32);
        attr[8] = 1;
        if compression_unit != 0 {
            LittleEndian::write_u16(&mut attr[12..14], 0x0001);
        }
        LittleEndian::write_u64(&mut attr[0x10..0x18], lowest_vcn);
        LittleEndian::write_u64(&mut attr[0x18..0x20], highest_vcn);
        LittleEndian::write_u16(&mut attr[0x20..0x22], mp as u16);
        attr[0x22] = compression_unit;
        LittleEndian::write_u64(&mut attr[0x28..0x30], (highest_vcn + 1) * 4096);
        LittleEndian::write_u64(&mut attr[0x30..0x38], file_size);
        LittleEndian::write_u64(&mut attr[0x38..0x40], file_size);
        attr[mp..mp + runs.len()].copy_from_slice(runs);
        attr
    }

    /// Appends `name` to an attribute built by the helpers above.
    pub(crate) fn named(mut attr: Vec<u8>, name: &str) -> Vec<u8> {
        let units: Vec<u16> = name.encode_utf16().collect();
        let name_off = attr.len();
        attr.resize((name_off + units.len() * 2 + 7) & !7, 0);
        for (i, u) in units.iter().enumerate() {
            LittleEndian::write_u16(&mut attr[name_off + i * 2..name_off + i * 2 + 2], *u);
        }
        let len = attr.len() as u32;
        LittleEndian::write_u32(&mut attr[4..8], len);
        attr[9] = units.len() as u8;
        LittleEndian::write_u16(&mut attr[10..12], name_off as u16);
        attr
    }

    #[test]
    fn resident_value_is_bounded() {
        let attr = resident_attribute(DATA, 3, b"hello");
        let parsed = Attribute::parse(&attr).unwrap();
        assert_eq!(parsed.resident_value(), Some(&b"hello"[..]));
        assert_eq!(parsed.instance, 3);

        let mut broken = attr.clone();
        LittleEndian::write_u32(&mut broken[16..20], 0x400);
        assert!(Attribute::parse(&broken).is_err());
    }

    #[test]
    fn nonresident_extent_decodes_runs() {
        let attr = nonresident_attribute(DATA, 0, 0x17, 0x18000, 0, &[0x21, 0x18, 0x34, 0x56]);
        let parsed = Attribute::parse(&attr).unwrap();
        let extent = parsed.nonresident().unwrap();
        assert!(extent.is_first_extent());
        assert_eq!(extent.file_size, 0x18000);
        assert_eq!(extent.runs.len(), 1);
        assert_eq!(extent.runs[0].lcn, Some(0x5634));
        assert_eq!(extent.total_allocated, None);
    }

    #[test]
    fn attribute_list_entries() {
        let mut list = vec![0u8; 0x20 + 0x28];
        LittleEndian::write_u32(&mut list[0..4], DATA);
        LittleEndian::write_u16(&mut list[4..6], 0x20);
        LittleEndian::write_u64(&mut list[8..16], 0x40);
        LittleEndian::write_u64(&mut list[16..24], FileReference { record: 42, sequence: 3 }.to_raw());
        LittleEndian::write_u16(&mut list[24..26], 5);

        let second = &mut list[0x20..];
        LittleEndian::write_u32(&mut second[0..4], DATA);
        LittleEndian::write_u16(&mut second[4..6], 0x28);
        second[6] = 3;
        second[7] = 0x1A;
        for (i, unit) in "ads".encode_utf16().enumerate() {
            LittleEndian::write_u16(&mut second[0x1A + i * 2..0x1C + i * 2], unit);
        }

        let entries = parse_attribute_list(&list).unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].reference, FileReference { record: 42, sequence: 3 });
        assert_eq!(entries[0].start_vcn, 0x40);
        assert_eq!(entries[1].name, "ads");
    }

    #[test]
    fn file_name_body() {
        let mut body = vec![0u8; 66 + 8];
        LittleEndian::write_u64(&mut body[0..8], FileReference { record: 5, sequence: 5 }.to_raw());
        LittleEndian::write_u64(&mut body[48..56], 1234);
        body[64] = 4;
        body[65] = 3;
        for (i, unit) in "a.md".encode_utf16().enumerate() {
            LittleEndian::write_u16(&mut body[66 + i * 2..68 + i * 2], unit);
        }
        let name = FileNameAttribute::parse(&body).unwrap();
        assert_eq!(name.name, "a.md");
        assert_eq!(name.parent.record, 5);
        assert_eq!(name.logical_size, 1234);
        assert!(name.creation_time.is_none());
    }
}

use std::collections::BTreeMap;
use std::fmt;

use byteorder::{ByteOrder, LittleEndian};

use super::attributes::{
    parse_attribute_list, Attribute, AttributeListEntry, FileNameAttribute, FileReference, StandardInformation,
    ATTRIBUTE_LIST, END_OF_ATTRIBUTES, FILE_NAME, REPARSE_POINT, STANDARD_INFORMATION,
};
use super::fixup::apply_fixups;
use crate::compression::wof::{parse_wof_reparse, WofAlgorithm};
use crate::error::{ForgeError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordSignature {
    File,
    /// Flagged by chkdsk after a failed multi-sector transfer.
    Baad,
}

impl fmt::Display for RecordSignature {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RecordSignature::File => "FILE",
            RecordSignature::Baad => "BAAD",
        })
    }
}

const HEADER_LEN: usize = 0x30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MftRecordHeader {
    pub signature: RecordSignature,
    pub update_sequence_offset: u16,
    pub update_sequence_size: u16,
    pub logfile_sequence_number: u64,
    pub sequence_number: u16,
    pub hard_link_count: u16,
    pub first_attribute_offset: u16,
    pub flags: u16, // 0x01 = in use, 0x02 = directory
    pub real_size: u32,
    pub allocated_size: u32,
    pub base_record: FileReference,
    pub next_attribute_id: u16,
    /// Only present in the XP+ header layout.
    pub record_number: Option<u32>,
}

impl MftRecordHeader {
    pub fn parse(data: &[u8]) -> Option<Self> {
        if data.len() < HEADER_LEN {
            return None;
        }
        let signature = match &data[0..4] {
            b"FILE" => RecordSignature::File,
            b"BAAD" => RecordSignature::Baad,
            _ => return None,
        };
        let update_sequence_offset = LittleEndian::read_u16(&data[4..6]);

        Some(Self {
            signature,
            update_sequence_offset,
            update_sequence_size: LittleEndian::read_u16(&data[6..8]),
            logfile_sequence_number: LittleEndian::read_u64(&data[8..16]),
            sequence_number: LittleEndian::read_u16(&data[16..18]),
            hard_link_count: LittleEndian::read_u16(&data[18..20]),
            first_attribute_offset: LittleEndian::read_u16(&data[20..22]),
            flags: LittleEndian::read_u16(&data[22..24]),
            real_size: LittleEndian::read_u32(&data[24..28]),
            allocated_size: LittleEndian::read_u32(&data[28..32]),
            base_record: FileReference::from_raw(LittleEndian::read_u64(&data[32..40])),
            next_attribute_id: LittleEndian::read_u16(&data[40..42]),
            record_number: (update_sequence_offset as usize >= HEADER_LEN)
                .then(|| LittleEndian::read_u32(&data[0x2C..0x30])),
        })
    }

    pub fn is_in_use(&self) -> bool {
        self.flags & 0x01 != 0
    }

    pub fn is_directory(&self) -> bool {
        self.flags & 0x02 != 0
    }
}

/// A decoded FILE record. Attributes are grouped by type code and kept in
/// on-disk order within a type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MftRecord {
    header: MftRecordHeader,
    attributes: BTreeMap<u32, Vec<Attribute>>,
}

impl MftRecord {
    pub fn header(&self) -> &MftRecordHeader {
        &self.header
    }

    pub fn record_number(&self) -> Option<u64> {
        self.header.record_number.map(u64::from)
    }

    pub fn sequence_number(&self) -> u16 {
        self.header.sequence_number
    }

    pub fn is_in_use(&self) -> bool {
        self.header.is_in_use()
    }

    pub fn is_directory(&self) -> bool {
        self.header.is_directory()
    }

    /// Extension records point back at the base record that owns them.
    pub fn is_extension(&self) -> bool {
        self.header.base_record.record != 0
    }

    pub fn attributes(&self) -> &BTreeMap<u32, Vec<Attribute>> {
        &self.attributes
    }

    pub fn attributes_of(&self, type_code: u32) -> &[Attribute] {
        self.attributes.get(&type_code).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn first_attribute(&self, type_code: u32) -> Option<&Attribute> {
        self.attributes_of(type_code).first()
    }

    pub fn attribute_count(&self) -> usize {
        self.attributes.values().map(Vec::len).sum()
    }

    pub fn standard_information(&self) -> Option<StandardInformation> {
        self.first_attribute(STANDARD_INFORMATION)
            .and_then(Attribute::resident_value)
            .and_then(StandardInformation::parse)
    }

    pub fn file_names(&self) -> Vec<FileNameAttribute> {
        self.attributes_of(FILE_NAME)
            .iter()
            .filter_map(Attribute::resident_value)
            .filter_map(FileNameAttribute::parse)
            .collect()
    }

    /// Algorithm of a WOF compressed file, read from a resident `$REPARSE_POINT`.
    pub fn wof_algorithm(&self) -> Option<WofAlgorithm> {
        self.first_attribute(REPARSE_POINT)
            .and_then(Attribute::resident_value)
            .and_then(|value| parse_wof_reparse(value).ok().flatten())
    }

    /// Entries of a resident `$ATTRIBUTE_LIST`. A nonresident list has to be read
    /// through the volume, see `NtfsVolume::attribute_list`.
    pub fn resident_attribute_list(&self) -> Result<Option<Vec<AttributeListEntry>>> {
        match self.first_attribute(ATTRIBUTE_LIST).and_then(Attribute::resident_value) {
            Some(value) => parse_attribute_list(value).map(Some),
            None => Ok(None),
        }
    }
}

impl fmt::Display for MftRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.record_number() {
            Some(n) => write!(f, "record {} seq {}", n, self.header.sequence_number)?,
            None => write!(f, "record ? seq {}", self.header.sequence_number)?,
        }
        write!(
            f,
            " [{}{}]",
            if self.is_in_use() { "in use" } else { "deleted" },
            if self.is_directory() { ", directory" } else { "" }
        )?;
        if let Some(name) = self.file_names().into_iter().max_by_key(|n| n.name_type != 2) {
            write!(f, " {}", name.name)?;
        }
        for attr in self.attributes.values().flatten() {
            write!(f, "\n  {}", attr)?;
        }
        Ok(())
    }
}

/// Decodes fixed-size FILE records.
#[derive(Debug, Clone, Copy)]
pub struct MftRecordParser {
    bytes_per_sector: usize,
}

impl MftRecordParser {
    pub fn new(bytes_per_sector: u16) -> Self {
        Self {
            bytes_per_sector: bytes_per_sector as usize,
        }
    }

    /// Parses a copy of `raw`, leaving the caller's buffer protected.
    pub fn parse(&self, raw: &[u8]) -> Result<MftRecord> {
        let mut buf = raw.to_vec();
        self.parse_in_place(&mut buf)
    }

    pub fn parse_in_place(&self, buf: &mut [u8]) -> Result<MftRecord> {
        let header = MftRecordHeader::parse(buf)
            .ok_or_else(|| ForgeError::corrupt("mft record", "missing FILE signature"))?;
        if header.signature == RecordSignature::Baad {
            return Err(ForgeError::corrupt("mft record", "record marked BAAD"));
        }

        apply_fixups(
            buf,
            header.update_sequence_offset as usize,
            header.update_sequence_size as usize,
            self.bytes_per_sector,
        )?;

        let first = header.first_attribute_offset as usize;
        let used = header.real_size as usize;
        if used > buf.len() || used < HEADER_LEN {
            return Err(ForgeError::corrupt("mft record", format!("used size {} of {}", used, buf.len())));
        }
        if first < HEADER_LEN || first + 4 > used || first % 8 != 0 {
            return Err(ForgeError::corrupt(
                "mft record",
                format!("first attribute offset {:#x}", first),
            ));
        }

        let mut attributes: BTreeMap<u32, Vec<Attribute>> = BTreeMap::new();
        let mut offset = first;
        loop {
            if offset + 4 > used {
                return Err(ForgeError::corrupt("mft record", "attribute stream has no end marker"));
            }
            let type_code = LittleEndian::read_u32(&buf[offset..offset + 4]);
            if type_code == END_OF_ATTRIBUTES {
                break;
            }
            if offset + 8 > used {
                return Err(ForgeError::corrupt("mft record", "attribute header truncated"));
            }
            let length = LittleEndian::read_u32(&buf[offset + 4..offset + 8]) as usize;
            if length < 16 || length % 8 != 0 || offset + length > used {
                return Err(ForgeError::corrupt(
                    "mft record",
                    format!("attribute at {:#x} has length {:#x}", offset, length),
                ));
            }
            let attribute = Attribute::parse(&buf[offset..offset + length])?;
            attributes.entry(type_code).or_default().push(attribute);
            offset += length;
        }

        Ok(MftRecord { header, attributes })
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::mft::attributes::tests::{nonresident_attribute, resident_attribute};
    use crate::mft::attributes::DATA;
    use crate::mft::fixup::tests::protect;

    pub(crate) struct RecordBuilder {
        pub number: u32,
        pub sequence: u16,
        pub flags: u16,
        pub base: FileReference,
        pub attributes: Vec<Vec<u8>>,
    }

    impl RecordBuilder {
        pub(crate) fn new(number: u32) -> Self {
            Self {
                number,
                sequence: 1,
                flags: 0x01,
                base: FileReference { record: 0, sequence: 0 },
                attributes: Vec::new(),
            }
        }

        pub(crate) fn attribute(mut self, bytes: Vec<u8>) -> Self {
            self.attributes.push(bytes);
            self
        }

        /// Unprotected record bytes, as they look after fixups.
        pub(crate) fn plain(&self) -> Vec<u8> {
            let mut rec = vec![0u8; 1024];
            rec[0..4].copy_from_slice(b"FILE");
            LittleEndian::write_u16(&mut rec[4..6], 0x30);
            LittleEndian::write_u16(&mut rec[6..8], 3);
            LittleEndian::write_u16(&mut rec[16..18], self.sequence);
            LittleEndian::write_u16(&mut rec[18..20], 1);
            LittleEndian::write_u16(&mut rec[20..22], 0x38);
            LittleEndian::write_u16(&mut rec[22..24], self.flags);
            LittleEndian::write_u32(&mut rec[28..32], 1024);
            LittleEndian::write_u64(&mut rec[32..40], self.base.to_raw());
            LittleEndian::write_u32(&mut rec[0x2C..0x30], self.number);
            let mut offset = 0x38;
            for attr in &self.attributes {
                rec[offset..offset + attr.len()].copy_from_slice(attr);
                offset += attr.len();
            }
            LittleEndian::write_u32(&mut rec[offset..offset + 4], END_OF_ATTRIBUTES);
            LittleEndian::write_u32(&mut rec[24..28], (offset + 8) as u32);
            rec
        }

        /// On-disk bytes with the update sequence applied.
        pub(crate) fn build(&self) -> Vec<u8> {
            let mut rec = self.plain();
            protect(&mut rec, 0x30, 512, 0x0042);
            rec
        }
    }

    #[test]
    fn parses_attributes_by_type() {
        let raw = RecordBuilder::new(7)
            .attribute(resident_attribute(STANDARD_INFORMATION, 0, &[0u8; 72]))
            .attribute(resident_attribute(DATA, 1, b"first"))
            .attribute(resident_attribute(DATA, 2, b"second"))
            .attribute(nonresident_attribute(DATA, 0, 0, 100, 0, &[0x11, 0x01, 0x30]))
            .build();
        let record = MftRecordParser::new(512).parse(&raw).unwrap();
        assert_eq!(record.record_number(), Some(7));
        assert_eq!(record.attributes_of(DATA).len(), 3);
        assert_eq!(record.first_attribute(DATA).unwrap().instance, 1);
        assert_eq!(record.attribute_count(), 4);
        assert!(record.standard_information().is_some());
        assert!(record.is_in_use());
    }

    #[test]
    fn unknown_types_are_kept() {
        let raw = RecordBuilder::new(1)
            .attribute(resident_attribute(0x4242, 0, b"vendor"))
            .build();
        let record = MftRecordParser::new(512).parse(&raw).unwrap();
        assert_eq!(record.first_attribute(0x4242).unwrap().resident_value(), Some(&b"vendor"[..]));
    }

    #[test]
    fn fixup_mismatch_rejects_plausible_record() {
        let mut raw = RecordBuilder::new(3)
            .attribute(resident_attribute(DATA, 0, b"payload"))
            .build();
        // torn second sector: its tail no longer carries the sequence number
        raw[1022] ^= 0xFF;
        let err = MftRecordParser::new(512).parse(&raw).unwrap_err();
        assert!(matches!(err, ForgeError::FixupMismatch { sector: 1, .. }));
    }

    #[test]
    fn overlong_attribute_is_corrupt() {
        let mut plain = RecordBuilder::new(3)
            .attribute(resident_attribute(DATA, 0, b"payload"))
            .plain();
        LittleEndian::write_u32(&mut plain[0x38 + 4..0x38 + 8], 0x800);
        protect(&mut plain, 0x30, 512, 9);
        assert!(MftRecordParser::new(512).parse(&plain).unwrap_err().is_corruption());
    }

    #[test]
    fn baad_records_are_rejected() {
        let mut raw = RecordBuilder::new(3).build();
        raw[0..4].copy_from_slice(b"BAAD");
        assert!(MftRecordParser::new(512).parse(&raw).is_err());
    }
}

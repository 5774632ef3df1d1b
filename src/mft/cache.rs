use std::collections::HashMap;

use log::debug;

use super::attributes::{Attribute, AttributeListEntry, FileReference};
use super::record::MftRecord;

/// Arena of decoded records keyed by record number.
///
/// Attribute list entries are `(record, sequence)` pairs; they are resolved here
/// on demand instead of holding pointers between records, since an extension
/// record may not be loaded when its base is.
#[derive(Debug, Default)]
pub struct RecordCache {
    records: HashMap<u64, MftRecord>,
    attribute_lists: HashMap<u64, Vec<AttributeListEntry>>,
}

impl RecordCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, number: u64, record: MftRecord) -> Option<MftRecord> {
        self.records.insert(number, record)
    }

    /// Registers the decoded `$ATTRIBUTE_LIST` of a base record, needed when the
    /// list itself is nonresident.
    pub fn insert_attribute_list(&mut self, number: u64, entries: Vec<AttributeListEntry>) {
        self.attribute_lists.insert(number, entries);
    }

    pub fn get(&self, number: u64) -> Option<&MftRecord> {
        self.records.get(&number)
    }

    pub fn contains(&self, number: u64) -> bool {
        self.records.contains_key(&number)
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// The referenced record, unless it has been reused since the reference was written.
    pub fn resolve(&self, reference: FileReference) -> Option<&MftRecord> {
        let record = self.records.get(&reference.record)?;
        if record.sequence_number() != reference.sequence {
            debug!(
                "stale reference to record {}: sequence {} != {}",
                reference.record,
                reference.sequence,
                record.sequence_number()
            );
            return None;
        }
        Some(record)
    }

    /// Attribute list entries of `base`, cached or resident.
    pub fn attribute_list_of(&self, number: u64, base: &MftRecord) -> Vec<AttributeListEntry> {
        if let Some(entries) = self.attribute_lists.get(&number) {
            return entries.clone();
        }
        base.resident_attribute_list().ok().flatten().unwrap_or_default()
    }

    /// First attribute of `type_code` belonging to `base`, following the attribute
    /// list into extension records when the base holds none.
    pub fn get_attribute_record_header<'a>(
        &'a self,
        number: u64,
        base: &'a MftRecord,
        type_code: u32,
    ) -> Option<&'a Attribute> {
        if let Some(attribute) = base.first_attribute(type_code) {
            return Some(attribute);
        }
        self.attribute_list_of(number, base)
            .iter()
            .filter(|entry| entry.type_code == type_code && entry.reference.record != number)
            .find_map(|entry| self.resolve_entry(entry))
    }

    /// Every extent of the stream `(type_code, name)` in VCN order.
    pub fn stream_extents<'a>(
        &'a self,
        number: u64,
        base: &'a MftRecord,
        type_code: u32,
        name: &str,
    ) -> Vec<&'a Attribute> {
        let mut extents: Vec<&Attribute> = base
            .attributes_of(type_code)
            .iter()
            .filter(|a| a.name == name)
            .collect();

        for entry in self.attribute_list_of(number, base) {
            if entry.type_code != type_code || entry.name != name || entry.reference.record == number {
                continue;
            }
            if let Some(attribute) = self.resolve_entry(&entry) {
                if !extents.iter().any(|e| std::ptr::eq(*e, attribute)) {
                    extents.push(attribute);
                }
            }
        }

        extents.sort_by_key(|a| a.nonresident().map_or(0, |n| n.lowest_vcn));
        extents
    }

    fn resolve_entry(&self, entry: &AttributeListEntry) -> Option<&Attribute> {
        let record = self.resolve(entry.reference)?;
        let candidates = record.attributes_of(entry.type_code);
        candidates
            .iter()
            .find(|a| a.instance == entry.instance && a.name == entry.name)
            .or_else(|| candidates.iter().find(|a| a.name == entry.name))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mft::attributes::tests::{nonresident_attribute, resident_attribute};
    use crate::mft::attributes::{ATTRIBUTE_LIST, DATA, STANDARD_INFORMATION};
    use crate::mft::record::tests::RecordBuilder;
    use crate::mft::record::MftRecordParser;
    use byteorder::{ByteOrder, LittleEndian};

    fn list_entry(type_code: u32, start_vcn: u64, reference: FileReference, instance: u16) -> Vec<u8> {
        let mut entry = vec![0u8; 0x20];
        LittleEndian::write_u32(&mut entry[0..4], type_code);
        LittleEndian::write_u16(&mut entry[4..6], 0x20);
        entry[7] = 0x1A;
        LittleEndian::write_u64(&mut entry[8..16], start_vcn);
        LittleEndian::write_u64(&mut entry[16..24], reference.to_raw());
        LittleEndian::write_u16(&mut entry[24..26], instance);
        entry
    }

    fn cache_with_extension(extension_sequence: u16) -> (RecordCache, MftRecord) {
        let parser = MftRecordParser::new(512);
        let base_ref = FileReference { record: 30, sequence: 1 };
        let ext_ref = FileReference { record: 31, sequence: 4 };

        let mut list = list_entry(STANDARD_INFORMATION, 0, base_ref, 0);
        list.extend(list_entry(DATA, 0, ext_ref, 2));
        list.extend(list_entry(DATA, 0x10, ext_ref, 3));

        let base = parser
            .parse(
                &RecordBuilder::new(30)
                    .attribute(resident_attribute(STANDARD_INFORMATION, 0, &[0u8; 48]))
                    .attribute(resident_attribute(ATTRIBUTE_LIST, 1, &list))
                    .build(),
            )
            .unwrap();

        let mut tail = nonresident_attribute(DATA, 0x10, 0x1F, 0, 0, &[0x11, 0x10, 0x60]);
        LittleEndian::write_u16(&mut tail[14..16], 3);
        let mut head = nonresident_attribute(DATA, 0, 0xF, 0x20000, 0, &[0x11, 0x10, 0x40]);
        LittleEndian::write_u16(&mut head[14..16], 2);

        let mut ext = RecordBuilder::new(31);
        ext.sequence = extension_sequence;
        ext.base = base_ref;
        let ext = parser.parse(&ext.attribute(tail).attribute(head).build()).unwrap();

        let mut cache = RecordCache::new();
        cache.insert(30, base.clone());
        cache.insert(31, ext);
        (cache, base)
    }

    #[test]
    fn bridges_attribute_list_to_extension() {
        let (cache, base) = cache_with_extension(4);
        assert!(base.first_attribute(DATA).is_none());
        let data = cache.get_attribute_record_header(30, &base, DATA).unwrap();
        assert_eq!(data.instance, 2);
        assert!(data.nonresident().unwrap().is_first_extent());
        assert_eq!(data.data_size(), Some(0x20000));

        let extents = cache.stream_extents(30, &base, DATA, "");
        assert_eq!(extents.len(), 2);
        assert_eq!(extents[1].nonresident().unwrap().lowest_vcn, 0x10);
    }

    #[test]
    fn stale_sequence_does_not_resolve() {
        let (cache, base) = cache_with_extension(5);
        assert!(cache.get_attribute_record_header(30, &base, DATA).is_none());
        assert!(cache.get_attribute_record_header(30, &base, STANDARD_INFORMATION).is_some());
    }
}

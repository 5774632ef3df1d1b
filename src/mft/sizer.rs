//! Authoritative stream length of an attribute.
//!
//! A resident value is sized by its header. A nonresident stream is sized by the
//! `FileSize` field of the extent starting at VCN 0; continuation extents carry
//! stale or garbage sizes, so they report `None` and the caller has to go back to
//! the first extent.

use super::attributes::{Attribute, DataAttribute};

pub fn get_data_size(attribute: &Attribute) -> Option<u64> {
    match &attribute.data {
        DataAttribute::Resident(resident) => Some(resident.value_length as u64),
        DataAttribute::Nonresident(extent) if extent.lowest_vcn == 0 => Some(extent.file_size),
        DataAttribute::Nonresident(_) => None,
    }
}

/// Size of a stream spread over several extents: the first extent decides.
pub fn get_stream_size<'a>(extents: impl IntoIterator<Item = &'a Attribute>) -> Option<u64> {
    extents.into_iter().find_map(get_data_size)
}

impl Attribute {
    pub fn data_size(&self) -> Option<u64> {
        get_data_size(self)
    }
}

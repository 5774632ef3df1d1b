use chrono::{DateTime, Utc};
use serde::Serialize;

use crate::compression::wof::WOF_STREAM_NAME;
use crate::location::{Partition, VolumeLocation};
use crate::mft::attributes::{FileNameAttribute, DATA};
use crate::mft::MftRecord;
use crate::shadow::ShadowCopy;

fn timestamp(value: Option<DateTime<Utc>>) -> Option<String> {
    value.map(|t| t.to_rfc3339())
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct LocationRow {
    pub identifier: String,
    pub kind: String,
    pub path: String,
    pub offset: u64,
    pub length: Option<u64>,
    pub partition: Option<u32>,
    pub file_system: String,
    pub serial_number: String,
    pub valid: bool,
    pub mount_points: Vec<String>,
    pub error: Option<String>,
}

impl From<&VolumeLocation> for LocationRow {
    fn from(location: &VolumeLocation) -> Self {
        Self {
            identifier: location.identifier(),
            kind: location.kind().to_string(),
            path: location.path().to_string(),
            offset: location.offset(),
            length: location.length(),
            partition: location.partition(),
            file_system: location.fs_type().to_string(),
            serial_number: format!("{:016X}", location.serial_number()),
            valid: location.is_valid(),
            mount_points: location.mount_points().to_vec(),
            error: location.error().map(str::to_string),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct PartitionRow {
    pub device: String,
    pub number: u32,
    pub partition_type: String,
    pub flags: String,
    pub start: Option<u64>,
    pub end: Option<u64>,
    pub size: Option<u64>,
    pub file_system: String,
    pub valid: bool,
    #[serde(rename = "MBRType")]
    pub mbr_type: Option<u8>,
    #[serde(rename = "GPTName")]
    pub gpt_name: Option<String>,
    #[serde(rename = "GPTUniqueGuid")]
    pub gpt_unique_guid: Option<String>,
    pub error: Option<String>,
}

impl PartitionRow {
    pub fn new(device: &str, partition: &Partition) -> Self {
        Self {
            device: device.to_string(),
            number: partition.number(),
            partition_type: partition.partition_type().to_string(),
            flags: partition.flags().to_string(),
            start: partition.start(),
            end: partition.end(),
            size: partition.size(),
            file_system: partition.file_system().to_string(),
            valid: partition.is_valid(),
            mbr_type: partition.mbr_type(),
            gpt_name: partition.gpt().map(|g| g.name.clone()),
            gpt_unique_guid: partition.gpt().map(|g| g.unique_guid.to_string()),
            error: partition.error().map(str::to_string),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct MftEntry {
    pub entry_number: u64,
    pub sequence_number: u16,

    pub parent_entry_number: Option<u64>,
    pub parent_sequence_number: Option<u16>,

    pub in_use: bool,
    pub is_directory: bool,
    pub is_extension: bool,

    pub file_name: Option<String>,
    pub name_type: Option<u8>,
    pub extension: Option<String>,

    pub has_ads: bool,
    pub wof_algorithm: Option<&'static str>,
    /// `None` when the size is held by an extent outside this record.
    pub file_size: Option<u64>,

    pub created0x10: Option<String>,
    pub created0x30: Option<String>,
    pub last_modified0x10: Option<String>,
    pub last_modified0x30: Option<String>,
    pub last_record_change0x10: Option<String>,
    pub last_record_change0x30: Option<String>,
    pub last_access0x10: Option<String>,
    pub last_access0x30: Option<String>,

    pub logfile_sequence_number: u64,
    pub security_id: Option<u32>,
    pub si_flags: Option<u32>,
    pub reference_count: u16,
    pub attribute_count: usize,

    pub signature: String,
    pub base_record_reference: u64,
    pub real_size: u32,
    pub allocated_size: u32,

    pub source: String,
}

/// Win32 names win over DOS 8.3 aliases.
fn preferred_name(names: &[FileNameAttribute]) -> Option<&FileNameAttribute> {
    names
        .iter()
        .find(|n| n.name_type == 1 || n.name_type == 3)
        .or_else(|| names.first())
}

impl MftEntry {
    pub fn from_record(number: u64, record: &MftRecord, source: &str) -> Self {
        let header = record.header();
        let names = record.file_names();
        let name = preferred_name(&names);
        let si = record.standard_information();
        let data = record.attributes_of(DATA);

        Self {
            entry_number: number,
            sequence_number: header.sequence_number,
            parent_entry_number: name.map(|n| n.parent.record),
            parent_sequence_number: name.map(|n| n.parent.sequence),
            in_use: record.is_in_use(),
            is_directory: record.is_directory(),
            is_extension: record.is_extension(),
            file_name: name.map(|n| n.name.clone()),
            name_type: name.map(|n| n.name_type),
            extension: name.and_then(|n| {
                n.name
                    .rsplit_once('.')
                    .filter(|(stem, ext)| !stem.is_empty() && !ext.is_empty())
                    .map(|(_, ext)| ext.to_string())
            }),
            has_ads: data.iter().any(|a| !a.name.is_empty() && a.name != WOF_STREAM_NAME),
            wof_algorithm: record.wof_algorithm().map(|a| a.as_str()),
            file_size: data.iter().filter(|a| a.name.is_empty()).find_map(|a| a.data_size()),
            created0x10: timestamp(si.as_ref().and_then(|s| s.creation_time)),
            created0x30: timestamp(name.and_then(|n| n.creation_time)),
            last_modified0x10: timestamp(si.as_ref().and_then(|s| s.modified_time)),
            last_modified0x30: timestamp(name.and_then(|n| n.modified_time)),
            last_record_change0x10: timestamp(si.as_ref().and_then(|s| s.mft_modified_time)),
            last_record_change0x30: timestamp(name.and_then(|n| n.mft_modified_time)),
            last_access0x10: timestamp(si.as_ref().and_then(|s| s.accessed_time)),
            last_access0x30: timestamp(name.and_then(|n| n.accessed_time)),
            logfile_sequence_number: header.logfile_sequence_number,
            security_id: si.as_ref().and_then(|s| s.security_id),
            si_flags: si.as_ref().map(|s| s.file_attributes),
            reference_count: header.hard_link_count,
            attribute_count: record.attribute_count(),
            signature: header.signature.to_string(),
            base_record_reference: header.base_record.to_raw(),
            real_size: header.real_size,
            allocated_size: header.allocated_size,
            source: source.to_string(),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ShadowCopyRow {
    pub id: String,
    pub set_id: String,
    pub parser: String,
    pub creation_time: Option<String>,
    pub volume_serial: String,
    pub volume_size: u64,
    pub store_location: String,
    pub chain_index: usize,
    pub layer_position: Option<u64>,
    pub attributes: Vec<&'static str>,
    pub machine: Option<String>,
    pub service: Option<String>,
    pub preserved_blocks: usize,
    pub identifier: String,
}

impl From<&ShadowCopy> for ShadowCopyRow {
    fn from(copy: &ShadowCopy) -> Self {
        Self {
            id: copy.id().to_string(),
            set_id: copy.set_id().to_string(),
            parser: copy.parser_type().to_string(),
            creation_time: timestamp(copy.creation_time()),
            volume_serial: format!("{:016X}", copy.volume_serial()),
            volume_size: copy.volume_size(),
            store_location: copy.store_location().to_string(),
            chain_index: copy.chain_index(),
            layer_position: copy.layer_position(),
            attributes: copy.attributes().names(),
            machine: copy.machine().map(str::to_string),
            service: copy.service().map(str::to_string),
            preserved_blocks: copy.preserved_blocks(),
            identifier: copy.location().identifier(),
        }
    }
}

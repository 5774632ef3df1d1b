//! Volume shadow copies: discovery and historical read views.

pub mod chain;
pub mod format;
pub mod metadata;
pub mod parser_type;
pub mod service;

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::context::ScanContext;
use crate::error::{ForgeError, Result};
use crate::io::{FileReader, SectorReader};
use crate::location::{BootSectorInfo, FileSystemType, LocationType, VolumeLocation};

pub use chain::{ShadowChain, ShadowCopyView, ShadowLayer};
pub use format::VolumeSnapshotAttributes;
pub use metadata::{MetadataShadowParser, VssStore};
pub use parser_type::ParserType;
pub use service::ServiceShadowParser;

/// Where a snapshot's preserved blocks are kept.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreLocation {
    /// A snapshot device exposed by the running system.
    Device(String),
    /// On-disk shadow storage inside the live volume.
    DiffArea {
        volume: String,
        store_index_offset: u64,
        store_file_reference: u64,
    },
}

impl fmt::Display for StoreLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Device(path) => f.write_str(path),
            Self::DiffArea {
                volume,
                store_index_offset,
                store_file_reference,
            } => write!(
                f,
                "{} (store index {:#x}, file {:#x})",
                volume, store_index_offset, store_file_reference
            ),
        }
    }
}

#[derive(Debug, Clone)]
enum Backing {
    Device(String),
    Chain {
        volume: VolumeLocation,
        chain: Arc<ShadowChain>,
        index: usize,
    },
}

/// One historical snapshot of a live volume, bound to it by serial number.
#[derive(Debug, Clone)]
pub struct ShadowCopy {
    id: Uuid,
    set_id: Uuid,
    volume_serial: u64,
    fs_type: FileSystemType,
    parser_type: ParserType,
    creation_time: Option<DateTime<Utc>>,
    store_location: StoreLocation,
    volume_size: u64,
    chain_index: usize,
    layer_position: Option<u64>,
    attributes: VolumeSnapshotAttributes,
    machine: Option<String>,
    service: Option<String>,
    preserved_blocks: usize,
    backing: Backing,
}

impl ShadowCopy {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn set_id(&self) -> Uuid {
        self.set_id
    }

    pub fn volume_serial(&self) -> u64 {
        self.volume_serial
    }

    pub fn parser_type(&self) -> ParserType {
        self.parser_type
    }

    pub fn creation_time(&self) -> Option<DateTime<Utc>> {
        self.creation_time
    }

    pub fn store_location(&self) -> &StoreLocation {
        &self.store_location
    }

    pub fn volume_size(&self) -> u64 {
        self.volume_size
    }

    /// 0 for the newest snapshot of the volume.
    pub fn chain_index(&self) -> usize {
        self.chain_index
    }

    pub fn layer_position(&self) -> Option<u64> {
        self.layer_position
    }

    pub fn attributes(&self) -> VolumeSnapshotAttributes {
        self.attributes
    }

    pub fn machine(&self) -> Option<&str> {
        self.machine.as_deref()
    }

    pub fn service(&self) -> Option<&str> {
        self.service.as_deref()
    }

    /// Blocks preserved by this snapshot's own store.
    pub fn preserved_blocks(&self) -> usize {
        self.preserved_blocks
    }

    /// The snapshot as a location. Internal snapshots have no device path of
    /// their own and are read through [`ShadowCopy::open`].
    pub fn location(&self) -> VolumeLocation {
        let path = match &self.backing {
            Backing::Device(path) => path.clone(),
            Backing::Chain { volume, .. } => format!("{}#vss{{{}}}", volume.path(), self.id),
        };
        VolumeLocation::new(LocationType::SnapshotVolume, path).with_boot_sector(BootSectorInfo {
            fs_type: self.fs_type,
            serial_number: self.volume_serial,
        })
    }

    /// Opens a read view of the volume as it was at snapshot time.
    pub fn open(&self) -> Result<Box<dyn SectorReader>> {
        match &self.backing {
            Backing::Device(path) => Ok(Box::new(FileReader::open(path)?)),
            Backing::Chain { volume, chain, index } => {
                let reader = volume.open()?;
                Ok(Box::new(ShadowCopyView::new(reader, chain.clone(), *index, self.volume_size)))
            }
        }
    }
}

impl fmt::Display for ShadowCopy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Shadow copy {{{}}} [{}]", self.id, self.parser_type)?;
        match self.creation_time {
            Some(time) => write!(f, " created {}", time.format("%Y-%m-%d %H:%M:%S UTC"))?,
            None => f.write_str(" created <unknown>")?,
        }
        write!(
            f,
            " - serial : {:#018x} - {} bytes - {}",
            self.volume_serial, self.volume_size, self.store_location
        )
    }
}

/// A way of discovering and reading shadow copies.
pub trait ShadowCopyParser: Send + Sync {
    fn parser_type(&self) -> ParserType;

    /// Shadow copies of the live volume at `location`, newest first.
    fn enumerate(&self, ctx: &ScanContext, location: &VolumeLocation) -> Result<Vec<ShadowCopy>>;

    fn open_snapshot_stream(&self, copy: &ShadowCopy) -> Result<Box<dyn SectorReader>> {
        if copy.parser_type() != self.parser_type() {
            return Err(ForgeError::InvalidArgument(format!(
                "shadow copy {} belongs to the {} parser",
                copy.id(),
                copy.parser_type()
            )));
        }
        copy.open()
    }
}

pub fn parser_for(kind: ParserType) -> Option<Box<dyn ShadowCopyParser>> {
    match kind {
        ParserType::Microsoft => Some(Box::new(ServiceShadowParser::new())),
        ParserType::Internal => Some(Box::new(MetadataShadowParser::new())),
        ParserType::Unknown => None,
    }
}

/// Shadow copies of `location` with the requested parser. Without an explicit
/// choice the service is tried first and on-disk storage is read when the service
/// is unavailable.
pub fn enumerate_shadow_copies(
    ctx: &ScanContext,
    location: &VolumeLocation,
    requested: Option<ParserType>,
) -> Result<Vec<ShadowCopy>> {
    if let Some(parser) = requested.and_then(parser_for) {
        return parser.enumerate(ctx, location);
    }
    match ServiceShadowParser::new().enumerate(ctx, location) {
        Err(ForgeError::ServiceUnavailable(reason)) => {
            ctx.info(location.path(), format!("{}, reading on-disk shadow storage", reason));
            MetadataShadowParser::new().enumerate(ctx, location)
        }
        other => other,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn device_copy() -> ShadowCopy {
        let path = r"\\?\GLOBALROOT\Device\HarddiskVolumeShadowCopy7".to_string();
        ShadowCopy {
            id: Uuid::nil(),
            set_id: Uuid::nil(),
            volume_serial: 0x1234,
            fs_type: FileSystemType::Ntfs,
            parser_type: ParserType::Microsoft,
            creation_time: None,
            store_location: StoreLocation::Device(path.clone()),
            volume_size: 0x10_0000,
            chain_index: 0,
            layer_position: None,
            attributes: VolumeSnapshotAttributes::default(),
            machine: None,
            service: None,
            preserved_blocks: 0,
            backing: Backing::Device(path),
        }
    }

    #[test]
    fn unknown_parser_has_no_implementation() {
        assert!(parser_for(ParserType::Unknown).is_none());
        assert_eq!(parser_for(ParserType::Internal).unwrap().parser_type(), ParserType::Internal);
        assert_eq!(parser_for(ParserType::Microsoft).unwrap().parser_type(), ParserType::Microsoft);
    }

    #[test]
    fn device_copy_location_keeps_live_serial() {
        let location = device_copy().location();
        assert_eq!(location.kind(), LocationType::SnapshotVolume);
        assert_eq!(location.serial_number(), 0x1234);
        assert_eq!(location.identifier(), "Snapshot_7");
    }

    #[test]
    fn stream_is_opened_by_owning_parser_only() {
        let Err(err) = MetadataShadowParser::new().open_snapshot_stream(&device_copy()) else {
            panic!("a device copy was opened by the metadata parser");
        };
        assert!(matches!(err, ForgeError::InvalidArgument(_)));
    }

    #[test]
    fn display_names_store() {
        let text = device_copy().to_string();
        assert!(text.contains("[microsoft]"));
        assert!(text.contains("created <unknown>"));
        assert!(text.ends_with("HarddiskVolumeShadowCopy7"));
    }
}

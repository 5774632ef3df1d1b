//! Readable storage locations: drives, partitions, mounted volumes, images and
//! snapshots.

pub mod enumerator;
pub mod fs_type;
pub mod partition;

use std::fmt;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;

use crate::error::Result;
use crate::io::{FileReader, SectorReader, WindowReader};

pub use enumerator::{enumerate, DeviceProvider, DriveReport, EnumerationReport, HostDevices, ImageFiles};
pub use fs_type::{get_file_system_type, identify_boot_sector, BootSectorInfo, FileSystemType};
pub use partition::{Partition, PartitionFlags, PartitionTable, PartitionType, TableKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
pub enum LocationType {
    PhysicalDrive,
    PartitionVolume,
    MountedVolume,
    ImageFile,
    SnapshotVolume,
}

impl fmt::Display for LocationType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::PhysicalDrive => "PhysicalDrive",
            Self::PartitionVolume => "PartitionVolume",
            Self::MountedVolume => "MountedVolume",
            Self::ImageFile => "ImageFile",
            Self::SnapshotVolume => "SnapshotVolume",
        })
    }
}

/// A place bytes can be read from. It holds no handle; [`VolumeLocation::open`]
/// acquires one per pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VolumeLocation {
    kind: LocationType,
    path: String,
    offset: u64,
    length: Option<u64>,
    partition: Option<u32>,
    fs_type: FileSystemType,
    serial_number: u64,
    valid: bool,
    mount_points: Vec<String>,
    error: Option<String>,
}

impl VolumeLocation {
    /// A location spanning the whole of `path`, not yet inspected.
    pub fn new(kind: LocationType, path: impl Into<String>) -> Self {
        Self {
            kind,
            path: path.into(),
            offset: 0,
            length: None,
            partition: None,
            fs_type: FileSystemType::Unknown,
            serial_number: 0,
            valid: true,
            mount_points: Vec::new(),
            error: None,
        }
    }

    /// A volume inside a device, described by its partition table entry.
    pub fn from_partition(kind: LocationType, device: impl Into<String>, partition: &Partition) -> Self {
        let mut location = Self::new(kind, device);
        location.offset = partition.start().unwrap_or(0);
        location.length = partition.size();
        location.partition = Some(partition.number());
        location.fs_type = partition.file_system();
        location.serial_number = partition.serial_number();
        location.valid = partition.is_valid();
        location.error = partition.error().map(str::to_string);
        location
    }

    pub fn with_window(mut self, offset: u64, length: u64) -> Self {
        self.offset = offset;
        self.length = Some(length);
        self
    }

    pub fn with_partition(mut self, number: u32) -> Self {
        self.partition = Some(number);
        self
    }

    pub fn with_boot_sector(mut self, boot: BootSectorInfo) -> Self {
        self.fs_type = boot.fs_type;
        self.serial_number = boot.serial_number;
        self
    }

    pub fn with_mount_point(mut self, mount_point: impl Into<String>) -> Self {
        let mount_point = mount_point.into();
        if !self.mount_points.contains(&mount_point) {
            self.mount_points.push(mount_point);
        }
        self
    }

    pub fn with_error(mut self, error: impl Into<String>) -> Self {
        self.valid = false;
        self.error = Some(error.into());
        self
    }

    /// Reads the boot sector and records what it names. I/O failures mark the
    /// location invalid instead of failing.
    pub fn inspect(self) -> Self {
        match self.read_boot_sector() {
            Ok(sector) => {
                let boot = identify_boot_sector(&sector);
                self.with_boot_sector(boot)
            }
            Err(err) => self.with_error(err.to_string()),
        }
    }

    pub fn kind(&self) -> LocationType {
        self.kind
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn length(&self) -> Option<u64> {
        self.length
    }

    pub fn partition(&self) -> Option<u32> {
        self.partition
    }

    pub fn fs_type(&self) -> FileSystemType {
        self.fs_type
    }

    pub fn serial_number(&self) -> u64 {
        self.serial_number
    }

    pub fn is_valid(&self) -> bool {
        self.valid
    }

    pub fn mount_points(&self) -> &[String] {
        &self.mount_points
    }

    pub fn error(&self) -> Option<&str> {
        self.error.as_deref()
    }

    /// Opens a fresh reader positioned on this location's byte window.
    pub fn open(&self) -> Result<Box<dyn SectorReader>> {
        let file = FileReader::open(&self.path)?;
        let device_len = file.len();
        if self.offset == 0 && self.length.map_or(true, |len| len == device_len) {
            return Ok(Box::new(file));
        }
        let length = self
            .length
            .unwrap_or_else(|| device_len.saturating_sub(self.offset));
        Ok(Box::new(WindowReader::new(file, self.offset, length)?))
    }

    pub fn read_boot_sector(&self) -> Result<Vec<u8>> {
        let mut reader = self.open()?;
        let sector_size = reader.sector_size().max(512) as usize;
        reader.read_sectors(0, sector_size)
    }

    /// Filesystem named by the boot sector. Unrecognized bytes give `Unknown`.
    pub fn get_file_system_type(&self) -> Result<FileSystemType> {
        Ok(get_file_system_type(&self.read_boot_sector()?))
    }

    /// A filesystem-safe name for this location, e.g. `Volume_C` or
    /// `PhysicalDrive_0_Partition_2`.
    pub fn identifier(&self) -> String {
        let base = match self.kind {
            LocationType::MountedVolume => {
                let source = self.mount_points.first().map_or(self.path.as_str(), String::as_str);
                volume_identifier(source)
            }
            LocationType::SnapshotVolume => snapshot_identifier(&self.path),
            LocationType::ImageFile => image_identifier(&self.path),
            LocationType::PhysicalDrive | LocationType::PartitionVolume => {
                if looks_like_image(&self.path) {
                    image_identifier(&self.path)
                } else {
                    drive_identifier(&self.path)
                }
            }
        };
        match self.partition {
            Some(number) if self.kind != LocationType::SnapshotVolume => {
                format!("{}_Partition_{}", base, number)
            }
            _ => base,
        }
    }
}

impl fmt::Display for VolumeLocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.path)?;
        if let Some(number) = self.partition {
            write!(f, " #{}", number)?;
        }
        if !self.mount_points.is_empty() {
            write!(f, " - {}", self.mount_points.join(", "))?;
        }
        if self.valid {
            write!(f, " - {} - Valid (serial : {:#018x})", self.fs_type, self.serial_number)
        } else {
            write!(f, " - {} - Invalid", self.fs_type)?;
            if let Some(error) = &self.error {
                write!(f, " ({})", error)?;
            }
            Ok(())
        }
    }
}

type PatternCell = OnceLock<Option<Regex>>;

fn regex(cell: &'static PatternCell, pattern: &str) -> Option<&'static Regex> {
    cell.get_or_init(|| Regex::new(pattern).ok()).as_ref()
}

fn capture(re: Option<&Regex>, text: &str) -> Option<String> {
    re?.captures(text)?.get(1).map(|m| m.as_str().to_string())
}

fn drive_letter_re() -> Option<&'static Regex> {
    static CELL: PatternCell = OnceLock::new();
    regex(&CELL, r"^(?:\\\\[.?]\\)?([A-Za-z]):\\?$")
}

fn physical_drive_re() -> Option<&'static Regex> {
    static CELL: PatternCell = OnceLock::new();
    regex(&CELL, r"(?i)PhysicalDrive(\d+)$")
}

fn shadow_copy_re() -> Option<&'static Regex> {
    static CELL: PatternCell = OnceLock::new();
    regex(&CELL, r"(?i)HarddiskVolumeShadowCopy(\d+)$")
}

fn internal_snapshot_re() -> Option<&'static Regex> {
    static CELL: PatternCell = OnceLock::new();
    regex(&CELL, r"(?i)#vss\{?([0-9a-f-]{36})\}?$")
}

/// Replaces characters Windows forbids in file names and trims separators.
pub fn sanitize_identifier(raw: &str) -> String {
    let replaced: String = raw
        .chars()
        .map(|c| match c {
            '<' | '>' | ':' | '"' | '/' | '\\' | '|' | '?' | '*' => '_',
            c if c.is_control() => '_',
            c => c,
        })
        .collect();
    replaced.trim_matches('_').to_string()
}

fn volume_identifier(source: &str) -> String {
    if let Some(letter) = capture(drive_letter_re(), source) {
        return format!("Volume_{}", letter.to_ascii_uppercase());
    }
    format!("Volume_{}", sanitize_identifier(source))
}

fn drive_identifier(path: &str) -> String {
    if let Some(number) = capture(physical_drive_re(), path) {
        return format!("PhysicalDrive_{}", number);
    }
    let name = Path::new(path)
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    format!("Disk_{}", sanitize_identifier(&name))
}

fn image_identifier(path: &str) -> String {
    let stem = Path::new(path)
        .file_stem()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_else(|| path.to_string());
    format!("Image_{}", sanitize_identifier(&stem))
}

fn snapshot_identifier(path: &str) -> String {
    if let Some(number) = capture(shadow_copy_re(), path) {
        return format!("Snapshot_{}", number);
    }
    if let Some(guid) = capture(internal_snapshot_re(), path) {
        return format!("Snapshot_{}", guid.to_ascii_lowercase());
    }
    format!("Snapshot_{}", sanitize_identifier(path))
}

fn looks_like_image(path: &str) -> bool {
    !(path.starts_with(r"\\") || path.starts_with("/dev/"))
}

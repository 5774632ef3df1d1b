use std::path::PathBuf;

use rayon::prelude::*;

use super::fs_type::identify_boot_sector;
use super::partition::{PartitionTable, TableKind};
use super::{BootSectorInfo, LocationType, Partition, VolumeLocation};
use crate::context::ScanContext;
use crate::error::{ForgeError, Result};
use crate::io::{FileReader, SectorReader};

/// A device to decode a partition table from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DriveSource {
    pub path: String,
    pub kind: LocationType,
}

/// A live mount: the device behind it and where it is mounted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MountSource {
    pub device: String,
    pub mount_point: String,
}

/// Where devices come from. Implementations must be shareable across the
/// worker threads that scan drives.
pub trait DeviceProvider: Send + Sync {
    fn drives(&self) -> Vec<DriveSource>;

    fn mounts(&self) -> Vec<MountSource> {
        Vec::new()
    }

    fn open(&self, path: &str) -> Result<Box<dyn SectorReader>> {
        Ok(Box::new(FileReader::open(path)?))
    }
}

/// Devices attached to this machine.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostDevices;

impl DeviceProvider for HostDevices {
    fn drives(&self) -> Vec<DriveSource> {
        host::drives()
    }

    fn mounts(&self) -> Vec<MountSource> {
        host::mounts()
    }

    fn open(&self, path: &str) -> Result<Box<dyn SectorReader>> {
        let reader = FileReader::open(path)?;
        Ok(Box::new(match host::logical_sector_size(path) {
            Some(size) => reader.with_sector_size(size),
            None => reader,
        }))
    }
}

/// Raw disk or volume images, each scanned like a drive.
#[derive(Debug, Default, Clone)]
pub struct ImageFiles {
    images: Vec<PathBuf>,
}

impl ImageFiles {
    pub fn new<I, P>(images: I) -> Self
    where
        I: IntoIterator<Item = P>,
        P: Into<PathBuf>,
    {
        Self {
            images: images.into_iter().map(Into::into).collect(),
        }
    }
}

impl DeviceProvider for ImageFiles {
    fn drives(&self) -> Vec<DriveSource> {
        self.images
            .iter()
            .map(|path| DriveSource {
                path: path.to_string_lossy().into_owned(),
                kind: LocationType::ImageFile,
            })
            .collect()
    }
}

#[derive(Debug, Clone)]
pub struct DriveReport {
    pub drive: VolumeLocation,
    pub table: Option<PartitionTable>,
}

/// Everything one enumeration pass found, failures included.
#[derive(Debug, Clone, Default)]
pub struct EnumerationReport {
    pub drives: Vec<DriveReport>,
    pub locations: Vec<VolumeLocation>,
    pub cancelled: bool,
}

impl EnumerationReport {
    /// Locations holding a recognized filesystem.
    pub fn volumes(&self) -> impl Iterator<Item = &VolumeLocation> {
        self.locations
            .iter()
            .filter(|l| l.is_valid() && l.fs_type().is_known())
    }

    pub fn failures(&self) -> impl Iterator<Item = &VolumeLocation> {
        self.locations.iter().filter(|l| !l.is_valid())
    }
}

/// Scans every drive and mount the provider knows of. Drives are decoded in
/// parallel; a failing drive or mount only marks its own location invalid.
pub fn enumerate(ctx: &ScanContext, provider: &dyn DeviceProvider) -> EnumerationReport {
    let drives = provider.drives();
    let mounts = provider.mounts();
    ctx.debug(
        "enumerate",
        format!("{} drive(s), {} mount(s)", drives.len(), mounts.len()),
    );

    let scanned: Vec<(DriveReport, Vec<VolumeLocation>)> = drives
        .par_iter()
        .map(|drive| scan_drive(ctx, provider, drive))
        .collect();
    let mounted: Vec<VolumeLocation> = mounts
        .par_iter()
        .map(|mount| scan_mount(ctx, provider, mount))
        .collect();

    let mut report = EnumerationReport {
        cancelled: ctx.is_cancelled(),
        ..Default::default()
    };
    for (drive, volumes) in scanned {
        report.locations.push(drive.drive.clone());
        report.locations.extend(volumes);
        report.drives.push(drive);
    }

    for volume in report.locations.iter_mut() {
        let (serial, fs_type) = (volume.serial_number(), volume.fs_type());
        if serial == 0 || volume.kind() == LocationType::PhysicalDrive {
            continue;
        }
        let mount_points: Vec<String> = mounted
            .iter()
            .filter(|m| m.is_valid() && m.serial_number() == serial && m.fs_type() == fs_type)
            .flat_map(|m| m.mount_points().iter().cloned())
            .collect();
        for mount_point in mount_points {
            *volume = volume.clone().with_mount_point(mount_point);
        }
    }
    report.locations.extend(mounted);

    report
        .locations
        .sort_by(|a, b| (a.kind(), a.path(), a.offset()).cmp(&(b.kind(), b.path(), b.offset())));
    report.drives.sort_by(|a, b| a.drive.path().cmp(b.drive.path()));
    report
}

fn scan_drive(ctx: &ScanContext, provider: &dyn DeviceProvider, source: &DriveSource) -> (DriveReport, Vec<VolumeLocation>) {
    let drive = VolumeLocation::new(source.kind, source.path.clone());
    let failed = |drive: VolumeLocation, err: ForgeError| {
        ctx.warn(&source.path, err.to_string());
        (DriveReport { drive: drive.with_error(err.to_string()), table: None }, Vec::new())
    };

    if let Err(err) = ctx.check_cancelled() {
        return failed(drive, err);
    }
    let mut reader = match provider.open(&source.path) {
        Ok(reader) => reader,
        Err(err) => return failed(drive, err),
    };
    let drive = match reader.len() {
        u64::MAX => drive,
        len => drive.with_window(0, len),
    };

    let table = match PartitionTable::read(&mut reader, ctx) {
        Ok(table) => table,
        Err(err) => return failed(drive, err),
    };
    ctx.info(
        &source.path,
        format!("{} table, {} partition(s)", table.kind(), table.partitions().len()),
    );

    let volumes = if table.kind() == TableKind::Volume {
        let kind = match source.kind {
            LocationType::ImageFile => LocationType::ImageFile,
            _ => LocationType::PartitionVolume,
        };
        table
            .volumes()
            .map(|p| {
                VolumeLocation::new(kind, source.path.clone())
                    .with_window(0, p.size().unwrap_or(0))
                    .with_boot_sector(identify_volume(p))
            })
            .collect()
    } else {
        table
            .volumes()
            .chain(table.unreadable())
            .map(|p| VolumeLocation::from_partition(LocationType::PartitionVolume, source.path.clone(), p))
            .collect()
    };

    (
        DriveReport {
            drive,
            table: Some(table),
        },
        volumes,
    )
}

fn identify_volume(partition: &Partition) -> BootSectorInfo {
    BootSectorInfo {
        fs_type: partition.file_system(),
        serial_number: partition.serial_number(),
    }
}

fn scan_mount(ctx: &ScanContext, provider: &dyn DeviceProvider, source: &MountSource) -> VolumeLocation {
    let location = VolumeLocation::new(LocationType::MountedVolume, source.device.clone())
        .with_mount_point(source.mount_point.clone());
    let boot = ctx.check_cancelled().and_then(|_| {
        let mut reader = provider.open(&source.device)?;
        let sector_size = reader.sector_size().max(512) as usize;
        reader.read_sectors(0, sector_size)
    });
    match boot {
        Ok(sector) => location.with_boot_sector(identify_boot_sector(&sector)),
        Err(err) => {
            ctx.warn(&source.device, format!("mount {}: {}", source.mount_point, err));
            location.with_error(err.to_string())
        }
    }
}

#[cfg(windows)]
mod host {
    use std::fs::File;
    use std::path::Path;

    use super::{DriveSource, LocationType, MountSource};

    const MAX_PHYSICAL_DRIVES: u32 = 32;

    pub(super) fn drives() -> Vec<DriveSource> {
        (0..MAX_PHYSICAL_DRIVES)
            .map(|n| format!(r"\\.\PhysicalDrive{}", n))
            .filter(|path| File::open(path).is_ok())
            .map(|path| DriveSource {
                path,
                kind: LocationType::PhysicalDrive,
            })
            .collect()
    }

    /// No geometry query here, reads align to 512 bytes.
    pub(super) fn logical_sector_size(_path: &str) -> Option<u32> {
        None
    }

    pub(super) fn mounts() -> Vec<MountSource> {
        (b'A'..=b'Z')
            .map(char::from)
            .filter(|letter| Path::new(&format!(r"{}:\", letter)).exists())
            .map(|letter| MountSource {
                device: format!(r"\\.\{}:", letter),
                mount_point: format!(r"{}:\", letter),
            })
            .collect()
    }
}

#[cfg(not(windows))]
mod host {
    use std::fs;

    use log::debug;

    use super::{DriveSource, LocationType, MountSource};

    const DISK_PREFIXES: [&str; 6] = ["sd", "nvme", "vd", "hd", "xvd", "mmcblk"];

    pub(super) fn drives() -> Vec<DriveSource> {
        let entries = match fs::read_dir("/sys/block") {
            Ok(entries) => entries,
            Err(err) => {
                debug!("cannot list /sys/block: {}", err);
                return Vec::new();
            }
        };
        let mut drives: Vec<DriveSource> = entries
            .filter_map(|entry| entry.ok())
            .map(|entry| entry.file_name().to_string_lossy().into_owned())
            .filter(|name| DISK_PREFIXES.iter().any(|prefix| name.starts_with(prefix)))
            .map(|name| DriveSource {
                path: format!("/dev/{}", name),
                kind: LocationType::PhysicalDrive,
            })
            .collect();
        drives.sort_by(|a, b| a.path.cmp(&b.path));
        drives
    }

    /// `queue/logical_block_size` of the device, or of the disk holding a partition.
    pub(super) fn logical_sector_size(path: &str) -> Option<u32> {
        let name = path.strip_prefix("/dev/")?;
        let class = format!("/sys/class/block/{}", name);
        [format!("{}/queue/logical_block_size", class), format!("{}/../queue/logical_block_size", class)]
            .iter()
            .find_map(|candidate| fs::read_to_string(candidate).ok())
            .and_then(|text| parse_block_size(&text))
    }

    pub(super) fn parse_block_size(text: &str) -> Option<u32> {
        text.trim().parse().ok().filter(|size: &u32| size.is_power_of_two())
    }

    pub(super) fn mounts() -> Vec<MountSource> {
        match fs::read_to_string("/proc/mounts") {
            Ok(text) => parse_mounts(&text),
            Err(err) => {
                debug!("cannot read /proc/mounts: {}", err);
                Vec::new()
            }
        }
    }

    /// Block-device mounts from a `/proc/mounts` listing.
    pub(super) fn parse_mounts(text: &str) -> Vec<MountSource> {
        text.lines()
            .filter_map(|line| {
                let mut fields = line.split_whitespace();
                let device = fields.next()?;
                let mount_point = fields.next()?;
                device.starts_with("/dev/").then(|| MountSource {
                    device: device.to_string(),
                    mount_point: mount_point.replace("\\040", " "),
                })
            })
            .collect()
    }
}

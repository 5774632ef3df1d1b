//! Shadow copies exposed by the running system's snapshot service.

use uuid::Uuid;

use super::{Backing, ParserType, ShadowCopy, ShadowCopyParser, StoreLocation, VolumeSnapshotAttributes};
use crate::context::ScanContext;
use crate::error::{ForgeError, Result};
use crate::location::{LocationType, VolumeLocation};

const DEVICE_PREFIX: &str = r"\\?\GLOBALROOT\Device\HarddiskVolumeShadowCopy";
const MAX_DEVICE_NUMBER: u32 = 512;
const MAX_CONSECUTIVE_MISSES: u32 = 16;

/// Probes the snapshot devices of the live system.
#[derive(Debug, Clone, Copy)]
pub struct ServiceShadowParser {
    max_device: u32,
    max_misses: u32,
}

impl Default for ServiceShadowParser {
    fn default() -> Self {
        Self::new()
    }
}

impl ServiceShadowParser {
    pub fn new() -> Self {
        Self {
            max_device: MAX_DEVICE_NUMBER,
            max_misses: MAX_CONSECUTIVE_MISSES,
        }
    }

    pub fn device_path(number: u32) -> String {
        format!("{}{}", DEVICE_PREFIX, number)
    }

    fn check_available(location: &VolumeLocation) -> Result<()> {
        if !cfg!(windows) {
            return Err(ForgeError::ServiceUnavailable(
                "snapshot service requires a Windows host".to_string(),
            ));
        }
        if location.mount_points().is_empty() {
            return Err(ForgeError::ServiceUnavailable(format!(
                "{} is not mounted",
                location.path()
            )));
        }
        Ok(())
    }

    /// Readable snapshot devices in device order. Probing stops after a run of
    /// consecutive misses.
    fn scan_devices(&self, ctx: &ScanContext) -> Result<Vec<(u32, VolumeLocation)>> {
        let mut found = Vec::new();
        let mut misses = 0;
        for number in 1..=self.max_device {
            ctx.check_cancelled()?;
            let device = VolumeLocation::new(LocationType::SnapshotVolume, Self::device_path(number)).inspect();
            if device.is_valid() {
                misses = 0;
                found.push((number, device));
            } else {
                misses += 1;
                if misses >= self.max_misses {
                    break;
                }
            }
        }
        Ok(found)
    }
}

impl ShadowCopyParser for ServiceShadowParser {
    fn parser_type(&self) -> ParserType {
        ParserType::Microsoft
    }

    fn enumerate(&self, ctx: &ScanContext, location: &VolumeLocation) -> Result<Vec<ShadowCopy>> {
        Self::check_available(location)?;
        let mut devices: Vec<(u32, VolumeLocation)> = self
            .scan_devices(ctx)?
            .into_iter()
            .filter(|(_, device)| device.serial_number() == location.serial_number())
            .collect();
        // higher device numbers were created later
        devices.sort_by(|a, b| b.0.cmp(&a.0));
        ctx.debug(
            location.path(),
            format!("{} snapshot device(s) match serial {:#018x}", devices.len(), location.serial_number()),
        );

        let copies = devices
            .into_iter()
            .enumerate()
            .map(|(index, (_, device))| {
                let volume_size = device.open().map(|reader| reader.len()).unwrap_or(0);
                ShadowCopy {
                    id: Uuid::nil(),
                    set_id: Uuid::nil(),
                    volume_serial: device.serial_number(),
                    fs_type: device.fs_type(),
                    parser_type: ParserType::Microsoft,
                    creation_time: None,
                    store_location: StoreLocation::Device(device.path().to_string()),
                    volume_size,
                    chain_index: index,
                    layer_position: None,
                    attributes: VolumeSnapshotAttributes::default(),
                    machine: None,
                    service: None,
                    preserved_blocks: 0,
                    backing: Backing::Device(device.path().to_string()),
                }
            })
            .collect();
        Ok(copies)
    }
}

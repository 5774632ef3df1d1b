pub mod locations;
pub mod mft;
pub mod shadows;

use std::fs::File;
use std::io::{self, BufWriter, Write};

use log::info;

use ntfs_artifact_forge::location::{enumerate, DeviceProvider, EnumerationReport, HostDevices, ImageFiles};
use ntfs_artifact_forge::location::{FileSystemType, VolumeLocation};
use ntfs_artifact_forge::output::JsonlWriter;
use ntfs_artifact_forge::{ForgeError, Result, ScanContext};

use crate::cli::SourceArgs;

/// Enumerates the given images, or the attached devices when there are none.
pub fn scan(ctx: &ScanContext, images: &[String]) -> EnumerationReport {
    let provider: Box<dyn DeviceProvider> = if images.is_empty() {
        Box::new(HostDevices)
    } else {
        Box::new(ImageFiles::new(images.iter().cloned()))
    };
    enumerate(ctx, provider.as_ref())
}

/// The volume named by `--volume`, or the first NTFS volume found.
pub fn select_volume(ctx: &ScanContext, source: &SourceArgs) -> Result<VolumeLocation> {
    let report = scan(ctx, &source.images);
    let selected = match &source.volume {
        Some(wanted) => report
            .locations
            .iter()
            .find(|l| l.identifier().eq_ignore_ascii_case(wanted) || l.path() == wanted),
        None => report.volumes().find(|l| l.fs_type() == FileSystemType::Ntfs),
    };
    let location = selected.cloned().ok_or_else(|| {
        ForgeError::InvalidArgument(match &source.volume {
            Some(wanted) => format!("no location named {}", wanted),
            None => "no NTFS volume found".to_string(),
        })
    })?;
    if !location.is_valid() {
        return Err(ForgeError::InvalidArgument(format!(
            "{} is not readable: {}",
            location.identifier(),
            location.error().unwrap_or("invalid")
        )));
    }
    info!("using {}", location);
    Ok(location)
}

pub fn jsonl_output(path: Option<&str>) -> Result<JsonlWriter<Box<dyn Write>>> {
    let sink: Box<dyn Write> = match path {
        Some(path) => Box::new(BufWriter::new(File::create(path)?)),
        None => Box::new(BufWriter::new(io::stdout())),
    };
    Ok(JsonlWriter::new(sink))
}

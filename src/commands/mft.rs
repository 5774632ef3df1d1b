use std::io;

use log::{info, warn};

use ntfs_artifact_forge::mft::NtfsVolume;
use ntfs_artifact_forge::models::MftEntry;
use ntfs_artifact_forge::shadow::{enumerate_shadow_copies, ParserType};
use ntfs_artifact_forge::{ForgeError, Result, ScanContext, SectorReader};

use super::{jsonl_output, select_volume};
use crate::cli::SourceArgs;

pub fn run(
    ctx: &ScanContext,
    source: &SourceArgs,
    shadow: Option<usize>,
    parser: Option<ParserType>,
    out: Option<&str>,
) -> Result<()> {
    let location = select_volume(ctx, source)?;

    let (reader, label): (Box<dyn SectorReader>, String) = match shadow {
        None => (location.open()?, location.identifier()),
        Some(index) => {
            let copies = enumerate_shadow_copies(ctx, &location, parser)?;
            let copy = copies.get(index).ok_or_else(|| {
                ForgeError::InvalidArgument(format!(
                    "{} has {} shadow copies, index {} does not exist",
                    location.identifier(),
                    copies.len(),
                    index
                ))
            })?;
            info!("reading {}", copy);
            (copy.open()?, copy.location().identifier())
        }
    };

    let mut volume = NtfsVolume::open(reader, ctx)?;
    info!(
        "{}: serial {:#018x}, {} MFT records of {} bytes",
        label,
        volume.serial_number(),
        volume.record_count(),
        volume.record_size()
    );

    let mut writer = jsonl_output(out)?;
    let mut write_error: Option<io::Error> = None;
    let summary = volume.walk_records(ctx, 0..u64::MAX, |number, record| {
        if write_error.is_some() {
            return;
        }
        if let Ok(record) = record {
            if let Err(err) = writer.write(&MftEntry::from_record(number, &record, &label)) {
                write_error = Some(err);
            }
        }
    })?;
    if let Some(err) = write_error {
        return Err(err.into());
    }
    writer.flush()?;

    info!(
        "{} records exported, {} empty, {} failed",
        summary.parsed, summary.empty, summary.failed
    );
    if summary.failed > 0 {
        warn!("{} corrupt records skipped, see diagnostics above", summary.failed);
    }
    Ok(())
}

use log::info;

use ntfs_artifact_forge::models::ShadowCopyRow;
use ntfs_artifact_forge::shadow::{enumerate_shadow_copies, ParserType};
use ntfs_artifact_forge::{Result, ScanContext};

use super::{jsonl_output, select_volume};
use crate::cli::SourceArgs;

pub fn run(ctx: &ScanContext, source: &SourceArgs, parser: Option<ParserType>, out: Option<&str>) -> Result<()> {
    let location = select_volume(ctx, source)?;
    let copies = enumerate_shadow_copies(ctx, &location, parser)?;
    info!("found {} shadow copies of {}", copies.len(), location.identifier());

    let mut writer = jsonl_output(out)?;
    for copy in &copies {
        info!("{}", copy);
        writer.write(&ShadowCopyRow::from(copy))?;
    }
    writer.flush()?;
    Ok(())
}

mod cli;
mod commands;

use std::process::ExitCode;

use clap::Parser;
use env_logger::Env;
use log::error;

use cli::{Cli, Commands};
use ntfs_artifact_forge::ScanContext;

fn main() -> ExitCode {
    env_logger::Builder::from_env(Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    let ctx = ScanContext::new();

    let result = match &cli.command {
        Commands::Locations {
            images,
            out,
            partitions,
        } => commands::locations::run(&ctx, images, out.as_deref(), partitions.as_deref()),
        Commands::Shadows {
            source,
            shadow_parser,
            out,
        } => commands::shadows::run(&ctx, source, shadow_parser.0, out.as_deref()),
        Commands::Mft {
            source,
            shadow,
            shadow_parser,
            out,
        } => commands::mft::run(&ctx, source, *shadow, shadow_parser.0, out.as_deref()),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            error!("{}", err);
            ExitCode::FAILURE
        }
    }
}

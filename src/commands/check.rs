//! Implementation of the `check` subcommand.

use anyhow::Result;
use clap::Parser;
use tracing::info;
use wdl_slurm::Config;

/// Arguments for the `check` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// Skips checking that the default partition exists.
    #[arg(long)]
    pub skip_partition: bool,
}

/// Runs the `check` subcommand.
///
/// The configuration has already been validated when it was loaded; this
/// additionally asks Slurm about the default partition.
pub async fn check(args: Args, config: Config) -> Result<()> {
    if !args.skip_partition {
        config.slurm.validate_partition().await?;
    }

    info!("configuration is valid");
    Ok(())
}

//! Implementation of the `cancel` subcommand.

use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use tokio::process::Command;
use wdl_slurm::Config;
use wdl_slurm::SUBMIT_LOG_FILE_NAME;
use wdl_slurm::SubmittedJob;

/// Arguments for the `cancel` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The task directory containing the submission log.
    #[arg(long, value_name = "DIR")]
    pub task_dir: PathBuf,
}

/// Runs the `cancel` subcommand.
///
/// Cancels the Slurm job recorded in a task directory's submission log.
pub async fn cancel(args: Args, config: Config) -> Result<()> {
    let job = SubmittedJob::read(&args.task_dir.join(SUBMIT_LOG_FILE_NAME)).await?;
    let cancel = job.cancel_args(&config.slurm.scancel_command()?);

    let status = Command::new(&cancel[0])
        .args(&cancel[1..])
        .status()
        .await
        .with_context(|| format!("failed to run `{program}`", program = cancel[0]))?;

    if !status.success() {
        bail!("failed to cancel Slurm job `{id}`: {status}", id = job.id);
    }

    println!("{id}", id = job.id);
    Ok(())
}

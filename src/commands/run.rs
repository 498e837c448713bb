//! Implementation of the `run` subcommand.

use std::path::PathBuf;

use anyhow::Result;
use anyhow::bail;
use clap::Parser;
use tokio::select;
use tokio_util::sync::CancellationToken;
use tracing::error;
use tracing::info;
use tracing::warn;
use wdl_slurm::Config;
use wdl_slurm::SlurmApptainerBackend;
use wdl_slurm::TaskExecutionBackend;

use super::TaskArgs;

/// Arguments for the `run` subcommand.
#[derive(Parser, Debug)]
pub struct Args {
    /// The task to run.
    #[command(flatten)]
    pub task: TaskArgs,

    /// The directory where the submission log is written.
    #[arg(long, value_name = "DIR")]
    pub task_dir: PathBuf,

    /// The directory where the default wrapper script is written.
    ///
    /// Defaults to the task directory.
    #[arg(long, value_name = "DIR")]
    pub root_dir: Option<PathBuf>,
}

/// Runs the `run` subcommand.
///
/// Returns the exit code of the job.
pub async fn run(args: Args, config: Config) -> Result<i32> {
    let root_dir = args.root_dir.as_ref().unwrap_or(&args.task_dir);
    let backend = SlurmApptainerBackend::new(config, root_dir)?;
    let runtime = args.task.runtime()?;
    let request = backend.process_runtime(&args.task.job_name, &runtime)?;
    let invocation =
        backend.build_invocation(&request, &args.task.container_task(request.gpu_requested)?)?;

    let token = CancellationToken::new();
    let terminating = {
        let token = token.clone();
        move || token.is_cancelled()
    };

    let run = backend.run(&args.task_dir, invocation, terminating);
    tokio::pin!(run);

    loop {
        select! {
            // Always prefer the CTRL-C signal to the job completing.
            biased;

            _ = tokio::signal::ctrl_c() => {
                // Dropping the run cancels the job from the submission log
                if token.is_cancelled() {
                    bail!("job submission was interrupted");
                }

                token.cancel();
                error!("waiting for the Slurm job to cancel: use Ctrl-C to immediately terminate");
            },
            res = &mut run => {
                let outcome = res?;
                if let Some(job) = &outcome.cancelled {
                    info!(job = job.id, "Slurm job was cancelled");
                }

                if outcome.is_out_of_memory() {
                    warn!(job = args.task.job_name, "Slurm job ran out of memory");
                }

                if !outcome.success() && !outcome.stderr.is_empty() {
                    eprint!("{stderr}", stderr = outcome.stderr);
                }

                return Ok(outcome.exit_code);
            },
        }
    }
}

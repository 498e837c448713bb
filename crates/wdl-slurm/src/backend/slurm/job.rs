//! Running `sbatch` invocations and cancelling their jobs.
//!
//! `sbatch --parsable` prints `<job_id>[;<cluster>]` as soon as the job is
//! queued. The runner sends that output to a log file in the task directory
//! and reads it back only when the job must be cancelled; the log is the sole
//! record of which Slurm job belongs to a task.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context as _;
use anyhow::Result;
use anyhow::anyhow;
use tokio::io::AsyncBufReadExt;
use tokio::io::BufReader;
use tokio::process::Child;
use tokio::runtime::Handle;
use tokio::runtime::RuntimeFlavor;
use tokio::process::Command;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::info;
use tracing::trace;
use tracing::warn;

use super::Invocation;

/// The name of the file that receives the output of `sbatch`.
pub const SUBMIT_LOG_FILE_NAME: &str = "slurm_apptainer.log.txt";

/// The exit code reported for jobs killed for exceeding their memory.
pub const OUT_OF_MEMORY_EXIT_CODE: i32 = 253;

/// Represents an error recovering a job from the submission log.
#[derive(Debug, thiserror::Error)]
pub enum RecoveryError {
    /// The log could not be read.
    #[error("failed to read submission log `{path}`", path = .path.display())]
    Read {
        /// The path of the log.
        path: PathBuf,
        /// The underlying I/O error.
        #[source]
        source: std::io::Error,
    },
    /// The log holds no job id.
    #[error("submission log is empty")]
    Empty,
    /// The recorded job id is not numeric.
    #[error("submission log has invalid job id `{0}`")]
    InvalidJobId(String),
}

/// A job accepted by Slurm, as recorded in the submission log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubmittedJob {
    /// The job id; always all digits.
    pub id: String,
    /// The cluster the job was submitted to, in a federated setup.
    pub cluster: Option<String>,
}

impl SubmittedJob {
    /// Parses the first line of `sbatch --parsable` output.
    pub fn parse(output: &str) -> Result<Self, RecoveryError> {
        let line = output.lines().next().unwrap_or_default().trim();
        if line.is_empty() {
            return Err(RecoveryError::Empty);
        }

        let (id, cluster) = match line.split_once(';') {
            Some((id, cluster)) => (id.trim(), Some(cluster.trim())),
            None => (line, None),
        };

        if id.is_empty() || !id.bytes().all(|b| b.is_ascii_digit()) {
            return Err(RecoveryError::InvalidJobId(id.to_string()));
        }

        Ok(Self {
            id: id.to_string(),
            cluster: cluster.filter(|c| !c.is_empty()).map(str::to_string),
        })
    }

    /// Reads the job from a submission log.
    pub async fn read(path: &Path) -> Result<Self, RecoveryError> {
        let contents =
            tokio::fs::read_to_string(path)
                .await
                .map_err(|source| RecoveryError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
        Self::parse(&contents)
    }

    /// Reads the job from a submission log without an async runtime.
    pub fn read_blocking(path: &Path) -> Result<Self, RecoveryError> {
        let contents = std::fs::read_to_string(path).map_err(|source| RecoveryError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    /// Gets the full cancellation command line for this job.
    pub fn cancel_args(&self, scancel: &[String]) -> Vec<String> {
        let mut args = scancel.to_vec();
        if let Some(cluster) = &self.cluster {
            args.push(format!("--clusters={cluster}"));
        }
        args.push(self.id.clone());
        args
    }
}

/// The outcome of a completed invocation.
///
/// A non-zero exit code is a normal outcome and not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobOutcome {
    /// The exit code of the invocation.
    ///
    /// With `sbatch --wait`, this is the exit code of the job itself.
    pub exit_code: i32,
    /// The captured standard error of the invocation.
    pub stderr: String,
    /// The job a cancellation was issued for, if any.
    pub cancelled: Option<SubmittedJob>,
}

impl JobOutcome {
    /// Whether the invocation succeeded.
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    /// Whether the job was killed for exceeding its memory.
    pub fn is_out_of_memory(&self) -> bool {
        self.exit_code == OUT_OF_MEMORY_EXIT_CODE
    }
}

/// Gets the exit code from an exit status.
///
/// Processes killed by a signal report `128 + signal`, as a shell would.
fn exit_code(status: std::process::ExitStatus) -> i32 {
    #[cfg(unix)]
    if let Some(signal) = std::os::unix::process::ExitStatusExt::signal(&status) {
        return 128 + signal;
    }

    status.code().unwrap_or(-1)
}

/// Issues a cancellation for the job recorded in `log`.
///
/// Failures are logged and otherwise ignored.
async fn cancel(log: &Path, scancel: &[String]) -> Option<SubmittedJob> {
    let job = match SubmittedJob::read(log).await {
        Ok(job) => job,
        Err(e) => {
            debug!(log = %log.display(), "not cancelling Slurm job: {e}");
            return None;
        }
    };

    let args = job.cancel_args(scancel);
    info!(job = job.id, "cancelling Slurm job");
    match Command::new(&args[0])
        .args(&args[1..])
        .stdin(Stdio::null())
        .output()
        .await
    {
        Ok(output) if output.status.success() => {}
        Ok(output) => warn!(
            job = job.id,
            stderr = %String::from_utf8_lossy(&output.stderr),
            "failed to cancel Slurm job"
        ),
        Err(e) => warn!(job = job.id, "failed to run `{program}`: {e}", program = args[0]),
    }

    Some(job)
}

/// Issues a cancellation for the job recorded in `log`, blocking the thread.
fn cancel_blocking(log: &Path, scancel: &[String]) {
    let job = match SubmittedJob::read_blocking(log) {
        Ok(job) => job,
        Err(e) => {
            debug!(log = %log.display(), "not cancelling Slurm job: {e}");
            return;
        }
    };

    let args = job.cancel_args(scancel);
    info!(job = job.id, "cancelling Slurm job");
    match std::process::Command::new(&args[0])
        .args(&args[1..])
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .status()
    {
        Ok(status) if status.success() => {}
        Ok(status) => warn!(job = job.id, %status, "failed to cancel Slurm job"),
        Err(e) => warn!(job = job.id, "failed to run `{program}`: {e}", program = args[0]),
    }
}

/// A running invocation.
///
/// Once the child process exits, the termination predicate is checked exactly
/// once; when it holds, the job recorded in the submission log is cancelled.
/// If the handle is dropped before [`JobHandle::wait`] completes, the same
/// check runs on drop.
pub struct JobHandle<F>
where
    F: Fn() -> bool,
{
    /// The child process.
    child: Child,
    /// The task that collects the child's standard error.
    stderr: Option<JoinHandle<String>>,
    /// The path of the submission log.
    log: PathBuf,
    /// The cancellation command, without the job arguments.
    scancel: Vec<String>,
    /// Whether the engine is shutting down.
    terminating: F,
    /// Whether the termination check has run.
    finalized: bool,
}

impl<F> fmt::Debug for JobHandle<F>
where
    F: Fn() -> bool,
{
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobHandle")
            .field("child", &self.child)
            .field("log", &self.log)
            .field("scancel", &self.scancel)
            .field("finalized", &self.finalized)
            .finish_non_exhaustive()
    }
}

impl<F> JobHandle<F>
where
    F: Fn() -> bool,
{
    /// Spawns an invocation.
    ///
    /// The invocation runs with `task_dir` as its working directory. The
    /// submission log is (re)created there, so a retried task never sees the
    /// job id of an earlier attempt.
    pub fn spawn(
        invocation: Invocation,
        task_dir: &Path,
        scancel: Vec<String>,
        terminating: F,
    ) -> Result<Self> {
        if scancel.is_empty() {
            return Err(anyhow!("cancellation command cannot be empty"));
        }

        let mut args = invocation.into_args().into_iter();
        let program = args
            .next()
            .ok_or_else(|| anyhow!("invocation cannot be empty"))?;

        std::fs::create_dir_all(task_dir).with_context(|| {
            format!(
                "failed to create task directory `{path}`",
                path = task_dir.display()
            )
        })?;

        let log = task_dir.join(SUBMIT_LOG_FILE_NAME);
        let stdout = std::fs::File::create(&log).with_context(|| {
            format!(
                "failed to create submission log `{path}`",
                path = log.display()
            )
        })?;

        let mut child = Command::new(&program)
            .args(args)
            .current_dir(task_dir)
            .stdin(Stdio::null())
            .stdout(stdout)
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("failed to spawn `{program}`"))?;

        debug!(pid = child.id(), log = %log.display(), "spawned `{program}`");

        let pipe = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("`{program}` child stderr missing"))?;
        // Drain the pipe until EOF; lines need not be valid UTF-8
        let stderr = tokio::spawn(async move {
            let mut captured = String::new();
            let mut reader = BufReader::new(pipe);
            let mut buf = Vec::new();
            loop {
                buf.clear();
                match reader.read_until(b'\n', &mut buf).await {
                    Ok(0) => break,
                    Ok(_) => {
                        let line = String::from_utf8_lossy(&buf);
                        let line = line.trim_end_matches(['\n', '\r']);
                        trace!(stderr = line, program);
                        captured.push_str(line);
                        captured.push('\n');
                    }
                    Err(e) => {
                        debug!("failed to read stderr of `{program}`: {e}");
                        break;
                    }
                }
            }
            captured
        });

        Ok(Self {
            child,
            stderr: Some(stderr),
            log,
            scancel,
            terminating,
            finalized: false,
        })
    }

    /// Gets the path of the submission log.
    pub fn log_path(&self) -> &Path {
        &self.log
    }

    /// Waits for the invocation to exit.
    pub async fn wait(mut self) -> Result<JobOutcome> {
        let status = self
            .child
            .wait()
            .await
            .context("failed to wait for job submission")?;

        self.finalized = true;
        let cancelled = if (self.terminating)() {
            cancel(&self.log, &self.scancel).await
        } else {
            None
        };

        let stderr = match self.stderr.take() {
            Some(task) => task.await.unwrap_or_else(|e| {
                debug!("failed to collect job submission stderr: {e}");
                String::new()
            }),
            None => String::new(),
        };

        let exit_code = exit_code(status);
        debug!(exit_code, "job submission exited");
        Ok(JobOutcome {
            exit_code,
            stderr,
            cancelled,
        })
    }
}

impl<F> Drop for JobHandle<F>
where
    F: Fn() -> bool,
{
    fn drop(&mut self) {
        if self.finalized {
            return;
        }

        self.finalized = true;
        if !(self.terminating)() {
            return;
        }

        // Keep the blocking cancellation off the async workers when possible
        match Handle::try_current() {
            Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
                tokio::task::block_in_place(|| cancel_blocking(&self.log, &self.scancel))
            }
            _ => cancel_blocking(&self.log, &self.scancel),
        }
    }
}

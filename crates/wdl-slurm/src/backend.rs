//! Implementation of task execution backends.

use std::future::Future;
use std::path::Path;
use std::path::PathBuf;
use std::str::FromStr;

use anyhow::Result;
use anyhow::bail;

use crate::ResourceRequest;
use crate::Runtime;

mod apptainer;
mod slurm;

pub use apptainer::*;
pub use slurm::*;

/// The resource ceiling reported to the engine's local task scheduler.
///
/// Backends that delegate admission control to a cluster scheduler report
/// [`ResourceLimits::unlimited`] so that no task is rejected locally.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResourceLimits {
    /// The number of CPUs.
    pub cpu: u64,
    /// The memory, in bytes.
    pub memory: u64,
    /// The walltime, in minutes.
    pub time: u64,
}

impl ResourceLimits {
    /// Gets limits with every dimension at its representable maximum.
    pub const fn unlimited() -> Self {
        Self {
            cpu: u64::MAX,
            memory: u64::MAX,
            time: u64::MAX,
        }
    }
}

/// A bind mount from the host into the container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    /// The host path.
    pub host: PathBuf,
    /// The guest path.
    pub guest: String,
    /// Whether the mount is read-only.
    pub read_only: bool,
}

impl FromStr for Mount {
    type Err = anyhow::Error;

    /// Parses a mount of the form `host:guest` or `host:guest:ro`.
    fn from_str(s: &str) -> Result<Self> {
        let (rest, read_only) = match s.strip_suffix(":ro") {
            Some(rest) => (rest, true),
            None => (s, false),
        };

        match rest.split_once(':') {
            Some((host, guest)) if !host.is_empty() && guest.starts_with('/') => Ok(Self {
                host: host.into(),
                guest: guest.to_string(),
                read_only,
            }),
            _ => bail!("invalid mount `{s}`: expected `host:guest` or `host:guest:ro`"),
        }
    }
}

/// The containerized part of a task execution.
#[derive(Debug, Clone)]
pub struct ContainerTask {
    /// The container image reference.
    pub image: String,
    /// The host path of the task's command script.
    pub command: PathBuf,
    /// The host path mapped to the container's working directory.
    pub work_dir: PathBuf,
    /// Additional bind mounts, such as localized inputs.
    pub mounts: Vec<Mount>,
    /// Whether GPU support should be enabled in the container.
    pub gpu: bool,
}

/// Builds the command line that runs a task inside a container.
pub trait ContainerInvocation: Send + Sync {
    /// Gets the ready-to-run command line for the task.
    ///
    /// The returned tokens are appended verbatim after the scheduler prefix.
    fn invocation(&self, task: &ContainerTask) -> Result<Vec<String>>;
}

/// Represents a task execution backend.
pub trait TaskExecutionBackend: Send + Sync {
    /// Gets the resource ceiling for local admission of tasks.
    ///
    /// This is fixed when the backend is created.
    fn resource_limits(&self) -> &ResourceLimits;

    /// Processes a task's evaluated runtime values into a resource request.
    ///
    /// This is called exactly once per task.
    fn process_runtime(&self, job_name: &str, runtime: &Runtime) -> Result<ResourceRequest>;

    /// Builds the full invocation for a task.
    ///
    /// This never performs I/O.
    fn build_invocation(&self, request: &ResourceRequest, task: &ContainerTask)
    -> Result<Invocation>;

    /// Runs an invocation to completion.
    ///
    /// `terminating` is checked once, after the child process exits; when it
    /// returns `true`, the scheduler job recorded under `task_dir` is
    /// cancelled.
    fn run<F>(
        &self,
        task_dir: &Path,
        invocation: Invocation,
        terminating: F,
    ) -> impl Future<Output = Result<JobOutcome>> + Send
    where
        F: Fn() -> bool + Send + Sync + 'static;
}

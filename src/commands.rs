//! Implementation of sprocket-slurm CLI commands.

use std::path::Path;
use std::path::PathBuf;

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use wdl_slurm::ContainerTask;
use wdl_slurm::Mount;
use wdl_slurm::Runtime;

use crate::input::parse_runtime;

pub mod cancel;
pub mod check;
pub mod config;
pub mod invocation;
pub mod run;

/// Arguments describing a single task execution.
#[derive(Parser, Debug, Clone)]
pub struct TaskArgs {
    /// The Slurm job name; this is the run id of the task execution.
    #[arg(long, value_name = "NAME")]
    pub job_name: String,

    /// The container image to run the task in.
    #[arg(long)]
    pub image: String,

    /// The host path of the task's command script.
    #[arg(long, value_name = "PATH")]
    pub command: PathBuf,

    /// The host directory mapped to the container's working directory.
    #[arg(long, value_name = "DIR")]
    pub work_dir: PathBuf,

    /// An additional bind mount of the form `host:guest` or `host:guest:ro`.
    #[arg(long = "mount", value_name = "MOUNT")]
    pub mounts: Vec<Mount>,

    /// Runtime values of the form `key=value`, such as `cpu=4` or
    /// `memory="4 GiB"`.
    #[arg(value_name = "KEY=VALUE")]
    pub runtime: Vec<String>,
}

impl TaskArgs {
    /// Parses the runtime values.
    pub fn runtime(&self) -> Result<Runtime> {
        Ok(parse_runtime(&self.runtime)?)
    }

    /// Gets the containerized part of the task.
    ///
    /// Host paths are made absolute, as jobs run from the task directory. A
    /// GPU is enabled in the container when the runtime requests one.
    pub fn container_task(&self, gpu: bool) -> Result<ContainerTask> {
        let mounts: Vec<Mount> = self
            .mounts
            .iter()
            .map(|mount| {
                Ok(Mount {
                    host: absolute(&mount.host)?,
                    ..mount.clone()
                })
            })
            .collect::<Result<_>>()?;

        Ok(ContainerTask {
            image: self.image.clone(),
            command: absolute(&self.command)?,
            work_dir: absolute(&self.work_dir)?,
            mounts,
            gpu,
        })
    }
}

/// Makes a host path absolute without touching the filesystem.
fn absolute(path: &Path) -> Result<PathBuf> {
    std::path::absolute(path)
        .with_context(|| format!("failed to make path `{path}` absolute", path = path.display()))
}

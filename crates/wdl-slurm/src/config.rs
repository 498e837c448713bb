//! Implementation of backend configuration.

use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use anyhow::ensure;
use serde::Deserialize;
use serde::Serialize;
use tokio::process::Command;
use tracing::debug;
use tracing::error;

/// The default program used to submit jobs.
pub const DEFAULT_SBATCH: &str = "sbatch";

/// The default program used to cancel jobs.
pub const DEFAULT_SCANCEL: &str = "scancel";

/// The default Apptainer executable.
pub const DEFAULT_APPTAINER: &str = "apptainer";

/// The name of the image cache directory created when none is configured.
pub const DEFAULT_IMAGE_CACHE_DIR: &str = "apptainer_image_cache";

/// How long to wait on `scontrol` when validating a partition.
const SCONTROL_TIMEOUT: Duration = Duration::from_secs(10);

/// Represents the backend configuration.
///
/// The configuration is read once at startup and is immutable afterwards.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct Config {
    /// Slurm configuration.
    #[serde(default)]
    pub slurm: SlurmConfig,
    /// Apptainer configuration.
    #[serde(default)]
    pub apptainer: ApptainerConfig,
}

impl Config {
    /// Validates the configuration.
    pub fn validate(&self) -> Result<()> {
        self.slurm.validate()?;
        self.apptainer.validate()?;
        Ok(())
    }

    /// Sets the Apptainer image cache to a directory under `cwd` when no cache
    /// is configured.
    ///
    /// Images are converted inside jobs, so the cache must be a directory that
    /// every compute node can see.
    pub fn apply_image_cache_default(&mut self, cwd: &Path) {
        if self.apptainer.image_cache.is_none() {
            let cache = cwd.join(DEFAULT_IMAGE_CACHE_DIR);
            debug!(cache = %cache.display(), "using default Apptainer image cache");
            self.apptainer.image_cache = Some(cache);
        }
    }
}

/// How the container command is handed to `sbatch`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PayloadMode {
    /// A wrapper script receives the container command as its arguments.
    #[default]
    Script,
    /// The container command is passed as a single shell string to `--wrap`.
    Wrap,
}

/// Configuration for job submission to Slurm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct SlurmConfig {
    /// Additional arguments to pass to `sbatch`, split like a shell would.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_args: Option<String>,
    /// The partition to use when a task does not name one.
    ///
    /// If this is also unset, no partition is passed and the cluster's default
    /// partition is used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub default_partition: Option<String>,
    /// How the container command is handed to `sbatch`.
    #[serde(default)]
    pub payload: PayloadMode,
    /// The wrapper script used in [`PayloadMode::Script`].
    ///
    /// When unset, the backend writes a default script into its root
    /// directory.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub exec_script: Option<PathBuf>,
    /// Environment variables starting with this prefix are removed before
    /// `sbatch` runs.
    ///
    /// This is useful when the engine itself runs inside a Slurm job, as the
    /// outer job's `SLURM_*` variables would otherwise leak into the inner
    /// submission.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub scrub_env_prefix: Option<String>,
    /// The program used to submit jobs.
    #[serde(default = "default_sbatch")]
    pub sbatch: String,
    /// The command used to cancel jobs.
    ///
    /// This is split like a shell would, so it may carry leading arguments.
    #[serde(default = "default_scancel")]
    pub scancel: String,
}

/// Gets the default `sbatch` program.
fn default_sbatch() -> String {
    DEFAULT_SBATCH.to_string()
}

/// Gets the default `scancel` command.
fn default_scancel() -> String {
    DEFAULT_SCANCEL.to_string()
}

impl Default for SlurmConfig {
    fn default() -> Self {
        Self {
            extra_args: None,
            default_partition: None,
            payload: PayloadMode::default(),
            exec_script: None,
            scrub_env_prefix: None,
            sbatch: default_sbatch(),
            scancel: default_scancel(),
        }
    }
}

impl SlurmConfig {
    /// Validates the Slurm configuration.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.sbatch.is_empty(),
            "Slurm configuration value `sbatch` cannot be empty"
        );
        self.extra_args()?;
        ensure!(
            !self.scancel_command()?.is_empty(),
            "Slurm configuration value `scancel` cannot be empty"
        );

        if let Some(partition) = &self.default_partition {
            ensure!(
                !partition.is_empty(),
                "Slurm configuration value `default_partition` cannot be empty"
            );
        }

        if let Some(prefix) = &self.scrub_env_prefix {
            ensure!(
                !prefix.is_empty(),
                "Slurm configuration value `scrub_env_prefix` cannot be empty"
            );
        }

        if self.payload == PayloadMode::Script
            && let Some(script) = &self.exec_script
            && !script.is_file()
        {
            bail!(
                "Slurm configuration value `exec_script` refers to `{path}`, which is not a file",
                path = script.display()
            );
        }

        Ok(())
    }

    /// Gets the extra `sbatch` arguments, split like a shell would.
    pub fn extra_args(&self) -> Result<Vec<String>> {
        match &self.extra_args {
            Some(args) => shlex::split(args).ok_or_else(|| {
                anyhow!("Slurm configuration value `extra_args` has invalid value `{args}`")
            }),
            None => Ok(Vec::new()),
        }
    }

    /// Gets the cancellation command, split like a shell would.
    pub fn scancel_command(&self) -> Result<Vec<String>> {
        shlex::split(&self.scancel).ok_or_else(|| {
            anyhow!(
                "Slurm configuration value `scancel` has invalid value `{scancel}`",
                scancel = self.scancel
            )
        })
    }

    /// Validates that the default partition exists according to the local
    /// `scontrol`.
    ///
    /// Does nothing if no default partition is configured.
    pub async fn validate_partition(&self) -> Result<()> {
        let Some(partition) = &self.default_partition else {
            return Ok(());
        };

        let output = tokio::time::timeout(
            SCONTROL_TIMEOUT,
            Command::new("scontrol")
                .arg("show")
                .arg("partition")
                .arg(partition)
                .output(),
        )
        .await
        .map_err(|_| anyhow!("timed out trying to validate Slurm partition `{partition}`"))?
        .context("failed to run `scontrol`")?;

        if !output.status.success() {
            let stdout = String::from_utf8_lossy(&output.stdout);
            let stderr = String::from_utf8_lossy(&output.stderr);
            error!(%stdout, %stderr, %partition, "failed to validate Slurm partition");
            bail!("Slurm partition `{partition}` does not exist");
        }

        Ok(())
    }
}

/// Configuration for the Apptainer container runtime used on compute nodes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", deny_unknown_fields)]
pub struct ApptainerConfig {
    /// The Apptainer (or Singularity) executable.
    #[serde(default = "default_apptainer")]
    pub executable: String,
    /// A shared directory for converted images.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_cache: Option<PathBuf>,
    /// Additional arguments to pass to `apptainer exec`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub extra_exec_args: Option<Vec<String>>,
}

/// Gets the default Apptainer executable.
fn default_apptainer() -> String {
    DEFAULT_APPTAINER.to_string()
}

impl Default for ApptainerConfig {
    fn default() -> Self {
        Self {
            executable: default_apptainer(),
            image_cache: None,
            extra_exec_args: None,
        }
    }
}

impl ApptainerConfig {
    /// Validates the Apptainer configuration.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.executable.is_empty(),
            "Apptainer configuration value `executable` cannot be empty"
        );
        Ok(())
    }
}

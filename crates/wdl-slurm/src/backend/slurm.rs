//! Slurm + Apptainer (aka Singularity) task execution backend.
//!
//! This backend submits each task as a Slurm job which invokes Apptainer to
//! provide the appropriate container environment for the task's command.
//!
//! Submission uses `sbatch --wait --parsable`: `sbatch` stays in the
//! foreground until the job terminates and exits with the job's exit code, so
//! from the engine's perspective a task behaves exactly like a local process.
//! Using `sbatch` (rather than `srun`) also guarantees that resources are
//! requested even when the engine itself runs inside a Slurm allocation.

use std::fmt;
use std::fs;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use anyhow::Result;
use anyhow::anyhow;
use anyhow::bail;
use tracing::debug;
use tracing::info;

use super::ApptainerInvocation;
use super::ContainerInvocation;
use super::ContainerTask;
use super::ResourceLimits;
use super::TaskExecutionBackend;
use crate::Config;
use crate::ResourceRequest;
use crate::Runtime;
use crate::config::PayloadMode;
use crate::config::SlurmConfig;

mod job;

pub use job::*;

/// The name of the backend.
pub const BACKEND_NAME: &str = "slurm_apptainer";

/// The file name, relative to the task directory, of the job's standard output.
pub const SLURM_STDOUT_FILE_NAME: &str = "slurm.stdout";

/// The file name, relative to the task directory, of the job's standard error.
pub const SLURM_STDERR_FILE_NAME: &str = "slurm.stderr";

/// The file name of the wrapper script written when none is configured.
pub const EXEC_SCRIPT_FILE_NAME: &str = "exec_script.sh";

/// The contents of the default wrapper script.
///
/// The script runs its arguments as the job's program.
const EXEC_SCRIPT: &str = "#!/usr/bin/env bash\nexec \"$@\"\n";

/// The maximum length of a Slurm job name.
// This was found experimentally on one cluster; the limit does not appear to be
// documented.
const SLURM_JOB_NAME_MAX_LENGTH: usize = 1024;

/// One mebibyte, the unit of the `--mem` flag.
const MEBIBYTE: u64 = 1024 * 1024;

/// A full command line, ready to execute.
///
/// The first token is the program; the remaining tokens are its arguments.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation(Vec<String>);

impl Invocation {
    /// Creates an invocation from its tokens.
    pub fn new(args: Vec<String>) -> Self {
        Self(args)
    }

    /// Gets the tokens of the invocation.
    pub fn args(&self) -> &[String] {
        &self.0
    }

    /// Consumes the invocation, returning its tokens.
    pub fn into_args(self) -> Vec<String> {
        self.0
    }
}

impl fmt::Display for Invocation {
    /// Formats the invocation as a shell-quoted command line.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, arg) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str(" ")?;
            }

            match shlex::try_quote(arg) {
                Ok(quoted) => f.write_str(&quoted)?,
                Err(_) => write!(f, "{arg:?}")?,
            }
        }

        Ok(())
    }
}

/// Converts a byte count to whole mebibytes, rounding to the nearest unit.
fn mebibytes(bytes: u64) -> u64 {
    bytes / MEBIBYTE + u64::from(bytes % MEBIBYTE >= MEBIBYTE / 2)
}

/// Builds the `sbatch` invocation for a task.
///
/// `container` is the ready-to-run container command line; in
/// [`PayloadMode::Script`] it is appended verbatim after `exec_script`, and in
/// [`PayloadMode::Wrap`] it is shell-quoted into a single `--wrap` argument.
///
/// `scrubbed_env` names the environment variables to unset before `sbatch`
/// runs; they are removed with an `env -u <name>` prefix.
///
/// This function performs no I/O; building twice from the same inputs yields
/// identical invocations.
pub fn build_sbatch_invocation(
    request: &ResourceRequest,
    config: &SlurmConfig,
    exec_script: Option<&Path>,
    scrubbed_env: &[String],
    container: Vec<String>,
) -> Result<Invocation> {
    let mut args = Vec::new();

    if !scrubbed_env.is_empty() {
        args.push("env".to_string());
        for name in scrubbed_env {
            args.push("-u".to_string());
            args.push(name.clone());
        }
    }

    args.extend([
        config.sbatch.clone(),
        // Keep `sbatch` running until the job terminates
        "--wait".to_string(),
        // Print only `<job_id>[;<cluster>]` so the job can be cancelled later
        "--parsable".to_string(),
        "--job-name".to_string(),
        request.job_name.clone(),
        // A single task keeps `--cpus-per-task` from being multiplied
        "--ntasks".to_string(),
        "1".to_string(),
        // Relative to the submission directory, which is the task directory
        "-o".to_string(),
        SLURM_STDOUT_FILE_NAME.to_string(),
        "-e".to_string(),
        SLURM_STDERR_FILE_NAME.to_string(),
    ]);

    if request.gpu_requested {
        args.push("--gres".to_string());
        args.push(format!("gpu:{gpus}", gpus = request.gpus()));
    }

    if let Some(account) = request.submission_account() {
        args.push("--account".to_string());
        args.push(account.to_string());
    }

    if let Some(partition) = request.submission_partition(config.default_partition.as_deref()) {
        args.push("--partition".to_string());
        args.push(partition.to_string());
    }

    if let Some(cpu) = request.cpu_count {
        args.push("--cpus-per-task".to_string());
        args.push(cpu.to_string());
    }

    if let Some(memory) = request.memory_bytes {
        args.push("--mem".to_string());
        args.push(format!("{mem}M", mem = mebibytes(memory)));
    }

    if let Some(minutes) = request.time_minutes {
        args.push("--time".to_string());
        args.push(minutes.to_string());
    }

    if let Some(constraint) = &request.constraint {
        args.push("--constraint".to_string());
        args.push(constraint.clone());
    }

    args.extend(config.extra_args()?);

    match config.payload {
        PayloadMode::Script => {
            let script = exec_script
                .ok_or_else(|| anyhow!("no wrapper script is available for `sbatch`"))?;
            args.push(script.display().to_string());
            args.extend(container);
        }
        PayloadMode::Wrap => {
            let command = shlex::try_join(container.iter().map(String::as_str))
                .context("failed to quote the container command for `--wrap`")?;
            args.push("--wrap".to_string());
            args.push(command);
        }
    }

    Ok(Invocation::new(args))
}

/// The Slurm + Apptainer backend.
///
/// See the module-level documentation for details.
pub struct SlurmApptainerBackend {
    /// The configuration of the backend.
    config: Arc<Config>,
    /// The resource ceiling reported for local admission.
    limits: ResourceLimits,
    /// The builder of container command lines.
    container: Arc<dyn ContainerInvocation>,
    /// The wrapper script passed to `sbatch` in [`PayloadMode::Script`].
    exec_script: Option<PathBuf>,
    /// The names of environment variables removed before `sbatch` runs.
    scrubbed_env: Vec<String>,
}

impl fmt::Debug for SlurmApptainerBackend {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SlurmApptainerBackend")
            .field("config", &self.config)
            .field("limits", &self.limits)
            .field("exec_script", &self.exec_script)
            .field("scrubbed_env", &self.scrubbed_env)
            .finish_non_exhaustive()
    }
}

impl SlurmApptainerBackend {
    /// Creates a new backend.
    ///
    /// The configuration is validated and the image cache defaults to a
    /// directory under the current working directory. When no wrapper script
    /// is configured, one is written into `root_dir`.
    pub fn new(mut config: Config, root_dir: &Path) -> Result<Self> {
        config.validate()?;

        let cwd = std::env::current_dir().context("failed to determine the working directory")?;
        config.apply_image_cache_default(&cwd);

        let exec_script = match (config.slurm.payload, &config.slurm.exec_script) {
            (PayloadMode::Wrap, _) => None,
            (PayloadMode::Script, Some(script)) => Some(std::path::absolute(script).with_context(
                || {
                    format!(
                        "failed to make wrapper script path `{path}` absolute",
                        path = script.display()
                    )
                },
            )?),
            (PayloadMode::Script, None) => Some(write_exec_script(root_dir)?),
        };

        let scrubbed_env = match &config.slurm.scrub_env_prefix {
            Some(prefix) => {
                let mut names: Vec<_> = std::env::vars_os()
                    .filter_map(|(name, _)| name.into_string().ok())
                    .filter(|name| name.starts_with(prefix.as_str()))
                    .collect();
                names.sort();
                names
            }
            None => Vec::new(),
        };

        debug!(?exec_script, ?scrubbed_env, "initialized {BACKEND_NAME} backend");

        Ok(Self {
            container: Arc::new(ApptainerInvocation::new(config.apptainer.clone())),
            config: Arc::new(config),
            limits: ResourceLimits::unlimited(),
            exec_script,
            scrubbed_env,
        })
    }

    /// Replaces the builder of container command lines.
    pub fn with_container_invocation(mut self, container: Arc<dyn ContainerInvocation>) -> Self {
        self.container = container;
        self
    }

    /// Gets the configuration of the backend.
    pub fn config(&self) -> &Config {
        &self.config
    }
}

/// Writes the default wrapper script into `root_dir`.
///
/// The returned path is absolute, as jobs run from the task directory.
fn write_exec_script(root_dir: &Path) -> Result<PathBuf> {
    let root_dir = &std::path::absolute(root_dir).with_context(|| {
        format!(
            "failed to make directory path `{path}` absolute",
            path = root_dir.display()
        )
    })?;
    fs::create_dir_all(root_dir).with_context(|| {
        format!(
            "failed to create directory `{path}`",
            path = root_dir.display()
        )
    })?;

    let path = root_dir.join(EXEC_SCRIPT_FILE_NAME);
    fs::write(&path, EXEC_SCRIPT).with_context(|| {
        format!(
            "failed to write wrapper script `{path}`",
            path = path.display()
        )
    })?;

    #[cfg(unix)]
    fs::set_permissions(
        &path,
        <fs::Permissions as std::os::unix::fs::PermissionsExt>::from_mode(0o755),
    )
    .with_context(|| {
        format!(
            "failed to set permissions of `{path}`",
            path = path.display()
        )
    })?;

    Ok(path)
}

impl TaskExecutionBackend for SlurmApptainerBackend {
    fn resource_limits(&self) -> &ResourceLimits {
        &self.limits
    }

    fn process_runtime(&self, job_name: &str, runtime: &Runtime) -> Result<ResourceRequest> {
        if job_name.is_empty() {
            bail!("task job name cannot be empty");
        }

        let job_name: String = job_name.chars().take(SLURM_JOB_NAME_MAX_LENGTH).collect();
        Ok(ResourceRequest::from_runtime(job_name, runtime)?)
    }

    fn build_invocation(
        &self,
        request: &ResourceRequest,
        task: &ContainerTask,
    ) -> Result<Invocation> {
        let container = self.container.invocation(task)?;
        let invocation = build_sbatch_invocation(
            request,
            &self.config.slurm,
            self.exec_script.as_deref(),
            &self.scrubbed_env,
            container,
        )?;
        info!("Slurm invocation: {invocation}");
        Ok(invocation)
    }

    async fn run<F>(
        &self,
        task_dir: &Path,
        invocation: Invocation,
        terminating: F,
    ) -> Result<JobOutcome>
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        let scancel = self.config.slurm.scancel_command()?;
        JobHandle::spawn(invocation, task_dir, scancel, terminating)?
            .wait()
            .await
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::RUNTIME_GPU;
    use crate::RUNTIME_SLURM_PARTITION;
    use crate::RuntimeValue;

    /// The stand-in container command used by the builder tests.
    fn container() -> Vec<String> {
        vec![
            "apptainer".to_string(),
            "exec".to_string(),
            "docker://ubuntu:24.04".to_string(),
            "bash".to_string(),
            "/mnt/task/command".to_string(),
        ]
    }

    fn build(request: &ResourceRequest, config: &SlurmConfig) -> Vec<String> {
        build_sbatch_invocation(
            request,
            config,
            Some(Path::new("/opt/exec_script.sh")),
            &[],
            container(),
        )
        .expect("invocation should build")
        .into_args()
    }

    /// Gets the value following `flag`, if present.
    fn flag<'a>(args: &'a [String], flag: &str) -> Option<&'a str> {
        args.iter()
            .position(|a| a == flag)
            .map(|i| args[i + 1].as_str())
    }

    #[test]
    fn cpu_memory_time_task() {
        let request = ResourceRequest {
            cpu_count: Some(4),
            memory_bytes: Some(4294967296),
            time_minutes: Some(60),
            ..ResourceRequest::new("task1")
        };
        let args = build(&request, &SlurmConfig::default());
        assert_eq!(
            args,
            [
                "sbatch",
                "--wait",
                "--parsable",
                "--job-name",
                "task1",
                "--ntasks",
                "1",
                "-o",
                "slurm.stdout",
                "-e",
                "slurm.stderr",
                "--cpus-per-task",
                "4",
                "--mem",
                "4096M",
                "--time",
                "60",
                "/opt/exec_script.sh",
                "apptainer",
                "exec",
                "docker://ubuntu:24.04",
                "bash",
                "/mnt/task/command",
            ]
        );
        assert_eq!(flag(&args, "--gres"), None);
        assert_eq!(flag(&args, "--partition"), None);
    }

    #[test]
    fn gpu_account_and_partition_take_precedence() {
        let mut request = ResourceRequest {
            gpu_requested: true,
            account: Some("lab".into()),
            account_gpu: Some("lab-gpu".into()),
            partition: Some("all".into()),
            partition_gpu: Some("gpu".into()),
            ..ResourceRequest::new("task")
        };
        let config = SlurmConfig::default();

        let args = build(&request, &config);
        assert_eq!(flag(&args, "--gres"), Some("gpu:1"));
        assert_eq!(flag(&args, "--account"), Some("lab-gpu"));
        assert_eq!(flag(&args, "--partition"), Some("gpu"));

        request.gpu_requested = false;
        let args = build(&request, &config);
        assert_eq!(flag(&args, "--gres"), None);
        assert_eq!(flag(&args, "--account"), Some("lab"));
        assert_eq!(flag(&args, "--partition"), Some("all"));
    }

    #[test]
    fn gpu_count_normalization() {
        let mut runtime = Runtime::new();
        runtime.insert(RUNTIME_GPU.to_string(), RuntimeValue::Boolean(true));
        runtime.insert(crate::RUNTIME_GPU_COUNT.to_string(), RuntimeValue::Integer(0));
        let request = ResourceRequest::from_runtime("task", &runtime).unwrap();
        let args = build(&request, &SlurmConfig::default());
        assert_eq!(flag(&args, "--gres"), Some("gpu:1"));

        runtime.insert(crate::RUNTIME_GPU_COUNT.to_string(), RuntimeValue::Integer(2));
        let request = ResourceRequest::from_runtime("task", &runtime).unwrap();
        let args = build(&request, &SlurmConfig::default());
        assert_eq!(flag(&args, "--gres"), Some("gpu:2"));
    }

    #[test]
    fn memory_rounds_to_nearest_mebibyte() {
        assert_eq!(mebibytes(1572864000), 1500);
        assert_eq!(mebibytes(0), 0);
        assert_eq!(mebibytes(MEBIBYTE / 2 - 1), 0);
        assert_eq!(mebibytes(MEBIBYTE / 2), 1);
        assert_eq!(mebibytes(3 * MEBIBYTE + MEBIBYTE / 2 + 1), 4);
        assert_eq!(mebibytes(u64::MAX), 17592186044416);

        let request = ResourceRequest {
            memory_bytes: Some(1572864000),
            ..ResourceRequest::new("task")
        };
        let args = build(&request, &SlurmConfig::default());
        assert_eq!(flag(&args, "--mem"), Some("1500M"));
    }

    #[test]
    fn default_partition_fallback() {
        let config = SlurmConfig {
            default_partition: Some("main".into()),
            ..Default::default()
        };
        let request = ResourceRequest::new("task");
        assert_eq!(flag(&build(&request, &config), "--partition"), Some("main"));

        let mut runtime = Runtime::new();
        runtime.insert(
            RUNTIME_SLURM_PARTITION.to_string(),
            RuntimeValue::String("short".into()),
        );
        let request = ResourceRequest::from_runtime("task", &runtime).unwrap();
        assert_eq!(flag(&build(&request, &config), "--partition"), Some("short"));
    }

    #[test]
    fn extra_args_respect_quoting() {
        let config = SlurmConfig {
            extra_args: Some("--foo \"a b\"".into()),
            ..Default::default()
        };
        let request = ResourceRequest {
            constraint: Some("skylake".into()),
            ..ResourceRequest::new("task")
        };
        let args = build(&request, &config);
        let script = args
            .iter()
            .position(|a| a == "/opt/exec_script.sh")
            .unwrap();
        assert_eq!(
            &args[script - 4..script],
            ["--constraint", "skylake", "--foo", "a b"]
        );
    }

    #[test]
    fn build_is_idempotent() {
        let request = ResourceRequest {
            cpu_count: Some(2),
            gpu_requested: true,
            gpu_count: Some(3),
            account: Some("lab".into()),
            constraint: Some("a100".into()),
            ..ResourceRequest::new("task")
        };
        let config = SlurmConfig {
            extra_args: Some("--qos=high".into()),
            ..Default::default()
        };
        assert_eq!(build(&request, &config), build(&request, &config));
    }

    #[test]
    fn wrap_payload() {
        let config = SlurmConfig {
            payload: PayloadMode::Wrap,
            ..Default::default()
        };
        let args = build_sbatch_invocation(
            &ResourceRequest::new("task"),
            &config,
            None,
            &[],
            vec!["apptainer".into(), "exec".into(), "my image".into()],
        )
        .unwrap()
        .into_args();
        assert_eq!(
            &args[args.len() - 2..],
            ["--wrap", "apptainer exec 'my image'"]
        );
    }

    #[test]
    fn script_payload_requires_script() {
        let err = build_sbatch_invocation(
            &ResourceRequest::new("task"),
            &SlurmConfig::default(),
            None,
            &[],
            container(),
        )
        .unwrap_err();
        assert_eq!(err.to_string(), "no wrapper script is available for `sbatch`");
    }

    #[test]
    fn scrubbed_environment() {
        let args = build_sbatch_invocation(
            &ResourceRequest::new("task"),
            &SlurmConfig::default(),
            Some(Path::new("/opt/exec_script.sh")),
            &["SLURM_JOB_ID".to_string(), "SLURM_NTASKS".to_string()],
            container(),
        )
        .unwrap()
        .into_args();
        assert_eq!(
            &args[..6],
            ["env", "-u", "SLURM_JOB_ID", "-u", "SLURM_NTASKS", "sbatch"]
        );
    }

    #[test]
    fn invocation_display_quotes() {
        let invocation = Invocation::new(vec![
            "sbatch".into(),
            "--comment".into(),
            "two words".into(),
        ]);
        assert_eq!(invocation.to_string(), "sbatch --comment 'two words'");
    }

    #[test]
    fn backend_writes_exec_script() {
        let root = tempfile::tempdir().unwrap();
        let backend = SlurmApptainerBackend::new(Config::default(), root.path()).unwrap();
        let script = root.path().join(EXEC_SCRIPT_FILE_NAME);
        assert_eq!(fs::read_to_string(&script).unwrap(), EXEC_SCRIPT);
        assert_eq!(backend.resource_limits(), &ResourceLimits::unlimited());
        assert!(backend.config().apptainer.image_cache.is_some());

        let request = backend
            .process_runtime("hello-0", &Runtime::new())
            .unwrap();
        let task = ContainerTask {
            image: "ubuntu".into(),
            command: root.path().join("command"),
            work_dir: root.path().join("work"),
            mounts: Vec::new(),
            gpu: false,
        };
        let args = backend.build_invocation(&request, &task).unwrap().into_args();
        assert_eq!(flag(&args, "--job-name"), Some("hello-0"));
        assert!(args.contains(&script.display().to_string()));
        assert!(args.contains(&"docker://ubuntu".to_string()));
    }

    #[test]
    fn long_job_names_are_truncated() {
        let root = tempfile::tempdir().unwrap();
        let backend = SlurmApptainerBackend::new(Config::default(), root.path()).unwrap();
        let name = "x".repeat(SLURM_JOB_NAME_MAX_LENGTH + 10);
        let request = backend.process_runtime(&name, &Runtime::new()).unwrap();
        assert_eq!(request.job_name.len(), SLURM_JOB_NAME_MAX_LENGTH);
        assert!(backend.process_runtime("", &Runtime::new()).is_err());
    }

    /// A container builder that runs a fixed command.
    struct FixedContainer;

    impl ContainerInvocation for FixedContainer {
        fn invocation(&self, _: &ContainerTask) -> Result<Vec<String>> {
            Ok(vec!["true".to_string()])
        }
    }

    fn task(root: &Path) -> ContainerTask {
        ContainerTask {
            image: "ubuntu".into(),
            command: root.join("command"),
            work_dir: root.join("work"),
            mounts: Vec::new(),
            gpu: false,
        }
    }

    #[test]
    fn scrubbed_environment_snapshot() {
        // SAFETY: the variable name is unique to this test
        unsafe { std::env::set_var("WDL_SLURM_SCRUB_TEST_VAR", "1") };

        let root = tempfile::tempdir().unwrap();
        let mut config = Config::default();
        config.slurm.scrub_env_prefix = Some("WDL_SLURM_SCRUB_TEST_".into());
        let backend = SlurmApptainerBackend::new(config, root.path())
            .unwrap()
            .with_container_invocation(Arc::new(FixedContainer));

        let request = backend.process_runtime("task", &Runtime::new()).unwrap();
        let invocation = backend
            .build_invocation(&request, &task(root.path()))
            .unwrap();
        assert_eq!(
            &invocation.args()[..4],
            ["env", "-u", "WDL_SLURM_SCRUB_TEST_VAR", "sbatch"]
        );
        assert_eq!(invocation.args().last().map(String::as_str), Some("true"));

        let backend = SlurmApptainerBackend::new(Config::default(), root.path()).unwrap();
        let invocation = backend
            .build_invocation(&request, &task(root.path()))
            .unwrap();
        assert_eq!(invocation.args()[0], "sbatch");
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn run_through_backend() {
        let root = tempfile::tempdir().unwrap();
        let sbatch = root.path().join("sbatch");
        let arguments = root.path().join("sbatch-args.txt");
        let record = root.path().join("scancel.txt");

        // Write the stand-in from a separate process so no descriptor for it
        // is ever open in this one while it is executed
        let script = format!(
            "#!/bin/sh\necho \"$*\" > '{arguments}'\necho '12345;mycluster'\nexit 3\n",
            arguments = arguments.display()
        );
        let status = std::process::Command::new("sh")
            .arg("-c")
            .arg("printf '%s' \"$1\" > \"$2\" && chmod +x \"$2\"")
            .arg("sh")
            .arg(&script)
            .arg(&sbatch)
            .status()
            .unwrap();
        assert!(status.success());

        let recorder = format!("printf '%s\\n' \"$*\" >> '{}'", record.display());
        let scancel = ["sh", "-c", recorder.as_str(), "scancel"];

        let mut config = Config::default();
        config.slurm.sbatch = sbatch.display().to_string();
        config.slurm.scancel = shlex::try_join(scancel).unwrap();
        let backend = SlurmApptainerBackend::new(config, root.path())
            .unwrap()
            .with_container_invocation(Arc::new(FixedContainer));

        let request = backend.process_runtime("hello-0", &Runtime::new()).unwrap();
        let invocation = backend
            .build_invocation(&request, &task(root.path()))
            .unwrap();

        let task_dir = root.path().join("attempt-0");
        let outcome = backend
            .run(&task_dir, invocation.clone(), || false)
            .await
            .unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(outcome.cancelled, None);
        assert!(!record.exists());
        assert!(
            fs::read_to_string(&arguments)
                .unwrap()
                .starts_with("--wait --parsable --job-name hello-0 --ntasks 1")
        );

        let outcome = backend.run(&task_dir, invocation, || true).await.unwrap();
        assert_eq!(outcome.exit_code, 3);
        assert_eq!(
            outcome.cancelled.map(|job| job.id).as_deref(),
            Some("12345")
        );
        assert_eq!(
            fs::read_to_string(&record).unwrap(),
            "--clusters=mycluster 12345\n"
        );
    }
}

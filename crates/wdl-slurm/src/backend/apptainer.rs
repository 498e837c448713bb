//! Support for using Apptainer (a.k.a. Singularity) as the container runtime
//! on compute nodes.
//!
//! Image pulling happens inside the job: Apptainer converts `docker://`
//! images on first use and reuses the conversion from the configured shared
//! cache afterwards.

use anyhow::Result;

use super::ContainerInvocation;
use super::ContainerTask;
use crate::config::ApptainerConfig;

/// The guest working directory.
const GUEST_WORK_DIR: &str = "/mnt/task/work";

/// The guest path for the command file.
const GUEST_COMMAND_PATH: &str = "/mnt/task/command";

/// The environment variable Apptainer reads its cache directory from.
const CACHE_DIR_ENV: &str = "APPTAINER_CACHEDIR";

/// Builds `apptainer exec` command lines.
#[derive(Debug, Clone)]
pub struct ApptainerInvocation {
    /// The Apptainer configuration.
    config: ApptainerConfig,
}

impl ApptainerInvocation {
    /// Creates a new [`ApptainerInvocation`].
    pub fn new(config: ApptainerConfig) -> Self {
        Self { config }
    }
}

/// Gets the Apptainer image URI for a container reference.
///
/// References with an explicit scheme and local `.sif` files are used as-is;
/// anything else is treated as a Docker image.
fn image_uri(image: &str) -> String {
    if image.contains("://") || image.ends_with(".sif") {
        image.to_string()
    } else {
        format!("docker://{image}")
    }
}

impl ContainerInvocation for ApptainerInvocation {
    fn invocation(&self, task: &ContainerTask) -> Result<Vec<String>> {
        let mut args = Vec::new();

        if let Some(cache) = &self.config.image_cache {
            args.push("env".to_string());
            args.push(format!("{CACHE_DIR_ENV}={cache}", cache = cache.display()));
        }

        args.extend([
            self.config.executable.clone(),
            "exec".to_string(),
            "--containall".to_string(),
            "--cleanenv".to_string(),
            "--pwd".to_string(),
            GUEST_WORK_DIR.to_string(),
            "--bind".to_string(),
            format!("{}:{GUEST_WORK_DIR}", task.work_dir.display()),
            "--bind".to_string(),
            format!("{}:{GUEST_COMMAND_PATH}:ro", task.command.display()),
        ]);

        for mount in &task.mounts {
            args.push("--bind".to_string());
            args.push(format!(
                "{host}:{guest}{ro}",
                host = mount.host.display(),
                guest = mount.guest,
                ro = if mount.read_only { ":ro" } else { "" }
            ));
        }

        if task.gpu {
            args.push("--nv".to_string());
        }

        if let Some(extra) = &self.config.extra_exec_args {
            args.extend(extra.iter().cloned());
        }

        args.push(image_uri(&task.image));
        args.push("bash".to_string());
        args.push(GUEST_COMMAND_PATH.to_string());
        Ok(args)
    }
}

#[cfg(test)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;
    use crate::Mount;

    fn task() -> ContainerTask {
        ContainerTask {
            image: "ubuntu:24.04".to_string(),
            command: "/runs/hello/command".into(),
            work_dir: "/runs/hello/work".into(),
            mounts: vec![Mount {
                host: "/data/in.txt".into(),
                guest: "/mnt/task/inputs/in.txt".into(),
                read_only: true,
            }],
            gpu: false,
        }
    }

    #[test]
    fn example_task_invocation() {
        let args = ApptainerInvocation::new(ApptainerConfig::default())
            .invocation(&task())
            .unwrap();
        assert_eq!(
            args,
            [
                "apptainer",
                "exec",
                "--containall",
                "--cleanenv",
                "--pwd",
                "/mnt/task/work",
                "--bind",
                "/runs/hello/work:/mnt/task/work",
                "--bind",
                "/runs/hello/command:/mnt/task/command:ro",
                "--bind",
                "/data/in.txt:/mnt/task/inputs/in.txt:ro",
                "docker://ubuntu:24.04",
                "bash",
                "/mnt/task/command",
            ]
        );
    }

    #[test]
    fn cache_gpu_and_extra_args() {
        let config = ApptainerConfig {
            image_cache: Some("/shared/cache".into()),
            extra_exec_args: Some(vec!["--writable-tmpfs".to_string()]),
            ..Default::default()
        };
        let mut task = task();
        task.gpu = true;
        task.image = "/images/tool.sif".to_string();
        let args = ApptainerInvocation::new(config).invocation(&task).unwrap();

        assert_eq!(&args[..3], ["env", "APPTAINER_CACHEDIR=/shared/cache", "apptainer"]);
        let nv = args.iter().position(|a| a == "--nv").expect("should request GPUs");
        assert_eq!(args[nv + 1], "--writable-tmpfs");
        assert_eq!(args[nv + 2], "/images/tool.sif");
    }

    #[test]
    fn image_uris() {
        assert_eq!(image_uri("ubuntu"), "docker://ubuntu");
        assert_eq!(image_uri("library://alpine:3"), "library://alpine:3");
        assert_eq!(image_uri("/images/tool.sif"), "/images/tool.sif");
    }
}

//! Extraction of task runtime values into a resource request.
//!
//! The generic container keys (`cpu`, `memory`, `gpu`) are processed first by
//! [`process_container_runtime`]; the Slurm-specific keys are then layered on
//! top by [`process_slurm_runtime`]. Any key not recognized by either step is
//! ignored.

use std::collections::HashMap;
use std::fmt;

use thiserror::Error;

use crate::convert_unit_string;

/// The runtime key for the number of CPUs.
pub const RUNTIME_CPU: &str = "cpu";

/// The runtime key for the memory reservation.
pub const RUNTIME_MEMORY: &str = "memory";

/// The runtime key for whether a GPU is required.
pub const RUNTIME_GPU: &str = "gpu";

/// The runtime key for the walltime in minutes.
pub const RUNTIME_TIME_MINUTES: &str = "time_minutes";

/// The runtime key for the number of GPUs.
pub const RUNTIME_GPU_COUNT: &str = "gpuCount";

/// The runtime key for the Slurm account.
pub const RUNTIME_SLURM_ACCOUNT: &str = "slurm_account";

/// The runtime key for the Slurm account used by GPU tasks.
pub const RUNTIME_SLURM_ACCOUNT_GPU: &str = "slurm_account_gpu";

/// The runtime key for the Slurm partition.
pub const RUNTIME_SLURM_PARTITION: &str = "slurm_partition";

/// The runtime key for the Slurm partition used by GPU tasks.
pub const RUNTIME_SLURM_PARTITION_GPU: &str = "slurm_partition_gpu";

/// The runtime key for the Slurm node constraint.
pub const RUNTIME_SLURM_CONSTRAINT: &str = "slurm_constraint";

/// An evaluated runtime value of a task.
#[derive(Debug, Clone, PartialEq)]
pub enum RuntimeValue {
    /// A boolean value.
    Boolean(bool),
    /// An integer value.
    Integer(i64),
    /// A floating point value.
    Float(f64),
    /// A string value.
    String(String),
}

impl RuntimeValue {
    /// Gets the name of the value's type.
    pub fn type_name(&self) -> &'static str {
        match self {
            Self::Boolean(_) => "Boolean",
            Self::Integer(_) => "Int",
            Self::Float(_) => "Float",
            Self::String(_) => "String",
        }
    }

    /// Gets the value as a boolean, if it is one.
    pub fn as_boolean(&self) -> Option<bool> {
        match self {
            Self::Boolean(b) => Some(*b),
            _ => None,
        }
    }

    /// Gets the value as an integer, if it is one.
    pub fn as_integer(&self) -> Option<i64> {
        match self {
            Self::Integer(i) => Some(*i),
            _ => None,
        }
    }

    /// Gets the value as a float; integers coerce to floats.
    pub fn as_float(&self) -> Option<f64> {
        match self {
            Self::Integer(i) => Some(*i as f64),
            Self::Float(f) => Some(*f),
            _ => None,
        }
    }

    /// Gets the value as a string, if it is one.
    pub fn as_string(&self) -> Option<&str> {
        match self {
            Self::String(s) => Some(s),
            _ => None,
        }
    }
}

impl fmt::Display for RuntimeValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Boolean(b) => write!(f, "{b}"),
            Self::Integer(i) => write!(f, "{i}"),
            Self::Float(v) => write!(f, "{v}"),
            Self::String(s) => write!(f, "{s:?}"),
        }
    }
}

impl From<bool> for RuntimeValue {
    fn from(value: bool) -> Self {
        Self::Boolean(value)
    }
}

impl From<i64> for RuntimeValue {
    fn from(value: i64) -> Self {
        Self::Integer(value)
    }
}

impl From<f64> for RuntimeValue {
    fn from(value: f64) -> Self {
        Self::Float(value)
    }
}

impl From<&str> for RuntimeValue {
    fn from(value: &str) -> Self {
        Self::String(value.to_string())
    }
}

impl From<String> for RuntimeValue {
    fn from(value: String) -> Self {
        Self::String(value)
    }
}

/// An error from coercing a runtime value.
#[derive(Debug, Error, PartialEq)]
pub enum RuntimeError {
    /// The value has a type that cannot be coerced to the expected type.
    #[error("runtime value `{key}` has type `{actual}` but `{expected}` was expected")]
    UnexpectedType {
        /// The runtime key.
        key: String,
        /// The expected type.
        expected: &'static str,
        /// The actual type.
        actual: &'static str,
    },
    /// The value is out of the allowed range.
    #[error("runtime value `{key}` has invalid value `{value}`")]
    InvalidValue {
        /// The runtime key.
        key: String,
        /// The offending value.
        value: String,
    },
}

/// A map of evaluated runtime values, keyed by name.
pub type Runtime = HashMap<String, RuntimeValue>;

/// Coerces the given runtime key with `f`, failing when the type doesn't fit.
fn coerce<'a, T>(
    runtime: &'a Runtime,
    key: &str,
    expected: &'static str,
    f: impl FnOnce(&'a RuntimeValue) -> Option<T>,
) -> Result<Option<T>, RuntimeError> {
    runtime
        .get(key)
        .map(|v| {
            f(v).ok_or_else(|| RuntimeError::UnexpectedType {
                key: key.to_string(),
                expected,
                actual: v.type_name(),
            })
        })
        .transpose()
}

/// Builds an [`RuntimeError::InvalidValue`].
fn invalid(key: &str, value: impl fmt::Display) -> RuntimeError {
    RuntimeError::InvalidValue {
        key: key.to_string(),
        value: value.to_string(),
    }
}

/// The resources requested by a single task execution.
///
/// Every field is independently optional; an absent field means the
/// corresponding `sbatch` flag is not passed at all.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ResourceRequest {
    /// The number of CPUs.
    pub cpu_count: Option<u64>,
    /// The memory reservation, in bytes.
    pub memory_bytes: Option<u64>,
    /// The walltime, in minutes.
    pub time_minutes: Option<u64>,
    /// Whether a GPU is requested.
    pub gpu_requested: bool,
    /// The number of GPUs; only meaningful when a GPU is requested.
    pub gpu_count: Option<u64>,
    /// The Slurm account.
    pub account: Option<String>,
    /// The Slurm account used when a GPU is requested.
    pub account_gpu: Option<String>,
    /// The Slurm partition.
    pub partition: Option<String>,
    /// The Slurm partition used when a GPU is requested.
    pub partition_gpu: Option<String>,
    /// The Slurm node constraint.
    pub constraint: Option<String>,
    /// The job name, which is the run id of the task execution.
    pub job_name: String,
}

impl ResourceRequest {
    /// Creates an empty request for the given job name.
    pub fn new(job_name: impl Into<String>) -> Self {
        Self {
            job_name: job_name.into(),
            ..Default::default()
        }
    }

    /// Creates a request from a task's runtime values.
    ///
    /// This runs [`process_container_runtime`] followed by
    /// [`process_slurm_runtime`].
    pub fn from_runtime(
        job_name: impl Into<String>,
        runtime: &Runtime,
    ) -> Result<Self, RuntimeError> {
        let mut request = Self::new(job_name);
        process_container_runtime(runtime, &mut request)?;
        process_slurm_runtime(runtime, &mut request)?;
        Ok(request)
    }

    /// The number of GPUs to request.
    ///
    /// Defaults to one when a GPU is requested without a count.
    pub fn gpus(&self) -> u64 {
        self.gpu_count.unwrap_or(1).max(1)
    }

    /// The account to submit under, preferring the GPU account for GPU tasks.
    pub fn submission_account(&self) -> Option<&str> {
        match (&self.account_gpu, &self.account) {
            (Some(gpu), _) if self.gpu_requested => Some(gpu.as_str()),
            (_, account) => account.as_deref(),
        }
    }

    /// The partition to submit to, preferring the GPU partition for GPU tasks.
    ///
    /// Falls back to `default` when the task doesn't name a partition.
    pub fn submission_partition<'a>(&'a self, default: Option<&'a str>) -> Option<&'a str> {
        match (&self.partition_gpu, &self.partition) {
            (Some(gpu), _) if self.gpu_requested => Some(gpu.as_str()),
            (_, Some(partition)) => Some(partition.as_str()),
            _ => default,
        }
    }
}

/// Processes the generic container runtime keys: `cpu`, `memory` and `gpu`.
///
/// A fractional `cpu` is rounded up to the next whole CPU. `memory` may be an
/// integer number of bytes or a string with a unit such as `4 GiB`.
pub fn process_container_runtime(
    runtime: &Runtime,
    request: &mut ResourceRequest,
) -> Result<(), RuntimeError> {
    if let Some(cpu) = coerce(runtime, RUNTIME_CPU, "Float", RuntimeValue::as_float)? {
        if !cpu.is_finite() || cpu <= 0.0 {
            return Err(invalid(RUNTIME_CPU, cpu));
        }
        request.cpu_count = Some(cpu.ceil() as u64);
    }

    if let Some(memory) = runtime.get(RUNTIME_MEMORY) {
        let bytes = match memory {
            RuntimeValue::Integer(i) => {
                u64::try_from(*i).map_err(|_| invalid(RUNTIME_MEMORY, i))?
            }
            RuntimeValue::String(s) => {
                convert_unit_string(s).ok_or_else(|| invalid(RUNTIME_MEMORY, s))?
            }
            other => {
                return Err(RuntimeError::UnexpectedType {
                    key: RUNTIME_MEMORY.to_string(),
                    expected: "Int",
                    actual: other.type_name(),
                });
            }
        };
        request.memory_bytes = Some(bytes);
    }

    if let Some(gpu) = coerce(runtime, RUNTIME_GPU, "Boolean", RuntimeValue::as_boolean)? {
        request.gpu_requested = gpu;
    }

    Ok(())
}

/// Processes the Slurm-specific runtime keys.
///
/// Strings are passed through unchanged; `gpuCount` is clamped to at least
/// one. Missing keys leave the request untouched.
pub fn process_slurm_runtime(
    runtime: &Runtime,
    request: &mut ResourceRequest,
) -> Result<(), RuntimeError> {
    if let Some(minutes) = coerce(runtime, RUNTIME_TIME_MINUTES, "Int", RuntimeValue::as_integer)? {
        request.time_minutes =
            Some(u64::try_from(minutes).map_err(|_| invalid(RUNTIME_TIME_MINUTES, minutes))?);
    }

    if let Some(count) = coerce(runtime, RUNTIME_GPU_COUNT, "Int", RuntimeValue::as_integer)? {
        request.gpu_count = Some(count.max(1) as u64);
    }

    let string = |key: &str| coerce(runtime, key, "String", |v| v.as_string().map(str::to_string));
    if let Some(account) = string(RUNTIME_SLURM_ACCOUNT)? {
        request.account = Some(account);
    }
    if let Some(account) = string(RUNTIME_SLURM_ACCOUNT_GPU)? {
        request.account_gpu = Some(account);
    }
    if let Some(partition) = string(RUNTIME_SLURM_PARTITION)? {
        request.partition = Some(partition);
    }
    if let Some(partition) = string(RUNTIME_SLURM_PARTITION_GPU)? {
        request.partition_gpu = Some(partition);
    }
    if let Some(constraint) = string(RUNTIME_SLURM_CONSTRAINT)? {
        request.constraint = Some(constraint);
    }

    Ok(())
}

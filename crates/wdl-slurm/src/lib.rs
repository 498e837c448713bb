//! Slurm + Apptainer task execution backend for Workflow Description Language
//! (WDL) engines.
//!
//! Each task execution is submitted as a Slurm job with `sbatch --wait`, which
//! blocks until the job finishes and reports the job's exit code. Inside the
//! job, Apptainer provides the container environment for the task command.
//!
//! The backend reports unlimited local resources, leaving admission
//! control to the Slurm queue rather than the submitting host.

pub mod backend;
pub mod config;
mod runtime;
mod units;

pub use backend::*;
pub use config::Config;
pub use runtime::*;
pub use units::*;

//! A command line tool for running WDL task containers as Slurm jobs.

pub mod commands;
pub mod config;
pub mod input;

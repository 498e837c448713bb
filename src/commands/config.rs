//! Implementation of the `config` subcommand.

use anyhow::Context;
use anyhow::Result;
use clap::Parser;
use clap::Subcommand;
use wdl_slurm::Config;

/// Arguments for the `config` subcommand.
#[derive(Parser, Debug, Clone)]
pub struct Args {
    /// The `config` subcommand to run.
    #[command(subcommand)]
    command: ConfigSubcommand,
}

/// Subcommands for the `config` command.
#[derive(Subcommand, Debug, Clone)]
pub enum ConfigSubcommand {
    /// Generates a default configuration file.
    Init,

    /// Displays the current configuration.
    Resolve,
}

/// Runs the `config` command.
pub fn config(args: Args, config: Config) -> Result<()> {
    let config = match args.command {
        ConfigSubcommand::Init => Config::default(),
        ConfigSubcommand::Resolve => config,
    };

    print!(
        "{}",
        toml::to_string_pretty(&config).context("failed to serialize configuration")?
    );
    Ok(())
}

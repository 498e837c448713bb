//! The sprocket-slurm command line tool.

use std::io::IsTerminal;
use std::io::stderr;
use std::path::PathBuf;

use clap::Parser;
use clap::Subcommand;
use clap_verbosity_flag::Verbosity;
use colored::Colorize;
use sprocket_slurm::commands;
use sprocket_slurm::config::load_config;
use tracing_log::AsTrace;

#[derive(Subcommand)]
enum Commands {
    /// Prints the Slurm invocation for a task without running it.
    Invocation(commands::invocation::Args),

    /// Runs a task as a Slurm job and waits for it to complete.
    ///
    /// The process exits with the job's exit code. Pressing Ctrl-C cancels the
    /// job once `sbatch` returns; pressing it again cancels the job and exits
    /// immediately.
    Run(commands::run::Args),

    /// Cancels the Slurm job recorded in a task directory.
    Cancel(commands::cancel::Args),

    /// Displays or initializes the configuration.
    Config(commands::config::Args),

    /// Checks the configuration against the local Slurm cluster.
    Check(commands::check::Args),
}

#[derive(Parser)]
#[command(author, version, propagate_version = true, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// The configuration file to use.
    ///
    /// Defaults to `sprocket-slurm.toml` in the current directory, if present.
    #[arg(long, global = true, value_name = "FILE")]
    config: Option<PathBuf>,

    #[command(flatten)]
    verbose: Verbosity,
}

pub async fn inner() -> anyhow::Result<i32> {
    let cli = Cli::parse();

    tracing_log::LogTracer::init()?;

    let subscriber = tracing_subscriber::fmt::Subscriber::builder()
        .with_max_level(cli.verbose.log_level_filter().as_trace())
        .with_writer(std::io::stderr)
        .with_ansi(stderr().is_terminal())
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = load_config(cli.config.as_deref())?;

    match cli.command {
        Commands::Invocation(args) => commands::invocation::invocation(args, config).map(|_| 0),
        Commands::Run(args) => commands::run::run(args, config).await,
        Commands::Cancel(args) => commands::cancel::cancel(args, config).await.map(|_| 0),
        Commands::Config(args) => commands::config::config(args, config).map(|_| 0),
        Commands::Check(args) => commands::check::check(args, config).await.map(|_| 0),
    }
}

#[tokio::main]
pub async fn main() {
    match inner().await {
        Ok(code) => std::process::exit(code),
        Err(e) => {
            eprintln!(
                "{error}: {e:?}",
                error = if std::io::stderr().is_terminal() {
                    "error".red().bold()
                } else {
                    "error".normal()
                }
            );
            std::process::exit(1);
        }
    }
}

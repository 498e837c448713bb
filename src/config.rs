//! Implementation of the configuration module.

use std::path::Path;

use anyhow::Context;
use anyhow::Result;
use tracing::debug;
use wdl_slurm::Config;

/// The name of the configuration file read from the current directory.
pub const DEFAULT_CONFIG_FILE_NAME: &str = "sprocket-slurm.toml";

/// Read a configuration file from the specified path.
pub fn read_config(path: &Path) -> Result<Config> {
    let text = std::fs::read_to_string(path).with_context(|| {
        format!(
            "failed to read configuration file `{path}`",
            path = path.display()
        )
    })?;
    let config: Config = toml::from_str(&text).with_context(|| {
        format!(
            "failed to parse configuration file `{path}`",
            path = path.display()
        )
    })?;
    Ok(config)
}

/// Loads the configuration.
///
/// An explicit path must exist. Otherwise, `sprocket-slurm.toml` in the
/// current directory is read when present and the defaults are used when it
/// is not.
pub fn load_config(path: Option<&Path>) -> Result<Config> {
    let config = match path {
        Some(path) => read_config(path)?,
        None => {
            let path = Path::new(DEFAULT_CONFIG_FILE_NAME);
            if path.is_file() {
                read_config(path)?
            } else {
                debug!("no configuration file found; using defaults");
                Config::default()
            }
        }
    };

    config.validate()?;
    Ok(config)
}

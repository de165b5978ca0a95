// Command handlers module
pub mod config;
#[cfg(target_os = "linux")]
pub mod produce;
pub mod run;
pub mod simulate;
pub mod version;

// Re-exports for cleaner imports
pub use version::execute as version;

use anyhow::Result;
use std::path::Path;

use crate::core::MonitorConfig;

/// The config named by `--config`, or the one at the default location.
pub(crate) fn load_config(matches: &clap::ArgMatches) -> Result<MonitorConfig> {
    let config = match matches.get_one::<String>("config") {
        Some(path) => MonitorConfig::load_from(Path::new(path))?,
        None => MonitorConfig::load()?,
    };
    config.validate()?;
    Ok(config)
}

use anyhow::{Context, Result};
use colored::Colorize;
use std::path::{Path, PathBuf};

use crate::core::MonitorConfig;

pub fn handle_config(matches: &clap::ArgMatches) -> Result<()> {
    let path = match matches.get_one::<String>("config") {
        Some(path) => PathBuf::from(path),
        None => MonitorConfig::get_config_path()?,
    };

    match matches.subcommand() {
        Some(("show", _)) => show(&path),
        Some(("path", _)) => {
            println!("{}", "Config file path:".white());
            println!("{}", path.display().to_string().cyan().bold());
            Ok(())
        }
        Some(("reset", _)) => reset(&path),
        Some(("socket", sub_matches)) => set_socket(&path, sub_matches),
        _ => {
            println!("Use 'bedside config --help' for more information.");
            Ok(())
        }
    }
}

fn show(path: &Path) -> Result<()> {
    let config = MonitorConfig::load_from(path)?;
    if !path.exists() {
        println!("{}", "No config file yet, showing defaults.".yellow());
        println!();
    }
    let rendered = serde_json::to_string_pretty(&config).with_context(|| "Failed to render config")?;
    println!("{}", rendered);
    Ok(())
}

fn reset(path: &Path) -> Result<()> {
    let mut config = MonitorConfig::load_from(path)?;
    config.reset_to_defaults();
    config.save_to(path)?;
    println!("{} {}", "✓ Config reset to defaults:".green(), path.display());
    Ok(())
}

fn set_socket(path: &Path, matches: &clap::ArgMatches) -> Result<()> {
    let mut config = MonitorConfig::load_from(path)?;
    match matches.get_one::<String>("path") {
        Some(socket) => {
            config.transport.socket_path = Some(PathBuf::from(socket));
            config.save_to(path)?;
            println!("{} {}", "✓ Control socket set to:".green(), socket);
        }
        None => {
            config.transport.socket_path = None;
            config.save_to(path)?;
            println!("{}", "✓ Control socket cleared; 'bedside run' will use the simulator.".green());
        }
    }
    Ok(())
}

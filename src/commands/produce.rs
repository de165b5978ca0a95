use anyhow::{Context, Result};
use colored::Colorize;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use crate::core::clock::SystemClock;
use crate::core::simulator::{demo_script, spawn_simulator, Simulator, SimulatorConfig};
use crate::core::transport::{ControlServer, RingWriter};

/// Serve a simulated ring to readers that connect to the control socket.
pub fn execute(matches: &clap::ArgMatches) -> Result<()> {
    let config = super::load_config(matches)?;
    let socket = matches
        .get_one::<String>("socket")
        .map(PathBuf::from)
        .or_else(|| config.transport.socket_path.clone())
        .context("No control socket given; pass --socket or set transport.socket_path")?;

    let (server, region) = ControlServer::bind(&socket, config.transport.slot_count)
        .with_context(|| format!("Failed to serve {}", socket.display()))?;

    let stop = Arc::new(AtomicBool::new(false));
    let stop_clone = stop.clone();
    ctrlc::set_handler(move || {
        println!();
        println!("{}", "Stopping producer...".yellow().bold());
        stop_clone.store(true, Ordering::Relaxed);
    })
    .map_err(|e| anyhow::anyhow!("Failed to set Ctrl+C handler: {}", e))?;

    let script = if matches.get_flag("steady") { Vec::new() } else { demo_script() };
    let simulator = Simulator::new(
        RingWriter::new(region),
        Arc::new(SystemClock),
        SimulatorConfig::default(),
        script,
    );
    let producer = spawn_simulator(simulator, Arc::clone(&stop))?;

    println!(
        "{} {} {}",
        "Producing frames on".cyan().bold(),
        server.path().display().to_string().white(),
        format!("({} slots)", config.transport.slot_count).dimmed()
    );
    println!("{}", "Press Ctrl+C to stop.".dimmed());

    let served = server.serve_until(&stop);
    stop.store(true, Ordering::Release);
    if producer.join().is_err() {
        log::warn!("Simulator thread panicked");
    }
    served?;
    Ok(())
}

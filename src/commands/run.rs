use anyhow::Result;
use colored::Colorize;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::error::TryRecvError;

use crate::core::monitor::{MonitorEvent, MonitorRuntime};
use crate::core::MonitorConfig;
use crate::ui::{format_event, print_snapshot, print_stats};

const CONSOLE_SUBSCRIBER: &str = "console";
const POLL_INTERVAL: Duration = Duration::from_millis(50);

pub fn execute(matches: &clap::ArgMatches) -> Result<()> {
    let mut config = super::load_config(matches)?;
    if let Some(socket) = matches.get_one::<String>("socket") {
        config.transport.socket_path = Some(PathBuf::from(socket));
    }
    let duration = matches.get_one::<u64>("duration").map(|s| Duration::from_secs(*s));

    match config.transport.socket_path.clone() {
        Some(path) => run_attached(&config, &path, duration),
        None => {
            println!(
                "{}",
                "No control socket configured, monitoring the built-in simulator.".yellow()
            );
            super::simulate::run_simulated(&config, &super::simulate::SimulateOptions::default(), duration)
        }
    }
}

#[cfg(unix)]
fn run_attached(config: &MonitorConfig, path: &Path, duration: Option<Duration>) -> Result<()> {
    use crate::core::monitor::Collaborators;
    use crate::core::transport::UnixControlChannel;

    println!("{} {}", "Attaching to".cyan().bold(), path.display().to_string().white());
    let mut source = UnixControlChannel::new(path);
    let runtime = MonitorRuntime::start(config, &mut source, Collaborators::from_config(config)?)?;
    watch(runtime, duration, &mut |_: &MonitorEvent| {})
}

#[cfg(not(unix))]
fn run_attached(_config: &MonitorConfig, path: &Path, _duration: Option<Duration>) -> Result<()> {
    anyhow::bail!(
        "Control socket {} needs a Unix platform; run without --socket to use the simulator",
        path.display()
    )
}

/// Print events until Ctrl+C, the real-time thread exits, or `duration`
/// elapses. Then shut the runtime down and print a summary. `react` sees
/// every event after it is printed.
pub(crate) fn watch(
    runtime: MonitorRuntime,
    duration: Option<Duration>,
    react: &mut dyn FnMut(&MonitorEvent),
) -> Result<()> {
    let cancel = Arc::new(AtomicBool::new(false));
    let cancel_clone = cancel.clone();
    ctrlc::set_handler(move || {
        println!();
        println!("{}", "Stopping monitor...".yellow().bold());
        cancel_clone.store(true, Ordering::Relaxed);
    })
    .map_err(|e| anyhow::anyhow!("Failed to set Ctrl+C handler: {}", e))?;

    let mut events = runtime.subscribe(CONSOLE_SUBSCRIBER, 1024);
    println!("{}", "Monitoring. Press Ctrl+C to stop.".dimmed());
    println!();

    let started = Instant::now();
    'watch: while !cancel.load(Ordering::Relaxed) {
        if duration.map(|d| started.elapsed() >= d).unwrap_or(false) {
            break;
        }
        loop {
            match events.try_recv() {
                Ok(event) => {
                    if let Some(line) = format_event(&event) {
                        println!("{}", line);
                    }
                    react(&event);
                }
                Err(TryRecvError::Empty) => break,
                Err(TryRecvError::Disconnected) => break 'watch,
            }
        }
        if !runtime.is_running() {
            println!("{}", "Real-time loop exited.".red().bold());
            break;
        }
        std::thread::sleep(POLL_INTERVAL);
    }

    println!();
    let snapshot = runtime.snapshot_rx.borrow().clone();
    print_snapshot(&snapshot);
    if runtime.degraded() {
        println!("{}", "⚠️  Monitor was degraded at shutdown".yellow().bold());
    }
    if let Some(stats) = runtime.shutdown() {
        print_stats(&stats);
    }
    Ok(())
}

use anyhow::{Context, Result};
use colored::Colorize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::core::alarm::{AlarmChange, ChangeKind};
use crate::core::monitor::{Collaborators, MonitorEvent, MonitorRuntime, OperatorHandle};
use crate::core::simulator::{demo_script, spawn_simulator, Simulator, SimulatorConfig};
use crate::core::transport::LocalHandleSource;
use crate::core::MonitorConfig;

const OPERATOR: &str = "console";

/// How the simulated operator answers new alarms.
#[derive(Debug, Clone)]
pub struct SimulateOptions {
    pub script: bool,
    pub seed: u64,
    /// Silence each new alarm for this many seconds.
    pub silence_secs: Option<i64>,
    pub acknowledge: bool,
}

impl Default for SimulateOptions {
    fn default() -> Self {
        Self {
            script: true,
            seed: SimulatorConfig::default().seed,
            silence_secs: None,
            acknowledge: false,
        }
    }
}

pub fn execute(matches: &clap::ArgMatches) -> Result<()> {
    let config = super::load_config(matches)?;
    let options = SimulateOptions {
        script: !matches.get_flag("steady"),
        seed: matches
            .get_one::<u64>("seed")
            .copied()
            .unwrap_or(SimulatorConfig::default().seed),
        silence_secs: matches.get_one::<i64>("silence").copied(),
        acknowledge: matches.get_flag("acknowledge"),
    };
    let duration = matches.get_one::<u64>("duration").map(|s| Duration::from_secs(*s));

    println!("{}", "Simulated bedside session".cyan().bold());
    if options.script {
        println!(
            "{}",
            "Scripted tachycardia at 10s and desaturation at 60s.".dimmed()
        );
    }
    run_simulated(&config, &options, duration)
}

/// Feed an in-process ring from the simulator and monitor it.
pub(crate) fn run_simulated(
    config: &MonitorConfig,
    options: &SimulateOptions,
    duration: Option<Duration>,
) -> Result<()> {
    let (mut source, writer) = LocalHandleSource::pair(config.transport.slot_count)
        .with_context(|| "Failed to create the in-process ring")?;
    let collaborators = Collaborators::from_config(config)?;
    let clock = Arc::clone(&collaborators.clock);
    let runtime = MonitorRuntime::start(config, &mut source, collaborators)?;

    let script = if options.script { demo_script() } else { Vec::new() };
    let simulator = Simulator::new(
        writer,
        clock,
        SimulatorConfig {
            seed: options.seed,
            ..SimulatorConfig::default()
        },
        script,
    );
    let stop = Arc::new(AtomicBool::new(false));
    let producer = spawn_simulator(simulator, Arc::clone(&stop))?;

    let operator = runtime.operator();
    let handle = runtime.handle();
    let result = super::run::watch(runtime, duration, &mut |event: &MonitorEvent| {
        if let MonitorEvent::AlarmChanged(change) = event {
            if change.kind == ChangeKind::Triggered {
                respond(&handle, &operator, change, options);
            }
        }
    });

    stop.store(true, Ordering::Release);
    if producer.join().is_err() {
        log::warn!("Simulator thread panicked");
    }
    result
}

fn respond(handle: &tokio::runtime::Handle, operator: &OperatorHandle, change: &AlarmChange, options: &SimulateOptions) {
    let id = change.alarm.id;
    if let Some(secs) = options.silence_secs {
        let reason = Some("simulated operator".to_string());
        if let Err(e) = handle.block_on(operator.silence(id, chrono::Duration::seconds(secs), OPERATOR, reason)) {
            println!("{}", format!("Could not silence {}: {}", id, e).yellow());
        }
    }
    if options.acknowledge {
        if let Err(e) = handle.block_on(operator.acknowledge(id, OPERATOR)) {
            println!("{}", format!("Could not acknowledge {}: {}", id, e).yellow());
        }
    }
}

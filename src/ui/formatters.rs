use chrono::{DateTime, Local, Utc};
use colored::*;

use crate::core::alarm::{AlarmChange, AlarmPriority, AlarmSnapshot, ChangeKind};
use crate::core::cache::VitalSample;
use crate::core::monitor::{Connectivity, MonitorEvent, OrchestratorStats};
use crate::core::scheduler::HealthEvent;

/// Wall-clock time of a sample in local time (HH:MM:SS)
pub fn format_time(time: DateTime<Utc>) -> String {
    let local: DateTime<Local> = time.into();
    local.format("%H:%M:%S").to_string()
}

fn format_value(value: Option<f32>, unit: &str) -> String {
    match value {
        Some(v) => format!("{:.0}{}", v, unit),
        None => "--".to_string(),
    }
}

pub fn format_vitals(sample: &VitalSample) -> String {
    format!(
        "{} {} {} {} {} {} {}",
        format_time(sample.timestamp).dimmed(),
        "HR".white().bold(),
        format_value(sample.heart_rate, " bpm").green(),
        "SpO2".white().bold(),
        format_value(sample.spo2, "%").cyan(),
        "RR".white().bold(),
        format_value(sample.respiration_rate, "/min").yellow(),
    )
}

fn priority_label(priority: AlarmPriority) -> ColoredString {
    match priority {
        AlarmPriority::High => "HIGH".red().bold(),
        AlarmPriority::Medium => "MEDIUM".yellow().bold(),
        AlarmPriority::Low => "LOW".cyan().bold(),
    }
}

pub fn format_alarm_change(change: &AlarmChange) -> String {
    let alarm = &change.alarm;
    let what = match change.kind {
        ChangeKind::Triggered => format!("{} triggered at {:.1}", alarm.vital, alarm.triggering_value)
            .bold()
            .to_string(),
        ChangeKind::Acknowledged => {
            let by = alarm.acknowledged.as_ref().map(|a| a.by.as_str()).unwrap_or("?");
            format!("{} acknowledged by {}", alarm.vital, by)
        }
        ChangeKind::Silenced => match &alarm.silence {
            Some(s) if s.effective_secs < s.requested_secs => format!(
                "{} silenced for {}s (requested {}s)",
                alarm.vital, s.effective_secs, s.requested_secs
            ),
            Some(s) => format!("{} silenced for {}s", alarm.vital, s.effective_secs),
            None => format!("{} silenced", alarm.vital),
        },
        ChangeKind::Unsilenced => format!("{} audio restored", alarm.vital),
        ChangeKind::Escalated => format!("{} escalated to level {}", alarm.vital, alarm.escalation_level)
            .red()
            .to_string(),
        ChangeKind::Resolved => format!("{} resolved at {:.1}", alarm.vital, alarm.last_value)
            .green()
            .to_string(),
    };
    format!("{} {} {} {}", "ALARM".red(), alarm.id.to_string().dimmed(), priority_label(alarm.priority), what)
}

fn format_connectivity(connectivity: &Connectivity) -> String {
    match connectivity {
        Connectivity::Connected => "Connected to frame source".green().to_string(),
        Connectivity::Degraded(fault) => format!("⚠️  Source degraded: {}", fault).yellow().bold().to_string(),
        Connectivity::Restored => "Source restored".green().to_string(),
        Connectivity::Disconnected => "Disconnected from frame source".dimmed().to_string(),
    }
}

fn format_health(event: &HealthEvent) -> String {
    match event {
        HealthEvent::Fault(fault) => format!("⚠️  {}", fault).yellow().bold().to_string(),
        HealthEvent::RestartIssued { component, attempt } => {
            format!("Restarting {} (attempt {})", component, attempt).yellow().to_string()
        }
        HealthEvent::Demoted { component, to } => {
            format!("{} demoted to {:?}", component, to).yellow().to_string()
        }
        HealthEvent::Restored { component } => format!("{} priority restored", component).green().to_string(),
        HealthEvent::Recovered { component } => format!("{} recovered", component).green().to_string(),
    }
}

/// One console line per event. Waveform updates are too frequent to
/// print and yield `None`.
pub fn format_event(event: &MonitorEvent) -> Option<String> {
    match event {
        MonitorEvent::VitalsUpdated(sample) => Some(format_vitals(sample)),
        MonitorEvent::WaveformWindowUpdated { .. } => None,
        MonitorEvent::AlarmChanged(change) => Some(format_alarm_change(change)),
        MonitorEvent::CriticalAlarmActive(true) => Some("CRITICAL ALARM ACTIVE".on_red().white().bold().to_string()),
        MonitorEvent::CriticalAlarmActive(false) => Some("Critical alarm cleared".green().to_string()),
        MonitorEvent::Connectivity(c) => Some(format_connectivity(c)),
        MonitorEvent::Health(h) => Some(format_health(h)),
        MonitorEvent::CapacityWarning(fault) => Some(format!("⚠️  {}", fault).yellow().to_string()),
    }
}

pub fn print_snapshot(snapshot: &AlarmSnapshot) {
    println!("{}", "Active alarms:".white().bold());
    if snapshot.active.is_empty() {
        println!("  {}", "none".dimmed());
        return;
    }
    for alarm in &snapshot.active {
        let mut flags = Vec::new();
        if alarm.acknowledged.is_some() {
            flags.push("acknowledged");
        }
        if alarm.is_silenced() {
            flags.push("silenced");
        }
        println!(
            "  {} {} {} level {} {}",
            alarm.id.to_string().dimmed(),
            priority_label(alarm.priority),
            alarm.vital.to_string().cyan(),
            alarm.escalation_level,
            flags.join(", ").dimmed()
        );
    }
}

pub fn print_stats(stats: &OrchestratorStats) {
    println!();
    println!("{}", "Session summary:".white().bold());
    println!("  {:<22} {}", "Vitals accepted:", stats.vitals_accepted.to_string().green());
    println!("  {:<22} {}", "Waveform frames:", stats.waveform_frames.to_string().cyan());
    println!("  {:<22} {}", "Heartbeats:", stats.heartbeat_frames);
    let warn = |n: u64| if n == 0 { n.to_string().dimmed() } else { n.to_string().yellow().bold() };
    println!("  {:<22} {}", "Out of sequence:", warn(stats.out_of_sequence));
    println!("  {:<22} {}", "Invalid samples:", warn(stats.invalid_samples));
    println!("  {:<22} {}", "Not cached:", warn(stats.not_cached));
    println!("  {:<22} {}", "Transport faults:", warn(stats.transport_faults));
    println!("  {:<22} {}", "Telemetry dropped:", warn(stats.telemetry_dropped));
    println!("  {:<22} {}", "Persist dropped:", warn(stats.persist_dropped));
}

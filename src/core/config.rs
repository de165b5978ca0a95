use anyhow::{bail, Context, Result};
use chrono::Duration as ChronoDuration;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::core::alarm::{AlarmEngineConfig, ThresholdSet};
use crate::core::cache::VitalsCacheConfig;
use crate::core::monitor::OrchestratorConfig;
use crate::core::scheduler::{CpuBudget, WatchdogConfig};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportSettings {
    /// Control socket the producer serves the region on. `None` runs the
    /// built-in simulator in-process.
    pub socket_path: Option<PathBuf>,
    pub slot_count: u32,
    pub stall_threshold_ms: u64,
    pub stall_check_interval_ms: u64,
    pub frames_per_poll: usize,
    /// How far ahead of the local clock a sample may be stamped.
    pub max_clock_skew_ms: u64,
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self {
            socket_path: None,
            slot_count: 1024,
            stall_threshold_ms: 250,
            stall_check_interval_ms: 100,
            frames_per_poll: 10,
            max_clock_skew_ms: 5_000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheSettings {
    pub vitals_capacity: usize,
    pub retention_hours: u64,
    pub pressure_threshold: u64,
    pub waveform_capacity: usize,
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            vitals_capacity: 72 * 3600,
            retention_hours: 72,
            pressure_threshold: 100,
            // 10 s of two 500 Hz channels, with headroom.
            waveform_capacity: 16_384,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AlarmSettings {
    pub thresholds: ThresholdSet,
    pub escalation_tick_secs: i64,
    pub max_escalation: u8,
    pub critical_level: u8,
    pub history_capacity: usize,
}

impl Default for AlarmSettings {
    fn default() -> Self {
        Self {
            thresholds: ThresholdSet::defaults(),
            escalation_tick_secs: 30,
            max_escalation: 3,
            critical_level: 2,
            history_capacity: 1000,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetrySettings {
    pub batch_max_samples: usize,
    pub batch_max_secs: u64,
    pub signing_key: String,
    pub queue_capacity: usize,
}

impl Default for TelemetrySettings {
    fn default() -> Self {
        Self {
            batch_max_samples: 100,
            batch_max_secs: 10,
            signing_key: "bedside-device-key".to_string(),
            queue_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceSettings {
    pub interval_secs: u64,
    /// Defaults to `<data dir>/bedside/archive.jsonl`.
    pub archive_path: Option<PathBuf>,
    pub queue_capacity: usize,
}

impl Default for PersistenceSettings {
    fn default() -> Self {
        Self {
            interval_secs: 5 * 60,
            archive_path: None,
            queue_capacity: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerSettings {
    pub realtime_budget_ms: u64,
    pub min_iteration_delay_ms: u64,
    pub watchdog_interval_ms: u64,
    pub max_restarts: u32,
    pub restart_window_secs: u64,
    pub starvation_overruns: u32,
    /// Ask the OS for real-time scheduling. Needs privileges.
    pub realtime_priority: bool,
    pub realtime_cpus: Vec<usize>,
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self {
            realtime_budget_ms: 5,
            min_iteration_delay_ms: 2,
            watchdog_interval_ms: 100,
            max_restarts: 3,
            restart_window_secs: 60,
            starvation_overruns: 20,
            realtime_priority: false,
            realtime_cpus: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventSettings {
    pub subscriber_capacity: usize,
    pub render_tick_ms: u64,
    pub operator_queue_capacity: usize,
}

impl Default for EventSettings {
    fn default() -> Self {
        Self {
            subscriber_capacity: 256,
            render_tick_ms: 33,
            operator_queue_capacity: 16,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct MonitorConfig {
    pub transport: TransportSettings,
    pub cache: CacheSettings,
    pub alarm: AlarmSettings,
    pub telemetry: TelemetrySettings,
    pub persistence: PersistenceSettings,
    pub scheduler: SchedulerSettings,
    pub events: EventSettings,
}

impl MonitorConfig {
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::get_config_path()?)
    }

    /// Read a config file. A missing, empty or unreadable file yields the
    /// defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let data = fs::read(path).with_context(|| format!("Failed to read config file: {:?}", path))?;
        if data.is_empty() {
            return Ok(Self::default());
        }
        Ok(serde_json::from_slice(&data).unwrap_or_else(|e| {
            log::warn!("Ignoring unreadable config {:?}: {}", path, e);
            Self::default()
        }))
    }

    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::get_config_path()?)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        self.validate()?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create config directory: {:?}", parent))?;
        }
        let data = serde_json::to_vec_pretty(self).with_context(|| "Failed to serialize config")?;
        fs::write(path, data).with_context(|| format!("Failed to write config file: {:?}", path))?;
        Ok(())
    }

    pub fn get_config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir().with_context(|| "Could not determine config directory")?;
        Ok(config_dir.join("bedside").join("config.json"))
    }

    pub fn archive_path(&self) -> Result<PathBuf> {
        if let Some(path) = &self.persistence.archive_path {
            return Ok(path.clone());
        }
        let data_dir = dirs::data_dir().with_context(|| "Could not determine data directory")?;
        Ok(data_dir.join("bedside").join("archive.jsonl"))
    }

    /// Reject settings the monitor cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.transport.slot_count < 2 {
            bail!("transport.slot_count must be at least 2");
        }
        if self.transport.stall_threshold_ms == 0 || self.transport.frames_per_poll == 0 {
            bail!("transport.stall_threshold_ms and transport.frames_per_poll must be positive");
        }
        if self.cache.vitals_capacity == 0 || self.cache.waveform_capacity == 0 {
            bail!("cache capacities must be positive");
        }
        if self.alarm.max_escalation == 0 || self.alarm.critical_level > self.alarm.max_escalation {
            bail!("alarm.critical_level must be within 1..=alarm.max_escalation");
        }
        if self.alarm.escalation_tick_secs <= 0 {
            bail!("alarm.escalation_tick_secs must be positive");
        }
        self.alarm
            .thresholds
            .validate()
            .with_context(|| "Invalid alarm thresholds")?;
        if self.telemetry.batch_max_samples == 0 || self.telemetry.batch_max_secs == 0 {
            bail!("telemetry batch limits must be positive");
        }
        if self.persistence.interval_secs == 0 {
            bail!("persistence.interval_secs must be positive");
        }
        if self.scheduler.realtime_budget_ms == 0 || self.scheduler.watchdog_interval_ms == 0 {
            bail!("scheduler budget and watchdog interval must be positive");
        }
        Ok(())
    }

    pub fn stall_threshold(&self) -> Duration {
        Duration::from_millis(self.transport.stall_threshold_ms)
    }

    pub fn vitals_cache(&self) -> VitalsCacheConfig {
        VitalsCacheConfig {
            capacity: self.cache.vitals_capacity,
            retention: Duration::from_secs(self.cache.retention_hours * 3600),
            pressure_threshold: self.cache.pressure_threshold,
        }
    }

    pub fn alarm_engine(&self) -> AlarmEngineConfig {
        AlarmEngineConfig {
            escalation_tick: ChronoDuration::seconds(self.alarm.escalation_tick_secs),
            max_escalation: self.alarm.max_escalation,
            critical_level: self.alarm.critical_level,
            history_capacity: self.alarm.history_capacity,
        }
    }

    pub fn orchestrator(&self) -> OrchestratorConfig {
        OrchestratorConfig {
            frames_per_poll: self.transport.frames_per_poll,
            max_clock_skew: Duration::from_millis(self.transport.max_clock_skew_ms),
            stall_check_interval: Duration::from_millis(self.transport.stall_check_interval_ms),
            render_tick: Duration::from_millis(self.events.render_tick_ms),
            persist_interval: Duration::from_secs(self.persistence.interval_secs),
            batch_max_samples: self.telemetry.batch_max_samples,
            batch_max_duration: Duration::from_secs(self.telemetry.batch_max_secs),
            ..OrchestratorConfig::default()
        }
    }

    pub fn cpu_budget(&self) -> CpuBudget {
        CpuBudget::new(
            Duration::from_millis(self.scheduler.realtime_budget_ms),
            Duration::from_millis(self.scheduler.min_iteration_delay_ms),
        )
    }

    pub fn watchdog(&self) -> WatchdogConfig {
        WatchdogConfig {
            check_interval: Duration::from_millis(self.scheduler.watchdog_interval_ms),
            max_restarts: self.scheduler.max_restarts,
            restart_window: Duration::from_secs(self.scheduler.restart_window_secs),
            starvation_overruns: self.scheduler.starvation_overruns,
        }
    }

    pub fn reset_to_defaults(&mut self) {
        *self = Self::default();
    }
}

//! Alarm limits and the per-patient threshold table.

use arc_swap::ArcSwap;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use crate::core::cache::{PatientContextId, VitalType};
use crate::error::ValidationFault;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum AlarmPriority {
    Low,
    Medium,
    High,
}

/// No silence may exceed this, whatever the priority.
pub const GLOBAL_SILENCE_CEILING_SECS: i64 = 600;

impl AlarmPriority {
    pub fn silence_ceiling(self) -> Duration {
        let secs = match self {
            AlarmPriority::High => 120,
            AlarmPriority::Medium => 300,
            AlarmPriority::Low => 600,
        };
        Duration::seconds(secs.min(GLOBAL_SILENCE_CEILING_SECS))
    }

    /// How long an unacknowledged alarm waits before escalating. Low
    /// priority alarms never escalate.
    pub fn escalation_delay(self) -> Option<Duration> {
        match self {
            AlarmPriority::High => Some(Duration::seconds(60)),
            AlarmPriority::Medium => Some(Duration::seconds(120)),
            AlarmPriority::Low => None,
        }
    }
}

impl fmt::Display for AlarmPriority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            AlarmPriority::Low => "LOW",
            AlarmPriority::Medium => "MEDIUM",
            AlarmPriority::High => "HIGH",
        };
        f.write_str(name)
    }
}

/// Which limit an alarm breached.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum BreachSide {
    Low,
    High,
}

/// Raw position of a value relative to the limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Below,
    Within,
    Above,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AlarmThreshold {
    pub vital: VitalType,
    pub low: f32,
    pub high: f32,
    /// Fraction of the limit a value must move back inside before an alarm
    /// clears, e.g. 0.05.
    pub hysteresis: f32,
    pub priority: AlarmPriority,
    pub enabled: bool,
}

impl AlarmThreshold {
    pub fn new(vital: VitalType, low: f32, high: f32, hysteresis: f32, priority: AlarmPriority) -> Self {
        Self {
            vital,
            low,
            high,
            hysteresis,
            priority,
            enabled: true,
        }
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    pub fn validate(&self) -> Result<(), ValidationFault> {
        let fault = |reason| ValidationFault::InvalidThreshold {
            vital: self.vital,
            reason,
        };
        if !self.low.is_finite() || !self.high.is_finite() || !self.hysteresis.is_finite() {
            return Err(fault("limits must be finite"));
        }
        if !(0.0..0.5).contains(&self.hysteresis) {
            return Err(fault("hysteresis must be within [0, 0.5)"));
        }
        if self.clear_above() >= self.clear_below() {
            return Err(fault("high limit must exceed low limit once hysteresis is removed"));
        }
        Ok(())
    }

    pub fn classify(&self, value: f32) -> Condition {
        if value < self.low {
            Condition::Below
        } else if value > self.high {
            Condition::Above
        } else {
            Condition::Within
        }
    }

    /// Whether `value` ends an excursion past `side`.
    pub fn clears(&self, side: BreachSide, value: f32) -> bool {
        match side {
            BreachSide::High => value <= self.clear_below(),
            BreachSide::Low => value >= self.clear_above(),
        }
    }

    /// A High breach clears at or below this.
    fn clear_below(&self) -> f32 {
        self.high * (1.0 - self.hysteresis)
    }

    /// A Low breach clears at or above this.
    fn clear_above(&self) -> f32 {
        self.low * (1.0 + self.hysteresis)
    }
}

/// The thresholds in force for one patient, at most one per vital type.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ThresholdSet {
    thresholds: Vec<AlarmThreshold>,
}

impl ThresholdSet {
    pub fn new(thresholds: Vec<AlarmThreshold>) -> Self {
        Self { thresholds }
    }

    /// HR 50–120 and SpO2 90–100 at high priority, RR 8–30 at medium.
    pub fn defaults() -> Self {
        Self::new(vec![
            AlarmThreshold::new(VitalType::HeartRate, 50.0, 120.0, 0.05, AlarmPriority::High),
            AlarmThreshold::new(VitalType::SpO2, 90.0, 100.0, 0.02, AlarmPriority::High),
            AlarmThreshold::new(VitalType::RespirationRate, 8.0, 30.0, 0.05, AlarmPriority::Medium),
        ])
    }

    pub fn get(&self, vital: VitalType) -> Option<&AlarmThreshold> {
        self.thresholds.iter().find(|t| t.vital == vital)
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlarmThreshold> {
        self.thresholds.iter()
    }

    pub fn validate(&self) -> Result<(), ValidationFault> {
        for (i, threshold) in self.thresholds.iter().enumerate() {
            threshold.validate()?;
            if self.thresholds[..i].iter().any(|t| t.vital == threshold.vital) {
                return Err(ValidationFault::InvalidThreshold {
                    vital: threshold.vital,
                    reason: "duplicate threshold for vital type",
                });
            }
        }
        Ok(())
    }
}

type Table = HashMap<Option<PatientContextId>, Arc<ThresholdSet>>;

/// Threshold sets keyed by patient, with `None` as the fallback for
/// patients without their own set.
///
/// Each update publishes a whole new table, so an evaluation always sees one
/// consistent set.
#[derive(Debug)]
pub struct ThresholdTable {
    table: ArcSwap<Table>,
}

impl ThresholdTable {
    pub fn new(defaults: ThresholdSet) -> Self {
        let mut table = Table::new();
        table.insert(None, Arc::new(defaults));
        Self {
            table: ArcSwap::from_pointee(table),
        }
    }

    pub fn for_patient(&self, patient: Option<PatientContextId>) -> Arc<ThresholdSet> {
        let table = self.table.load();
        table
            .get(&patient)
            .or_else(|| table.get(&None))
            .cloned()
            .unwrap_or_default()
    }

    /// Install `set` for `patient`, returning the published set.
    pub fn replace(&self, patient: Option<PatientContextId>, set: ThresholdSet) -> Arc<ThresholdSet> {
        let set = Arc::new(set);
        let mut next = Table::clone(&self.table.load());
        next.insert(patient, Arc::clone(&set));
        self.table.store(Arc::new(next));
        set
    }

    pub fn patients(&self) -> Vec<Option<PatientContextId>> {
        self.table.load().keys().copied().collect()
    }
}

impl Default for ThresholdTable {
    fn default() -> Self {
        Self::new(ThresholdSet::defaults())
    }
}

//! Alarm records, their history, and the published snapshot.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::VecDeque;
use std::fmt;

use super::threshold::{AlarmPriority, AlarmThreshold, BreachSide};
use crate::core::cache::{PatientContextId, VitalType};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct AlarmId(pub u64);

impl fmt::Display for AlarmId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AlarmState {
    Active,
    Acknowledged,
    Resolved,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Acknowledgement {
    pub by: String,
    pub at: DateTime<Utc>,
}

/// Time-bounded audio suppression of one alarm.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SilenceContext {
    pub alarm_id: AlarmId,
    pub silenced_at: DateTime<Utc>,
    pub requested_secs: i64,
    pub effective_secs: i64,
    pub expires_at: DateTime<Utc>,
    pub user: String,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AlarmRecord {
    pub id: AlarmId,
    pub vital: VitalType,
    pub patient: Option<PatientContextId>,
    pub priority: AlarmPriority,
    pub state: AlarmState,
    pub side: BreachSide,
    pub triggered_at: DateTime<Utc>,
    pub acknowledged: Option<Acknowledgement>,
    pub escalation_level: u8,
    pub triggering_value: f32,
    pub last_value: f32,
    pub last_seen: DateTime<Utc>,
    /// Limits in force when the alarm triggered.
    pub threshold: AlarmThreshold,
    pub silence: Option<SilenceContext>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl AlarmRecord {
    pub fn is_open(&self) -> bool {
        self.state != AlarmState::Resolved
    }

    pub fn is_silenced(&self) -> bool {
        self.silence.is_some()
    }

    /// Audible indication: only for unacknowledged, unsilenced alarms.
    pub fn audio_active(&self) -> bool {
        self.state == AlarmState::Active && !self.is_silenced()
    }

    /// Visual indication stays on until the alarm resolves; acknowledging
    /// or silencing never turns it off.
    pub fn visual_active(&self) -> bool {
        self.is_open()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Triggered,
    Acknowledged,
    Silenced,
    Unsilenced,
    Escalated,
    Resolved,
}

/// One lifecycle step of an alarm, carrying the record as it is after the
/// step.
#[derive(Debug, Clone, PartialEq)]
pub struct AlarmChange {
    pub alarm: AlarmRecord,
    pub kind: ChangeKind,
}

/// Immutable view of the open alarms, published after every change.
#[derive(Debug, Clone, Default)]
pub struct AlarmSnapshot {
    pub version: u64,
    pub taken_at: Option<DateTime<Utc>>,
    pub active: Vec<AlarmRecord>,
}

impl AlarmSnapshot {
    pub fn critical(&self) -> bool {
        self.active.iter().any(|a| a.priority == AlarmPriority::High)
    }

    pub fn audio_active(&self) -> bool {
        self.active.iter().any(AlarmRecord::audio_active)
    }
}

/// Bounded record of resolved alarms, newest last.
#[derive(Debug, Clone)]
pub struct AlarmHistory {
    capacity: usize,
    entries: VecDeque<AlarmRecord>,
    /// Newest entries not yet handed to storage.
    pending: usize,
}

impl AlarmHistory {
    pub fn with_capacity(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            entries: VecDeque::with_capacity(capacity),
            pending: 0,
        }
    }

    pub fn push(&mut self, record: AlarmRecord) {
        if self.entries.len() >= self.capacity {
            self.entries.pop_front();
        }
        self.entries.push_back(record);
        self.pending = (self.pending + 1).min(self.entries.len());
    }

    pub fn find(&self, id: AlarmId) -> Option<&AlarmRecord> {
        self.entries.iter().rev().find(|r| r.id == id)
    }

    /// Alarms triggered within `[start, end]`.
    pub fn between(&self, start: DateTime<Utc>, end: DateTime<Utc>) -> Vec<AlarmRecord> {
        self.entries
            .iter()
            .filter(|r| r.triggered_at >= start && r.triggered_at <= end)
            .cloned()
            .collect()
    }

    /// Copies of the entries not yet handed to storage, oldest first.
    pub fn unpersisted(&self) -> Vec<AlarmRecord> {
        let from = self.entries.len() - self.pending;
        self.entries.range(from..).cloned().collect()
    }

    /// Release the oldest `count` pending entries once storage has them.
    pub fn mark_handed_off(&mut self, count: usize) {
        self.pending = self.pending.saturating_sub(count);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &AlarmRecord> {
        self.entries.iter()
    }
}

//! The alarm state machine.
//!
//! Runs single-threaded on the real-time thread. Other threads see its state
//! only through [`AlarmSnapshot`]s.

use chrono::{DateTime, Duration, Utc};
use std::sync::Arc;

use super::record::{
    Acknowledgement, AlarmChange, AlarmHistory, AlarmId, AlarmRecord, AlarmSnapshot, AlarmState,
    ChangeKind, SilenceContext,
};
use super::threshold::{
    AlarmPriority, AlarmThreshold, BreachSide, Condition, ThresholdSet, ThresholdTable,
    GLOBAL_SILENCE_CEILING_SECS,
};
use crate::core::cache::{PatientContextId, VitalSample, VitalType};
use crate::error::StateFault;

/// Renders audio and visual indication for an alarm. Called after every
/// change with the updated record; implementations read
/// [`AlarmRecord::audio_active`], [`AlarmRecord::visual_active`] and the
/// escalation level.
pub trait AlarmIndicator: Send + Sync {
    fn indicate(&self, alarm: &AlarmRecord, change: ChangeKind);
}

/// Receives alarms that escalated to the top levels.
pub trait CriticalNotifier: Send + Sync {
    fn notify(&self, alarm: &AlarmRecord);
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogIndicator;

impl AlarmIndicator for LogIndicator {
    fn indicate(&self, alarm: &AlarmRecord, change: ChangeKind) {
        log::info!(
            "[{}] alarm {} {:?} {} {:?} (audio {}, visual {}, level {})",
            alarm.priority,
            alarm.id,
            change,
            alarm.vital,
            alarm.side,
            if alarm.audio_active() { "on" } else { "off" },
            if alarm.visual_active() { "on" } else { "off" },
            alarm.escalation_level
        );
    }
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

impl CriticalNotifier for LogNotifier {
    fn notify(&self, alarm: &AlarmRecord) {
        log::error!(
            "CRITICAL: alarm {} ({}) unacknowledged at escalation level {}",
            alarm.id,
            alarm.vital,
            alarm.escalation_level
        );
    }
}

#[derive(Debug, Clone)]
pub struct AlarmEngineConfig {
    pub escalation_tick: Duration,
    pub max_escalation: u8,
    /// Escalation level from which the critical notifier is signalled.
    pub critical_level: u8,
    pub history_capacity: usize,
}

impl Default for AlarmEngineConfig {
    fn default() -> Self {
        Self {
            escalation_tick: Duration::seconds(30),
            max_escalation: 3,
            critical_level: 2,
            history_capacity: 1000,
        }
    }
}

pub struct AlarmEngine {
    thresholds: Arc<ThresholdTable>,
    active: Vec<AlarmRecord>,
    history: AlarmHistory,
    indicator: Arc<dyn AlarmIndicator>,
    notifier: Arc<dyn CriticalNotifier>,
    config: AlarmEngineConfig,
    next_id: u64,
    last_escalation_pass: Option<DateTime<Utc>>,
    version: u64,
    published: u64,
}

impl AlarmEngine {
    pub fn new(
        thresholds: Arc<ThresholdTable>,
        indicator: Arc<dyn AlarmIndicator>,
        notifier: Arc<dyn CriticalNotifier>,
        config: AlarmEngineConfig,
    ) -> Self {
        Self {
            thresholds,
            active: Vec::with_capacity(VitalType::ALL.len() * 4),
            history: AlarmHistory::with_capacity(config.history_capacity),
            indicator,
            notifier,
            config,
            next_id: 1,
            last_escalation_pass: None,
            version: 0,
            published: 0,
        }
    }

    /// Engine with logging collaborators and default settings.
    pub fn with_defaults(thresholds: Arc<ThresholdTable>) -> Self {
        Self::new(
            thresholds,
            Arc::new(LogIndicator),
            Arc::new(LogNotifier),
            AlarmEngineConfig::default(),
        )
    }

    pub fn thresholds(&self) -> &Arc<ThresholdTable> {
        &self.thresholds
    }

    /// Evaluate one sample against every enabled threshold for its patient.
    pub fn evaluate(&mut self, sample: &VitalSample) -> Vec<AlarmChange> {
        let set = self.thresholds.for_patient(sample.patient);
        let mut changes = Vec::new();

        for vital in VitalType::ALL {
            let Some(value) = sample.value(vital) else {
                continue;
            };
            let Some(threshold) = set.get(vital).filter(|t| t.enabled) else {
                continue;
            };
            self.evaluate_one(threshold, sample.patient, value, sample.timestamp, &mut changes);
        }
        changes
    }

    fn evaluate_one(
        &mut self,
        threshold: &AlarmThreshold,
        patient: Option<PatientContextId>,
        value: f32,
        at: DateTime<Utc>,
        changes: &mut Vec<AlarmChange>,
    ) {
        if let Some(i) = self.position(threshold.vital, patient) {
            let side = self.active[i].side;
            if !threshold.clears(side, value) {
                let alarm = &mut self.active[i];
                alarm.last_value = value;
                alarm.last_seen = at;
                return;
            }
            self.active[i].last_value = value;
            self.active[i].last_seen = at;
            changes.push(self.resolve(i, at));
        }

        // A value that cleared one side may already breach the other.
        let side = match threshold.classify(value) {
            Condition::Within => return,
            Condition::Below => BreachSide::Low,
            Condition::Above => BreachSide::High,
        };
        changes.push(self.trigger(threshold, patient, side, value, at));
    }

    fn position(&self, vital: VitalType, patient: Option<PatientContextId>) -> Option<usize> {
        self.active
            .iter()
            .position(|a| a.vital == vital && a.patient == patient)
    }

    fn trigger(
        &mut self,
        threshold: &AlarmThreshold,
        patient: Option<PatientContextId>,
        side: BreachSide,
        value: f32,
        at: DateTime<Utc>,
    ) -> AlarmChange {
        let record = AlarmRecord {
            id: AlarmId(self.next_id),
            vital: threshold.vital,
            patient,
            priority: threshold.priority,
            state: AlarmState::Active,
            side,
            triggered_at: at,
            acknowledged: None,
            escalation_level: 0,
            triggering_value: value,
            last_value: value,
            last_seen: at,
            threshold: *threshold,
            silence: None,
            resolved_at: None,
        };
        self.next_id += 1;
        self.active.push(record.clone());
        self.changed(record, ChangeKind::Triggered)
    }

    fn resolve(&mut self, index: usize, at: DateTime<Utc>) -> AlarmChange {
        let mut record = self.active.remove(index);
        record.state = AlarmState::Resolved;
        record.resolved_at = Some(at);
        record.silence = None;
        self.history.push(record.clone());
        self.changed(record, ChangeKind::Resolved)
    }

    fn changed(&mut self, alarm: AlarmRecord, kind: ChangeKind) -> AlarmChange {
        self.version += 1;
        self.indicator.indicate(&alarm, kind);
        AlarmChange { alarm, kind }
    }

    fn index_of(&self, id: AlarmId) -> Result<usize, StateFault> {
        self.active
            .iter()
            .position(|a| a.id == id)
            .ok_or(StateFault::NotFound(id))
    }

    /// Acknowledge an active alarm. Audio stops and escalation freezes; the
    /// visual indication stays until the alarm resolves.
    pub fn acknowledge(&mut self, id: AlarmId, user: &str, now: DateTime<Utc>) -> Result<AlarmChange, StateFault> {
        let i = self.index_of(id).map_err(|fault| match self.history.find(id) {
            Some(resolved) => StateFault::InvalidState {
                id,
                state: resolved.state,
            },
            None => fault,
        })?;
        let alarm = &mut self.active[i];
        if alarm.state != AlarmState::Active {
            return Err(StateFault::InvalidState {
                id,
                state: alarm.state,
            });
        }
        alarm.state = AlarmState::Acknowledged;
        alarm.acknowledged = Some(Acknowledgement {
            by: user.to_string(),
            at: now,
        });
        let record = alarm.clone();
        Ok(self.changed(record, ChangeKind::Acknowledged))
    }

    /// Suppress audio for up to the priority's ceiling. Longer requests are
    /// clamped, not rejected.
    pub fn silence(
        &mut self,
        id: AlarmId,
        requested: Duration,
        user: &str,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<AlarmChange, StateFault> {
        if requested <= Duration::zero() {
            return Err(StateFault::InvalidDuration);
        }
        let i = self.index_of(id)?;
        let alarm = &mut self.active[i];
        let ceiling = alarm
            .priority
            .silence_ceiling()
            .min(Duration::seconds(GLOBAL_SILENCE_CEILING_SECS));
        let effective = requested.min(ceiling);

        alarm.silence = Some(SilenceContext {
            alarm_id: id,
            silenced_at: now,
            requested_secs: requested.num_seconds(),
            effective_secs: effective.num_seconds(),
            expires_at: now + effective,
            user: user.to_string(),
            reason,
        });
        let record = alarm.clone();
        Ok(self.changed(record, ChangeKind::Silenced))
    }

    pub fn unsilence(&mut self, id: AlarmId, user: &str, _now: DateTime<Utc>) -> Result<AlarmChange, StateFault> {
        let i = self.index_of(id)?;
        let alarm = &mut self.active[i];
        if alarm.silence.take().is_none() {
            return Err(StateFault::InvalidState {
                id,
                state: alarm.state,
            });
        }
        log::debug!("Alarm {} unsilenced by {}", id, user);
        let record = alarm.clone();
        Ok(self.changed(record, ChangeKind::Unsilenced))
    }

    /// Expire silences, then run an escalation pass if one is due.
    pub fn tick(&mut self, now: DateTime<Utc>) -> Vec<AlarmChange> {
        let mut changes = Vec::new();

        for i in 0..self.active.len() {
            let expired = self.active[i]
                .silence
                .as_ref()
                .map(|s| s.expires_at <= now)
                .unwrap_or(false);
            if expired {
                self.active[i].silence = None;
                let record = self.active[i].clone();
                changes.push(self.changed(record, ChangeKind::Unsilenced));
            }
        }

        let due = self
            .last_escalation_pass
            .map(|last| now - last >= self.config.escalation_tick)
            .unwrap_or(true);
        if due {
            self.last_escalation_pass = Some(now);
            self.escalate(now, &mut changes);
        }
        changes
    }

    fn escalate(&mut self, now: DateTime<Utc>, changes: &mut Vec<AlarmChange>) {
        for i in 0..self.active.len() {
            let alarm = &self.active[i];
            if alarm.state != AlarmState::Active || alarm.escalation_level >= self.config.max_escalation {
                continue;
            }
            let Some(delay) = alarm.priority.escalation_delay() else {
                continue;
            };
            if now - alarm.triggered_at < delay {
                continue;
            }

            self.active[i].escalation_level += 1;
            let record = self.active[i].clone();
            if record.escalation_level >= self.config.critical_level {
                self.notifier.notify(&record);
            }
            changes.push(self.changed(record, ChangeKind::Escalated));
        }
    }

    /// Install a new threshold set for `patient` (`None` for the default
    /// set) and re-check open alarms that now evaluate against it.
    ///
    /// Open alarms whose last value falls inside the new band, or whose
    /// threshold is now disabled or missing, resolve immediately. Resolved
    /// alarms are never reopened.
    pub fn update_thresholds(
        &mut self,
        patient: Option<PatientContextId>,
        set: ThresholdSet,
        now: DateTime<Utc>,
    ) -> Result<Vec<AlarmChange>, StateFault> {
        set.validate()?;
        let installed = self.thresholds.replace(patient, set);
        let mut changes = Vec::new();

        let mut i = 0;
        while i < self.active.len() {
            let alarm = &self.active[i];
            let governing = self.thresholds.for_patient(alarm.patient);
            if !Arc::ptr_eq(&governing, &installed) {
                i += 1;
                continue;
            }
            let clears = match governing.get(alarm.vital) {
                Some(t) if t.enabled => t.clears(alarm.side, alarm.last_value),
                _ => true,
            };
            if clears {
                changes.push(self.resolve(i, now));
            } else {
                i += 1;
            }
        }
        Ok(changes)
    }

    /// Look up an alarm, open or resolved.
    pub fn find(&self, id: AlarmId) -> Option<AlarmRecord> {
        self.active
            .iter()
            .find(|a| a.id == id)
            .or_else(|| self.history.find(id))
            .cloned()
    }

    pub fn active(&self) -> &[AlarmRecord] {
        &self.active
    }

    pub fn history(&self) -> &AlarmHistory {
        &self.history
    }

    /// Resolved alarms not yet handed to storage.
    pub fn pending_resolved(&self) -> Vec<AlarmRecord> {
        self.history.unpersisted()
    }

    /// Storage accepted the oldest `count` pending resolved alarms.
    pub fn release_resolved(&mut self, count: usize) {
        self.history.mark_handed_off(count);
    }

    pub fn critical_active(&self) -> bool {
        self.active.iter().any(|a| a.priority == AlarmPriority::High)
    }

    pub fn snapshot(&self, now: DateTime<Utc>) -> Arc<AlarmSnapshot> {
        Arc::new(AlarmSnapshot {
            version: self.version,
            taken_at: Some(now),
            active: self.active.clone(),
        })
    }

    /// A fresh snapshot if anything changed since the last one taken here.
    pub fn publish_if_changed(&mut self, now: DateTime<Utc>) -> Option<Arc<AlarmSnapshot>> {
        if self.published == self.version {
            return None;
        }
        self.published = self.version;
        Some(self.snapshot(now))
    }
}

//! The real-time path: frames in, samples cached, alarms evaluated, events
//! out.
//!
//! Everything here runs on one dedicated OS thread. It never blocks on
//! another thread: hand-offs use `try_send`, operator input uses
//! `try_recv`, and every poll is bounded.

use chrono::{DateTime, Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use super::events::{Connectivity, DegradedIndicator, EventBus, MonitorEvent};
use super::operator::OperatorCommand;
use super::persistence::PersistRequest;
use super::telemetry::{BatchAccumulator, TelemetryBatch};
use crate::core::alarm::{AlarmChange, AlarmEngine, AlarmSnapshot, ChangeKind};
use crate::core::cache::{ChannelId, VitalSample, VitalsCache, WaveformCache, WaveformSample};
use crate::core::clock::{from_epoch_ns, Clock};
use crate::core::scheduler::{CpuBudget, HeartbeatSlot, PriorityControl, ThreadRef};
use crate::core::transport::{
    Frame, FrameKind, SessionState, SessionTransition, StopHandle, TransportSession, WaveformFrame,
};
use crate::error::{CapacityFault, TransportFault, ValidationFault};

#[derive(Debug, Clone)]
pub struct OrchestratorConfig {
    /// Frames handled per loop iteration before periodic work runs.
    pub frames_per_poll: usize,
    pub stall_check_interval: Duration,
    /// Minimum spacing of waveform update events per channel.
    pub render_tick: Duration,
    pub persist_interval: Duration,
    pub batch_max_samples: usize,
    pub batch_max_duration: Duration,
    /// Operator commands drained per iteration.
    pub commands_per_poll: usize,
    /// Samples stamped further than this ahead of the clock are rejected.
    pub max_clock_skew: Duration,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            frames_per_poll: 10,
            stall_check_interval: Duration::from_millis(100),
            render_tick: Duration::from_millis(33),
            persist_interval: Duration::from_secs(5 * 60),
            batch_max_samples: 100,
            batch_max_duration: Duration::from_secs(10),
            commands_per_poll: 8,
            max_clock_skew: Duration::from_secs(5),
        }
    }
}

/// Channels connecting the real-time thread to the rest of the process.
pub struct OrchestratorLinks {
    pub telemetry: mpsc::Sender<TelemetryBatch>,
    pub persistence: mpsc::Sender<PersistRequest>,
    pub operator: mpsc::Receiver<OperatorCommand>,
    pub snapshots: watch::Sender<Arc<AlarmSnapshot>>,
}

/// Shared state the orchestrator writes into.
#[derive(Clone)]
pub struct SharedState {
    pub vitals: Arc<VitalsCache>,
    pub waveforms: Arc<WaveformCache>,
    pub bus: Arc<EventBus>,
    pub degraded: Arc<DegradedIndicator>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrchestratorStats {
    pub vitals_accepted: u64,
    pub waveform_frames: u64,
    pub heartbeat_frames: u64,
    pub out_of_sequence: u64,
    pub invalid_samples: u64,
    /// Evaluated but not cached because an older timestamp arrived late.
    pub not_cached: u64,
    pub transport_faults: u64,
    pub telemetry_dropped: u64,
    pub persist_dropped: u64,
}

/// What one iteration did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IterationSummary {
    pub frames: usize,
    pub alarm_changes: usize,
    pub stopped: bool,
}

pub struct Orchestrator {
    session: TransportSession,
    engine: AlarmEngine,
    shared: SharedState,
    links: OrchestratorLinks,
    clock: Arc<dyn Clock>,
    config: OrchestratorConfig,
    batches: BatchAccumulator,
    last_sequence: HashMap<(FrameKind, u8), u64>,
    last_waveform_event: HashMap<u8, u64>,
    last_stall_check_ns: u64,
    last_persist_ns: u64,
    last_heartbeat_frame: Option<DateTime<Utc>>,
    critical: bool,
    stats: OrchestratorStats,
    resync: Arc<AtomicBool>,
}

impl std::fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Orchestrator")
            .field("session", &self.session)
            .field("critical", &self.critical)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Orchestrator {
    pub fn new(
        session: TransportSession,
        engine: AlarmEngine,
        shared: SharedState,
        links: OrchestratorLinks,
        clock: Arc<dyn Clock>,
        config: OrchestratorConfig,
    ) -> Self {
        let now_ns = clock.monotonic_ns();
        let batches = BatchAccumulator::new(
            config.batch_max_samples,
            ChronoDuration::from_std(config.batch_max_duration).unwrap_or_else(|_| ChronoDuration::seconds(10)),
        );
        shared.bus.publish(MonitorEvent::Connectivity(Connectivity::Connected));
        Self {
            session,
            engine,
            shared,
            links,
            clock,
            config,
            batches,
            last_sequence: HashMap::new(),
            last_waveform_event: HashMap::new(),
            last_stall_check_ns: now_ns,
            last_persist_ns: now_ns,
            last_heartbeat_frame: None,
            critical: false,
            stats: OrchestratorStats::default(),
            resync: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn stats(&self) -> OrchestratorStats {
        self.stats
    }

    pub fn engine(&self) -> &AlarmEngine {
        &self.engine
    }

    pub fn session(&self) -> &TransportSession {
        &self.session
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.session.stop_handle()
    }

    /// Flag that makes the next iteration drop the transport backlog. Set
    /// by the watchdog's restart hook.
    pub fn resync_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.resync)
    }

    /// Wall-clock time of the last heartbeat frame received.
    pub fn last_heartbeat_frame(&self) -> Option<DateTime<Utc>> {
        self.last_heartbeat_frame
    }

    /// One bounded pass: frames, operator input, then periodic work.
    pub fn run_iteration(&mut self) -> IterationSummary {
        let mut summary = IterationSummary::default();

        if self.resync.swap(false, Ordering::AcqRel) {
            let skipped = self.session.resync();
            self.last_sequence.clear();
            log::warn!("Real-time loop restarted, skipped {} backlogged frame(s)", skipped);
        }

        for _ in 0..self.config.frames_per_poll {
            match self.session.poll_next() {
                Ok(Some(frame)) => {
                    summary.frames += 1;
                    summary.alarm_changes += self.handle_frame(frame);
                }
                Ok(None) => break,
                Err(TransportFault::Stopped) => {
                    summary.stopped = true;
                    return summary;
                }
                Err(fault) => {
                    self.stats.transport_faults += 1;
                    log::warn!("{}", fault);
                }
            }
        }

        summary.alarm_changes += self.drain_operator();
        summary.alarm_changes += self.periodic();
        summary
    }

    /// Route one decoded frame. Returns the number of alarm changes.
    pub fn handle_frame(&mut self, frame: Frame) -> usize {
        let (kind, channel) = frame.source();
        let sequence = frame.sequence();
        if let Some(&last) = self.last_sequence.get(&(kind, channel)) {
            if sequence <= last {
                self.stats.out_of_sequence += 1;
                log::warn!(
                    "{}",
                    ValidationFault::OutOfSequence {
                        channel,
                        sequence,
                        last
                    }
                );
                return 0;
            }
        }
        self.last_sequence.insert((kind, channel), sequence);

        match frame {
            Frame::Vitals(vitals) => match VitalSample::from_frame(&vitals).and_then(|s| self.check_skew(s)) {
                Ok(sample) => self.handle_vitals(sample),
                Err(fault) => {
                    self.stats.invalid_samples += 1;
                    log::warn!("Frame {} rejected: {}", sequence, fault);
                    0
                }
            },
            Frame::Waveform(waveform) => {
                self.handle_waveform(&waveform);
                0
            }
            Frame::Heartbeat(beat) => {
                self.stats.heartbeat_frames += 1;
                self.last_heartbeat_frame = Some(from_epoch_ns(beat.timestamp_ns));
                0
            }
        }
    }

    /// A sample from the future would become the cache's newest entry, make
    /// every later sample out of order and drag the retention horizon along.
    fn check_skew(&self, sample: VitalSample) -> Result<VitalSample, ValidationFault> {
        let now = self.clock.now();
        let tolerance = ChronoDuration::from_std(self.config.max_clock_skew).unwrap_or(ChronoDuration::MAX);
        match now.checked_add_signed(tolerance) {
            Some(limit) if sample.timestamp > limit => Err(ValidationFault::FromFuture {
                timestamp_ms: sample.timestamp.timestamp_millis(),
                now_ms: now.timestamp_millis(),
                tolerance_ms: tolerance.num_milliseconds(),
            }),
            _ => Ok(sample),
        }
    }

    fn handle_vitals(&mut self, sample: VitalSample) -> usize {
        match self.shared.vitals.append(sample) {
            Ok(Some(pressure)) => {
                log::warn!("{}", pressure);
                self.shared.bus.publish(MonitorEvent::CapacityWarning(pressure));
            }
            Ok(None) => {}
            // Still a valid reading: it is evaluated, only the history skips it.
            Err(fault) => {
                self.stats.not_cached += 1;
                log::warn!("Sample {} not cached: {}", sample.sequence, fault);
            }
        }
        self.stats.vitals_accepted += 1;

        let changes = self.engine.evaluate(&sample);
        self.shared.bus.publish(MonitorEvent::VitalsUpdated(sample));

        let now = self.clock.now();
        if let Some(batch) = self.batches.add_sample(sample, now) {
            self.hand_off_batch(batch);
        }
        self.dispatch(changes, now)
    }

    fn handle_waveform(&mut self, frame: &WaveformFrame) {
        self.stats.waveform_frames += 1;
        let start = from_epoch_ns(frame.timestamp_ns);
        let rate = frame.sample_rate_hz;
        let step_ns = if rate > 0.0 { (1e9 / rate as f64) as i64 } else { 0 };

        let mut latest = start;
        for (i, &value) in frame.samples().iter().enumerate() {
            latest = start + ChronoDuration::nanoseconds(step_ns * i as i64);
            self.shared.waveforms.append(WaveformSample {
                timestamp: latest,
                channel: ChannelId(frame.channel),
                sample_rate_hz: rate,
                value,
            });
        }

        let now_ns = self.clock.monotonic_ns();
        let due = self
            .last_waveform_event
            .get(&frame.channel)
            .map(|&last| now_ns.saturating_sub(last) >= self.config.render_tick.as_nanos() as u64)
            .unwrap_or(true);
        if due {
            self.last_waveform_event.insert(frame.channel, now_ns);
            self.shared.bus.publish(MonitorEvent::WaveformWindowUpdated {
                channel: ChannelId(frame.channel),
                latest,
                total_written: self.shared.waveforms.total_written(),
            });
        }
    }

    /// Publish alarm changes, fold them into telemetry, and refresh the
    /// critical flag and the snapshot.
    fn dispatch(&mut self, changes: Vec<AlarmChange>, now: DateTime<Utc>) -> usize {
        let count = changes.len();
        for change in changes {
            if matches!(change.kind, ChangeKind::Triggered | ChangeKind::Resolved) {
                self.batches.add_alarm(change.alarm.clone(), now);
            }
            self.shared.bus.publish(MonitorEvent::AlarmChanged(change));
        }

        let critical = self.engine.critical_active();
        if critical != self.critical {
            self.critical = critical;
            self.shared.bus.publish(MonitorEvent::CriticalAlarmActive(critical));
        }
        if let Some(snapshot) = self.engine.publish_if_changed(now) {
            // No receivers is fine; the next subscriber gets the latest.
            let _ = self.links.snapshots.send(snapshot);
        }
        count
    }

    fn drain_operator(&mut self) -> usize {
        let mut changes = 0;
        for _ in 0..self.config.commands_per_poll {
            let Ok(command) = self.links.operator.try_recv() else {
                break;
            };
            let now = self.clock.now();
            let result = command.apply(&mut self.engine, now);
            changes += self.dispatch(result, now);
        }
        changes
    }

    fn periodic(&mut self) -> usize {
        let now_ns = self.clock.monotonic_ns();
        let now = self.clock.now();

        if now_ns.saturating_sub(self.last_stall_check_ns) >= self.config.stall_check_interval.as_nanos() as u64 {
            self.last_stall_check_ns = now_ns;
            self.check_connectivity();
        }

        let changes = self.engine.tick(now);
        let count = self.dispatch(changes, now);

        if let Some(batch) = self.batches.poll(now) {
            self.hand_off_batch(batch);
        }

        if now_ns.saturating_sub(self.last_persist_ns) >= self.config.persist_interval.as_nanos() as u64 {
            self.last_persist_ns = now_ns;
            self.request_persist(now);
        }
        count
    }

    fn check_connectivity(&mut self) {
        match self.session.check_stall() {
            Some(SessionTransition::Stalled(fault)) => {
                log::warn!("{}", fault);
                self.shared.degraded.set_transport(true);
                self.shared
                    .bus
                    .publish(MonitorEvent::Connectivity(Connectivity::Degraded(fault)));
            }
            Some(SessionTransition::Resumed) => {
                log::info!("Frame source resumed");
                self.shared.degraded.set_transport(false);
                self.shared.bus.publish(MonitorEvent::Connectivity(Connectivity::Restored));
            }
            None => {}
        }
    }

    fn hand_off_batch(&mut self, batch: TelemetryBatch) {
        if let Err(mpsc::error::TrySendError::Full(batch)) = self.links.telemetry.try_send(batch) {
            self.stats.telemetry_dropped += 1;
            let fault = CapacityFault::ChannelFull {
                channel: "telemetry",
                dropped: self.stats.telemetry_dropped,
            };
            log::warn!("{}, batch {} dropped", fault, batch.id());
        }
    }

    /// Ask the storage worker to persist. Resolved alarms travel with the
    /// request and stay pending until it is queued, so a full channel
    /// leaves them for the next request.
    pub fn request_persist(&mut self, now: DateTime<Utc>) {
        let request = PersistRequest {
            requested_at: now,
            resolved_alarms: self.engine.pending_resolved(),
        };
        let handed = request.resolved_alarms.len();
        match self.links.persistence.try_send(request) {
            Ok(()) => self.engine.release_resolved(handed),
            Err(mpsc::error::TrySendError::Full(request)) | Err(mpsc::error::TrySendError::Closed(request)) => {
                self.stats.persist_dropped += 1;
                log::warn!(
                    "{}, {} resolved alarm(s) kept for the next request",
                    CapacityFault::ChannelFull {
                        channel: "persistence",
                        dropped: self.stats.persist_dropped,
                    },
                    request.resolved_alarms.len()
                );
            }
        }
    }

    /// Stop the session and flush what the workers should still see.
    pub fn shutdown(&mut self) {
        let now = self.clock.now();
        if let Ok(batch) = self.batches.close(now) {
            self.hand_off_batch(batch);
        }
        self.request_persist(now);
        if self.session.state() != SessionState::Stopped {
            self.session.stop();
        }
        self.shared
            .bus
            .publish(MonitorEvent::Connectivity(Connectivity::Disconnected));
    }

    /// Run iterations until the session stops, pacing each with `budget`
    /// and beating `slot` once per iteration.
    pub fn run(mut self, slot: Arc<HeartbeatSlot>, budget: CpuBudget) -> Self {
        slot.bind(ThreadRef::current());
        loop {
            let timer = budget.start();
            let summary = self.run_iteration();
            if summary.alarm_changes > 0 {
                budget.yield_point();
            }
            let report = budget.finish(&timer);
            slot.record_iteration(report.overran);
            slot.beat(self.clock.monotonic_ns());
            if summary.stopped {
                break;
            }
            budget.pace(&timer);
        }
        self.shutdown();
        log::info!("Real-time loop stopped: {:?}", self.stats);
        self
    }
}

/// Start the orchestrator on its own OS thread at the real-time tier.
pub fn spawn_realtime(
    orchestrator: Orchestrator,
    slot: Arc<HeartbeatSlot>,
    budget: CpuBudget,
    control: Arc<dyn PriorityControl>,
) -> io::Result<JoinHandle<Orchestrator>> {
    std::thread::Builder::new()
        .name("bedside-rt".to_string())
        .spawn(move || {
            if let Err(e) = control.set_priority_tier(ThreadRef::current(), slot.tier()) {
                log::warn!("Running without real-time priority: {}", e);
            }
            orchestrator.run(slot, budget)
        })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::alarm::ThresholdTable;
    use crate::core::cache::VitalsCacheConfig;
    use crate::core::monitor::operator::OperatorHandle;
    use crate::core::clock::{to_epoch_ns, ManualClock};
    use crate::core::transport::{connect, HeartbeatFrame, LocalHandleSource, RingWriter, VitalsFrame};

    struct Rig {
        orchestrator: Orchestrator,
        writer: RingWriter,
        clock: ManualClock,
        events: mpsc::Receiver<MonitorEvent>,
        telemetry: mpsc::Receiver<TelemetryBatch>,
        persist: mpsc::Receiver<PersistRequest>,
        snapshots: watch::Receiver<Arc<AlarmSnapshot>>,
        shared: SharedState,
    }

    fn rig(config: OrchestratorConfig) -> Rig {
        let clock = ManualClock::default();
        let (mut source, writer) = LocalHandleSource::pair(64).unwrap();
        let session = connect(&mut source, Arc::new(clock.clone()), Duration::from_millis(500)).unwrap();
        let shared = SharedState {
            vitals: Arc::new(VitalsCache::new(VitalsCacheConfig::default())),
            waveforms: Arc::new(WaveformCache::new(1024)),
            bus: Arc::new(EventBus::new()),
            degraded: Arc::new(DegradedIndicator::new()),
        };
        let events = shared.bus.subscribe("test", 256);
        let (telemetry_tx, telemetry) = mpsc::channel(4);
        let (persist_tx, persist) = mpsc::channel(4);
        let (_operator, operator_rx) = OperatorHandle::channel(4);
        let (snapshot_tx, snapshots) = watch::channel(Arc::new(AlarmSnapshot::default()));
        let orchestrator = Orchestrator::new(
            session,
            AlarmEngine::with_defaults(Arc::new(ThresholdTable::default())),
            shared.clone(),
            OrchestratorLinks {
                telemetry: telemetry_tx,
                persistence: persist_tx,
                operator: operator_rx,
                snapshots: snapshot_tx,
            },
            Arc::new(clock.clone()),
            config,
        );
        Rig {
            orchestrator,
            writer,
            clock,
            events,
            telemetry,
            persist,
            snapshots,
            shared,
        }
    }

    fn vitals(clock: &ManualClock, sequence: u64, hr: f32) -> Frame {
        Frame::Vitals(VitalsFrame {
            sequence,
            timestamp_ns: to_epoch_ns(clock.now()),
            patient: 0,
            heart_rate: Some(hr),
            spo2: Some(97.0),
            respiration_rate: Some(14.0),
        })
    }

    fn vitals_stamped(sequence: u64, at: DateTime<Utc>, hr: f32) -> Frame {
        Frame::Vitals(VitalsFrame {
            sequence,
            timestamp_ns: to_epoch_ns(at),
            patient: 0,
            heart_rate: Some(hr),
            spo2: Some(97.0),
            respiration_rate: Some(14.0),
        })
    }

    fn drain(events: &mut mpsc::Receiver<MonitorEvent>) -> Vec<MonitorEvent> {
        let mut out = Vec::new();
        while let Ok(event) = events.try_recv() {
            out.push(event);
        }
        out
    }

    #[test]
    fn test_vitals_flow_through_cache_engine_and_events() {
        let mut rig = rig(OrchestratorConfig::default());
        let frame = vitals(&rig.clock, 1, 130.0);
        rig.writer.publish(&frame, rig.clock.monotonic_ns());

        let summary = rig.orchestrator.run_iteration();
        assert_eq!(summary.frames, 1);
        assert_eq!(rig.shared.vitals.len(), 1);

        let events = drain(&mut rig.events);
        assert!(events.iter().any(|e| matches!(e, MonitorEvent::VitalsUpdated(_))));
        assert!(events
            .iter()
            .any(|e| matches!(e, MonitorEvent::AlarmChanged(c) if c.kind == ChangeKind::Triggered)));
        assert!(events.iter().any(|e| matches!(e, MonitorEvent::CriticalAlarmActive(true))));
        assert_eq!(rig.snapshots.borrow().active.len(), 1);
    }

    #[test]
    fn test_stale_sequence_dropped() {
        let mut rig = rig(OrchestratorConfig::default());
        let now = rig.clock.monotonic_ns();
        rig.writer.publish(&vitals(&rig.clock, 5, 80.0), now);
        rig.writer.publish(&vitals(&rig.clock, 5, 80.0), now);
        rig.writer.publish(&vitals(&rig.clock, 4, 80.0), now);
        rig.writer.publish(&vitals(&rig.clock, 6, 80.0), now);

        rig.orchestrator.run_iteration();
        assert_eq!(rig.orchestrator.stats().out_of_sequence, 2);
        assert_eq!(rig.shared.vitals.len(), 2);
    }

    #[test]
    fn test_impossible_value_not_cached_or_evaluated() {
        let mut rig = rig(OrchestratorConfig::default());
        rig.writer.publish(&vitals(&rig.clock, 1, 400.0), rig.clock.monotonic_ns());
        rig.orchestrator.run_iteration();

        assert!(rig.shared.vitals.is_empty());
        assert!(rig.orchestrator.engine().active().is_empty());
        assert_eq!(rig.orchestrator.stats().invalid_samples, 1);
    }

    #[test]
    fn test_future_stamped_frame_rejected_and_alarms_keep_working() {
        let mut rig = rig(OrchestratorConfig::default());
        let now = rig.clock.monotonic_ns();
        for seq in 1..=5 {
            rig.writer.publish(&vitals(&rig.clock, seq, 80.0), now);
        }
        let skewed = rig.clock.now() + ChronoDuration::days(1);
        rig.writer.publish(&vitals_stamped(6, skewed, 80.0), now);
        rig.orchestrator.run_iteration();
        assert_eq!(rig.orchestrator.stats().invalid_samples, 1);
        assert_eq!(rig.shared.vitals.len(), 5);

        rig.clock.advance(Duration::from_secs(10));
        for seq in 7..=11 {
            rig.writer.publish(&vitals(&rig.clock, seq, 160.0), rig.clock.monotonic_ns());
        }
        rig.orchestrator.run_iteration();

        assert_eq!(rig.orchestrator.stats().invalid_samples, 1);
        assert_eq!(rig.shared.vitals.len(), 10);
        assert_eq!(rig.orchestrator.engine().active().len(), 1);
        assert!(rig.shared.vitals.latest().unwrap().timestamp < skewed);
    }

    #[test]
    fn test_late_sample_evaluated_even_when_not_cached() {
        let mut rig = rig(OrchestratorConfig::default());
        let now = rig.clock.monotonic_ns();
        let ahead = rig.clock.now() + ChronoDuration::seconds(3);
        rig.writer.publish(&vitals_stamped(1, ahead, 80.0), now);
        rig.writer.publish(&vitals(&rig.clock, 2, 160.0), now);
        rig.orchestrator.run_iteration();

        let stats = rig.orchestrator.stats();
        assert_eq!(stats.invalid_samples, 0);
        assert_eq!(stats.not_cached, 1);
        assert_eq!(stats.vitals_accepted, 2);
        assert_eq!(rig.shared.vitals.len(), 1);
        assert_eq!(rig.orchestrator.engine().active().len(), 1);
    }

    #[test]
    fn test_resolved_alarms_kept_when_persist_channel_full() {
        let mut rig = rig(OrchestratorConfig::default());
        for _ in 0..4 {
            rig.orchestrator.request_persist(rig.clock.now());
        }

        let now = rig.clock.monotonic_ns();
        rig.writer.publish(&vitals(&rig.clock, 1, 130.0), now);
        rig.writer.publish(&vitals(&rig.clock, 2, 80.0), now);
        rig.orchestrator.run_iteration();
        assert_eq!(rig.orchestrator.engine().pending_resolved().len(), 1);

        rig.orchestrator.request_persist(rig.clock.now());
        assert_eq!(rig.orchestrator.stats().persist_dropped, 1);
        assert_eq!(rig.orchestrator.engine().pending_resolved().len(), 1);

        for _ in 0..4 {
            assert!(rig.persist.try_recv().unwrap().resolved_alarms.is_empty());
        }
        rig.orchestrator.request_persist(rig.clock.now());
        let request = rig.persist.try_recv().unwrap();
        assert_eq!(request.resolved_alarms.len(), 1);
        assert!(rig.orchestrator.engine().pending_resolved().is_empty());
    }

    #[test]
    fn test_frames_per_poll_bounded() {
        let mut rig = rig(OrchestratorConfig::default());
        for seq in 1..=15 {
            rig.writer.publish(&vitals(&rig.clock, seq, 80.0), rig.clock.monotonic_ns());
        }
        assert_eq!(rig.orchestrator.run_iteration().frames, 10);
        assert_eq!(rig.orchestrator.run_iteration().frames, 5);
    }

    #[test]
    fn test_waveform_events_throttled() {
        let mut rig = rig(OrchestratorConfig::default());
        let ts = to_epoch_ns(rig.clock.now());
        for seq in 1..=3 {
            let frame = Frame::Waveform(WaveformFrame::new(seq, ts, 0, 250.0, &[0.1, 0.2, 0.3]));
            rig.writer.publish(&frame, rig.clock.monotonic_ns());
        }
        rig.orchestrator.run_iteration();

        let updates = drain(&mut rig.events)
            .into_iter()
            .filter(|e| matches!(e, MonitorEvent::WaveformWindowUpdated { .. }))
            .count();
        assert_eq!(updates, 1);
        assert_eq!(rig.shared.waveforms.total_written(), 9);

        rig.clock.advance(Duration::from_millis(40));
        let frame = Frame::Waveform(WaveformFrame::new(4, ts, 0, 250.0, &[0.4]));
        rig.writer.publish(&frame, rig.clock.monotonic_ns());
        rig.orchestrator.run_iteration();
        assert!(drain(&mut rig.events)
            .iter()
            .any(|e| matches!(e, MonitorEvent::WaveformWindowUpdated { .. })));
    }

    #[test]
    fn test_batch_handed_to_telemetry_when_full() {
        let mut rig = rig(OrchestratorConfig {
            batch_max_samples: 3,
            ..OrchestratorConfig::default()
        });
        for seq in 1..=3 {
            rig.clock.advance(Duration::from_secs(1));
            rig.writer.publish(&vitals(&rig.clock, seq, 80.0), rig.clock.monotonic_ns());
        }
        rig.orchestrator.run_iteration();
        let batch = rig.telemetry.try_recv().unwrap();
        assert_eq!(batch.samples().len(), 3);
    }

    #[test]
    fn test_persist_request_sent_on_interval() {
        let mut rig = rig(OrchestratorConfig {
            persist_interval: Duration::from_secs(60),
            ..OrchestratorConfig::default()
        });
        rig.writer.publish(&vitals(&rig.clock, 1, 80.0), rig.clock.monotonic_ns());
        rig.orchestrator.run_iteration();
        assert!(rig.persist.try_recv().is_err());

        rig.clock.advance(Duration::from_secs(61));
        rig.writer.beat(rig.clock.monotonic_ns());
        rig.orchestrator.run_iteration();
        assert!(rig.persist.try_recv().is_ok());
    }

    #[test]
    fn test_stall_pauses_and_degrades_then_recovers() {
        let mut rig = rig(OrchestratorConfig::default());
        rig.writer.beat(rig.clock.monotonic_ns());
        rig.orchestrator.run_iteration();

        rig.clock.advance(Duration::from_millis(800));
        rig.orchestrator.run_iteration();
        assert_eq!(rig.orchestrator.session().state(), SessionState::Paused);
        assert!(rig.shared.degraded.is_degraded());
        assert!(drain(&mut rig.events).iter().any(|e| matches!(
            e,
            MonitorEvent::Connectivity(Connectivity::Degraded(TransportFault::Stalled { .. }))
        )));

        rig.clock.advance(Duration::from_millis(200));
        rig.writer.beat(rig.clock.monotonic_ns());
        rig.orchestrator.run_iteration();
        assert_eq!(rig.orchestrator.session().state(), SessionState::Streaming);
        assert!(!rig.shared.degraded.is_degraded());
    }

    #[test]
    fn test_heartbeat_frame_recorded() {
        let mut rig = rig(OrchestratorConfig::default());
        let ts = to_epoch_ns(rig.clock.now());
        rig.writer.publish(
            &Frame::Heartbeat(HeartbeatFrame {
                sequence: 1,
                timestamp_ns: ts,
            }),
            rig.clock.monotonic_ns(),
        );
        rig.orchestrator.run_iteration();
        assert_eq!(rig.orchestrator.stats().heartbeat_frames, 1);
        assert!(rig.orchestrator.last_heartbeat_frame().is_some());
    }

    #[test]
    fn test_stop_ends_iteration_and_flushes() {
        let mut rig = rig(OrchestratorConfig::default());
        rig.writer.publish(&vitals(&rig.clock, 1, 80.0), rig.clock.monotonic_ns());
        rig.orchestrator.run_iteration();

        rig.orchestrator.stop_handle().stop();
        assert!(rig.orchestrator.run_iteration().stopped);
        rig.orchestrator.shutdown();

        assert!(rig.telemetry.try_recv().is_ok());
        assert!(rig.persist.try_recv().is_ok());
    }
}

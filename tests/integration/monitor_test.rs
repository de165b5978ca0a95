use bedside::core::alarm::{ChangeKind, LogIndicator, LogNotifier};
use bedside::core::cache::VitalType;
use bedside::core::clock::{Clock, SystemClock};
use bedside::core::monitor::{
    Collaborators, Connectivity, JsonLinesArchive, LogTelemetrySink, MonitorEvent, MonitorRuntime, Sha256Signer,
};
use bedside::core::scheduler::NoopPriorityControl;
use bedside::core::simulator::{spawn_simulator, Excursion, Simulator, SimulatorConfig};
use bedside::core::transport::{Frame, LocalHandleSource, VitalsFrame};
use bedside::MonitorConfig;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

fn collaborators(dir: &Path) -> Collaborators {
    Collaborators {
        clock: Arc::new(SystemClock),
        indicator: Arc::new(LogIndicator),
        notifier: Arc::new(LogNotifier),
        signer: Arc::new(Sha256Signer::new("integration")),
        telemetry: Arc::new(LogTelemetrySink),
        storage: Arc::new(JsonLinesArchive::new(dir.join("archive.jsonl"))),
        priority: Arc::new(NoopPriorityControl),
    }
}

/// Wait up to five seconds for an event matching `pick`.
fn wait_for<T>(
    runtime: &MonitorRuntime,
    events: &mut mpsc::Receiver<MonitorEvent>,
    pick: impl Fn(&MonitorEvent) -> Option<T>,
) -> Option<T> {
    runtime.handle().block_on(async {
        tokio::time::timeout(Duration::from_secs(5), async {
            while let Some(event) = events.recv().await {
                if let Some(found) = pick(&event) {
                    return Some(found);
                }
            }
            None
        })
        .await
        .ok()
        .flatten()
    })
}

#[test]
fn test_simulated_tachycardia_is_alarmed_silenced_and_archived() {
    let dir = tempfile::tempdir().unwrap();
    let config = MonitorConfig::default();
    let (mut source, writer) = LocalHandleSource::pair(config.transport.slot_count).unwrap();
    let runtime = MonitorRuntime::start(&config, &mut source, collaborators(dir.path())).unwrap();
    let mut events = runtime.subscribe("integration", 4096);

    let script = vec![Excursion::new(
        VitalType::HeartRate,
        Duration::ZERO,
        Duration::from_secs(60),
        140.0,
    )];
    let simulator = Simulator::new(writer, Arc::new(SystemClock), SimulatorConfig::default(), script);
    let stop = Arc::new(AtomicBool::new(false));
    let producer = spawn_simulator(simulator, Arc::clone(&stop)).unwrap();

    let alarm = wait_for(&runtime, &mut events, |event| match event {
        MonitorEvent::AlarmChanged(change)
            if change.kind == ChangeKind::Triggered && change.alarm.vital == VitalType::HeartRate =>
        {
            Some(change.alarm.clone())
        }
        _ => None,
    })
    .expect("heart rate alarm");
    assert_eq!(alarm.triggering_value, 140.0);

    let operator = runtime.operator();
    let silenced = runtime
        .handle()
        .block_on(operator.silence(alarm.id, chrono::Duration::seconds(1000), "nurse", None))
        .unwrap();
    assert_eq!(silenced.alarm.silence.as_ref().unwrap().effective_secs, 120);

    let mut snapshots = runtime.snapshot_rx.clone();
    let snapshot = runtime.handle().block_on(async {
        tokio::time::timeout(
            Duration::from_secs(5),
            snapshots.wait_for(|s| s.active.iter().any(|a| a.id == alarm.id && a.is_silenced())),
        )
        .await
        .ok()
        .and_then(|r| r.ok().map(|s| Arc::clone(&s)))
    });
    let snapshot = snapshot.expect("silenced snapshot");
    assert!(snapshot.critical());
    assert!(!snapshot.audio_active());

    assert!(runtime.vitals().latest().is_some());
    assert!(!runtime.waveforms().is_empty());

    stop.store(true, Ordering::Release);
    producer.join().unwrap();
    let stats = runtime.shutdown().unwrap();
    assert!(stats.vitals_accepted >= 1);
    assert_eq!(stats.invalid_samples, 0);

    let archive = std::fs::read_to_string(dir.path().join("archive.jsonl")).unwrap();
    assert!(archive.lines().any(|line| line.contains("\"kind\":\"vitals\"")));
}

#[test]
fn test_stalled_producer_degrades_then_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = MonitorConfig::default();
    config.transport.stall_threshold_ms = 150;
    let (mut source, mut writer) = LocalHandleSource::pair(64).unwrap();
    let runtime = MonitorRuntime::start(&config, &mut source, collaborators(dir.path())).unwrap();
    let mut events = runtime.subscribe("integration", 1024);

    let clock = SystemClock;
    writer.publish(
        &Frame::Vitals(VitalsFrame {
            sequence: 1,
            timestamp_ns: bedside::core::clock::to_epoch_ns(clock.now()),
            patient: 1,
            heart_rate: Some(72.0),
            spo2: Some(98.0),
            respiration_rate: Some(14.0),
        }),
        clock.monotonic_ns(),
    );

    let degraded = wait_for(&runtime, &mut events, |event| match event {
        MonitorEvent::Connectivity(Connectivity::Degraded(fault)) => Some(fault.clone()),
        _ => None,
    });
    assert!(degraded.is_some());
    assert!(runtime.degraded());

    writer.beat(clock.monotonic_ns());
    let restored = wait_for(&runtime, &mut events, |event| {
        matches!(event, MonitorEvent::Connectivity(Connectivity::Restored)).then_some(())
    });
    assert!(restored.is_some());

    runtime.shutdown();
}

//! Process wiring: the real-time thread plus a small tokio runtime for the
//! background tiers.

use anyhow::{Context, Result};
use parking_lot::Mutex;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::thread::JoinHandle;
use tokio::sync::{broadcast, mpsc, watch};

use super::events::{DegradedIndicator, EventBus, MonitorEvent};
use super::operator::OperatorHandle;
use super::orchestrator::{spawn_realtime, Orchestrator, OrchestratorLinks, OrchestratorStats, SharedState};
use super::persistence::{storage_worker, JsonLinesArchive, PersistRequest, StorageSink};
use super::telemetry::{telemetry_worker, BatchSigner, LogTelemetrySink, Sha256Signer, TelemetryBatch, TelemetrySink};
use crate::core::alarm::{
    AlarmEngine, AlarmIndicator, AlarmSnapshot, CriticalNotifier, LogIndicator, LogNotifier, ThresholdTable,
};
use crate::core::cache::{VitalsCache, WaveformCache};
use crate::core::clock::{Clock, SystemClock};
use crate::core::config::MonitorConfig;
use crate::core::scheduler::{
    run_watchdog, HealthEvent, HeartbeatSlot, NoopPriorityControl, PriorityControl, PriorityTier, RestartHook,
    ThreadRef, TierRegistry, Watchdog,
};
use crate::core::transport::{connect, HandleSource, StopHandle};
use crate::error::SchedulingFault;

pub const REALTIME_COMPONENT: &str = "realtime-loop";
pub const TELEMETRY_COMPONENT: &str = "telemetry-worker";
pub const STORAGE_COMPONENT: &str = "storage-worker";

/// Everything the monitor talks to outside itself.
#[derive(Clone)]
pub struct Collaborators {
    pub clock: Arc<dyn Clock>,
    pub indicator: Arc<dyn AlarmIndicator>,
    pub notifier: Arc<dyn CriticalNotifier>,
    pub signer: Arc<dyn BatchSigner>,
    pub telemetry: Arc<dyn TelemetrySink>,
    pub storage: Arc<dyn StorageSink>,
    pub priority: Arc<dyn PriorityControl>,
}

impl Collaborators {
    /// Logging indicators, a JSON-lines archive and the configured signing
    /// key. Real-time priority only when the config asks for it.
    pub fn from_config(config: &MonitorConfig) -> Result<Self> {
        let priority: Arc<dyn PriorityControl> = if config.scheduler.realtime_priority {
            Arc::new(crate::platform::OsPriorityControl)
        } else {
            Arc::new(NoopPriorityControl)
        };
        Ok(Self {
            clock: Arc::new(SystemClock),
            indicator: Arc::new(LogIndicator),
            notifier: Arc::new(LogNotifier),
            signer: Arc::new(Sha256Signer::new(config.telemetry.signing_key.as_bytes())),
            telemetry: Arc::new(LogTelemetrySink),
            storage: Arc::new(JsonLinesArchive::new(config.archive_path()?)),
            priority,
        })
    }
}

type WorkerFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// A background task the watchdog can restart by aborting and respawning.
struct SupervisedWorker {
    handle: tokio::runtime::Handle,
    spawn: Box<dyn Fn() -> WorkerFuture + Send + Sync>,
    task: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl SupervisedWorker {
    fn start(handle: tokio::runtime::Handle, spawn: Box<dyn Fn() -> WorkerFuture + Send + Sync>) -> Arc<Self> {
        let worker = Arc::new(Self {
            handle,
            spawn,
            task: Mutex::new(None),
        });
        worker.respawn();
        worker
    }

    fn respawn(&self) {
        let mut task = self.task.lock();
        if let Some(old) = task.take() {
            old.abort();
        }
        *task = Some(self.handle.spawn((self.spawn)()));
    }
}

impl RestartHook for SupervisedWorker {
    fn restart(&self, component: &str) -> bool {
        log::warn!("Restarting {}", component);
        self.respawn();
        true
    }
}

/// Wrapper around the real-time thread and the background runtime.
pub struct MonitorRuntime {
    /// Latest published alarm snapshot.
    pub snapshot_rx: watch::Receiver<Arc<AlarmSnapshot>>,
    operator: OperatorHandle,
    shared: SharedState,
    thresholds: Arc<ThresholdTable>,
    registry: Arc<TierRegistry>,
    stop: StopHandle,
    shutdown_tx: broadcast::Sender<()>,
    realtime: Option<JoinHandle<Orchestrator>>,
    runtime: tokio::runtime::Runtime,
}

impl MonitorRuntime {
    /// Connect to the frame source and start every component.
    pub fn start(config: &MonitorConfig, source: &mut dyn HandleSource, collaborators: Collaborators) -> Result<Self> {
        config.validate()?;

        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(2)
            .enable_time()
            .thread_name("bedside-worker")
            .build()?;

        let clock = Arc::clone(&collaborators.clock);
        let session = connect(source, Arc::clone(&clock), config.stall_threshold())
            .with_context(|| "Failed to connect to the frame source")?;
        log::info!("Connected to frame source");

        let thresholds = Arc::new(ThresholdTable::new(config.alarm.thresholds.clone()));
        let engine = AlarmEngine::new(
            Arc::clone(&thresholds),
            Arc::clone(&collaborators.indicator),
            Arc::clone(&collaborators.notifier),
            config.alarm_engine(),
        );

        let shared = SharedState {
            vitals: Arc::new(VitalsCache::new(config.vitals_cache())),
            waveforms: Arc::new(WaveformCache::new(config.cache.waveform_capacity)),
            bus: Arc::new(EventBus::new()),
            degraded: Arc::new(DegradedIndicator::new()),
        };

        let (telemetry_tx, telemetry_rx) = mpsc::channel::<TelemetryBatch>(config.telemetry.queue_capacity.max(1));
        let (persist_tx, persist_rx) = mpsc::channel::<PersistRequest>(config.persistence.queue_capacity.max(1));
        let (operator, operator_rx) = OperatorHandle::channel(config.events.operator_queue_capacity);
        let (snapshot_tx, snapshot_rx) = watch::channel(Arc::new(AlarmSnapshot::default()));
        let (shutdown_tx, _) = broadcast::channel::<()>(1);

        let registry = Arc::new(TierRegistry::new());
        let now_ns = clock.monotonic_ns();
        let rt_slot = registry.register(REALTIME_COMPONENT, PriorityTier::RealTime, now_ns)?;
        let telemetry_slot = registry.register(TELEMETRY_COMPONENT, PriorityTier::Normal, now_ns)?;
        let storage_slot = registry.register(STORAGE_COMPONENT, PriorityTier::Background, now_ns)?;

        let orchestrator = Orchestrator::new(
            session,
            engine,
            shared.clone(),
            OrchestratorLinks {
                telemetry: telemetry_tx,
                persistence: persist_tx,
                operator: operator_rx,
                snapshots: snapshot_tx,
            },
            Arc::clone(&clock),
            config.orchestrator(),
        );
        let stop = orchestrator.stop_handle();
        let resync = orchestrator.resync_flag();

        let telemetry = telemetry_supervisor(
            runtime.handle().clone(),
            telemetry_rx,
            &collaborators,
            telemetry_slot,
            &shutdown_tx,
        );
        let storage = storage_supervisor(
            runtime.handle().clone(),
            persist_rx,
            Arc::clone(&shared.vitals),
            &collaborators,
            storage_slot,
            &shutdown_tx,
        );

        let mut watchdog = Watchdog::new(
            Arc::clone(&registry),
            Arc::clone(&collaborators.priority),
            Arc::clone(&clock),
            config.watchdog(),
        );
        watchdog.on_restart(
            REALTIME_COMPONENT,
            Arc::new(move |component: &str| {
                log::warn!("Resynchronizing {}", component);
                resync.store(true, Ordering::Release);
                true
            }),
        );
        watchdog.on_restart(TELEMETRY_COMPONENT, telemetry);
        watchdog.on_restart(STORAGE_COMPONENT, storage);

        let bus = Arc::clone(&shared.bus);
        let degraded = Arc::clone(&shared.degraded);
        runtime.spawn(run_watchdog(
            watchdog,
            move |events: Vec<HealthEvent>, is_degraded: bool| {
                degraded.set_scheduling(is_degraded);
                for event in events {
                    bus.publish(MonitorEvent::Health(event));
                }
            },
            shutdown_tx.subscribe(),
        ));

        let pinned: Arc<dyn PriorityControl> = Arc::new(PinnedControl {
            inner: Arc::clone(&collaborators.priority),
            cpus: config.scheduler.realtime_cpus.clone(),
        });
        let realtime = spawn_realtime(orchestrator, rt_slot, config.cpu_budget(), pinned)
            .with_context(|| "Failed to start the real-time thread")?;

        Ok(Self {
            snapshot_rx,
            operator,
            shared,
            thresholds,
            registry,
            stop,
            shutdown_tx,
            realtime: Some(realtime),
            runtime,
        })
    }

    pub fn subscribe(&self, name: &str, capacity: usize) -> mpsc::Receiver<MonitorEvent> {
        self.shared.bus.subscribe(name, capacity)
    }

    pub fn operator(&self) -> OperatorHandle {
        self.operator.clone()
    }

    pub fn vitals(&self) -> &Arc<VitalsCache> {
        &self.shared.vitals
    }

    pub fn waveforms(&self) -> &Arc<WaveformCache> {
        &self.shared.waveforms
    }

    pub fn thresholds(&self) -> &Arc<ThresholdTable> {
        &self.thresholds
    }

    pub fn degraded(&self) -> bool {
        self.shared.degraded.is_degraded()
    }

    pub fn components(&self) -> Vec<Arc<HeartbeatSlot>> {
        self.registry.slots()
    }

    /// Handle for driving async operator calls from synchronous code.
    pub fn handle(&self) -> tokio::runtime::Handle {
        self.runtime.handle().clone()
    }

    pub fn is_running(&self) -> bool {
        self.realtime.as_ref().map(|t| !t.is_finished()).unwrap_or(false)
    }

    /// Stop the real-time thread, let the workers flush, then stop them.
    pub fn shutdown(mut self) -> Option<OrchestratorStats> {
        log::info!("Shutting down monitor");
        self.stop.stop();
        let stats = self
            .realtime
            .take()
            .and_then(|thread| thread.join().ok())
            .map(|orchestrator| orchestrator.stats());

        // Give queued batches and the final persist request a moment.
        self.runtime
            .block_on(async { tokio::time::sleep(std::time::Duration::from_millis(100)).await });
        let _ = self.shutdown_tx.send(());
        self.runtime.shutdown_timeout(std::time::Duration::from_secs(2));
        stats
    }
}

/// Applies the configured CPU pinning along with the tier.
struct PinnedControl {
    inner: Arc<dyn PriorityControl>,
    cpus: Vec<usize>,
}

impl PriorityControl for PinnedControl {
    fn set_priority_tier(&self, thread: ThreadRef, tier: PriorityTier) -> Result<(), SchedulingFault> {
        if !self.cpus.is_empty() {
            self.inner.set_cpu_affinity(thread, &self.cpus)?;
        }
        self.inner.set_priority_tier(thread, tier)
    }

    fn set_cpu_affinity(&self, thread: ThreadRef, cpus: &[usize]) -> Result<(), SchedulingFault> {
        self.inner.set_cpu_affinity(thread, cpus)
    }
}

fn telemetry_supervisor(
    handle: tokio::runtime::Handle,
    batches: mpsc::Receiver<TelemetryBatch>,
    collaborators: &Collaborators,
    slot: Arc<HeartbeatSlot>,
    shutdown: &broadcast::Sender<()>,
) -> Arc<SupervisedWorker> {
    let batches = Arc::new(tokio::sync::Mutex::new(batches));
    let signer = Arc::clone(&collaborators.signer);
    let sink = Arc::clone(&collaborators.telemetry);
    let clock = Arc::clone(&collaborators.clock);
    let shutdown = shutdown.clone();

    SupervisedWorker::start(
        handle,
        Box::new(move || {
            let batches = Arc::clone(&batches);
            let signer = Arc::clone(&signer);
            let sink = Arc::clone(&sink);
            let clock = Arc::clone(&clock);
            let slot = Arc::clone(&slot);
            let shutdown = shutdown.subscribe();
            Box::pin(async move {
                let mut batches = batches.lock().await;
                telemetry_worker(&mut *batches, signer, sink, shutdown, move || {
                    slot.beat(clock.monotonic_ns())
                })
                .await
            })
        }),
    )
}

fn storage_supervisor(
    handle: tokio::runtime::Handle,
    requests: mpsc::Receiver<PersistRequest>,
    cache: Arc<VitalsCache>,
    collaborators: &Collaborators,
    slot: Arc<HeartbeatSlot>,
    shutdown: &broadcast::Sender<()>,
) -> Arc<SupervisedWorker> {
    let requests = Arc::new(tokio::sync::Mutex::new(requests));
    let sink = Arc::clone(&collaborators.storage);
    let clock = Arc::clone(&collaborators.clock);
    let shutdown = shutdown.clone();

    SupervisedWorker::start(
        handle,
        Box::new(move || {
            let requests = Arc::clone(&requests);
            let cache = Arc::clone(&cache);
            let sink = Arc::clone(&sink);
            let clock = Arc::clone(&clock);
            let slot = Arc::clone(&slot);
            let shutdown = shutdown.subscribe();
            Box::pin(async move {
                let mut requests = requests.lock().await;
                storage_worker(&mut *requests, cache, sink, shutdown, move || {
                    slot.beat(clock.monotonic_ns())
                })
                .await
            })
        }),
    )
}

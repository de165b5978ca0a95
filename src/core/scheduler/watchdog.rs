//! Heartbeat supervision of every registered component.
//!
//! The watchdog runs on the background runtime and compares each slot's last
//! heartbeat against its tier deadline. A miss is logged and reported, then
//! followed by a bounded number of restarts. When a lower tier is starving
//! while the real-time thread keeps overrunning its CPU budget, the real-time
//! thread is moved down one tier until the starvation clears.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;

use super::tiers::{PriorityControl, PriorityTier, TierRegistry};
use crate::core::clock::Clock;
use crate::error::SchedulingFault;

#[derive(Debug, Clone)]
pub struct WatchdogConfig {
    pub check_interval: Duration,
    /// Restarts allowed per component within `restart_window`.
    pub max_restarts: u32,
    pub restart_window: Duration,
    /// Consecutive budget overruns after which the real-time thread counts
    /// as monopolizing the CPU.
    pub starvation_overruns: u32,
}

impl Default for WatchdogConfig {
    fn default() -> Self {
        Self {
            check_interval: Duration::from_millis(100),
            max_restarts: 3,
            restart_window: Duration::from_secs(60),
            starvation_overruns: 20,
        }
    }
}

/// What the watchdog observed during one check.
#[derive(Debug, Clone, PartialEq)]
pub enum HealthEvent {
    Fault(SchedulingFault),
    RestartIssued { component: String, attempt: u32 },
    Demoted { component: String, to: PriorityTier },
    Restored { component: String },
    Recovered { component: String },
}

/// Restarts a stalled component. Returns whether the restart was issued.
pub trait RestartHook: Send + Sync {
    fn restart(&self, component: &str) -> bool;
}

impl<F> RestartHook for F
where
    F: Fn(&str) -> bool + Send + Sync,
{
    fn restart(&self, component: &str) -> bool {
        self(component)
    }
}

#[derive(Debug, Default)]
struct ComponentHealth {
    stalled: bool,
    exhausted: bool,
    restarts: VecDeque<u64>,
}

pub struct Watchdog {
    registry: Arc<TierRegistry>,
    control: Arc<dyn PriorityControl>,
    clock: Arc<dyn Clock>,
    config: WatchdogConfig,
    hooks: HashMap<String, Arc<dyn RestartHook>>,
    health: HashMap<String, ComponentHealth>,
}

impl Watchdog {
    pub fn new(
        registry: Arc<TierRegistry>,
        control: Arc<dyn PriorityControl>,
        clock: Arc<dyn Clock>,
        config: WatchdogConfig,
    ) -> Self {
        Self {
            registry,
            control,
            clock,
            config,
            hooks: HashMap::new(),
            health: HashMap::new(),
        }
    }

    pub fn on_restart(&mut self, component: &str, hook: Arc<dyn RestartHook>) {
        self.hooks.insert(component.to_string(), hook);
    }

    pub fn config(&self) -> &WatchdogConfig {
        &self.config
    }

    /// True while any component is stalled, out of restarts, or the
    /// real-time thread is demoted.
    pub fn degraded(&self) -> bool {
        self.health.values().any(|h| h.stalled || h.exhausted)
            || self.registry.real_time().map(|s| s.is_demoted()).unwrap_or(false)
    }

    pub fn check(&mut self) -> Vec<HealthEvent> {
        let now_ns = self.clock.monotonic_ns();
        let window_ns = self.config.restart_window.as_nanos() as u64;
        let mut events = Vec::new();
        let mut starved: Option<String> = None;

        for slot in self.registry.slots() {
            let age_ns = now_ns.saturating_sub(slot.last_beat_ns());
            let deadline = slot.tier().stall_deadline();
            let health = self.health.entry(slot.name().to_string()).or_default();

            if age_ns <= deadline.as_nanos() as u64 {
                if health.stalled {
                    health.stalled = false;
                    health.exhausted = false;
                    log::info!("{} heartbeat recovered", slot.name());
                    events.push(HealthEvent::Recovered {
                        component: slot.name().to_string(),
                    });
                }
                continue;
            }

            if !health.stalled {
                health.stalled = true;
                let fault = SchedulingFault::MissedHeartbeat {
                    component: slot.name().to_string(),
                    tier: slot.tier(),
                    age_ms: age_ns / 1_000_000,
                };
                log::error!("{}", fault);
                events.push(HealthEvent::Fault(fault));
            }

            if slot.tier() != PriorityTier::RealTime && starved.is_none() {
                starved = Some(slot.name().to_string());
            }

            if health.exhausted {
                continue;
            }
            let Some(hook) = self.hooks.get(slot.name()) else {
                continue;
            };

            while health
                .restarts
                .front()
                .map(|&t| now_ns.saturating_sub(t) > window_ns)
                .unwrap_or(false)
            {
                health.restarts.pop_front();
            }

            // Give the previous restart one full deadline to take effect.
            let settling = health
                .restarts
                .back()
                .map(|&t| now_ns.saturating_sub(t) < deadline.as_nanos() as u64)
                .unwrap_or(false);
            if settling {
                continue;
            }

            if health.restarts.len() as u32 >= self.config.max_restarts {
                health.exhausted = true;
                let fault = SchedulingFault::RestartsExhausted {
                    component: slot.name().to_string(),
                    attempts: health.restarts.len() as u32,
                };
                log::error!("{}", fault);
                events.push(HealthEvent::Fault(fault));
                continue;
            }

            health.restarts.push_back(now_ns);
            let attempt = health.restarts.len() as u32;
            if hook.restart(slot.name()) {
                log::warn!("Restarting {} (attempt {})", slot.name(), attempt);
                events.push(HealthEvent::RestartIssued {
                    component: slot.name().to_string(),
                    attempt,
                });
            } else {
                log::warn!("Restart of {} was refused", slot.name());
            }
        }

        self.check_starvation(starved, &mut events);
        events
    }

    fn check_starvation(&mut self, starved: Option<String>, events: &mut Vec<HealthEvent>) {
        let Some(rt) = self.registry.real_time() else {
            return;
        };
        let monopolizing = rt.consecutive_overruns() >= self.config.starvation_overruns;

        match starved {
            Some(starved) if monopolizing && !rt.is_demoted() => {
                let fault = SchedulingFault::Starvation {
                    starved,
                    monopolizer: rt.name().to_string(),
                };
                log::error!("{}", fault);
                events.push(HealthEvent::Fault(fault));

                let to = PriorityTier::RealTime.lower();
                match self.control.set_priority_tier(rt.thread(), to) {
                    Ok(()) => {
                        rt.set_demoted(true);
                        log::warn!("{} demoted to {} tier", rt.name(), to);
                        events.push(HealthEvent::Demoted {
                            component: rt.name().to_string(),
                            to,
                        });
                    }
                    Err(err) => {
                        log::error!("{}", err);
                        events.push(HealthEvent::Fault(err));
                    }
                }
            }
            None if rt.is_demoted() && !monopolizing => {
                match self.control.set_priority_tier(rt.thread(), PriorityTier::RealTime) {
                    Ok(()) => {
                        rt.set_demoted(false);
                        log::info!("{} restored to real-time tier", rt.name());
                        events.push(HealthEvent::Restored {
                            component: rt.name().to_string(),
                        });
                    }
                    Err(err) => {
                        log::error!("{}", err);
                        events.push(HealthEvent::Fault(err));
                    }
                }
            }
            _ => {}
        }
    }
}

/// Run checks at the configured interval until shutdown. After every check
/// `report` receives what was observed and whether the system is degraded.
pub async fn run_watchdog<F>(mut watchdog: Watchdog, report: F, mut shutdown: broadcast::Receiver<()>)
where
    F: Fn(Vec<HealthEvent>, bool) + Send,
{
    let mut interval = tokio::time::interval(watchdog.config.check_interval);
    interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            _ = interval.tick() => {
                let events = watchdog.check();
                let degraded = watchdog.degraded();
                report(events, degraded);
            }
            _ = shutdown.recv() => {
                log::debug!("Watchdog shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::clock::ManualClock;
    use crate::core::scheduler::tiers::{NoopPriorityControl, ThreadRef};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn setup() -> (Arc<TierRegistry>, ManualClock, Watchdog) {
        let registry = Arc::new(TierRegistry::new());
        let clock = ManualClock::default();
        let watchdog = Watchdog::new(
            Arc::clone(&registry),
            Arc::new(NoopPriorityControl),
            Arc::new(clock.clone()),
            WatchdogConfig::default(),
        );
        (registry, clock, watchdog)
    }

    #[test]
    fn test_missed_heartbeat_reported_once() {
        let (registry, clock, mut watchdog) = setup();
        let _slot = registry
            .register("storage", PriorityTier::Background, clock.monotonic_ns())
            .unwrap();

        assert!(watchdog.check().is_empty());

        clock.advance(Duration::from_secs(11));
        let events = watchdog.check();
        assert!(matches!(
            events.as_slice(),
            [HealthEvent::Fault(SchedulingFault::MissedHeartbeat { .. })]
        ));
        assert!(watchdog.degraded());

        // Still stalled, no new fault.
        assert!(watchdog.check().is_empty());
    }

    #[test]
    fn test_recovery_clears_degraded() {
        let (registry, clock, mut watchdog) = setup();
        let slot = registry
            .register("telemetry", PriorityTier::Normal, clock.monotonic_ns())
            .unwrap();

        clock.advance(Duration::from_secs(3));
        watchdog.check();
        assert!(watchdog.degraded());

        slot.beat(clock.monotonic_ns());
        let events = watchdog.check();
        assert_eq!(
            events,
            vec![HealthEvent::Recovered {
                component: "telemetry".to_string()
            }]
        );
        assert!(!watchdog.degraded());
    }

    #[test]
    fn test_restarts_bounded() {
        let (registry, clock, mut watchdog) = setup();
        registry
            .register("storage", PriorityTier::Background, clock.monotonic_ns())
            .unwrap();
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        watchdog.on_restart(
            "storage",
            Arc::new(move |_: &str| {
                counter.fetch_add(1, Ordering::SeqCst);
                true
            }),
        );

        let mut exhausted = false;
        for _ in 0..6 {
            clock.advance(Duration::from_secs(11));
            for event in watchdog.check() {
                if matches!(event, HealthEvent::Fault(SchedulingFault::RestartsExhausted { .. })) {
                    exhausted = true;
                }
            }
        }

        assert_eq!(calls.load(Ordering::SeqCst), 3);
        assert!(exhausted);
    }

    #[derive(Default)]
    struct RecordingControl {
        tiers: parking_lot::Mutex<Vec<PriorityTier>>,
    }

    impl PriorityControl for RecordingControl {
        fn set_priority_tier(&self, _thread: ThreadRef, tier: PriorityTier) -> Result<(), SchedulingFault> {
            self.tiers.lock().push(tier);
            Ok(())
        }

        fn set_cpu_affinity(&self, _thread: ThreadRef, _cpus: &[usize]) -> Result<(), SchedulingFault> {
            Ok(())
        }
    }

    #[test]
    fn test_overrunning_real_time_thread_demoted_then_restored() {
        let registry = Arc::new(TierRegistry::new());
        let clock = ManualClock::default();
        let control = Arc::new(RecordingControl::default());
        let mut watchdog = Watchdog::new(
            Arc::clone(&registry),
            Arc::clone(&control) as Arc<dyn PriorityControl>,
            Arc::new(clock.clone()),
            WatchdogConfig::default(),
        );
        let rt = registry
            .register("bedside-rt", PriorityTier::RealTime, clock.monotonic_ns())
            .unwrap();
        let telemetry = registry
            .register("telemetry", PriorityTier::Normal, clock.monotonic_ns())
            .unwrap();

        for _ in 0..watchdog.config().starvation_overruns {
            rt.record_iteration(true);
        }
        clock.advance(Duration::from_secs(3));
        rt.beat(clock.monotonic_ns());

        let events = watchdog.check();
        assert!(events.iter().any(|e| matches!(
            e,
            HealthEvent::Fault(SchedulingFault::MissedHeartbeat { component, .. }) if component == "telemetry"
        )));
        assert!(events.contains(&HealthEvent::Fault(SchedulingFault::Starvation {
            starved: "telemetry".to_string(),
            monopolizer: "bedside-rt".to_string(),
        })));
        assert!(events.contains(&HealthEvent::Demoted {
            component: "bedside-rt".to_string(),
            to: PriorityTier::Critical,
        }));
        assert!(rt.is_demoted());
        assert!(watchdog.degraded());

        // Already demoted: no second demotion while starvation persists.
        rt.record_iteration(true);
        rt.beat(clock.monotonic_ns());
        assert!(!watchdog
            .check()
            .iter()
            .any(|e| matches!(e, HealthEvent::Demoted { .. })));

        rt.record_iteration(false);
        rt.beat(clock.monotonic_ns());
        telemetry.beat(clock.monotonic_ns());
        let events = watchdog.check();
        assert!(events.contains(&HealthEvent::Recovered {
            component: "telemetry".to_string()
        }));
        assert!(events.contains(&HealthEvent::Restored {
            component: "bedside-rt".to_string()
        }));
        assert!(!rt.is_demoted());
        assert!(!watchdog.degraded());
        assert_eq!(
            *control.tiers.lock(),
            vec![PriorityTier::Critical, PriorityTier::RealTime]
        );
    }
}

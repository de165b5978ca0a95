//! Outbound events and the per-subscriber bus.

use arc_swap::ArcSwap;
use chrono::{DateTime, Utc};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::mpsc;

use crate::core::alarm::AlarmChange;
use crate::core::cache::{ChannelId, VitalSample};
use crate::core::scheduler::HealthEvent;
use crate::error::{CapacityFault, TransportFault};

#[derive(Debug, Clone, PartialEq)]
pub enum Connectivity {
    Connected,
    /// The source stopped producing; the session is paused.
    Degraded(TransportFault),
    Restored,
    Disconnected,
}

#[derive(Debug, Clone)]
pub enum MonitorEvent {
    VitalsUpdated(VitalSample),
    /// New waveform data is available in the shared waveform cache.
    WaveformWindowUpdated {
        channel: ChannelId,
        latest: DateTime<Utc>,
        total_written: u64,
    },
    AlarmChanged(AlarmChange),
    CriticalAlarmActive(bool),
    Connectivity(Connectivity),
    Health(HealthEvent),
    CapacityWarning(CapacityFault),
}

struct Subscriber {
    name: String,
    tx: mpsc::Sender<MonitorEvent>,
    lagging: AtomicBool,
}

/// Fan-out of [`MonitorEvent`]s to bounded per-subscriber queues.
///
/// Publishing never blocks: a full queue drops the event for that
/// subscriber only. Subscribers may join from any thread at any time.
pub struct EventBus {
    subscribers: ArcSwap<Vec<Arc<Subscriber>>>,
    dropped: AtomicU64,
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("subscribers", &self.subscribers.load().len())
            .field("dropped", &self.dropped())
            .finish()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    pub fn new() -> Self {
        Self {
            subscribers: ArcSwap::from_pointee(Vec::new()),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn subscribe(&self, name: &str, capacity: usize) -> mpsc::Receiver<MonitorEvent> {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        let subscriber = Arc::new(Subscriber {
            name: name.to_string(),
            tx,
            lagging: AtomicBool::new(false),
        });
        self.subscribers.rcu(|current| {
            let mut next = Vec::clone(current);
            next.push(Arc::clone(&subscriber));
            next
        });
        rx
    }

    pub fn subscriber_count(&self) -> usize {
        self.subscribers.load().len()
    }

    /// Events dropped across all subscribers because their queue was full.
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    pub fn publish(&self, event: MonitorEvent) {
        let subscribers = self.subscribers.load();
        let mut closed = false;

        for subscriber in subscribers.iter() {
            match subscriber.tx.try_send(event.clone()) {
                Ok(()) => {
                    subscriber.lagging.store(false, Ordering::Relaxed);
                }
                Err(mpsc::error::TrySendError::Full(_)) => {
                    let dropped = self.dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    if !subscriber.lagging.swap(true, Ordering::Relaxed) {
                        log::warn!(
                            "{} (subscriber '{}')",
                            CapacityFault::ChannelFull {
                                channel: "events",
                                dropped
                            },
                            subscriber.name
                        );
                    }
                }
                Err(mpsc::error::TrySendError::Closed(_)) => closed = true,
            }
        }

        if closed {
            self.subscribers.rcu(|current| {
                current
                    .iter()
                    .filter(|s| !s.tx.is_closed())
                    .cloned()
                    .collect::<Vec<_>>()
            });
        }
    }
}

/// Latched "degraded" indication. Set by transport and scheduling faults,
/// cleared only when the component that raised it recovers.
#[derive(Debug, Default)]
pub struct DegradedIndicator {
    transport: AtomicBool,
    scheduling: AtomicBool,
}

impl DegradedIndicator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_transport(&self, degraded: bool) {
        self.transport.store(degraded, Ordering::Release);
    }

    pub fn set_scheduling(&self, degraded: bool) {
        self.scheduling.store(degraded, Ordering::Release);
    }

    pub fn transport(&self) -> bool {
        self.transport.load(Ordering::Acquire)
    }

    pub fn scheduling(&self) -> bool {
        self.scheduling.load(Ordering::Acquire)
    }

    pub fn is_degraded(&self) -> bool {
        self.transport() || self.scheduling()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_subscriber_does_not_block_others() {
        let bus = EventBus::new();
        let mut slow = bus.subscribe("slow", 1);
        let mut fast = bus.subscribe("fast", 16);

        for _ in 0..5 {
            bus.publish(MonitorEvent::CriticalAlarmActive(true));
        }

        assert_eq!(bus.dropped(), 4);
        let mut received = 0;
        while fast.try_recv().is_ok() {
            received += 1;
        }
        assert_eq!(received, 5);
        assert!(slow.try_recv().is_ok());
        assert!(slow.try_recv().is_err());
    }

    #[test]
    fn test_closed_subscriber_pruned() {
        let bus = EventBus::new();
        let rx = bus.subscribe("ui", 4);
        let _keep = bus.subscribe("log", 4);
        drop(rx);
        bus.publish(MonitorEvent::CriticalAlarmActive(false));
        assert_eq!(bus.subscriber_count(), 1);
    }

    #[test]
    fn test_events_keep_order_per_subscriber() {
        let bus = EventBus::new();
        let mut rx = bus.subscribe("ui", 8);
        bus.publish(MonitorEvent::CriticalAlarmActive(true));
        bus.publish(MonitorEvent::CriticalAlarmActive(false));
        assert!(matches!(rx.try_recv(), Ok(MonitorEvent::CriticalAlarmActive(true))));
        assert!(matches!(rx.try_recv(), Ok(MonitorEvent::CriticalAlarmActive(false))));
    }

    #[test]
    fn test_degraded_latches_until_cleared() {
        let indicator = DegradedIndicator::new();
        indicator.set_transport(true);
        indicator.set_scheduling(true);
        indicator.set_transport(false);
        assert!(indicator.is_degraded());
        indicator.set_scheduling(false);
        assert!(!indicator.is_degraded());
    }
}

//! Priority tiers and the registry of supervised components.
//!
//! Every long-lived loop in the monitor registers a [`HeartbeatSlot`] under a
//! tier. The tier fixes both the OS scheduling policy the thread runs under
//! and how long its heartbeat may go quiet before the watchdog steps in.

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU32, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::error::SchedulingFault;
use crate::platform;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PriorityTier {
    RealTime,
    Critical,
    Interactive,
    Normal,
    Background,
    Idle,
}

/// How a tier is expressed to the OS scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierPolicy {
    /// `SCHED_RR` at the given static priority.
    RoundRobin(i32),
    /// `SCHED_OTHER` at the given nice level.
    Nice(i32),
}

impl PriorityTier {
    pub const ALL: [PriorityTier; 6] = [
        PriorityTier::RealTime,
        PriorityTier::Critical,
        PriorityTier::Interactive,
        PriorityTier::Normal,
        PriorityTier::Background,
        PriorityTier::Idle,
    ];

    /// Longest a component on this tier may go without a heartbeat.
    pub fn stall_deadline(self) -> Duration {
        match self {
            PriorityTier::RealTime => Duration::from_millis(250),
            PriorityTier::Critical => Duration::from_millis(500),
            PriorityTier::Interactive => Duration::from_secs(1),
            PriorityTier::Normal => Duration::from_secs(2),
            PriorityTier::Background => Duration::from_secs(10),
            PriorityTier::Idle => Duration::from_secs(30),
        }
    }

    pub fn policy(self) -> TierPolicy {
        match self {
            PriorityTier::RealTime => TierPolicy::RoundRobin(80),
            PriorityTier::Critical => TierPolicy::Nice(-10),
            PriorityTier::Interactive => TierPolicy::Nice(-5),
            PriorityTier::Normal => TierPolicy::Nice(0),
            PriorityTier::Background => TierPolicy::Nice(10),
            PriorityTier::Idle => TierPolicy::Nice(19),
        }
    }

    /// The next tier down; `Idle` stays `Idle`.
    pub fn lower(self) -> PriorityTier {
        match self {
            PriorityTier::RealTime => PriorityTier::Critical,
            PriorityTier::Critical => PriorityTier::Interactive,
            PriorityTier::Interactive => PriorityTier::Normal,
            PriorityTier::Normal => PriorityTier::Background,
            PriorityTier::Background | PriorityTier::Idle => PriorityTier::Idle,
        }
    }
}

impl fmt::Display for PriorityTier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            PriorityTier::RealTime => "real-time",
            PriorityTier::Critical => "critical",
            PriorityTier::Interactive => "interactive",
            PriorityTier::Normal => "normal",
            PriorityTier::Background => "background",
            PriorityTier::Idle => "idle",
        };
        f.write_str(name)
    }
}

/// OS thread identifier as understood by the [`PriorityControl`] in use.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ThreadRef(pub i64);

impl ThreadRef {
    pub fn current() -> Self {
        ThreadRef(platform::current_thread_id())
    }
}

/// Capability to move threads between tiers and CPUs.
pub trait PriorityControl: Send + Sync {
    fn set_priority_tier(&self, thread: ThreadRef, tier: PriorityTier) -> Result<(), SchedulingFault>;
    fn set_cpu_affinity(&self, thread: ThreadRef, cpus: &[usize]) -> Result<(), SchedulingFault>;
}

/// Accepts every request and changes nothing. Used when the process lacks
/// the privileges for real-time scheduling, and in tests.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopPriorityControl;

impl PriorityControl for NoopPriorityControl {
    fn set_priority_tier(&self, thread: ThreadRef, tier: PriorityTier) -> Result<(), SchedulingFault> {
        log::debug!("Priority control disabled, thread {} stays put (wanted {})", thread.0, tier);
        Ok(())
    }

    fn set_cpu_affinity(&self, _thread: ThreadRef, _cpus: &[usize]) -> Result<(), SchedulingFault> {
        Ok(())
    }
}

/// Liveness record of one supervised component.
#[derive(Debug)]
pub struct HeartbeatSlot {
    name: String,
    tier: PriorityTier,
    last_beat_ns: AtomicU64,
    thread: AtomicI64,
    consecutive_overruns: AtomicU32,
    demoted: AtomicBool,
}

impl HeartbeatSlot {
    fn new(name: String, tier: PriorityTier, now_ns: u64) -> Self {
        Self {
            name,
            tier,
            last_beat_ns: AtomicU64::new(now_ns),
            thread: AtomicI64::new(0),
            consecutive_overruns: AtomicU32::new(0),
            demoted: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn tier(&self) -> PriorityTier {
        self.tier
    }

    pub fn beat(&self, now_ns: u64) {
        self.last_beat_ns.store(now_ns, Ordering::Release);
    }

    pub fn last_beat_ns(&self) -> u64 {
        self.last_beat_ns.load(Ordering::Acquire)
    }

    /// Record which OS thread runs this component.
    pub fn bind(&self, thread: ThreadRef) {
        self.thread.store(thread.0, Ordering::Release);
    }

    pub fn thread(&self) -> ThreadRef {
        ThreadRef(self.thread.load(Ordering::Acquire))
    }

    /// Track whether the last iteration overran its CPU budget.
    pub fn record_iteration(&self, overran: bool) {
        if overran {
            self.consecutive_overruns.fetch_add(1, Ordering::AcqRel);
        } else {
            self.consecutive_overruns.store(0, Ordering::Release);
        }
    }

    pub fn consecutive_overruns(&self) -> u32 {
        self.consecutive_overruns.load(Ordering::Acquire)
    }

    pub fn is_demoted(&self) -> bool {
        self.demoted.load(Ordering::Acquire)
    }

    pub(crate) fn set_demoted(&self, demoted: bool) {
        self.demoted.store(demoted, Ordering::Release);
    }
}

/// All supervised components, at most one of them on the real-time tier.
#[derive(Debug, Default)]
pub struct TierRegistry {
    slots: Mutex<Vec<Arc<HeartbeatSlot>>>,
}

impl TierRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &self,
        name: &str,
        tier: PriorityTier,
        now_ns: u64,
    ) -> Result<Arc<HeartbeatSlot>, SchedulingFault> {
        let mut slots = self.slots.lock();
        if tier == PriorityTier::RealTime {
            if let Some(holder) = slots.iter().find(|s| s.tier == PriorityTier::RealTime) {
                return Err(SchedulingFault::TierOccupied {
                    tier,
                    holder: holder.name.clone(),
                });
            }
        }
        let slot = Arc::new(HeartbeatSlot::new(name.to_string(), tier, now_ns));
        slots.push(Arc::clone(&slot));
        Ok(slot)
    }

    pub fn unregister(&self, name: &str) {
        self.slots.lock().retain(|s| s.name != name);
    }

    pub fn slots(&self) -> Vec<Arc<HeartbeatSlot>> {
        self.slots.lock().clone()
    }

    pub fn real_time(&self) -> Option<Arc<HeartbeatSlot>> {
        self.slots
            .lock()
            .iter()
            .find(|s| s.tier == PriorityTier::RealTime)
            .cloned()
    }
}

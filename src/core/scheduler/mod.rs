//! Priority tiers, CPU budgets and heartbeat supervision.

pub mod budget;
pub mod tiers;
pub mod watchdog;

pub use budget::{CpuBudget, IterationReport, IterationTimer};
pub use tiers::{
    HeartbeatSlot, NoopPriorityControl, PriorityControl, PriorityTier, ThreadRef, TierPolicy,
    TierRegistry,
};
pub use watchdog::{run_watchdog, HealthEvent, RestartHook, Watchdog, WatchdogConfig};

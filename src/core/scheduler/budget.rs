//! Per-iteration CPU budget for the real-time loop.

use std::time::{Duration, Instant};

use crate::platform;

/// Bounds how much CPU one loop iteration may use and how often iterations
/// may start.
#[derive(Debug, Clone, Copy)]
pub struct CpuBudget {
    budget: Duration,
    min_delay: Duration,
}

/// Started at the top of an iteration.
#[derive(Debug, Clone, Copy)]
pub struct IterationTimer {
    cpu_start: Option<Duration>,
    wall_start: Instant,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IterationReport {
    pub used: Duration,
    pub overran: bool,
}

impl CpuBudget {
    pub fn new(budget: Duration, min_delay: Duration) -> Self {
        Self { budget, min_delay }
    }

    pub fn budget(&self) -> Duration {
        self.budget
    }

    pub fn start(&self) -> IterationTimer {
        IterationTimer {
            cpu_start: platform::thread_cpu_time(),
            wall_start: Instant::now(),
        }
    }

    /// Time charged to the iteration so far. Thread CPU time where the
    /// platform reports it, wall time otherwise.
    pub fn used(&self, timer: &IterationTimer) -> Duration {
        match (timer.cpu_start, platform::thread_cpu_time()) {
            (Some(start), Some(now)) => now.saturating_sub(start),
            _ => timer.wall_start.elapsed(),
        }
    }

    /// True once the iteration should stop taking on more work.
    pub fn exhausted(&self, timer: &IterationTimer) -> bool {
        self.used(timer) >= self.budget
    }

    /// Explicit yield after a unit of critical work.
    pub fn yield_point(&self) {
        std::thread::yield_now();
    }

    pub fn finish(&self, timer: &IterationTimer) -> IterationReport {
        let used = self.used(timer);
        IterationReport {
            used,
            overran: used > self.budget,
        }
    }

    /// Sleep out the rest of the minimum inter-iteration delay.
    pub fn pace(&self, timer: &IterationTimer) {
        let elapsed = timer.wall_start.elapsed();
        if let Some(rest) = self.min_delay.checked_sub(elapsed) {
            std::thread::sleep(rest);
        } else {
            std::thread::yield_now();
        }
    }
}

impl Default for CpuBudget {
    fn default() -> Self {
        Self::new(Duration::from_millis(5), Duration::from_millis(2))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_idle_iteration_stays_within_budget() {
        let budget = CpuBudget::new(Duration::from_millis(50), Duration::ZERO);
        let timer = budget.start();
        let report = budget.finish(&timer);
        assert!(!report.overran);
    }

    #[test]
    fn test_busy_iteration_overruns() {
        let budget = CpuBudget::new(Duration::from_micros(100), Duration::ZERO);
        let timer = budget.start();
        let start = Instant::now();
        let mut x = 0u64;
        while start.elapsed() < Duration::from_millis(20) {
            x = x.wrapping_add(std::hint::black_box(1));
        }
        assert!(x > 0);
        assert!(budget.exhausted(&timer));
        assert!(budget.finish(&timer).overran);
    }

    #[test]
    fn test_pace_enforces_minimum_delay() {
        let budget = CpuBudget::new(Duration::from_millis(5), Duration::from_millis(10));
        let timer = budget.start();
        budget.pace(&timer);
        assert!(timer.wall_start.elapsed() >= Duration::from_millis(10));
    }
}

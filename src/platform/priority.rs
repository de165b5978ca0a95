// OS thread priority and affinity control

use crate::core::scheduler::{PriorityControl, PriorityTier, ThreadRef, TierPolicy};
use crate::error::SchedulingFault;

/// Applies tiers through the OS scheduler.
///
/// The real-time tier maps to `SCHED_RR` so that equal-priority work still
/// round-robins; every other tier runs under `SCHED_OTHER` with a nice level.
/// Lacking privileges is reported as a fault, and the caller keeps running
/// at the default priority.
#[derive(Debug, Default, Clone, Copy)]
pub struct OsPriorityControl;

#[cfg(target_os = "linux")]
fn last_os_error(op: &str) -> SchedulingFault {
    SchedulingFault::PriorityControl(format!("{}: {}", op, std::io::Error::last_os_error()))
}

#[cfg(target_os = "linux")]
impl PriorityControl for OsPriorityControl {
    fn set_priority_tier(&self, thread: ThreadRef, tier: PriorityTier) -> Result<(), SchedulingFault> {
        let tid = thread.0 as libc::pid_t;
        match tier.policy() {
            TierPolicy::RoundRobin(priority) => {
                let param = libc::sched_param {
                    sched_priority: priority,
                };
                // SAFETY: `param` outlives the call.
                let rc = unsafe { libc::sched_setscheduler(tid, libc::SCHED_RR, &param) };
                if rc != 0 {
                    return Err(last_os_error("sched_setscheduler"));
                }
            }
            TierPolicy::Nice(nice) => {
                let param = libc::sched_param { sched_priority: 0 };
                // SAFETY: `param` outlives the call.
                let rc = unsafe { libc::sched_setscheduler(tid, libc::SCHED_OTHER, &param) };
                if rc != 0 {
                    return Err(last_os_error("sched_setscheduler"));
                }
                // SAFETY: plain syscall on a thread id.
                let rc = unsafe { libc::setpriority(libc::PRIO_PROCESS, tid as libc::id_t, nice) };
                if rc != 0 {
                    return Err(last_os_error("setpriority"));
                }
            }
        }
        log::debug!("Thread {} moved to tier {:?}", thread.0, tier);
        Ok(())
    }

    fn set_cpu_affinity(&self, thread: ThreadRef, cpus: &[usize]) -> Result<(), SchedulingFault> {
        if cpus.is_empty() {
            return Ok(());
        }
        // SAFETY: cpu_set_t is plain data; zeroed is the empty set.
        let mut set: libc::cpu_set_t = unsafe { std::mem::zeroed() };
        for &cpu in cpus {
            // SAFETY: CPU_SET bounds-checks against the set size.
            unsafe { libc::CPU_SET(cpu, &mut set) };
        }
        // SAFETY: `set` is a valid cpu_set_t of the size passed.
        let rc = unsafe {
            libc::sched_setaffinity(
                thread.0 as libc::pid_t,
                std::mem::size_of::<libc::cpu_set_t>(),
                &set,
            )
        };
        if rc != 0 {
            return Err(last_os_error("sched_setaffinity"));
        }
        Ok(())
    }
}

#[cfg(not(target_os = "linux"))]
impl PriorityControl for OsPriorityControl {
    fn set_priority_tier(&self, _thread: ThreadRef, tier: PriorityTier) -> Result<(), SchedulingFault> {
        Err(SchedulingFault::PriorityControl(format!(
            "tier {:?} not supported on this platform",
            tier
        )))
    }

    fn set_cpu_affinity(&self, _thread: ThreadRef, _cpus: &[usize]) -> Result<(), SchedulingFault> {
        Err(SchedulingFault::PriorityControl(
            "CPU affinity not supported on this platform".to_string(),
        ))
    }
}

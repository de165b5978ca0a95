// Platform-specific code module

pub mod clock;
pub mod priority;
#[cfg(unix)]
pub mod shm;

// Re-exports for cleaner imports
pub use clock::{current_thread_id, monotonic_ns, thread_cpu_time};
pub use priority::OsPriorityControl;

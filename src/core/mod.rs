// Core business logic module

pub mod alarm;
pub mod cache;
pub mod clock;
pub mod config;
pub mod monitor;
pub mod scheduler;
pub mod simulator;
pub mod transport;

// Re-export commonly used items
pub use alarm::{AlarmEngine, AlarmId, AlarmPriority, AlarmRecord, AlarmSnapshot, ThresholdSet};
pub use cache::{VitalSample, VitalType, VitalsCache, WaveformCache};
pub use clock::{Clock, ManualClock, SystemClock};
pub use config::MonitorConfig;
pub use monitor::{MonitorEvent, MonitorRuntime, OperatorHandle};

//! Alarm detection: thresholds, lifecycle records and the evaluation engine.

pub mod engine;
pub mod record;
pub mod threshold;

pub use engine::{AlarmEngine, AlarmEngineConfig, AlarmIndicator, CriticalNotifier, LogIndicator, LogNotifier};
pub use record::{
    Acknowledgement, AlarmChange, AlarmHistory, AlarmId, AlarmRecord, AlarmSnapshot, AlarmState,
    ChangeKind, SilenceContext,
};
pub use threshold::{
    AlarmPriority, AlarmThreshold, BreachSide, Condition, ThresholdSet, ThresholdTable,
    GLOBAL_SILENCE_CEILING_SECS,
};

use std::io;
use thiserror::Error;

use crate::core::alarm::{AlarmId, AlarmState};
use crate::core::cache::VitalType;
use crate::core::scheduler::PriorityTier;

/// Faults raised by the frame transport.
///
/// All of these are recovered locally: a bad frame is skipped, a stalled
/// writer pauses the session. None of them is fatal to the process.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum TransportFault {
    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Invalid shared region: {0}")]
    InvalidRegion(String),

    #[error("Checksum mismatch in frame {index}")]
    ChecksumMismatch { index: u64 },

    #[error("Malformed frame {index}: {reason}")]
    Malformed { index: u64, reason: &'static str },

    #[error("Reader fell behind, {skipped} frame(s) dropped")]
    FrameDropped { skipped: u64 },

    #[error("Writer stalled, no heartbeat for {age_ms} ms")]
    Stalled { age_ms: u64 },

    #[error("Transport session stopped")]
    Stopped,
}

/// A sample or frame that cannot be used. The sample is dropped and logged,
/// and no alarm evaluation is performed on it.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ValidationFault {
    #[error("Impossible {vital} value: {value}")]
    ImpossibleValue { vital: VitalType, value: f32 },

    #[error("Sample at {timestamp_ms} ms is older than newest cached sample at {newest_ms} ms")]
    OutOfOrder { timestamp_ms: i64, newest_ms: i64 },

    #[error("Sample at {timestamp_ms} ms is more than {tolerance_ms} ms ahead of the clock at {now_ms} ms")]
    FromFuture {
        timestamp_ms: i64,
        now_ms: i64,
        tolerance_ms: i64,
    },

    #[error("Frame {sequence} on channel {channel} is not newer than {last}")]
    OutOfSequence { channel: u8, sequence: u64, last: u64 },

    #[error("Frame carries no vital values")]
    EmptyVitals,

    #[error("Invalid {vital} threshold: {reason}")]
    InvalidThreshold { vital: VitalType, reason: &'static str },
}

/// Expected operator misuse. Returned to the caller, never logged.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum StateFault {
    #[error("Alarm {0} not found")]
    NotFound(AlarmId),

    #[error("Alarm {id} is {state:?}")]
    InvalidState { id: AlarmId, state: AlarmState },

    #[error("Silence duration must be positive")]
    InvalidDuration,

    #[error(transparent)]
    InvalidThreshold(#[from] ValidationFault),

    #[error("Monitoring engine is not running")]
    Unavailable,
}

/// Sustained pressure on a bounded structure.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum CapacityFault {
    #[error("Vitals cache evicted {evicted} unpersisted sample(s) under capacity pressure")]
    EvictionPressure { evicted: u64 },

    #[error("Channel '{channel}' full, {dropped} message(s) dropped")]
    ChannelFull { channel: &'static str, dropped: u64 },
}

/// Health problems detected by the watchdog. Always surfaced to the operator.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SchedulingFault {
    #[error("{component} ({tier:?}) missed its heartbeat for {age_ms} ms")]
    MissedHeartbeat {
        component: String,
        tier: PriorityTier,
        age_ms: u64,
    },

    #[error("{starved} is starved while {monopolizer} overruns its budget")]
    Starvation { starved: String, monopolizer: String },

    #[error("Tier {tier:?} already hosts {holder}")]
    TierOccupied { tier: PriorityTier, holder: String },

    #[error("{component} restarted {attempts} time(s) without recovering")]
    RestartsExhausted { component: String, attempts: u32 },

    #[error("Priority control failed: {0}")]
    PriorityControl(String),
}

/// Custom error type for the monitoring core
#[derive(Error, Debug)]
pub enum BedsideError {
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Transport fault: {0}")]
    Transport(#[from] TransportFault),

    #[error("Validation fault: {0}")]
    Validation(#[from] ValidationFault),

    #[error("State fault: {0}")]
    State(#[from] StateFault),

    #[error("Capacity fault: {0}")]
    Capacity(#[from] CapacityFault),

    #[error("Scheduling fault: {0}")]
    Scheduling(#[from] SchedulingFault),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Telemetry error: {0}")]
    Telemetry(String),
}

/// Result type alias for the monitoring core
pub type Result<T> = std::result::Result<T, BedsideError>;

impl BedsideError {
    /// Create a storage error
    pub fn storage<S: Into<String>>(msg: S) -> Self {
        BedsideError::Storage(msg.into())
    }

    /// Create a telemetry error
    pub fn telemetry<S: Into<String>>(msg: S) -> Self {
        BedsideError::Telemetry(msg.into())
    }
}

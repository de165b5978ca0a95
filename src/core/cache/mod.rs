//! In-memory history of vitals and waveforms, plus the sample types.

pub mod vitals;
pub mod waveform;

pub use vitals::{PendingSamples, PersistMark, VitalsCache, VitalsCacheConfig, VitalsRange};
pub use waveform::WaveformCache;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::core::clock::from_epoch_ns;
use crate::core::transport::VitalsFrame;
use crate::error::ValidationFault;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum VitalType {
    HeartRate,
    SpO2,
    RespirationRate,
}

impl VitalType {
    pub const ALL: [VitalType; 3] = [VitalType::HeartRate, VitalType::SpO2, VitalType::RespirationRate];

    /// Values outside this range cannot come from a living patient and are
    /// treated as sensor faults.
    pub fn physiological_range(self) -> (f32, f32) {
        match self {
            VitalType::HeartRate => (0.0, 300.0),
            VitalType::SpO2 => (0.0, 100.0),
            VitalType::RespirationRate => (0.0, 150.0),
        }
    }

    pub fn unit(self) -> &'static str {
        match self {
            VitalType::HeartRate => "bpm",
            VitalType::SpO2 => "%",
            VitalType::RespirationRate => "br/min",
        }
    }
}

impl fmt::Display for VitalType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            VitalType::HeartRate => "heart rate",
            VitalType::SpO2 => "SpO2",
            VitalType::RespirationRate => "respiration rate",
        };
        f.write_str(name)
    }
}

/// Admitted patient the samples belong to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct PatientContextId(pub u32);

impl fmt::Display for PatientContextId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "patient-{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u8);

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct VitalSample {
    pub timestamp: DateTime<Utc>,
    pub patient: Option<PatientContextId>,
    pub heart_rate: Option<f32>,
    pub spo2: Option<f32>,
    pub respiration_rate: Option<f32>,
    pub sequence: u64,
}

impl VitalSample {
    /// Build a sample from a decoded frame, rejecting impossible values.
    pub fn from_frame(frame: &VitalsFrame) -> Result<Self, ValidationFault> {
        let sample = Self {
            timestamp: from_epoch_ns(frame.timestamp_ns),
            patient: (frame.patient != 0).then_some(PatientContextId(frame.patient)),
            heart_rate: frame.heart_rate,
            spo2: frame.spo2,
            respiration_rate: frame.respiration_rate,
            sequence: frame.sequence,
        };
        sample.validate()?;
        Ok(sample)
    }

    pub fn value(&self, vital: VitalType) -> Option<f32> {
        match vital {
            VitalType::HeartRate => self.heart_rate,
            VitalType::SpO2 => self.spo2,
            VitalType::RespirationRate => self.respiration_rate,
        }
    }

    pub fn validate(&self) -> Result<(), ValidationFault> {
        let mut any = false;
        for vital in VitalType::ALL {
            let Some(value) = self.value(vital) else {
                continue;
            };
            any = true;
            let (low, high) = vital.physiological_range();
            if value.is_nan() || value < low || value > high {
                return Err(ValidationFault::ImpossibleValue { vital, value });
            }
        }
        if any {
            Ok(())
        } else {
            Err(ValidationFault::EmptyVitals)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct WaveformSample {
    pub timestamp: DateTime<Utc>,
    pub channel: ChannelId,
    pub sample_rate_hz: f32,
    pub value: f32,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(hr: Option<f32>, spo2: Option<f32>) -> VitalsFrame {
        VitalsFrame {
            sequence: 3,
            timestamp_ns: 1_700_000_000_000_000_000,
            patient: 0,
            heart_rate: hr,
            spo2,
            respiration_rate: None,
        }
    }

    #[test]
    fn test_sample_from_frame() {
        let sample = VitalSample::from_frame(&frame(Some(72.0), Some(97.0))).unwrap();
        assert_eq!(sample.patient, None);
        assert_eq!(sample.value(VitalType::HeartRate), Some(72.0));
        assert_eq!(sample.value(VitalType::RespirationRate), None);
    }

    #[test]
    fn test_impossible_values_rejected() {
        assert_eq!(
            VitalSample::from_frame(&frame(Some(400.0), None)),
            Err(ValidationFault::ImpossibleValue {
                vital: VitalType::HeartRate,
                value: 400.0
            })
        );
        assert!(matches!(
            VitalSample::from_frame(&frame(None, Some(f32::NAN))),
            Err(ValidationFault::ImpossibleValue {
                vital: VitalType::SpO2,
                ..
            })
        ));
        assert!(VitalSample::from_frame(&frame(Some(-1.0), None)).is_err());
    }

    #[test]
    fn test_frame_without_values_rejected() {
        assert_eq!(
            VitalSample::from_frame(&frame(None, None)),
            Err(ValidationFault::EmptyVitals)
        );
    }
}

//! Fixed-size frame codec.
//!
//! Slot layout (little-endian, `FRAME_SIZE` bytes):
//!
//! | offset | size | field |
//! |-------:|-----:|-------|
//! | 0   | 1  | kind (1 vitals, 2 waveform, 3 heartbeat) |
//! | 1   | 1  | channel |
//! | 2   | 2  | sample count |
//! | 4   | 4  | channel mask |
//! | 8   | 8  | sequence |
//! | 16  | 8  | timestamp, ns since the Unix epoch |
//! | 24  | 16 | vital payload: heart rate, SpO2, respiration rate (f32), patient (u32, 0 = none) |
//! | 40  | 4  | sample rate (f32) |
//! | 44  | 208 | waveform payload, up to 52 × f32 |
//! | 252 | 4  | CRC32 of bytes 0..252 |

use crate::error::TransportFault;

pub const FRAME_SIZE: usize = 256;
pub const MAX_WAVEFORM_SAMPLES: usize = 52;

const OFF_KIND: usize = 0;
const OFF_CHANNEL: usize = 1;
const OFF_SAMPLE_COUNT: usize = 2;
const OFF_MASK: usize = 4;
const OFF_SEQUENCE: usize = 8;
const OFF_TIMESTAMP: usize = 16;
const OFF_HEART_RATE: usize = 24;
const OFF_SPO2: usize = 28;
const OFF_RESP_RATE: usize = 32;
const OFF_PATIENT: usize = 36;
const OFF_SAMPLE_RATE: usize = 40;
const OFF_WAVEFORM: usize = 44;
const OFF_CRC: usize = FRAME_SIZE - 4;

const MASK_HEART_RATE: u32 = 1;
const MASK_SPO2: u32 = 1 << 1;
const MASK_RESP_RATE: u32 = 1 << 2;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum FrameKind {
    Vitals = 1,
    Waveform = 2,
    Heartbeat = 3,
}

impl FrameKind {
    fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(FrameKind::Vitals),
            2 => Some(FrameKind::Waveform),
            3 => Some(FrameKind::Heartbeat),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct VitalsFrame {
    pub sequence: u64,
    pub timestamp_ns: u64,
    /// Patient context, 0 when no patient is admitted.
    pub patient: u32,
    pub heart_rate: Option<f32>,
    pub spo2: Option<f32>,
    pub respiration_rate: Option<f32>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct WaveformFrame {
    pub sequence: u64,
    pub timestamp_ns: u64,
    pub channel: u8,
    pub sample_rate_hz: f32,
    count: u16,
    samples: [f32; MAX_WAVEFORM_SAMPLES],
}

impl WaveformFrame {
    /// Build a waveform frame; samples beyond `MAX_WAVEFORM_SAMPLES` are
    /// dropped.
    pub fn new(sequence: u64, timestamp_ns: u64, channel: u8, sample_rate_hz: f32, values: &[f32]) -> Self {
        let count = values.len().min(MAX_WAVEFORM_SAMPLES);
        let mut samples = [0.0; MAX_WAVEFORM_SAMPLES];
        samples[..count].copy_from_slice(&values[..count]);
        Self {
            sequence,
            timestamp_ns,
            channel,
            sample_rate_hz,
            count: count as u16,
            samples,
        }
    }

    pub fn samples(&self) -> &[f32] {
        &self.samples[..self.count as usize]
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct HeartbeatFrame {
    pub sequence: u64,
    pub timestamp_ns: u64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Frame {
    Vitals(VitalsFrame),
    Waveform(WaveformFrame),
    Heartbeat(HeartbeatFrame),
}

impl Frame {
    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Vitals(_) => FrameKind::Vitals,
            Frame::Waveform(_) => FrameKind::Waveform,
            Frame::Heartbeat(_) => FrameKind::Heartbeat,
        }
    }

    pub fn sequence(&self) -> u64 {
        match self {
            Frame::Vitals(f) => f.sequence,
            Frame::Waveform(f) => f.sequence,
            Frame::Heartbeat(f) => f.sequence,
        }
    }

    pub fn timestamp_ns(&self) -> u64 {
        match self {
            Frame::Vitals(f) => f.timestamp_ns,
            Frame::Waveform(f) => f.timestamp_ns,
            Frame::Heartbeat(f) => f.timestamp_ns,
        }
    }

    /// Source channel the sequence number is counted on.
    pub fn source(&self) -> (FrameKind, u8) {
        match self {
            Frame::Waveform(f) => (FrameKind::Waveform, f.channel),
            other => (other.kind(), 0),
        }
    }

    pub fn encode(&self, out: &mut [u8; FRAME_SIZE]) {
        out.fill(0);
        out[OFF_KIND] = self.kind() as u8;
        put_u64(out, OFF_SEQUENCE, self.sequence());
        put_u64(out, OFF_TIMESTAMP, self.timestamp_ns());

        match self {
            Frame::Vitals(v) => {
                let mut mask = 0;
                if let Some(hr) = v.heart_rate {
                    mask |= MASK_HEART_RATE;
                    put_f32(out, OFF_HEART_RATE, hr);
                }
                if let Some(spo2) = v.spo2 {
                    mask |= MASK_SPO2;
                    put_f32(out, OFF_SPO2, spo2);
                }
                if let Some(rr) = v.respiration_rate {
                    mask |= MASK_RESP_RATE;
                    put_f32(out, OFF_RESP_RATE, rr);
                }
                put_u32(out, OFF_MASK, mask);
                put_u32(out, OFF_PATIENT, v.patient);
            }
            Frame::Waveform(w) => {
                out[OFF_CHANNEL] = w.channel;
                put_u16(out, OFF_SAMPLE_COUNT, w.count);
                put_u32(out, OFF_MASK, 1u32 << (w.channel % 32));
                put_f32(out, OFF_SAMPLE_RATE, w.sample_rate_hz);
                for (i, value) in w.samples().iter().enumerate() {
                    put_f32(out, OFF_WAVEFORM + i * 4, *value);
                }
            }
            Frame::Heartbeat(_) => {}
        }

        let crc = crc32fast::hash(&out[..OFF_CRC]);
        put_u32(out, OFF_CRC, crc);
    }

    /// Validate the checksum, then decode. `index` only labels faults.
    pub fn decode(buf: &[u8; FRAME_SIZE], index: u64) -> Result<Frame, TransportFault> {
        let stored = get_u32(buf, OFF_CRC);
        if crc32fast::hash(&buf[..OFF_CRC]) != stored {
            return Err(TransportFault::ChecksumMismatch { index });
        }

        let kind = FrameKind::from_u8(buf[OFF_KIND]).ok_or(TransportFault::Malformed {
            index,
            reason: "unknown frame kind",
        })?;
        let sequence = get_u64(buf, OFF_SEQUENCE);
        let timestamp_ns = get_u64(buf, OFF_TIMESTAMP);

        let frame = match kind {
            FrameKind::Vitals => {
                let mask = get_u32(buf, OFF_MASK);
                let field = |bit: u32, offset: usize| (mask & bit != 0).then(|| get_f32(buf, offset));
                Frame::Vitals(VitalsFrame {
                    sequence,
                    timestamp_ns,
                    patient: get_u32(buf, OFF_PATIENT),
                    heart_rate: field(MASK_HEART_RATE, OFF_HEART_RATE),
                    spo2: field(MASK_SPO2, OFF_SPO2),
                    respiration_rate: field(MASK_RESP_RATE, OFF_RESP_RATE),
                })
            }
            FrameKind::Waveform => {
                let count = get_u16(buf, OFF_SAMPLE_COUNT) as usize;
                if count > MAX_WAVEFORM_SAMPLES {
                    return Err(TransportFault::Malformed {
                        index,
                        reason: "sample count exceeds payload",
                    });
                }
                let sample_rate_hz = get_f32(buf, OFF_SAMPLE_RATE);
                if !sample_rate_hz.is_finite() || sample_rate_hz <= 0.0 {
                    return Err(TransportFault::Malformed {
                        index,
                        reason: "invalid sample rate",
                    });
                }
                let mut samples = [0.0; MAX_WAVEFORM_SAMPLES];
                for (i, slot) in samples.iter_mut().take(count).enumerate() {
                    *slot = get_f32(buf, OFF_WAVEFORM + i * 4);
                }
                Frame::Waveform(WaveformFrame {
                    sequence,
                    timestamp_ns,
                    channel: buf[OFF_CHANNEL],
                    sample_rate_hz,
                    count: count as u16,
                    samples,
                })
            }
            FrameKind::Heartbeat => Frame::Heartbeat(HeartbeatFrame {
                sequence,
                timestamp_ns,
            }),
        };
        Ok(frame)
    }
}

fn put_u16(buf: &mut [u8], offset: usize, value: u16) {
    buf[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_u32(buf: &mut [u8], offset: usize, value: u32) {
    buf[offset..offset + 4].copy_from_slice(&value.to_le_bytes());
}

fn put_u64(buf: &mut [u8], offset: usize, value: u64) {
    buf[offset..offset + 8].copy_from_slice(&value.to_le_bytes());
}

fn put_f32(buf: &mut [u8], offset: usize, value: f32) {
    put_u32(buf, offset, value.to_bits());
}

fn get_u16(buf: &[u8], offset: usize) -> u16 {
    u16::from_le_bytes([buf[offset], buf[offset + 1]])
}

fn get_u32(buf: &[u8], offset: usize) -> u32 {
    let mut bytes = [0u8; 4];
    bytes.copy_from_slice(&buf[offset..offset + 4]);
    u32::from_le_bytes(bytes)
}

fn get_u64(buf: &[u8], offset: usize) -> u64 {
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&buf[offset..offset + 8]);
    u64::from_le_bytes(bytes)
}

fn get_f32(buf: &[u8], offset: usize) -> f32 {
    f32::from_bits(get_u32(buf, offset))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vitals() -> Frame {
        Frame::Vitals(VitalsFrame {
            sequence: 7,
            timestamp_ns: 1_700_000_000_000_000_000,
            patient: 42,
            heart_rate: Some(72.0),
            spo2: None,
            respiration_rate: Some(14.0),
        })
    }

    #[test]
    fn test_vitals_keep_missing_fields_missing() {
        let mut buf = [0u8; FRAME_SIZE];
        vitals().encode(&mut buf);
        assert_eq!(Frame::decode(&buf, 0).unwrap(), vitals());
    }

    #[test]
    fn test_waveform_payload_truncated_to_capacity() {
        let values: Vec<f32> = (0..80).map(|i| i as f32).collect();
        let frame = WaveformFrame::new(1, 2, 3, 250.0, &values);
        assert_eq!(frame.samples().len(), MAX_WAVEFORM_SAMPLES);

        let mut buf = [0u8; FRAME_SIZE];
        Frame::Waveform(frame).encode(&mut buf);
        match Frame::decode(&buf, 0).unwrap() {
            Frame::Waveform(decoded) => {
                assert_eq!(decoded.channel, 3);
                assert_eq!(decoded.samples()[51], 51.0);
            }
            other => panic!("unexpected frame {:?}", other),
        }
    }

    #[test]
    fn test_single_flipped_bit_fails_checksum() {
        let mut buf = [0u8; FRAME_SIZE];
        vitals().encode(&mut buf);
        buf[OFF_HEART_RATE] ^= 0x01;
        assert_eq!(
            Frame::decode(&buf, 9),
            Err(TransportFault::ChecksumMismatch { index: 9 })
        );
    }

    #[test]
    fn test_unknown_kind_is_malformed() {
        let mut buf = [0u8; FRAME_SIZE];
        buf[OFF_KIND] = 9;
        let crc = crc32fast::hash(&buf[..OFF_CRC]);
        put_u32(&mut buf, OFF_CRC, crc);
        assert!(matches!(
            Frame::decode(&buf, 0),
            Err(TransportFault::Malformed { .. })
        ));
    }

    #[test]
    fn test_zeroed_slot_is_rejected() {
        let buf = [0u8; FRAME_SIZE];
        assert!(Frame::decode(&buf, 0).is_err());
    }
}

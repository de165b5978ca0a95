//! Synthetic frame producer.
//!
//! Writes plausible vitals, ECG and pleth waveforms, and heartbeats into a
//! ring. Used by the `simulate` and `produce` commands and by tests that
//! need a live source.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::f64::consts::PI;
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crate::core::cache::VitalType;
use crate::core::clock::{to_epoch_ns, Clock};
use crate::core::transport::{Frame, HeartbeatFrame, RingWriter, VitalsFrame, WaveformFrame, MAX_WAVEFORM_SAMPLES};

pub const ECG_CHANNEL: u8 = 0;
pub const PLETH_CHANNEL: u8 = 1;

#[derive(Debug, Clone)]
pub struct SimulatorConfig {
    pub vitals_interval: Duration,
    pub waveform_rate_hz: f32,
    /// Waveform samples are sent in chunks of this much signal time.
    pub waveform_chunk: Duration,
    pub heartbeat_interval: Duration,
    pub patient: u32,
    pub seed: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            vitals_interval: Duration::from_secs(1),
            waveform_rate_hz: 250.0,
            waveform_chunk: Duration::from_millis(100),
            heartbeat_interval: Duration::from_millis(100),
            patient: 1,
            seed: 0x5eed,
        }
    }
}

/// Forces one vital to a fixed value for a stretch of simulated time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Excursion {
    pub vital: VitalType,
    pub start: Duration,
    pub duration: Duration,
    pub value: f32,
}

impl Excursion {
    pub fn new(vital: VitalType, start: Duration, duration: Duration, value: f32) -> Self {
        Self {
            vital,
            start,
            duration,
            value,
        }
    }

    fn covers(&self, elapsed: Duration) -> bool {
        elapsed >= self.start && elapsed < self.start + self.duration
    }
}

/// Tachycardia at 10 s for 30 s, then desaturation at 60 s for 20 s.
pub fn demo_script() -> Vec<Excursion> {
    vec![
        Excursion::new(VitalType::HeartRate, Duration::from_secs(10), Duration::from_secs(30), 135.0),
        Excursion::new(VitalType::SpO2, Duration::from_secs(60), Duration::from_secs(20), 86.0),
    ]
}

pub struct Simulator {
    writer: RingWriter,
    clock: Arc<dyn Clock>,
    config: SimulatorConfig,
    script: Vec<Excursion>,
    rng: StdRng,
    started_ns: u64,
    next_vitals_ns: u64,
    next_chunk_ns: u64,
    next_heartbeat_ns: u64,
    vitals_sequence: u64,
    waveform_sequence: [u64; 2],
    heartbeat_sequence: u64,
    samples_sent: u64,
}

impl std::fmt::Debug for Simulator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Simulator")
            .field("config", &self.config)
            .field("vitals_sequence", &self.vitals_sequence)
            .finish()
    }
}

impl Simulator {
    pub fn new(writer: RingWriter, clock: Arc<dyn Clock>, config: SimulatorConfig, script: Vec<Excursion>) -> Self {
        let now = clock.monotonic_ns();
        let rng = StdRng::seed_from_u64(config.seed);
        Self {
            writer,
            clock,
            config,
            script,
            rng,
            started_ns: now,
            next_vitals_ns: now,
            next_chunk_ns: now,
            next_heartbeat_ns: now,
            vitals_sequence: 0,
            waveform_sequence: [0; 2],
            heartbeat_sequence: 0,
            samples_sent: 0,
        }
    }

    pub fn elapsed(&self) -> Duration {
        Duration::from_nanos(self.clock.monotonic_ns().saturating_sub(self.started_ns))
    }

    /// Vitals for `elapsed` into the run: slow drift plus noise, overridden
    /// by any active excursion.
    pub fn vitals_at(&mut self, elapsed: Duration) -> (f32, f32, f32) {
        let t = elapsed.as_secs_f64();
        let mut hr = (75.0 + 8.0 * (t * 0.05).sin() + self.rng.gen_range(-2.0..2.0)) as f32;
        let mut spo2 = (97.5_f64 + self.rng.gen_range(-1.0..1.0)).clamp(0.0, 100.0) as f32;
        let mut rr = (14.0 + 2.0 * (t * 0.02).sin() + self.rng.gen_range(-1.0..1.0)) as f32;

        for excursion in self.script.iter().filter(|e| e.covers(elapsed)) {
            match excursion.vital {
                VitalType::HeartRate => hr = excursion.value,
                VitalType::SpO2 => spo2 = excursion.value,
                VitalType::RespirationRate => rr = excursion.value,
            }
        }
        (hr, spo2, rr)
    }

    fn heart_period(&self, elapsed: Duration) -> f64 {
        let hr = self
            .script
            .iter()
            .find(|e| e.vital == VitalType::HeartRate && e.covers(elapsed))
            .map(|e| e.value as f64)
            .unwrap_or(75.0);
        60.0 / hr.max(20.0)
    }

    /// Synthetic ECG: P, QRS and T bumps once per beat.
    fn ecg(&mut self, t: f64, period: f64) -> f32 {
        let phase = (t % period) / period;
        let bump = |center: f64, width: f64, height: f64| height * (-((phase - center) / width).powi(2)).exp();
        let value = bump(0.2, 0.03, 0.15) - bump(0.37, 0.01, 0.1) + bump(0.4, 0.012, 1.2) - bump(0.43, 0.01, 0.25)
            + bump(0.7, 0.05, 0.3);
        (value + self.rng.gen_range(-0.02..0.02)) as f32
    }

    fn pleth(&self, t: f64, period: f64) -> f32 {
        let phase = 2.0 * PI * (t % period) / period;
        (0.5 + 0.4 * phase.sin() + 0.1 * (2.0 * phase).sin()) as f32
    }

    /// Publish every frame due by now. Returns the number of frames written.
    pub fn step(&mut self) -> usize {
        let now_ns = self.clock.monotonic_ns();
        let mut published = 0;

        if now_ns >= self.next_vitals_ns {
            self.next_vitals_ns = now_ns + self.config.vitals_interval.as_nanos() as u64;
            let (hr, spo2, rr) = self.vitals_at(self.elapsed());
            self.vitals_sequence += 1;
            let frame = Frame::Vitals(VitalsFrame {
                sequence: self.vitals_sequence,
                timestamp_ns: to_epoch_ns(self.clock.now()),
                patient: self.config.patient,
                heart_rate: Some(hr),
                spo2: Some(spo2),
                respiration_rate: Some(rr),
            });
            self.writer.publish(&frame, now_ns);
            published += 1;
        }

        if now_ns >= self.next_chunk_ns {
            self.next_chunk_ns = now_ns + self.config.waveform_chunk.as_nanos() as u64;
            published += self.publish_waveforms(now_ns);
        }

        if now_ns >= self.next_heartbeat_ns {
            self.next_heartbeat_ns = now_ns + self.config.heartbeat_interval.as_nanos() as u64;
            self.heartbeat_sequence += 1;
            let frame = Frame::Heartbeat(HeartbeatFrame {
                sequence: self.heartbeat_sequence,
                timestamp_ns: to_epoch_ns(self.clock.now()),
            });
            self.writer.publish(&frame, now_ns);
            published += 1;
        }

        self.writer.beat(now_ns);
        published
    }

    fn publish_waveforms(&mut self, now_ns: u64) -> usize {
        let rate = self.config.waveform_rate_hz as f64;
        let count = ((self.config.waveform_chunk.as_secs_f64() * rate).round() as usize).clamp(1, MAX_WAVEFORM_SAMPLES);
        let first = self.samples_sent;
        let start = self.clock.now();
        let elapsed = self.elapsed();
        let period = self.heart_period(elapsed);

        let mut ecg = [0.0f32; MAX_WAVEFORM_SAMPLES];
        let mut pleth = [0.0f32; MAX_WAVEFORM_SAMPLES];
        for i in 0..count {
            let t = (first + i as u64) as f64 / rate;
            ecg[i] = self.ecg(t, period);
            pleth[i] = self.pleth(t, period);
        }
        self.samples_sent += count as u64;

        let timestamp_ns = to_epoch_ns(start);
        for (slot, (channel, values)) in [(ECG_CHANNEL, &ecg[..count]), (PLETH_CHANNEL, &pleth[..count])]
            .into_iter()
            .enumerate()
        {
            self.waveform_sequence[slot] += 1;
            let frame = Frame::Waveform(WaveformFrame::new(
                self.waveform_sequence[slot],
                timestamp_ns,
                channel,
                self.config.waveform_rate_hz,
                values,
            ));
            self.writer.publish(&frame, now_ns);
        }
        2
    }

    /// Step until `stop` is set, sleeping `tick` between steps.
    pub fn run(mut self, stop: &AtomicBool, tick: Duration) {
        while !stop.load(Ordering::Acquire) {
            self.step();
            std::thread::sleep(tick);
        }
        log::info!("Simulator stopped after {} vitals frames", self.vitals_sequence);
    }
}

/// Run `simulator` on its own thread until `stop` is set.
pub fn spawn_simulator(simulator: Simulator, stop: Arc<AtomicBool>) -> io::Result<JoinHandle<()>> {
    std::thread::Builder::new()
        .name("bedside-sim".to_string())
        .spawn(move || simulator.run(&stop, Duration::from_millis(5)))
}

//! Telemetry batching, signing and hand-off.
//!
//! The real-time thread only accumulates and closes batches; signing and
//! submission happen on the background worker.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};
use uuid::Uuid;

use crate::core::alarm::AlarmRecord;
use crate::core::cache::VitalSample;
use crate::error::{BedsideError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TelemetryWindow {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
}

/// A closed batch. Contents are fixed; only the signature may be attached,
/// once.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TelemetryBatch {
    id: Uuid,
    window: TelemetryWindow,
    samples: Vec<VitalSample>,
    alarms: Vec<AlarmRecord>,
    signature: Option<String>,
}

#[derive(Serialize)]
struct SignedContent<'a> {
    id: &'a Uuid,
    window: &'a TelemetryWindow,
    samples: &'a [VitalSample],
    alarms: &'a [AlarmRecord],
}

impl TelemetryBatch {
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn window(&self) -> TelemetryWindow {
        self.window
    }

    pub fn samples(&self) -> &[VitalSample] {
        &self.samples
    }

    pub fn alarms(&self) -> &[AlarmRecord] {
        &self.alarms
    }

    pub fn signature(&self) -> Option<&str> {
        self.signature.as_deref()
    }

    /// The bytes a signature covers: everything except the signature.
    pub fn content_bytes(&self) -> Result<Vec<u8>> {
        Ok(serde_json::to_vec(&SignedContent {
            id: &self.id,
            window: &self.window,
            samples: &self.samples,
            alarms: &self.alarms,
        })?)
    }

    pub fn attach_signature(&mut self, signature: String) -> Result<()> {
        if self.signature.is_some() {
            return Err(BedsideError::telemetry(format!("batch {} is already signed", self.id)));
        }
        self.signature = Some(signature);
        Ok(())
    }
}

/// Produces a content signature for a batch.
pub trait BatchSigner: Send + Sync {
    fn sign(&self, content: &[u8]) -> Result<String>;
}

/// Keyed SHA-256 over the batch content, hex encoded.
#[derive(Debug, Clone)]
pub struct Sha256Signer {
    key: Vec<u8>,
}

impl Sha256Signer {
    pub fn new(key: impl Into<Vec<u8>>) -> Self {
        Self { key: key.into() }
    }
}

impl BatchSigner for Sha256Signer {
    fn sign(&self, content: &[u8]) -> Result<String> {
        let mut hasher = Sha256::new();
        hasher.update(&self.key);
        hasher.update(content);
        Ok(format!("{:x}", hasher.finalize()))
    }
}

/// Receives each signed batch exactly once. Retries are its own business.
pub trait TelemetrySink: Send + Sync {
    fn submit(&self, batch: &TelemetryBatch) -> Result<()>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct LogTelemetrySink;

impl TelemetrySink for LogTelemetrySink {
    fn submit(&self, batch: &TelemetryBatch) -> Result<()> {
        log::info!(
            "Telemetry batch {} ({} samples, {} alarms, {} → {})",
            batch.id,
            batch.samples.len(),
            batch.alarms.len(),
            batch.window.start.format("%H:%M:%S"),
            batch.window.end.format("%H:%M:%S")
        );
        Ok(())
    }
}

struct OpenBatch {
    opened_at: DateTime<Utc>,
    samples: Vec<VitalSample>,
    alarms: Vec<AlarmRecord>,
}

/// Collects samples until a count or age limit, then closes the batch.
pub struct BatchAccumulator {
    max_samples: usize,
    max_duration: Duration,
    open: Option<OpenBatch>,
}

impl BatchAccumulator {
    pub fn new(max_samples: usize, max_duration: Duration) -> Self {
        Self {
            max_samples: max_samples.max(1),
            max_duration,
            open: None,
        }
    }

    fn open_batch(&mut self, now: DateTime<Utc>) -> &mut OpenBatch {
        let max_samples = self.max_samples;
        self.open.get_or_insert_with(|| OpenBatch {
            opened_at: now,
            samples: Vec::with_capacity(max_samples),
            alarms: Vec::new(),
        })
    }

    /// Add a sample; returns the closed batch if this filled it.
    pub fn add_sample(&mut self, sample: VitalSample, now: DateTime<Utc>) -> Option<TelemetryBatch> {
        let max_samples = self.max_samples;
        let batch = self.open_batch(now);
        batch.samples.push(sample);
        if batch.samples.len() >= max_samples {
            return self.close(now).ok();
        }
        None
    }

    pub fn add_alarm(&mut self, alarm: AlarmRecord, now: DateTime<Utc>) {
        self.open_batch(now).alarms.push(alarm);
    }

    /// Close the batch if it has been open for the maximum duration.
    pub fn poll(&mut self, now: DateTime<Utc>) -> Option<TelemetryBatch> {
        let expired = self
            .open
            .as_ref()
            .map(|b| now - b.opened_at >= self.max_duration)
            .unwrap_or(false);
        if expired {
            return self.close(now).ok();
        }
        None
    }

    /// Close the open batch. An empty batch cannot be closed; it stays open.
    pub fn close(&mut self, now: DateTime<Utc>) -> Result<TelemetryBatch> {
        let empty = self
            .open
            .as_ref()
            .map(|b| b.samples.is_empty() && b.alarms.is_empty())
            .unwrap_or(true);
        if empty {
            return Err(BedsideError::telemetry("cannot close an empty batch"));
        }
        let Some(open) = self.open.take() else {
            return Err(BedsideError::telemetry("cannot close an empty batch"));
        };
        Ok(TelemetryBatch {
            id: Uuid::new_v4(),
            window: TelemetryWindow {
                start: open.opened_at,
                end: now,
            },
            samples: open.samples,
            alarms: open.alarms,
            signature: None,
        })
    }

    pub fn pending_samples(&self) -> usize {
        self.open.as_ref().map(|b| b.samples.len()).unwrap_or(0)
    }
}

/// Sign one batch and submit it.
pub fn deliver(mut batch: TelemetryBatch, signer: &dyn BatchSigner, sink: &dyn TelemetrySink) -> Result<()> {
    let signature = signer.sign(&batch.content_bytes()?)?;
    batch.attach_signature(signature)?;
    sink.submit(&batch)
}

/// Background worker: sign and submit every batch handed over.
pub async fn telemetry_worker(
    batches: &mut mpsc::Receiver<TelemetryBatch>,
    signer: Arc<dyn BatchSigner>,
    sink: Arc<dyn TelemetrySink>,
    mut shutdown: broadcast::Receiver<()>,
    on_beat: impl Fn() + Send,
) {
    let mut ticker = tokio::time::interval(std::time::Duration::from_millis(500));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe = batches.recv() => {
                let Some(batch) = maybe else { break };
                let id = batch.id();
                if let Err(e) = deliver(batch, signer.as_ref(), sink.as_ref()) {
                    log::warn!("Telemetry batch {} not delivered: {}", id, e);
                }
                on_beat();
            }
            _ = ticker.tick() => on_beat(),
            _ = shutdown.recv() => {
                log::debug!("Telemetry worker shutting down");
                break;
            }
        }
    }
}

//! Periodic hand-off of cached vitals and resolved alarms to storage.

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::Serialize;
use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc};

use crate::core::alarm::AlarmRecord;
use crate::core::cache::{VitalSample, VitalsCache};
use crate::error::{BedsideError, Result};

/// Sent by the real-time thread; fire and forget.
#[derive(Debug, Clone)]
pub struct PersistRequest {
    pub requested_at: DateTime<Utc>,
    pub resolved_alarms: Vec<AlarmRecord>,
}

/// Durable storage for vitals and resolved alarms. `store` returning `Ok`
/// means the entries are written and may be released from memory.
pub trait StorageSink: Send + Sync {
    fn store(&self, vitals: &[VitalSample], alarms: &[AlarmRecord]) -> Result<()>;
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum ArchiveEntry<'a> {
    Vitals(&'a VitalSample),
    Alarm(&'a AlarmRecord),
}

/// Appends one JSON object per line to a file.
#[derive(Debug)]
pub struct JsonLinesArchive {
    path: PathBuf,
    file: Mutex<Option<File>>,
}

impl JsonLinesArchive {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            file: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn open(&self) -> Result<File> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        Ok(OpenOptions::new().create(true).append(true).open(&self.path)?)
    }
}

impl StorageSink for JsonLinesArchive {
    fn store(&self, vitals: &[VitalSample], alarms: &[AlarmRecord]) -> Result<()> {
        let mut guard = self.file.lock();
        if guard.is_none() {
            *guard = Some(self.open()?);
        }
        let Some(file) = guard.as_mut() else {
            return Err(BedsideError::storage("archive file unavailable"));
        };

        let mut out = BufWriter::new(file);
        let entries = vitals
            .iter()
            .map(ArchiveEntry::Vitals)
            .chain(alarms.iter().map(ArchiveEntry::Alarm));
        for entry in entries {
            serde_json::to_writer(&mut out, &entry)?;
            out.write_all(b"\n")?;
        }
        out.flush()?;
        out.get_ref().sync_data()?;
        Ok(())
    }
}

/// Store whatever the cache has not yet persisted, plus `alarms`, and
/// release the stored samples from the cache's pending set.
///
/// Returns the number of samples written.
pub fn persist_once(cache: &VitalsCache, sink: &dyn StorageSink, alarms: &[AlarmRecord]) -> Result<usize> {
    let pending = cache.unpersisted();
    if pending.is_empty() && alarms.is_empty() {
        return Ok(0);
    }
    sink.store(pending.samples(), alarms)?;
    if let Some(mark) = pending.mark() {
        cache.mark_persisted(mark);
    }
    Ok(pending.len())
}

/// Background worker serving [`PersistRequest`]s.
///
/// Writes run on the blocking pool. Alarms from a failed write are kept and
/// retried with the next request.
pub async fn storage_worker(
    requests: &mut mpsc::Receiver<PersistRequest>,
    cache: Arc<VitalsCache>,
    sink: Arc<dyn StorageSink>,
    mut shutdown: broadcast::Receiver<()>,
    on_beat: impl Fn() + Send,
) {
    let mut carried: Vec<AlarmRecord> = Vec::new();
    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(2));
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

    loop {
        tokio::select! {
            maybe = requests.recv() => {
                let Some(request) = maybe else { break };
                carried.extend(request.resolved_alarms);
                let task_cache = Arc::clone(&cache);
                let task_sink = Arc::clone(&sink);
                let alarms = carried.clone();
                let outcome = tokio::task::spawn_blocking(move || {
                    persist_once(&task_cache, task_sink.as_ref(), &alarms)
                })
                .await;
                match outcome {
                    Ok(Ok(written)) => {
                        log::debug!(
                            "Persisted {} sample(s) and {} alarm(s)",
                            written,
                            carried.len()
                        );
                        carried.clear();
                    }
                    Ok(Err(e)) => log::warn!("Persistence failed, will retry: {}", e),
                    Err(e) => log::error!("Persistence task did not complete: {}", e),
                }
                on_beat();
            }
            _ = ticker.tick() => on_beat(),
            _ = shutdown.recv() => {
                log::debug!("Storage worker shutting down");
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::cache::VitalsCacheConfig;
    use std::sync::atomic::{AtomicBool, Ordering};

    fn sample(secs: i64) -> VitalSample {
        VitalSample {
            timestamp: DateTime::<Utc>::from_timestamp(1_700_000_000 + secs, 0).unwrap(),
            patient: None,
            heart_rate: Some(80.0),
            spo2: Some(97.0),
            respiration_rate: None,
            sequence: secs as u64,
        }
    }

    struct FlakySink {
        fail: AtomicBool,
        stored: Mutex<usize>,
    }

    impl StorageSink for FlakySink {
        fn store(&self, vitals: &[VitalSample], _alarms: &[AlarmRecord]) -> Result<()> {
            if self.fail.load(Ordering::SeqCst) {
                return Err(BedsideError::storage("disk unavailable"));
            }
            *self.stored.lock() += vitals.len();
            Ok(())
        }
    }

    #[test]
    fn test_archive_writes_one_line_per_entry() {
        let dir = tempfile::tempdir().unwrap();
        let archive = JsonLinesArchive::new(dir.path().join("nested").join("archive.jsonl"));
        archive.store(&[sample(0), sample(1)], &[]).unwrap();
        archive.store(&[sample(2)], &[]).unwrap();

        let text = fs::read_to_string(archive.path()).unwrap();
        let lines: Vec<_> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        let first: serde_json::Value = serde_json::from_str(lines[0]).unwrap();
        assert_eq!(first["kind"], "vitals");
    }

    #[test]
    fn test_failed_write_keeps_samples_pending() {
        let cache = VitalsCache::new(VitalsCacheConfig::default());
        cache.append(sample(0)).unwrap();
        cache.append(sample(1)).unwrap();

        let sink = FlakySink {
            fail: AtomicBool::new(true),
            stored: Mutex::new(0),
        };
        assert!(persist_once(&cache, &sink, &[]).is_err());
        assert_eq!(cache.unpersisted().len(), 2);

        sink.fail.store(false, Ordering::SeqCst);
        assert_eq!(persist_once(&cache, &sink, &[]).unwrap(), 2);
        assert!(cache.unpersisted().is_empty());
        assert_eq!(cache.len(), 2);
    }

    #[tokio::test]
    async fn test_worker_stores_each_request() {
        let cache = Arc::new(VitalsCache::new(VitalsCacheConfig::default()));
        cache.append(sample(0)).unwrap();
        cache.append(sample(1)).unwrap();
        let sink = Arc::new(FlakySink {
            fail: AtomicBool::new(false),
            stored: Mutex::new(0),
        });

        let (tx, mut rx) = mpsc::channel(4);
        let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
        let worker_cache = Arc::clone(&cache);
        let worker_sink: Arc<dyn StorageSink> = sink.clone();
        let worker = tokio::spawn(async move {
            storage_worker(&mut rx, worker_cache, worker_sink, shutdown_rx, || {}).await;
        });

        tx.send(PersistRequest {
            requested_at: Utc::now(),
            resolved_alarms: Vec::new(),
        })
        .await
        .unwrap();
        drop(tx);
        worker.await.unwrap();

        assert_eq!(*sink.stored.lock(), 2);
        assert!(cache.unpersisted().is_empty());
        drop(shutdown_tx);
    }

    #[test]
    fn test_nothing_pending_skips_store() {
        let cache = VitalsCache::new(VitalsCacheConfig::default());
        let sink = FlakySink {
            fail: AtomicBool::new(true),
            stored: Mutex::new(0),
        };
        assert_eq!(persist_once(&cache, &sink, &[]).unwrap(), 0);
    }
}

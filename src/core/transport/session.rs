//! Reader-side session over an exchanged region.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use super::frame::Frame;
use super::handshake::HandleSource;
use super::ring::{RingReader, TransportStats};
use crate::core::clock::Clock;
use crate::error::TransportFault;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Streaming,
    Paused,
    Stopped,
}

/// Connectivity change reported by [`TransportSession::check_stall`].
#[derive(Debug, Clone, PartialEq)]
pub enum SessionTransition {
    Stalled(TransportFault),
    Resumed,
}

/// Cloneable handle that stops a session from another thread.
#[derive(Debug, Clone, Default)]
pub struct StopHandle(Arc<AtomicBool>);

impl StopHandle {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn stop(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_stopped(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

pub struct TransportSession {
    reader: RingReader,
    state: SessionState,
    stop: StopHandle,
    clock: Arc<dyn Clock>,
    stall_threshold: Duration,
}

impl std::fmt::Debug for TransportSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransportSession")
            .field("state", &self.state)
            .field("read_index", &self.reader.read_index())
            .field("stall_threshold", &self.stall_threshold)
            .finish()
    }
}

/// Perform the handshake and start reading at the writer's current position.
pub fn connect(
    source: &mut dyn HandleSource,
    clock: Arc<dyn Clock>,
    stall_threshold: Duration,
) -> Result<TransportSession, TransportFault> {
    let region = source.exchange()?;
    region.validate_header()?;
    Ok(TransportSession {
        reader: RingReader::new(region),
        state: SessionState::Streaming,
        stop: StopHandle::new(),
        clock,
        stall_threshold,
    })
}

impl TransportSession {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn stats(&self) -> TransportStats {
        self.reader.stats()
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn stop(&mut self) {
        self.stop.stop();
        self.state = SessionState::Stopped;
    }

    /// Next frame, if one is ready. Bounded time, never blocks.
    ///
    /// Paused sessions keep polling: frames arriving before the next
    /// [`check_stall`](Self::check_stall) are still delivered.
    pub fn poll_next(&mut self) -> Result<Option<Frame>, TransportFault> {
        if self.stop.is_stopped() {
            self.state = SessionState::Stopped;
        }
        if self.state == SessionState::Stopped {
            return Err(TransportFault::Stopped);
        }
        self.reader.poll()
    }

    /// Time since the writer last refreshed its heartbeat.
    pub fn heartbeat_age(&self) -> Duration {
        let beat = self.reader.heartbeat_ns();
        Duration::from_nanos(self.clock.monotonic_ns().saturating_sub(beat))
    }

    /// Move between `Streaming` and `Paused` according to heartbeat age.
    pub fn check_stall(&mut self) -> Option<SessionTransition> {
        let age = self.heartbeat_age();
        match self.state {
            SessionState::Streaming if age > self.stall_threshold => {
                self.state = SessionState::Paused;
                Some(SessionTransition::Stalled(TransportFault::Stalled {
                    age_ms: age.as_millis() as u64,
                }))
            }
            SessionState::Paused if age <= self.stall_threshold => {
                self.state = SessionState::Streaming;
                Some(SessionTransition::Resumed)
            }
            _ => None,
        }
    }

    /// Drop any backlog and continue from the newest frame.
    pub fn resync(&mut self) -> u64 {
        self.reader.resync()
    }
}

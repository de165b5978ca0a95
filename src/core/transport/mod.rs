//! Frame transport: shared ring region, codec, handshake and session.

pub mod frame;
pub mod handshake;
pub mod region;
pub mod ring;
pub mod session;

pub use frame::{Frame, FrameKind, HeartbeatFrame, VitalsFrame, WaveformFrame, FRAME_SIZE, MAX_WAVEFORM_SAMPLES};
#[cfg(target_os = "linux")]
pub use handshake::ControlServer;
#[cfg(unix)]
pub use handshake::UnixControlChannel;
pub use handshake::{ControlMessage, HandleSource, LocalHandleSource};
pub use region::SharedRegion;
pub use ring::{RingReader, RingWriter, TransportStats};
pub use session::{connect, SessionState, SessionTransition, StopHandle, TransportSession};

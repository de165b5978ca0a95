//! One-time exchange of the shared region handle.
//!
//! After `exchange` returns, no further control traffic happens; all data
//! crosses through the region.

use std::sync::Arc;

use super::region::SharedRegion;
use super::ring::RingWriter;
use crate::error::TransportFault;

/// Something that can hand over a ring region exactly once.
pub trait HandleSource {
    fn exchange(&mut self) -> Result<Arc<SharedRegion>, TransportFault>;
}

/// Control-channel message accompanying the region descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ControlMessage {
    pub kind: u32,
    pub region_size: u64,
}

impl ControlMessage {
    pub const REGION_HANDLE: u32 = 1;
    pub const ENCODED_LEN: usize = 16;

    pub fn region_handle(region_size: u64) -> Self {
        Self {
            kind: Self::REGION_HANDLE,
            region_size,
        }
    }

    pub fn encode(&self) -> [u8; Self::ENCODED_LEN] {
        let mut out = [0u8; Self::ENCODED_LEN];
        out[..4].copy_from_slice(&self.kind.to_le_bytes());
        out[8..].copy_from_slice(&self.region_size.to_le_bytes());
        out
    }

    pub fn decode(buf: &[u8]) -> Result<Self, TransportFault> {
        if buf.len() < Self::ENCODED_LEN {
            return Err(TransportFault::Handshake(format!(
                "control message truncated to {} bytes",
                buf.len()
            )));
        }
        let mut kind = [0u8; 4];
        kind.copy_from_slice(&buf[..4]);
        let mut size = [0u8; 8];
        size.copy_from_slice(&buf[8..16]);
        let message = Self {
            kind: u32::from_le_bytes(kind),
            region_size: u64::from_le_bytes(size),
        };
        if message.kind != Self::REGION_HANDLE {
            return Err(TransportFault::Handshake(format!(
                "unexpected control message kind {}",
                message.kind
            )));
        }
        Ok(message)
    }
}

/// In-process substitute for the shared-memory handshake.
#[derive(Debug)]
pub struct LocalHandleSource {
    region: Option<Arc<SharedRegion>>,
}

impl LocalHandleSource {
    pub fn new(region: Arc<SharedRegion>) -> Self {
        Self {
            region: Some(region),
        }
    }

    /// A fresh heap region with its writer and the source that hands it out.
    pub fn pair(slot_count: u32) -> Result<(Self, RingWriter), TransportFault> {
        let region = Arc::new(SharedRegion::heap(slot_count)?);
        let writer = RingWriter::new(Arc::clone(&region));
        Ok((Self::new(region), writer))
    }
}

impl HandleSource for LocalHandleSource {
    fn exchange(&mut self) -> Result<Arc<SharedRegion>, TransportFault> {
        self.region
            .take()
            .ok_or_else(|| TransportFault::Handshake("region handle already exchanged".to_string()))
    }
}

#[cfg(unix)]
pub use unix::UnixControlChannel;
#[cfg(target_os = "linux")]
pub use unix::ControlServer;

#[cfg(unix)]
mod unix {
    use std::fs::File;
    use std::io;
    use std::os::fd::AsRawFd;
    use std::os::unix::net::{UnixListener, UnixStream};
    use std::path::{Path, PathBuf};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    use super::{ControlMessage, HandleSource};
    use crate::core::transport::region::SharedRegion;
    use crate::error::TransportFault;
    use crate::platform::shm;

    const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(2);

    /// Receives the region descriptor over a Unix-domain socket.
    #[derive(Debug)]
    pub struct UnixControlChannel {
        path: PathBuf,
        used: bool,
    }

    impl UnixControlChannel {
        pub fn new<P: AsRef<Path>>(path: P) -> Self {
            Self {
                path: path.as_ref().to_path_buf(),
                used: false,
            }
        }

        fn receive(&self) -> io::Result<(ControlMessage, File)> {
            let stream = UnixStream::connect(&self.path)?;
            stream.set_read_timeout(Some(HANDSHAKE_TIMEOUT))?;

            let mut buf = [0u8; ControlMessage::ENCODED_LEN];
            let (n, fd) = shm::recv_fd(&stream, &mut buf)?;
            let message = ControlMessage::decode(&buf[..n])
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))?;
            let fd = fd.ok_or_else(|| {
                io::Error::new(io::ErrorKind::InvalidData, "no descriptor in control message")
            })?;
            // Dropping the stream closes the control channel for good.
            Ok((message, File::from(fd)))
        }
    }

    impl HandleSource for UnixControlChannel {
        fn exchange(&mut self) -> Result<Arc<SharedRegion>, TransportFault> {
            if self.used {
                return Err(TransportFault::Handshake(
                    "region handle already exchanged".to_string(),
                ));
            }
            self.used = true;

            let (message, file) = self
                .receive()
                .map_err(|e| TransportFault::Handshake(format!("{}: {}", self.path.display(), e)))?;
            let region = map_region(&file, message.region_size)?;
            log::info!(
                "Attached shared region via {} ({} slots)",
                self.path.display(),
                region.slot_count()
            );
            Ok(Arc::new(region))
        }
    }

    /// Map `region_size` bytes of a received memory file. Touching a
    /// mapping beyond the end of its file raises SIGBUS, so the advertised
    /// size must fit the file.
    pub(super) fn map_region(file: &File, region_size: u64) -> Result<SharedRegion, TransportFault> {
        let file_len = file
            .metadata()
            .map_err(|e| TransportFault::Handshake(format!("inspecting region file: {}", e)))?
            .len();
        if region_size == 0 || region_size > file_len {
            return Err(TransportFault::Handshake(format!(
                "advertised region of {} bytes does not fit a {}-byte file",
                region_size, file_len
            )));
        }
        let map = memmap2::MmapOptions::new()
            .len(region_size as usize)
            .map_raw(file)
            .map_err(|e| TransportFault::Handshake(format!("mapping region: {}", e)))?;
        SharedRegion::attach_mapped(map)
    }

    /// Producer side: owns the memory file and hands its descriptor to each
    /// reader that connects.
    #[cfg(target_os = "linux")]
    pub struct ControlServer {
        listener: UnixListener,
        path: PathBuf,
        file: File,
        region_size: u64,
    }

    #[cfg(target_os = "linux")]
    impl ControlServer {
        /// Create the region and bind the control socket at `path`.
        pub fn bind<P: AsRef<Path>>(
            path: P,
            slot_count: u32,
        ) -> Result<(Self, Arc<SharedRegion>), TransportFault> {
            use crate::core::transport::region::region_size;

            let path = path.as_ref().to_path_buf();
            let size = region_size(slot_count) as u64;
            let file = shm::create_memfd("bedside-ring", size)
                .map_err(|e| TransportFault::Handshake(format!("memfd_create: {}", e)))?;
            let map = memmap2::MmapOptions::new()
                .len(size as usize)
                .map_raw(&file)
                .map_err(|e| TransportFault::Handshake(format!("mapping region: {}", e)))?;
            let region = Arc::new(SharedRegion::init_mapped(map, slot_count)?);

            if path.exists() {
                std::fs::remove_file(&path)
                    .map_err(|e| TransportFault::Handshake(format!("{}: {}", path.display(), e)))?;
            }
            let listener = UnixListener::bind(&path)
                .map_err(|e| TransportFault::Handshake(format!("{}: {}", path.display(), e)))?;
            listener
                .set_nonblocking(true)
                .map_err(|e| TransportFault::Handshake(e.to_string()))?;

            Ok((
                Self {
                    listener,
                    path,
                    file,
                    region_size: size,
                },
                region,
            ))
        }

        pub fn path(&self) -> &Path {
            &self.path
        }

        /// Hand the descriptor to every pending reader. Returns how many
        /// were served.
        pub fn serve_pending(&self) -> Result<usize, TransportFault> {
            let mut served = 0;
            loop {
                match self.listener.accept() {
                    Ok((stream, _)) => {
                        let message = ControlMessage::region_handle(self.region_size);
                        if let Err(e) = shm::send_fd(&stream, self.file.as_raw_fd(), &message.encode()) {
                            log::warn!("Handshake with reader failed: {}", e);
                            continue;
                        }
                        served += 1;
                    }
                    Err(e) if e.kind() == io::ErrorKind::WouldBlock => return Ok(served),
                    Err(e) => return Err(TransportFault::Handshake(e.to_string())),
                }
            }
        }

        /// Serve readers until `stop` is set.
        pub fn serve_until(&self, stop: &AtomicBool) -> Result<(), TransportFault> {
            while !stop.load(Ordering::Acquire) {
                if self.serve_pending()? > 0 {
                    log::info!("Reader attached on {}", self.path.display());
                }
                std::thread::sleep(Duration::from_millis(50));
            }
            Ok(())
        }
    }

    #[cfg(target_os = "linux")]
    impl Drop for ControlServer {
        fn drop(&mut self) {
            let _ = std::fs::remove_file(&self.path);
        }
    }
}

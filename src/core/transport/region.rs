//! The shared ring-buffer region.
//!
//! The region is viewed purely as an array of `AtomicU64` words so that
//! both processes touch it only through atomic operations. The first eight
//! words form the header:
//!
//! | word | contents |
//! |-----:|----------|
//! | 0 | magic (u32) · version (u16) · reserved (u16) |
//! | 1 | slot count (u32) · frame size (u32) |
//! | 2 | write index |
//! | 3 | heartbeat, monotonic ns |
//! | 4 | CRC32 of words 0..2 |
//! | 5..8 | reserved |

use std::sync::atomic::{AtomicU64, Ordering};

use super::frame::FRAME_SIZE;
use crate::error::TransportFault;

pub const MAGIC: u32 = u32::from_le_bytes(*b"SMRB");
pub const VERSION: u16 = 1;
pub const HEADER_WORDS: usize = 8;
pub const HEADER_SIZE: usize = HEADER_WORDS * 8;
pub const SLOT_WORDS: usize = FRAME_SIZE / 8;

const WORD_IDENT: usize = 0;
const WORD_GEOMETRY: usize = 1;
const WORD_WRITE_INDEX: usize = 2;
const WORD_HEARTBEAT: usize = 3;
const WORD_HEADER_CRC: usize = 4;

/// Bytes needed for a region holding `slot_count` frames.
pub fn region_size(slot_count: u32) -> usize {
    HEADER_SIZE + slot_count as usize * FRAME_SIZE
}

enum Backing {
    Heap(Box<[AtomicU64]>),
    #[cfg(unix)]
    Mapped(memmap2::MmapRaw),
}

/// A header-validated ring region, in-process or shared.
pub struct SharedRegion {
    backing: Backing,
    slot_count: u32,
}

impl std::fmt::Debug for SharedRegion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let kind = match self.backing {
            Backing::Heap(_) => "heap",
            #[cfg(unix)]
            Backing::Mapped(_) => "mapped",
        };
        f.debug_struct("SharedRegion")
            .field("backing", &kind)
            .field("slot_count", &self.slot_count)
            .finish()
    }
}

impl SharedRegion {
    /// Allocate and initialize an in-process region.
    pub fn heap(slot_count: u32) -> Result<Self, TransportFault> {
        check_slot_count(slot_count)?;
        let words = region_size(slot_count) / 8;
        let storage: Box<[AtomicU64]> = (0..words).map(|_| AtomicU64::new(0)).collect();
        let region = Self {
            backing: Backing::Heap(storage),
            slot_count,
        };
        region.write_header(slot_count);
        Ok(region)
    }

    /// Wrap a fresh mapping and write the header into it. Producer side.
    #[cfg(unix)]
    pub fn init_mapped(map: memmap2::MmapRaw, slot_count: u32) -> Result<Self, TransportFault> {
        check_slot_count(slot_count)?;
        check_mapping(&map, region_size(slot_count))?;
        let region = Self {
            backing: Backing::Mapped(map),
            slot_count,
        };
        region.write_header(slot_count);
        Ok(region)
    }

    /// Wrap a mapping received from the producer, validating its header.
    #[cfg(unix)]
    pub fn attach_mapped(map: memmap2::MmapRaw) -> Result<Self, TransportFault> {
        check_mapping(&map, HEADER_SIZE)?;
        let mut region = Self {
            backing: Backing::Mapped(map),
            slot_count: 0,
        };
        let slot_count = region.validate_header()?;
        let needed = region_size(slot_count);
        if region.words().len() * 8 < needed {
            return Err(TransportFault::InvalidRegion(format!(
                "region holds {} bytes, header needs {}",
                region.words().len() * 8,
                needed
            )));
        }
        region.slot_count = slot_count;
        Ok(region)
    }

    fn words(&self) -> &[AtomicU64] {
        match &self.backing {
            Backing::Heap(words) => words,
            #[cfg(unix)]
            Backing::Mapped(map) => {
                // SAFETY: the mapping is page-aligned, at least `len` bytes long
                // and lives as long as `self`. All access goes through atomics.
                unsafe { std::slice::from_raw_parts(map.as_ptr() as *const AtomicU64, map.len() / 8) }
            }
        }
    }

    fn write_header(&self, slot_count: u32) {
        let words = self.words();
        let ident = MAGIC as u64 | (VERSION as u64) << 32;
        let geometry = slot_count as u64 | (FRAME_SIZE as u64) << 32;
        words[WORD_IDENT].store(ident, Ordering::Relaxed);
        words[WORD_GEOMETRY].store(geometry, Ordering::Relaxed);
        words[WORD_WRITE_INDEX].store(0, Ordering::Relaxed);
        words[WORD_HEARTBEAT].store(0, Ordering::Relaxed);
        words[WORD_HEADER_CRC].store(header_crc(ident, geometry) as u64, Ordering::Release);
    }

    /// Check magic, version, geometry and header checksum; returns the slot
    /// count.
    pub fn validate_header(&self) -> Result<u32, TransportFault> {
        let words = self.words();
        let crc = words[WORD_HEADER_CRC].load(Ordering::Acquire) as u32;
        let ident = words[WORD_IDENT].load(Ordering::Relaxed);
        let geometry = words[WORD_GEOMETRY].load(Ordering::Relaxed);

        if ident as u32 != MAGIC {
            return Err(TransportFault::InvalidRegion("bad magic".to_string()));
        }
        let version = (ident >> 32) as u16;
        if version != VERSION {
            return Err(TransportFault::InvalidRegion(format!(
                "unsupported version {}",
                version
            )));
        }
        if header_crc(ident, geometry) != crc {
            return Err(TransportFault::InvalidRegion("header checksum mismatch".to_string()));
        }
        let slot_count = geometry as u32;
        let frame_size = (geometry >> 32) as u32;
        if frame_size as usize != FRAME_SIZE {
            return Err(TransportFault::InvalidRegion(format!(
                "frame size {} not supported",
                frame_size
            )));
        }
        check_slot_count(slot_count)?;
        Ok(slot_count)
    }

    pub fn slot_count(&self) -> u32 {
        self.slot_count
    }

    pub fn write_index(&self) -> &AtomicU64 {
        &self.words()[WORD_WRITE_INDEX]
    }

    pub fn heartbeat(&self) -> &AtomicU64 {
        &self.words()[WORD_HEARTBEAT]
    }

    /// The words of the slot that frame `index` lands in.
    pub fn slot(&self, index: u64) -> &[AtomicU64] {
        let slot = (index % self.slot_count as u64) as usize;
        let start = HEADER_WORDS + slot * SLOT_WORDS;
        &self.words()[start..start + SLOT_WORDS]
    }
}

fn header_crc(ident: u64, geometry: u64) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&ident.to_le_bytes());
    hasher.update(&geometry.to_le_bytes());
    hasher.finalize()
}

fn check_slot_count(slot_count: u32) -> Result<(), TransportFault> {
    if slot_count < 2 {
        return Err(TransportFault::InvalidRegion(format!(
            "slot count {} too small",
            slot_count
        )));
    }
    Ok(())
}

#[cfg(unix)]
fn check_mapping(map: &memmap2::MmapRaw, needed: usize) -> Result<(), TransportFault> {
    if map.len() < needed {
        return Err(TransportFault::InvalidRegion(format!(
            "mapping holds {} bytes, need {}",
            map.len(),
            needed
        )));
    }
    if map.as_ptr() as usize % std::mem::align_of::<AtomicU64>() != 0 {
        return Err(TransportFault::InvalidRegion("mapping is misaligned".to_string()));
    }
    Ok(())
}

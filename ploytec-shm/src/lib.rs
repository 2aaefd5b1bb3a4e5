//! Shared-memory contract between the USB engine and its consumers.
//!
//! The engine daemon creates one file-backed region per session and maps it
//! read-write; the audio bridge and MIDI consumers map the same file. The
//! layout in [`region::SharedRegion`] is the ABI: a small identity header,
//! two lock-free SPSC MIDI rings, and a cache-aligned audio block holding
//! the stream geometry, a sequence-locked timestamp cell and the two packet
//! rings the USB transfers run out of.
//!
//! Nothing in here takes a lock. Cross-process handoff happens through the
//! atomic cells with the orderings documented on each operation.

mod map;
mod region;
mod ring;
mod timestamp;

pub use map::{RegionMap, ShmError};
pub use region::{AudioShared, DeviceIdentity, NameField, SharedRegion, REGION_SIZE};
pub use ring::{MidiRing, RingFull};
pub use timestamp::TimestampCell;

/// Region magic, "OZZY". Written last during creation, zeroed on engine
/// stop so stale mappings read as poisoned.
pub const SHARED_MAGIC: u32 = 0x4F5A_5A59;

/// Layout revision.
pub const SHARED_VERSION: u32 = 1;

/// Default path of the region file.
pub const DEFAULT_REGION_PATH: &str = "/dev/shm/ozzy_shared_mem";

/// Capacity of each MIDI ring. Power of two; indices are free-running and
/// masked with `MIDI_RING_MASK` at access time.
pub const MIDI_RING_SIZE: usize = 1024;
pub const MIDI_RING_MASK: u32 = (MIDI_RING_SIZE - 1) as u32;

/// Device flags bit 0: PCM-out pipe is bulk rather than interrupt.
pub const FLAG_BULK_MODE: u32 = 1 << 0;

/// Packet transfers the engine keeps in flight per endpoint. Part of the
/// contract: consumers derive their safety offset from it.
pub const DEFAULT_URB_COUNT: u32 = 2;

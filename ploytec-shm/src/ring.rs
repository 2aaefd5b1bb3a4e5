//! SPSC byte ring for MIDI traffic.

use std::cell::UnsafeCell;
use std::sync::atomic::{AtomicU32, Ordering};

use thiserror::Error;

use crate::{MIDI_RING_MASK, MIDI_RING_SIZE};

/// The producer would overwrite unread data; the byte is dropped.
#[derive(Clone, Copy, Debug, Error)]
#[error("midi ring full")]
pub struct RingFull;

/// One direction of MIDI flow. Single producer, single consumer, fixed per
/// ring: the engine consumes `midi_out` and produces `midi_in`, the MIDI
/// driver does the reverse.
///
/// Indices are free-running u32 counters reduced by `MIDI_RING_MASK` only
/// when touching the buffer. The ring is empty iff `write == read` and full
/// when `write - read` reaches the capacity. Producer stores pair with
/// consumer loads as release/acquire so the byte is visible before the
/// index move.
#[repr(C)]
pub struct MidiRing {
    write_index: AtomicU32,
    _pad0: [u8; 64],
    read_index: AtomicU32,
    _pad1: [u8; 64],
    buffer: UnsafeCell<[u8; MIDI_RING_SIZE]>,
}

// The buffer cell is only written by the producer side at the slot the
// indices hand over; see push/pop.
unsafe impl Sync for MidiRing {}

impl MidiRing {
    /// Producer side. Fails with the ring full; the caller drops the byte
    /// (drop-newest overflow policy).
    pub fn push(&self, byte: u8) -> Result<(), RingFull> {
        let w = self.write_index.load(Ordering::Relaxed);
        let r = self.read_index.load(Ordering::Acquire);
        if w.wrapping_sub(r) >= MIDI_RING_SIZE as u32 {
            return Err(RingFull);
        }
        unsafe {
            (*self.buffer.get())[(w & MIDI_RING_MASK) as usize] = byte;
        }
        self.write_index.store(w.wrapping_add(1), Ordering::Release);
        Ok(())
    }

    /// Consumer side.
    pub fn pop(&self) -> Option<u8> {
        let r = self.read_index.load(Ordering::Relaxed);
        let w = self.write_index.load(Ordering::Acquire);
        if r == w {
            return None;
        }
        let byte = unsafe { (*self.buffer.get())[(r & MIDI_RING_MASK) as usize] };
        self.read_index.store(r.wrapping_add(1), Ordering::Release);
        Some(byte)
    }

    /// Unread bytes, as seen by the consumer.
    pub fn len(&self) -> u32 {
        let r = self.read_index.load(Ordering::Relaxed);
        let w = self.write_index.load(Ordering::Acquire);
        w.wrapping_sub(r)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Space left for the producer.
    pub fn producible(&self) -> u32 {
        MIDI_RING_SIZE as u32 - self.len()
    }
}

//! Sequence-locked (sample time, host time) anchor.

use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};

/// Writer-priority timestamp cell. The USB engine is the only writer; the
/// audio bridge reads it on every host clock query.
///
/// Writer: bump the sequence to odd (release), store both fields relaxed,
/// bump to even (release). Reader: spin for an even sequence (acquire),
/// read both fields relaxed, accept only if the sequence did not move.
/// A stable even sequence therefore brackets a pair that was published by
/// exactly one writer pass.
#[repr(C)]
pub struct TimestampCell {
    sequence: AtomicU32,
    sample_time: AtomicU64,
    host_time: AtomicU64,
}

impl TimestampCell {
    /// Publish a new anchor. Engine side only.
    pub fn publish(&self, sample_time: u64, host_time: u64) {
        let seq = self.sequence.load(Ordering::Relaxed);
        self.sequence.store(seq.wrapping_add(1), Ordering::Release);
        self.sample_time.store(sample_time, Ordering::Relaxed);
        self.host_time.store(host_time, Ordering::Relaxed);
        self.sequence.store(seq.wrapping_add(2), Ordering::Release);
    }

    /// Read a consistent (sample time, host time) pair.
    pub fn read(&self) -> (u64, u64) {
        loop {
            let before = self.sequence.load(Ordering::Acquire);
            if before & 1 != 0 {
                std::hint::spin_loop();
                continue;
            }
            let sample_time = self.sample_time.load(Ordering::Relaxed);
            let host_time = self.host_time.load(Ordering::Relaxed);
            if self.sequence.load(Ordering::Acquire) == before {
                return (sample_time, host_time);
            }
        }
    }

    /// Reset to the zero anchor at stream start.
    pub fn reset(&self) {
        self.publish(0, 0);
    }
}

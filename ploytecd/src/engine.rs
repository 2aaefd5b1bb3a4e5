//! The streaming engine: packet pipeline state, MIDI multiplexing and the
//! hardware sample clock.
//!
//! The engine owns no threads itself. The pump calls the completion
//! handlers from whatever context the transport completes on; everything
//! shared lives in atomics or in the mapped region, so handlers stay
//! lock-free and return quickly.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use ploytec_codec::{
    clear_output, midi_slot_offset, TransferMode, FRAMES_PER_PACKET, IN_PACKET_SIZE,
    MAX_PACKET_SIZE, MIDI_IGNORE, NUM_PACKETS,
};
use ploytec_shm::{AudioShared, RegionMap, FLAG_BULK_MODE};

use crate::bus::TransferStatus;
use crate::control::DeviceSetup;

/// Frames between timestamp anchors: every 8 packets, 6.67 ms at 96 kHz.
pub const UPDATE_INTERVAL_FRAMES: u32 = 640;

pub use ploytec_shm::DEFAULT_URB_COUNT;

pub struct Engine {
    region: Arc<RegionMap>,
    mode: TransferMode,
    urb_count: u32,
    midi_in_packet: usize,
    hw_sample_time: AtomicU64,
    shutdown: AtomicBool,
    last_input_ns: AtomicU64,
    midi_in_dropped: AtomicU64,
    started: Instant,
}

impl Engine {
    /// Build the engine for a configured device and publish the stream
    /// geometry into the shared region.
    pub fn new(region: Arc<RegionMap>, setup: &DeviceSetup, urb_count: u32) -> Self {
        let audio = &region.region().audio;
        audio
            .sample_rate
            .store(setup.sample_rate, Ordering::Relaxed);
        audio.device_flags.store(
            if setup.mode.is_bulk() { FLAG_BULK_MODE } else { 0 },
            Ordering::Relaxed,
        );
        audio
            .update_interval_frames
            .store(UPDATE_INTERVAL_FRAMES, Ordering::Relaxed);
        audio
            .frames_per_packet
            .store(FRAMES_PER_PACKET as u32, Ordering::Relaxed);
        audio.samples_per_packet.store(10, Ordering::Relaxed);
        audio.output_bytes_per_frame.store(48, Ordering::Relaxed);
        audio.input_bytes_per_frame.store(64, Ordering::Relaxed);

        Self {
            region,
            mode: setup.mode,
            urb_count,
            midi_in_packet: setup.midi_in_packet,
            hw_sample_time: AtomicU64::new(0),
            shutdown: AtomicBool::new(false),
            last_input_ns: AtomicU64::new(0),
            midi_in_dropped: AtomicU64::new(0),
            started: Instant::now(),
        }
    }

    pub fn region(&self) -> &ploytec_shm::SharedRegion {
        self.region.region()
    }

    fn audio(&self) -> &AudioShared {
        &self.region.region().audio
    }

    pub fn urb_count(&self) -> u32 {
        self.urb_count
    }

    pub fn midi_in_packet(&self) -> usize {
        self.midi_in_packet
    }

    pub fn hw_sample_time(&self) -> u64 {
        self.hw_sample_time.load(Ordering::Relaxed)
    }

    /// Monotonic host time in nanoseconds since engine start.
    pub fn host_time_now(&self) -> u64 {
        self.started.elapsed().as_nanos() as u64
    }

    pub fn last_input_ns(&self) -> u64 {
        self.last_input_ns.load(Ordering::Relaxed)
    }

    /// Prepare the region for a fresh stream: sync-pattern the whole output
    /// ring, zero the input ring, rewind the clock and the timestamp cell.
    /// `driver_ready` stays false until the initial transfers are queued.
    pub fn begin_streaming(&self) {
        let audio = self.audio();
        audio.driver_ready.store(false, Ordering::Release);
        self.shutdown.store(false, Ordering::Relaxed);

        unsafe {
            clear_output(audio.output_bytes_mut(), self.mode);
            audio.input_bytes_mut().fill(0);
        }

        self.hw_sample_time.store(0, Ordering::Relaxed);
        audio.timestamp.reset();
        audio.hal_write_position.store(0, Ordering::Relaxed);
        self.last_input_ns
            .store(self.host_time_now(), Ordering::Relaxed);

        audio.hardware_present.store(true, Ordering::Release);
    }

    /// Publish readiness once the pump has its initial transfers queued.
    pub fn mark_ready(&self) {
        self.audio().driver_ready.store(true, Ordering::Release);
    }

    pub fn request_shutdown(&self) {
        self.shutdown.store(true, Ordering::Release);
    }

    pub fn shutting_down(&self) -> bool {
        self.shutdown.load(Ordering::Acquire)
    }

    /// The device is gone (terminated, or declared dead by the watchdog).
    pub fn device_lost(&self) {
        let audio = self.audio();
        audio.driver_ready.store(false, Ordering::Release);
        audio.hardware_present.store(false, Ordering::Release);
    }

    /// PCM-out completion. Picks the packet `urb_count` ahead of the
    /// finished one, injects at most one pending MIDI byte into its MIDI
    /// slot, and advances the sample clock for the completed packet.
    /// Returns the packet index to submit next, `None` to stop the pipe.
    pub fn pcm_out_complete(&self, finished: u32, status: TransferStatus) -> Option<u32> {
        if self.shutting_down() || status == TransferStatus::Cancelled {
            return None;
        }
        let next = finished.wrapping_add(self.urb_count);
        self.process_midi_out(next);
        match status {
            TransferStatus::Complete(_) => self.advance_clock(),
            TransferStatus::Failed => {
                log::warn!(
                    "PCM out transfer {} failed, resubmitting slot {}",
                    finished,
                    next % NUM_PACKETS as u32
                );
            }
            TransferStatus::Cancelled => unreachable!(),
        }
        Some(next)
    }

    /// PCM-in completion: note the arrival for the watchdog and rotate the
    /// slot sequence. The bridge picks its read position from the
    /// timestamp, so no per-slot handoff happens here.
    pub fn pcm_in_complete(&self, finished: u32, status: TransferStatus) -> Option<u32> {
        if self.shutting_down() || status == TransferStatus::Cancelled {
            return None;
        }
        match status {
            TransferStatus::Complete(_) => {
                self.last_input_ns
                    .store(self.host_time_now(), Ordering::Relaxed);
            }
            TransferStatus::Failed => {
                log::warn!("PCM in transfer {} failed, resubmitting", finished);
            }
            TransferStatus::Cancelled => unreachable!(),
        }
        Some(finished.wrapping_add(self.urb_count))
    }

    /// MIDI-in completion: drop wire sync bytes, queue the rest with
    /// drop-newest overflow. Returns whether to resubmit.
    pub fn midi_in_complete(&self, data: &[u8], status: TransferStatus) -> bool {
        if self.shutting_down() || status == TransferStatus::Cancelled {
            return false;
        }
        if let TransferStatus::Complete(_) = status {
            let ring = &self.region.region().midi_in;
            for &byte in data {
                if byte == MIDI_IGNORE {
                    continue;
                }
                if ring.push(byte).is_err() {
                    let dropped = self.midi_in_dropped.fetch_add(1, Ordering::Relaxed) + 1;
                    log::debug!("MIDI in ring full, dropped byte ({} total)", dropped);
                }
            }
        }
        true
    }

    pub fn midi_in_dropped(&self) -> u64 {
        self.midi_in_dropped.load(Ordering::Relaxed)
    }

    /// One byte per logical packet, first sub-packet's slot; the second
    /// slot byte always carries the sync pattern.
    fn process_midi_out(&self, packet: u32) {
        let off = midi_slot_offset(self.mode, packet);
        let out = unsafe { self.audio().output_bytes_mut() };
        out[off] = self.region.region().midi_out.pop().unwrap_or(MIDI_IGNORE);
        out[off + 1] = MIDI_IGNORE;
    }

    fn advance_clock(&self) {
        let audio = self.audio();
        let interval = u64::from(audio.update_interval_frames.load(Ordering::Relaxed));
        let old = self
            .hw_sample_time
            .fetch_add(FRAMES_PER_PACKET as u64, Ordering::Relaxed);
        let new = old + FRAMES_PER_PACKET as u64;
        // Publish on boundary crossings, not only exact multiples; packets
        // do not have to divide the interval.
        if interval > 0 && old / interval != new / interval {
            audio.timestamp.publish(new, self.host_time_now());
        }
    }

    /// Outbound payload of a packet slot.
    pub fn output_slot(&self, packet: u32) -> &[u8] {
        let base = (packet as usize % NUM_PACKETS) * MAX_PACKET_SIZE;
        let bytes = unsafe { self.audio().output_bytes() };
        &bytes[base..base + self.mode.packet_size()]
    }

    /// Inbound slot the transport fills in place. The engine is the only
    /// writer of input slots between submit and completion.
    #[allow(clippy::mut_from_ref)]
    pub fn input_slot_mut(&self, packet: u32) -> &mut [u8] {
        let base = (packet as usize % NUM_PACKETS) * MAX_PACKET_SIZE;
        let bytes = unsafe { self.audio().input_bytes_mut() };
        &mut bytes[base..base + IN_PACKET_SIZE]
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::control::{DeviceSetup, FirmwareVersion};
    use ploytec_codec::SUB_PACKETS;
    use std::path::PathBuf;
    use std::sync::atomic::Ordering;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ploytecd-test-{}-{}", std::process::id(), name))
    }

    fn test_engine(name: &str, mode: TransferMode) -> (Engine, Arc<RegionMap>) {
        let region = Arc::new(RegionMap::create(&scratch(name)).unwrap());
        let setup = DeviceSetup {
            firmware: FirmwareVersion {
                id: 0x21,
                major: 1,
                minor: 1,
                patch: 7,
            },
            mode,
            sample_rate: 96_000,
            midi_in_packet: 512,
        };
        let engine = Engine::new(region.clone(), &setup, DEFAULT_URB_COUNT);
        engine.begin_streaming();
        engine.mark_ready();
        (engine, region)
    }

    #[test]
    fn begin_streaming_prefills_sync_bytes() {
        let (engine, region) = test_engine("prefill", TransferMode::Bulk);
        let audio = &region.region().audio;
        let out = unsafe { audio.output_bytes() };
        for packet in [0usize, 17, NUM_PACKETS - 1] {
            for sub in 0..SUB_PACKETS {
                let off = packet * MAX_PACKET_SIZE + sub * 512 + 480;
                assert_eq!(out[off], MIDI_IGNORE);
                assert_eq!(out[off + 1], MIDI_IGNORE);
            }
        }
        assert_eq!(engine.hw_sample_time(), 0);
        assert!(audio.hardware_present.load(Ordering::Acquire));
        assert_eq!(audio.timestamp.read(), (0, 0));
        assert_eq!(audio.update_interval_frames.load(Ordering::Relaxed), 640);
    }

    #[test]
    fn midi_bytes_inject_one_per_packet() {
        // Three queued bytes drain over the next three completions.
        let (engine, region) = test_engine("midi-inject", TransferMode::Bulk);
        let shared = region.region();
        for b in [0x90u8, 0x40, 0x7F] {
            shared.midi_out.push(b).unwrap();
        }

        let next = engine
            .pcm_out_complete(15, TransferStatus::Complete(4096))
            .unwrap();
        assert_eq!(next, 17);
        let out = unsafe { shared.audio.output_bytes() };
        assert_eq!(out[17 * MAX_PACKET_SIZE + 480], 0x90);
        assert_eq!(out[17 * MAX_PACKET_SIZE + 481], MIDI_IGNORE);
        assert_eq!(shared.midi_out.len(), 2);

        engine
            .pcm_out_complete(16, TransferStatus::Complete(4096))
            .unwrap();
        assert_eq!(out[18 * MAX_PACKET_SIZE + 480], 0x40);
        engine
            .pcm_out_complete(17, TransferStatus::Complete(4096))
            .unwrap();
        assert_eq!(out[19 * MAX_PACKET_SIZE + 480], 0x7F);
        assert!(shared.midi_out.is_empty());

        // Queue empty: the slot returns to the sync pattern.
        let _ = engine.pcm_out_complete(18, TransferStatus::Complete(4096));
        assert_eq!(out[20 * MAX_PACKET_SIZE + 480], MIDI_IGNORE);
    }

    #[test]
    fn midi_pacing_is_min_of_queued_and_packets() {
        let (engine, region) = test_engine("midi-pacing", TransferMode::Bulk);
        let shared = region.region();
        for b in 1u8..=5 {
            shared.midi_out.push(b).unwrap();
        }

        // Three completions move exactly three bytes.
        for finished in 0..3u32 {
            engine
                .pcm_out_complete(finished, TransferStatus::Complete(4096))
                .unwrap();
        }
        let out = unsafe { shared.audio.output_bytes() };
        let injected = (0..NUM_PACKETS)
            .filter(|p| out[p * MAX_PACKET_SIZE + 480] != MIDI_IGNORE)
            .count();
        assert_eq!(injected, 3);
        assert_eq!(shared.midi_out.len(), 2);

        // Five more completions drain the remaining two only.
        for finished in 3..8u32 {
            engine
                .pcm_out_complete(finished, TransferStatus::Complete(4096))
                .unwrap();
        }
        let injected = (0..NUM_PACKETS)
            .filter(|p| out[p * MAX_PACKET_SIZE + 480] != MIDI_IGNORE)
            .count();
        assert_eq!(injected, 5);
    }

    #[test]
    fn sample_clock_is_monotonic_and_exact() {
        let (engine, _region) = test_engine("clock", TransferMode::Bulk);
        let mut expected = 0u64;
        for finished in 0..100u32 {
            let status = if finished % 7 == 3 {
                TransferStatus::Failed
            } else {
                TransferStatus::Complete(4096)
            };
            let before = engine.hw_sample_time();
            engine.pcm_out_complete(finished, status).unwrap();
            let after = engine.hw_sample_time();
            if status == TransferStatus::Failed {
                assert_eq!(after, before, "failed transfer must not advance the clock");
            } else {
                expected += FRAMES_PER_PACKET as u64;
                assert_eq!(after, before + FRAMES_PER_PACKET as u64);
            }
            assert_eq!(after, expected);
        }
    }

    #[test]
    fn timestamp_publishes_on_boundary_crossing() {
        // From 630, the completion that reaches 710 crosses 640 and
        // publishes 710 itself.
        let (engine, region) = test_engine("timestamp", TransferMode::Bulk);
        let cell = &region.region().audio.timestamp;
        engine.hw_sample_time.store(630, Ordering::Relaxed);

        engine
            .pcm_out_complete(0, TransferStatus::Complete(4096))
            .unwrap();
        let (sample, host) = cell.read();
        assert_eq!(sample, 710);
        assert!(host > 0);

        // 710 → 790 stays inside the same interval.
        engine
            .pcm_out_complete(1, TransferStatus::Complete(4096))
            .unwrap();
        assert_eq!(cell.read().0, 710);

        // Crossing 1280 publishes again.
        for finished in 2..10u32 {
            engine
                .pcm_out_complete(finished, TransferStatus::Complete(4096))
                .unwrap();
            if engine.hw_sample_time() > 1280 {
                break;
            }
        }
        assert_eq!(cell.read().0, 1350);
    }

    #[test]
    fn midi_in_filters_the_sync_byte() {
        let (engine, region) = test_engine("midi-filter", TransferMode::Bulk);
        let ring = &region.region().midi_in;
        assert!(engine.midi_in_complete(&[0xFD, 0x90, 0xFD, 0x40, 0xFD], TransferStatus::Complete(5)));
        assert_eq!(ring.pop(), Some(0x90));
        assert_eq!(ring.pop(), Some(0x40));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn midi_in_overflow_drops_newest() {
        let (engine, region) = test_engine("midi-overflow", TransferMode::Bulk);
        let ring = &region.region().midi_in;
        let flood = vec![0x42u8; 2000];
        assert!(engine.midi_in_complete(&flood, TransferStatus::Complete(flood.len())));
        assert_eq!(ring.len(), 1024);
        assert_eq!(engine.midi_in_dropped(), 2000 - 1024);
    }

    #[test]
    fn cancelled_completions_stop_the_pipe() {
        let (engine, _region) = test_engine("cancel", TransferMode::Bulk);
        assert_eq!(engine.pcm_out_complete(5, TransferStatus::Cancelled), None);
        assert_eq!(engine.pcm_in_complete(5, TransferStatus::Cancelled), None);
        assert!(!engine.midi_in_complete(&[], TransferStatus::Cancelled));

        engine.request_shutdown();
        assert_eq!(
            engine.pcm_out_complete(6, TransferStatus::Complete(4096)),
            None
        );
        assert_eq!(
            engine.pcm_in_complete(6, TransferStatus::Complete(5120)),
            None
        );
    }

    #[test]
    fn interrupt_mode_uses_the_shorter_slot() {
        let (engine, region) = test_engine("interrupt", TransferMode::Interrupt);
        assert_eq!(engine.output_slot(0).len(), 3856);
        region.region().midi_out.push(0xF8).unwrap();
        engine
            .pcm_out_complete(0, TransferStatus::Complete(3856))
            .unwrap();
        let out = unsafe { region.region().audio.output_bytes() };
        assert_eq!(out[2 * MAX_PACKET_SIZE + 432], 0xF8);
    }
}

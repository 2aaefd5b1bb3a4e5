//! Consumer-side bridge onto the engine's shared region.
//!
//! Host audio glue (an audio scheme daemon, a plugin shim, a test harness)
//! uses this crate instead of touching the region layout directly: it maps
//! and validates the region, advertises the stream properties, copies
//! float frames to and from the packet rings through the codec, relays the
//! engine's timestamp anchors and exposes both MIDI directions.
//!
//! Every entry point on the real-time path re-validates the region first
//! and degrades to silence when the engine or the hardware went away, so
//! the host can keep calling at its own cadence and re-enumerate when told.

mod midi;

pub use midi::{MidiReceiver, MidiSender};

use std::path::Path;
use std::sync::atomic::Ordering;

use thiserror::Error;

use ploytec_codec::{read_input, write_output, TransferMode, CHANNELS, FRAMES_PER_PACKET};
use ploytec_shm::{RegionMap, ShmError, SharedRegion, DEFAULT_URB_COUNT, SHARED_MAGIC};

#[derive(Debug, Error)]
pub enum BridgeError {
    #[error("shared region: {0}")]
    Shm(#[from] ShmError),
}

/// Stream properties the host framework advertises. Fixed by the hardware
/// except for the rate and period fields, which mirror the region.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct DeviceProperties {
    /// 8 in, 8 out, 32-bit float interleaved, native endian.
    pub channels_in: u32,
    pub channels_out: u32,
    pub sample_rate: u32,
    /// Frames the engine keeps in flight: the host must stay this far from
    /// the hardware position.
    pub safety_offset: u32,
    pub latency: u32,
    /// Frames between timestamp anchors.
    pub zero_timestamp_period: u32,
}

/// A consistent clock anchor plus the seed that invalidates it: the seed
/// changes whenever the engine restarts, so hosts discard derived state.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ZeroTimestamp {
    pub sample_time: u64,
    pub host_time: u64,
    pub seed: u32,
}

pub struct AudioBridge {
    map: RegionMap,
    session_id: u32,
}

impl AudioBridge {
    /// Map the engine's region at its default path.
    pub fn open_default() -> Result<Self, BridgeError> {
        Self::open(Path::new(ploytec_shm::DEFAULT_REGION_PATH))
    }

    /// Map and validate the region, caching the session id. A later id
    /// change means the engine restarted and this bridge must be reopened.
    pub fn open(path: &Path) -> Result<Self, BridgeError> {
        let map = RegionMap::open(path)?;
        let session_id = map.region().session_id.load(Ordering::Acquire);
        log::info!(
            "mapped {} (session {:#010x})",
            path.display(),
            session_id
        );
        Ok(Self { map, session_id })
    }

    fn region(&self) -> &SharedRegion {
        self.map.region()
    }

    pub fn session_id(&self) -> u32 {
        self.session_id
    }

    /// The engine restarted underneath us.
    pub fn session_changed(&self) -> bool {
        self.region().session_id.load(Ordering::Acquire) != self.session_id
    }

    /// True while the region is live, the hardware is attached, the engine
    /// is streaming and the session matches the one mapped at open.
    pub fn connected(&self) -> bool {
        let region = self.region();
        region.magic.load(Ordering::Acquire) == SHARED_MAGIC
            && !self.session_changed()
            && region.audio.hardware_present.load(Ordering::Acquire)
            && region.audio.driver_ready.load(Ordering::Acquire)
    }

    pub fn properties(&self) -> DeviceProperties {
        let audio = &self.region().audio;
        DeviceProperties {
            channels_in: CHANNELS as u32,
            channels_out: CHANNELS as u32,
            sample_rate: audio.sample_rate.load(Ordering::Relaxed),
            safety_offset: DEFAULT_URB_COUNT * FRAMES_PER_PACKET as u32,
            latency: 0,
            zero_timestamp_period: audio.update_interval_frames.load(Ordering::Relaxed),
        }
    }

    /// Sequence-locked read of the engine's current anchor.
    pub fn zero_timestamp(&self) -> ZeroTimestamp {
        let (sample_time, host_time) = self.region().audio.timestamp.read();
        ZeroTimestamp {
            sample_time,
            host_time,
            seed: self.session_id,
        }
    }

    /// Host write callback: encode `frames` (interleaved, 8 channels) into
    /// the output ring at `sample_time`, then publish the write position.
    /// Returns false without writing anything when the device is gone; the
    /// host should re-check the device list.
    pub fn write_frames(&self, sample_time: u64, frames: &[f32]) -> bool {
        debug_assert_eq!(frames.len() % CHANNELS, 0);
        if !self.connected() {
            return false;
        }
        let audio = &self.region().audio;
        let mode = TransferMode::from_bulk_flag(audio.is_bulk());
        let ring = unsafe { audio.output_bytes_mut() };
        write_output(ring, frames, sample_time, mode);

        let frame_count = (frames.len() / CHANNELS) as u64;
        audio
            .hal_write_position
            .store(sample_time + frame_count, Ordering::Release);
        true
    }

    /// Host read callback: decode from the input ring at `sample_time`.
    /// Hands back silence (and false) when the device is gone.
    pub fn read_frames(&self, sample_time: u64, frames: &mut [f32]) -> bool {
        debug_assert_eq!(frames.len() % CHANNELS, 0);
        if !self.connected() {
            frames.fill(0.0);
            return false;
        }
        let audio = &self.region().audio;
        let ring = unsafe { audio.input_bytes() };
        read_input(frames, ring, sample_time);
        true
    }

    /// Producer handle onto the MIDI-out ring (towards the device).
    pub fn midi_sender(&self) -> MidiSender<'_> {
        MidiSender::new(&self.region().midi_out)
    }

    /// Consumer handle onto the MIDI-in ring (from the device).
    pub fn midi_receiver(&self) -> MidiReceiver<'_> {
        MidiReceiver::new(&self.region().midi_in)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ploytec_codec::{output_frame_offset, MAX_PACKET_SIZE, OUT_FRAME_SIZE};
    use ploytec_shm::FLAG_BULK_MODE;
    use std::path::PathBuf;

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ploytec-audio-{}-{}", std::process::id(), name))
    }

    /// Stand in for the engine: create the region and mark it streaming.
    fn fake_engine(name: &str) -> (RegionMap, PathBuf) {
        let path = scratch(name);
        let map = RegionMap::create(&path).unwrap();
        let audio = &map.region().audio;
        audio.sample_rate.store(96_000, Ordering::Relaxed);
        audio.device_flags.store(FLAG_BULK_MODE, Ordering::Relaxed);
        audio.update_interval_frames.store(640, Ordering::Relaxed);
        audio
            .frames_per_packet
            .store(FRAMES_PER_PACKET as u32, Ordering::Relaxed);
        audio.hardware_present.store(true, Ordering::Release);
        audio.driver_ready.store(true, Ordering::Release);
        (map, path)
    }

    #[test]
    fn properties_mirror_the_region() {
        let (_engine, path) = fake_engine("props");
        let bridge = AudioBridge::open(&path).unwrap();
        let props = bridge.properties();
        assert_eq!(props.channels_in, 8);
        assert_eq!(props.channels_out, 8);
        assert_eq!(props.sample_rate, 96_000);
        assert_eq!(props.safety_offset, 160);
        assert_eq!(props.latency, 0);
        assert_eq!(props.zero_timestamp_period, 640);
    }

    #[test]
    fn write_encodes_and_publishes_position() {
        let (engine, path) = fake_engine("write");
        let bridge = AudioBridge::open(&path).unwrap();

        let mut frames = vec![0.0f32; 4 * CHANNELS];
        frames[0] = -65536.0 / 8_388_608.0;
        assert!(bridge.write_frames(1000, &frames));

        let audio = &engine.region().audio;
        assert_eq!(audio.hal_write_position.load(Ordering::Acquire), 1004);
        let ring = unsafe { audio.output_bytes() };
        let off = output_frame_offset(TransferMode::Bulk, 1000);
        assert_eq!(&ring[off..off + 8], &[0x01; 8]);
        assert!(ring[off + 8..off + OUT_FRAME_SIZE].iter().all(|&b| b == 0));
    }

    #[test]
    fn disconnected_bridge_goes_silent() {
        // Device loss as seen from the consumer: flags drop, callbacks
        // return silence.
        let (engine, path) = fake_engine("silent");
        let bridge = AudioBridge::open(&path).unwrap();
        assert!(bridge.connected());

        engine
            .region()
            .audio
            .driver_ready
            .store(false, Ordering::Release);
        assert!(!bridge.connected());
        assert!(!bridge.write_frames(0, &vec![0.25f32; CHANNELS]));

        let mut input = vec![0.7f32; 2 * CHANNELS];
        assert!(!bridge.read_frames(0, &mut input));
        assert!(input.iter().all(|&s| s == 0.0));
    }

    #[test]
    fn timestamp_relay_carries_the_session_seed() {
        let (engine, path) = fake_engine("seed");
        let bridge = AudioBridge::open(&path).unwrap();
        engine.region().audio.timestamp.publish(1280, 42_000_000);
        let ts = bridge.zero_timestamp();
        assert_eq!(ts.sample_time, 1280);
        assert_eq!(ts.host_time, 42_000_000);
        assert_eq!(ts.seed, bridge.session_id());
    }

    #[test]
    fn engine_restart_invalidates_the_bridge() {
        // The cached session id goes stale across an engine restart.
        let (engine, path) = fake_engine("restart");
        let bridge = AudioBridge::open(&path).unwrap();
        let cached = bridge.session_id();
        assert!(bridge.connected());

        drop(engine);
        // Old mapping is poisoned even though the file is gone.
        assert!(!bridge.connected());

        let (second, _path2) = fake_engine("restart");
        let reopened = AudioBridge::open(second.path()).unwrap();
        assert_ne!(reopened.session_id(), cached);
        assert!(reopened.connected());
    }

    #[test]
    fn read_round_trips_engine_input() {
        let (engine, path) = fake_engine("read");
        let bridge = AudioBridge::open(&path).unwrap();

        // The engine's transport would DMA wire frames into the input
        // ring; fabricate one frame at position 160.
        let audio = &engine.region().audio;
        let ring = unsafe { audio.input_bytes_mut() };
        let off = 2 * MAX_PACKET_SIZE; // frame 160
        for b in ring[off..off + 8].iter_mut() {
            *b = 0x01;
        }

        let mut frames = vec![0.0f32; CHANNELS];
        assert!(bridge.read_frames(160, &mut frames));
        assert_eq!(frames[0], -65536.0 / 8_388_608.0);
        assert_eq!(frames[1], 0.0);
    }
}

//! The mapped region layout. `#[repr(C)]` throughout; this is the ABI both
//! sides compile against.

use std::cell::UnsafeCell;
use std::mem::size_of;
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicU32, AtomicU64, Ordering};

use ploytec_codec::AUDIO_RING_SIZE;

use crate::ring::MidiRing;
use crate::timestamp::TimestampCell;

/// Total byte size of the mapped region.
pub const REGION_SIZE: usize = size_of::<SharedRegion>();

/// Identity of the attached device, copied out of its USB descriptors.
#[derive(Clone, Copy, Debug, Default)]
pub struct DeviceIdentity<'a> {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: &'a str,
    pub product: &'a str,
    pub serial: &'a str,
}

/// A fixed 64-byte NUL-terminated UTF-8 name slot.
#[repr(C)]
pub struct NameField(UnsafeCell<[u8; 64]>);

unsafe impl Sync for NameField {}

impl NameField {
    /// Store `value`, truncated to 63 bytes on a char boundary. Called by
    /// the engine while it owns the identity fields (device attach).
    pub fn set(&self, value: &str) {
        let mut end = value.len().min(63);
        while !value.is_char_boundary(end) {
            end -= 1;
        }
        let bytes = unsafe { &mut *self.0.get() };
        bytes.fill(0);
        bytes[..end].copy_from_slice(&value.as_bytes()[..end]);
    }

    pub fn get(&self) -> String {
        let bytes = unsafe { &*self.0.get() };
        let end = bytes.iter().position(|&b| b == 0).unwrap_or(bytes.len());
        String::from_utf8_lossy(&bytes[..end]).into_owned()
    }
}

/// The audio block. Cache-line aligned; geometry fields are written during
/// enumeration (before `driver_ready`) and read-only afterwards.
#[repr(C, align(64))]
pub struct AudioShared {
    pub hardware_present: AtomicBool,
    pub driver_ready: AtomicBool,
    pub sample_rate: AtomicU32,
    pub device_flags: AtomicU32,
    pub update_interval_frames: AtomicU32,
    pub frames_per_packet: AtomicU32,
    pub samples_per_packet: AtomicU32,
    pub output_bytes_per_frame: AtomicU32,
    pub input_bytes_per_frame: AtomicU32,
    pub timestamp: TimestampCell,
    _pad0: [u8; 64],
    pub hal_write_position: AtomicU64,
    _pad1: [u8; 64],
    input_buffer: UnsafeCell<[u8; AUDIO_RING_SIZE]>,
    output_buffer: UnsafeCell<[u8; AUDIO_RING_SIZE]>,
}

unsafe impl Sync for AudioShared {}

impl AudioShared {
    /// Input packet ring.
    ///
    /// # Safety
    /// The caller must respect the ring discipline: the USB engine is the
    /// only writer (per slot, between submit and completion), the bridge
    /// reads slots selected by sample time.
    pub unsafe fn input_bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.input_buffer.get().cast(), AUDIO_RING_SIZE)
    }

    /// # Safety
    /// See [`Self::input_bytes`]; additionally no other `&mut` to the same
    /// slot may be live.
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn input_bytes_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.input_buffer.get().cast(), AUDIO_RING_SIZE)
    }

    /// Output packet ring. Same discipline, roles reversed: the bridge
    /// encodes frames in, the engine overwrites MIDI slots and hands slots
    /// to the transport.
    ///
    /// # Safety
    /// See [`Self::input_bytes`].
    pub unsafe fn output_bytes(&self) -> &[u8] {
        std::slice::from_raw_parts(self.output_buffer.get().cast(), AUDIO_RING_SIZE)
    }

    /// # Safety
    /// See [`Self::input_bytes_mut`].
    #[allow(clippy::mut_from_ref)]
    pub unsafe fn output_bytes_mut(&self) -> &mut [u8] {
        std::slice::from_raw_parts_mut(self.output_buffer.get().cast(), AUDIO_RING_SIZE)
    }

    pub fn is_bulk(&self) -> bool {
        self.device_flags.load(Ordering::Relaxed) & crate::FLAG_BULK_MODE != 0
    }
}

/// The whole mapped region.
#[repr(C)]
pub struct SharedRegion {
    pub magic: AtomicU32,
    pub version: AtomicU32,
    pub session_id: AtomicU32,
    pub heartbeat: AtomicU32,
    pub vendor_id: AtomicU16,
    pub product_id: AtomicU16,
    pub manufacturer_name: NameField,
    pub product_name: NameField,
    pub serial_number: NameField,
    pub midi_out: MidiRing,
    pub midi_in: MidiRing,
    pub audio: AudioShared,
}

impl SharedRegion {
    /// Stamp the attached device's identity. Engine side, device attach.
    pub fn set_identity(&self, identity: &DeviceIdentity<'_>) {
        self.vendor_id.store(identity.vendor_id, Ordering::Relaxed);
        self.product_id.store(identity.product_id, Ordering::Relaxed);
        self.manufacturer_name.set(identity.manufacturer);
        self.product_name.set(identity.product);
        self.serial_number.set(identity.serial);
    }
}

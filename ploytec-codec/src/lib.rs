//! Transcoding between host float PCM and the Ploytec wire format.
//!
//! The hardware is not USB Audio Class. It speaks a proprietary
//! bit-interleaved encoding: one frame of 8 × 24-bit little-endian samples
//! becomes 48 bytes on the way out and arrives as 64 bytes on the way in,
//! with every bit of every sample byte relocated. On top of the per-frame
//! encoding sits a fixed packet geometry that reserves two bytes per
//! sub-packet for multiplexed MIDI.
//!
//! This crate owns the wire contract: the per-frame bit interleave, the
//! bulk/interrupt packet geometry, and the ring-level copy helpers used by
//! both the USB engine and the audio consumer.

mod frame;
mod packet;

pub use frame::{decode_frame, encode_frame};
pub use packet::{
    clear_output, input_frame_offset, midi_slot_offset, output_frame_offset, read_input,
    write_output, TransferMode,
};

/// Channels per frame, fixed by the hardware.
pub const CHANNELS: usize = 8;

/// Encoded size of one outbound frame.
pub const OUT_FRAME_SIZE: usize = 48;

/// Encoded size of one inbound frame.
pub const IN_FRAME_SIZE: usize = 64;

/// Audio frames carried by one logical USB packet at 96 kHz.
pub const FRAMES_PER_PACKET: usize = 80;

/// Sub-packets per logical packet.
pub const SUB_PACKETS: usize = 8;

/// Frames per sub-packet.
pub const FRAMES_PER_SUB_PACKET: usize = 10;

/// Slot stride in the shared audio rings. Sized for the high-speed USB
/// maximum so one layout serves every packet flavour.
pub const MAX_PACKET_SIZE: usize = 8192;

/// Packet slots per audio ring.
pub const NUM_PACKETS: usize = 128;

/// Byte size of each shared audio ring.
pub const AUDIO_RING_SIZE: usize = MAX_PACKET_SIZE * NUM_PACKETS;

/// Frames held by each shared audio ring.
pub const RING_FRAMES: u64 = (NUM_PACKETS * FRAMES_PER_PACKET) as u64;

/// Inbound packet payload: 80 frames × 64 bytes, both modes.
pub const IN_PACKET_SIZE: usize = FRAMES_PER_PACKET * IN_FRAME_SIZE;

/// Wire byte meaning "no MIDI data here". The engine pads idle MIDI slots
/// with it and drops it from inbound MIDI streams.
pub const MIDI_IGNORE: u8 = 0xFD;

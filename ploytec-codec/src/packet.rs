//! Packet geometry and ring-level copies.
//!
//! The shared audio rings hold `NUM_PACKETS` slots of `MAX_PACKET_SIZE`
//! bytes each. Output slots carry 8 sub-packets of 512 (bulk) or 482
//! (interrupt) bytes; each sub-packet is 10 encoded frames plus a two-byte
//! MIDI slot. In bulk mode the MIDI slot trails the 10 frames; in interrupt
//! mode it sits between the 9th and 10th frame. Input slots are a flat run
//! of 80 × 64-byte frames.

use crate::frame::{decode_frame, encode_frame};
use crate::{
    CHANNELS, FRAMES_PER_PACKET, FRAMES_PER_SUB_PACKET, IN_FRAME_SIZE, MAX_PACKET_SIZE,
    MIDI_IGNORE, NUM_PACKETS, OUT_FRAME_SIZE, SUB_PACKETS,
};

/// Endpoint transfer type of the PCM-out pipe, which fixes the output
/// packet geometry.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferMode {
    Bulk,
    Interrupt,
}

impl TransferMode {
    pub fn from_bulk_flag(bulk: bool) -> Self {
        if bulk {
            Self::Bulk
        } else {
            Self::Interrupt
        }
    }

    pub fn is_bulk(self) -> bool {
        self == Self::Bulk
    }

    /// Byte stride of one sub-packet.
    pub fn sub_packet_size(self) -> usize {
        match self {
            Self::Bulk => 512,
            Self::Interrupt => 482,
        }
    }

    /// Offset of the two-byte MIDI slot inside a sub-packet.
    pub fn midi_offset(self) -> usize {
        match self {
            Self::Bulk => 480,
            Self::Interrupt => 432,
        }
    }

    /// Outbound USB payload length per packet: 4096 bulk, 3856 interrupt.
    pub fn packet_size(self) -> usize {
        SUB_PACKETS * self.sub_packet_size()
    }
}

/// Byte offset of an output frame inside the ring, `frame_index` counted
/// from the ring start. Frames at index 9 of an interrupt-mode sub-packet
/// sit past the MIDI gap.
pub fn output_frame_offset(mode: TransferMode, frame_index: u64) -> usize {
    let packet = (frame_index / FRAMES_PER_PACKET as u64) as usize % NUM_PACKETS;
    let in_packet = (frame_index % FRAMES_PER_PACKET as u64) as usize;
    let sub = in_packet / FRAMES_PER_SUB_PACKET;
    let in_sub = in_packet % FRAMES_PER_SUB_PACKET;
    let gap = match mode {
        TransferMode::Interrupt if in_sub >= 9 => 2,
        _ => 0,
    };
    packet * MAX_PACKET_SIZE + sub * mode.sub_packet_size() + in_sub * OUT_FRAME_SIZE + gap
}

/// Byte offset of an input frame inside the ring.
pub fn input_frame_offset(frame_index: u64) -> usize {
    let packet = (frame_index / FRAMES_PER_PACKET as u64) as usize % NUM_PACKETS;
    let in_packet = (frame_index % FRAMES_PER_PACKET as u64) as usize;
    packet * MAX_PACKET_SIZE + in_packet * IN_FRAME_SIZE
}

/// Offset of the live MIDI slot for a packet: the first sub-packet's slot.
/// Limiting injection to one byte per logical packet keeps MIDI output
/// around 1200 B/s at 96 kHz, under the 3.125 kB/s MIDI 1.0 wire rate.
pub fn midi_slot_offset(mode: TransferMode, packet_index: u32) -> usize {
    (packet_index as usize % NUM_PACKETS) * MAX_PACKET_SIZE + mode.midi_offset()
}

fn ring_frames(ring_len: usize) -> u64 {
    ((ring_len / MAX_PACKET_SIZE) * FRAMES_PER_PACKET) as u64
}

/// Encode `frames` into the output ring starting at the slot position of
/// `sample_time`, wrapping at the ring end.
pub fn write_output(ring: &mut [u8], frames: &[f32], sample_time: u64, mode: TransferMode) {
    let total = ring_frames(ring.len());
    let mut pos = sample_time % total;
    for frame in frames.chunks_exact(CHANNELS) {
        let off = output_frame_offset(mode, pos);
        encode_frame(&mut ring[off..off + OUT_FRAME_SIZE], frame);
        pos += 1;
        if pos == total {
            pos = 0;
        }
    }
}

/// Decode `frames` out of the input ring starting at the slot position of
/// `sample_time`, wrapping at the ring end.
pub fn read_input(frames: &mut [f32], ring: &[u8], sample_time: u64) {
    let total = ring_frames(ring.len());
    let mut pos = sample_time % total;
    for frame in frames.chunks_exact_mut(CHANNELS) {
        let off = input_frame_offset(pos);
        decode_frame(frame, &ring[off..off + IN_FRAME_SIZE]);
        pos += 1;
        if pos == total {
            pos = 0;
        }
    }
}

/// Zero every PCM byte of the output ring and restore the 0xFD pair in
/// every sub-packet's MIDI slot. The device expects the sync pattern even
/// while no audio or MIDI is flowing.
pub fn clear_output(ring: &mut [u8], mode: TransferMode) {
    ring.fill(0);
    let packets = ring.len() / MAX_PACKET_SIZE;
    for packet in 0..packets {
        let base = packet * MAX_PACKET_SIZE;
        for sub in 0..SUB_PACKETS {
            let off = base + sub * mode.sub_packet_size() + mode.midi_offset();
            ring[off] = MIDI_IGNORE;
            ring[off + 1] = MIDI_IGNORE;
        }
    }
}

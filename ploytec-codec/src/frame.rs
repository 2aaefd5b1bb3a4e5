//! Per-frame bit interleave.
//!
//! An encoded output frame is two 24-byte halves: the first packs channels
//! 1/3/5/7, the second channels 2/4/6/8. Within a half, three 8-byte blocks
//! carry the high, middle and low byte of the four 24-bit samples. Output
//! byte `i` of a block holds bit `7 - i` of all four source bytes, with
//! channel `c` of the half landing at bit position `c`.
//!
//! Input frames are 64 bytes with the halves 32 bytes apart; only the first
//! 24 bytes of each half carry sample bits. The bit placement is the same
//! family as the output side, which is what makes the decode→encode
//! round-trip testable bit-for-bit.

use crate::{CHANNELS, IN_FRAME_SIZE, OUT_FRAME_SIZE};

const SCALE: f32 = 8_388_608.0;
const HALF_CHANNELS: usize = CHANNELS / 2;

/// Encode one frame of interleaved float samples into 48 wire bytes.
///
/// Samples outside [-1.0, 1.0] saturate to the signed 24-bit range.
pub fn encode_frame(dst: &mut [u8], src: &[f32]) {
    debug_assert!(dst.len() >= OUT_FRAME_SIZE);
    debug_assert!(src.len() >= CHANNELS);

    let mut bytes = [[0u8; 3]; CHANNELS];
    for (ch, sample) in src[..CHANNELS].iter().enumerate() {
        let s = (sample * SCALE).clamp(-8_388_608.0, 8_388_607.0) as i32;
        let le = s.to_le_bytes();
        bytes[ch] = [le[0], le[1], le[2]];
    }

    for half in 0..2 {
        for block in 0..3 {
            // High byte travels first within a half.
            let significance = 2 - block;
            for i in 0..8 {
                let mut out = 0u8;
                for c in 0..HALF_CHANNELS {
                    let source = bytes[half + 2 * c][significance];
                    out |= ((source >> (7 - i)) & 1) << c;
                }
                dst[half * 24 + block * 8 + i] = out;
            }
        }
    }
}

/// Decode one 64-byte wire frame into 8 float samples.
pub fn decode_frame(dst: &mut [f32], src: &[u8]) {
    debug_assert!(src.len() >= IN_FRAME_SIZE);
    debug_assert!(dst.len() >= CHANNELS);

    for half in 0..2 {
        for c in 0..HALF_CHANNELS {
            let mut bytes = [0u8; 3];
            for block in 0..3 {
                let significance = 2 - block;
                let mut v = 0u8;
                for i in 0..8 {
                    v |= ((src[half * 32 + block * 8 + i] >> c) & 1) << (7 - i);
                }
                bytes[significance] = v;
            }
            let raw =
                i32::from(bytes[0]) | i32::from(bytes[1]) << 8 | i32::from(bytes[2]) << 16;
            // Sign-extend from 24 bits.
            let s = (raw << 8) >> 8;
            dst[half + 2 * c] = s as f32 / SCALE;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Lay a 48-byte output frame into the 64-byte input layout so decode
    /// can read it back: halves move from 24-byte to 32-byte strides.
    fn widen(out: &[u8; 48]) -> [u8; 64] {
        let mut wire = [0u8; 64];
        wire[..24].copy_from_slice(&out[..24]);
        wire[32..56].copy_from_slice(&out[24..]);
        wire
    }

    #[test]
    fn silence_encodes_to_zero() {
        let mut dst = [0xAAu8; 48];
        encode_frame(&mut dst, &[0.0; 8]);
        assert_eq!(dst, [0u8; 48]);
    }

    #[test]
    fn channel_one_high_byte_lands_in_first_block() {
        // -65536 / 2^23: sample bytes are L=0x00 M=0x00 H=0xFF, so every
        // output byte of the first block carries exactly bit 0.
        let mut src = [0.0f32; 8];
        src[0] = -65536.0 / SCALE;
        let mut dst = [0u8; 48];
        encode_frame(&mut dst, &src);
        assert_eq!(&dst[..8], &[0x01; 8]);
        assert_eq!(&dst[8..48], &[0u8; 40][..]);
    }

    #[test]
    fn channel_two_uses_second_half() {
        let mut src = [0.0f32; 8];
        src[1] = -65536.0 / SCALE;
        let mut dst = [0u8; 48];
        encode_frame(&mut dst, &src);
        assert_eq!(&dst[..24], &[0u8; 24][..]);
        assert_eq!(&dst[24..32], &[0x01; 8]);
        assert_eq!(&dst[32..48], &[0u8; 16][..]);
    }

    #[test]
    fn channel_three_shifts_one_bit() {
        let mut src = [0.0f32; 8];
        src[2] = -65536.0 / SCALE;
        let mut dst = [0u8; 48];
        encode_frame(&mut dst, &src);
        assert_eq!(&dst[..8], &[0x02; 8]);
    }

    #[test]
    fn decode_reads_bit_zero_as_channel_one() {
        let mut wire = [0u8; 64];
        for b in wire[..8].iter_mut() {
            *b = 0x01;
        }
        let mut dst = [0.0f32; 8];
        decode_frame(&mut dst, &wire);
        assert_eq!(dst[0], -65536.0 / SCALE);
        for s in &dst[1..] {
            assert_eq!(*s, 0.0);
        }
    }

    #[test]
    fn saturation_clamps_to_24_bit_range() {
        let mut dst = [0u8; 48];
        encode_frame(&mut dst, &[2.0, -2.0, 1.0, -1.0, 0.0, 0.0, 0.0, 0.0]);
        let mut decoded = [0.0f32; 8];
        decode_frame(&mut decoded, &widen(&dst));
        assert_eq!(decoded[0], 8_388_607.0 / SCALE);
        assert_eq!(decoded[1], -1.0);
        assert_eq!(decoded[2], 8_388_607.0 / SCALE);
        assert_eq!(decoded[3], -1.0);
    }

    #[test]
    fn decode_then_encode_preserves_surviving_bits() {
        // Property: any bit decode claims to read must be placed at the
        // symmetric position by encode. Walk a pseudo-random 64-byte wire
        // frame (with garbage in the unused tail of each half), decode it,
        // re-encode, and compare the low-nibble bits of the 24 live bytes
        // per half.
        let mut x = 0x2545_F491_4F6C_DD1Du64;
        let mut rng = || {
            x ^= x >> 12;
            x ^= x << 25;
            x ^= x >> 27;
            (x.wrapping_mul(0x2545_F491_4F6C_DD1D) >> 32) as u8
        };

        for _ in 0..256 {
            let mut wire = [0u8; 64];
            for b in wire.iter_mut() {
                *b = rng();
            }

            let mut samples = [0.0f32; 8];
            decode_frame(&mut samples, &wire);
            let mut encoded = [0u8; 48];
            encode_frame(&mut encoded, &samples);

            for half in 0..2 {
                for i in 0..24 {
                    let read = wire[half * 32 + i] & 0x0F;
                    let written = encoded[half * 24 + i];
                    assert_eq!(
                        written, read,
                        "half {} byte {}: wire {:#04x} encoded {:#04x}",
                        half, i, wire[half * 32 + i], written
                    );
                }
            }
        }
    }
}

//! MIDI port handles over the shared rings.
//!
//! The engine injects one outbound byte per USB packet and fills the
//! inbound ring from the device's MIDI endpoint; these handles are the
//! other end of both rings.

use ploytec_shm::MidiRing;

/// Producer onto the MIDI-out ring. Overflow drops the newest byte and
/// counts it; at one byte per packet the engine drains ≈1200 B/s, so a
/// full ring means the producer is far ahead of the wire.
pub struct MidiSender<'a> {
    ring: &'a MidiRing,
    dropped: u64,
}

impl<'a> MidiSender<'a> {
    pub(crate) fn new(ring: &'a MidiRing) -> Self {
        Self { ring, dropped: 0 }
    }

    /// Queue one byte towards the device. Returns false if it was dropped.
    pub fn send(&mut self, byte: u8) -> bool {
        if self.ring.push(byte).is_err() {
            self.dropped += 1;
            log::debug!("MIDI out ring full, dropped byte ({} total)", self.dropped);
            return false;
        }
        true
    }

    /// Queue a whole message, all-or-nothing.
    pub fn send_all(&mut self, bytes: &[u8]) -> bool {
        if (self.ring.producible() as usize) < bytes.len() {
            self.dropped += bytes.len() as u64;
            return false;
        }
        for &byte in bytes {
            // Cannot fail: capacity checked above, we are the only producer.
            let _ = self.ring.push(byte);
        }
        true
    }

    pub fn dropped(&self) -> u64 {
        self.dropped
    }
}

/// Consumer of the MIDI-in ring. The engine has already stripped the wire
/// sync bytes; everything here is real traffic.
pub struct MidiReceiver<'a> {
    ring: &'a MidiRing,
}

impl<'a> MidiReceiver<'a> {
    pub(crate) fn new(ring: &'a MidiRing) -> Self {
        Self { ring }
    }

    pub fn recv(&mut self) -> Option<u8> {
        self.ring.pop()
    }

    pub fn pending(&self) -> u32 {
        self.ring.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ploytec_shm::MIDI_RING_SIZE;

    fn fresh_ring() -> MidiRing {
        unsafe { std::mem::zeroed() }
    }

    #[test]
    fn sender_feeds_the_engine_side() {
        let ring = fresh_ring();
        let mut sender = MidiSender::new(&ring);
        assert!(sender.send_all(&[0x90, 0x40, 0x7F]));
        // Engine side drains one byte per packet.
        assert_eq!(ring.pop(), Some(0x90));
        assert_eq!(ring.pop(), Some(0x40));
        assert_eq!(ring.pop(), Some(0x7F));
        assert_eq!(ring.pop(), None);
    }

    #[test]
    fn overflow_drops_and_counts() {
        let ring = fresh_ring();
        let mut sender = MidiSender::new(&ring);
        for _ in 0..MIDI_RING_SIZE {
            assert!(sender.send(0xF8));
        }
        assert!(!sender.send(0xF8));
        assert_eq!(sender.dropped(), 1);
        // A whole message never goes in half-way.
        assert!(!sender.send_all(&[0x90, 0x40, 0x7F]));
        assert_eq!(sender.dropped(), 4);
    }

    #[test]
    fn receiver_reads_engine_pushes() {
        let ring = fresh_ring();
        ring.push(0xB0).unwrap();
        ring.push(0x07).unwrap();
        let mut receiver = MidiReceiver::new(&ring);
        assert_eq!(receiver.pending(), 2);
        assert_eq!(receiver.recv(), Some(0xB0));
        assert_eq!(receiver.recv(), Some(0x07));
        assert_eq!(receiver.recv(), None);
    }
}

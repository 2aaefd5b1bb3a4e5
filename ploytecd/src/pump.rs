//! Per-endpoint transfer loops.
//!
//! Each pipe runs `urb_count` packet indices through a rotating window:
//! submit, block until the transport completes, fold the completion through
//! the engine, requeue whatever index the engine hands back. The threads
//! exit when a completion returns nothing (abort or shutdown).

use std::collections::VecDeque;
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crate::bus::{Pipe, TransferStatus, UsbBus};
use crate::engine::Engine;

pub struct Pumps {
    handles: Vec<JoinHandle<()>>,
}

/// Queue the initial window on all three pipes and start the loops. The
/// caller flips `driver_ready` once this returns.
pub fn start(engine: Arc<Engine>, bus: Arc<dyn UsbBus>) -> Pumps {
    let handles = vec![
        spawn("ploytec-pcm-out", {
            let engine = engine.clone();
            let bus = bus.clone();
            move || run_pcm_out(&engine, &*bus)
        }),
        spawn("ploytec-pcm-in", {
            let engine = engine.clone();
            let bus = bus.clone();
            move || run_pcm_in(&engine, &*bus)
        }),
        spawn("ploytec-midi-in", {
            move || run_midi_in(&engine, &*bus)
        }),
    ];
    Pumps { handles }
}

impl Pumps {
    /// Wait for the loops to drain. Call after aborting the pipes.
    pub fn join(self) {
        for handle in self.handles {
            let _ = handle.join();
        }
    }
}

fn spawn(name: &str, f: impl FnOnce() + Send + 'static) -> JoinHandle<()> {
    thread::Builder::new()
        .name(name.into())
        .spawn(f)
        .expect("ploytecd: failed to spawn pump thread")
}

// A dead pipe fails instantly; don't turn that into a hot loop.
fn failure_backoff(status: TransferStatus) {
    if status == TransferStatus::Failed {
        thread::sleep(std::time::Duration::from_millis(1));
    }
}

fn run_pcm_out(engine: &Engine, bus: &dyn UsbBus) {
    let mut pending: VecDeque<u32> = (0..engine.urb_count()).collect();
    while let Some(index) = pending.pop_front() {
        let status = bus.write_packet(Pipe::PcmOut, engine.output_slot(index));
        if let Some(next) = engine.pcm_out_complete(index, status) {
            pending.push_back(next);
        }
        failure_backoff(status);
    }
    log::debug!("PCM out pump stopped");
}

fn run_pcm_in(engine: &Engine, bus: &dyn UsbBus) {
    let mut pending: VecDeque<u32> = (0..engine.urb_count()).collect();
    while let Some(index) = pending.pop_front() {
        let status = bus.read_packet(Pipe::PcmIn, engine.input_slot_mut(index));
        if let Some(next) = engine.pcm_in_complete(index, status) {
            pending.push_back(next);
        }
        failure_backoff(status);
    }
    log::debug!("PCM in pump stopped");
}

fn run_midi_in(engine: &Engine, bus: &dyn UsbBus) {
    let mut buf = vec![0u8; engine.midi_in_packet()];
    loop {
        let status = bus.read_packet(Pipe::MidiIn, &mut buf);
        let received = match status {
            TransferStatus::Complete(n) => n.min(buf.len()),
            _ => 0,
        };
        if !engine.midi_in_complete(&buf[..received], status) {
            break;
        }
        failure_backoff(status);
    }
    log::debug!("MIDI in pump stopped");
}

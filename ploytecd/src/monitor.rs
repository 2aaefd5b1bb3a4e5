//! Liveness monitor: heartbeat for consumers, watchdog for the device.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use crossbeam_channel::Sender;

use crate::engine::Engine;
use crate::lifecycle::DeviceEvent;

const TICK: Duration = Duration::from_millis(100);

pub struct Monitor {
    stop: Arc<AtomicBool>,
    handle: Option<JoinHandle<()>>,
}

/// Bump the region heartbeat every tick and watch the PCM-in pipe. A wedged
/// device stops delivering input completions while everything else still
/// looks alive; declaring it gone re-enters the enumeration path.
pub fn start(engine: Arc<Engine>, events: Sender<DeviceEvent>, watchdog: Duration) -> Monitor {
    let stop = Arc::new(AtomicBool::new(false));
    let stop_flag = stop.clone();
    let handle = std::thread::Builder::new()
        .name("ploytec-monitor".into())
        .spawn(move || {
            let watchdog_ns = watchdog.as_nanos() as u64;
            let mut ticks = 0u32;
            while !stop_flag.load(Ordering::Acquire) {
                let region = engine.region();
                region.heartbeat.fetch_add(1, Ordering::Relaxed);

                ticks += 1;
                if ticks % 100 == 0 {
                    log::debug!(
                        "clock at {} frames, {} MIDI-in bytes dropped",
                        engine.hw_sample_time(),
                        engine.midi_in_dropped()
                    );
                }

                if watchdog_ns > 0 && region.audio.driver_ready.load(Ordering::Acquire) {
                    let idle = engine
                        .host_time_now()
                        .saturating_sub(engine.last_input_ns());
                    if idle > watchdog_ns {
                        log::error!(
                            "no PCM-in completion for {} ms, declaring the device gone",
                            idle / 1_000_000
                        );
                        engine.device_lost();
                        // End the session, then re-enter enumeration: a
                        // wedged device often comes back after a reopen.
                        let _ = events.send(DeviceEvent::Terminated);
                        let _ = events.send(DeviceEvent::Matched);
                        break;
                    }
                }
                std::thread::sleep(TICK);
            }
        })
        .expect("ploytecd: failed to spawn monitor thread");
    Monitor {
        stop,
        handle: Some(handle),
    }
}

impl Monitor {
    pub fn stop(mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for Monitor {
    fn drop(&mut self) {
        self.stop.store(true, Ordering::Release);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

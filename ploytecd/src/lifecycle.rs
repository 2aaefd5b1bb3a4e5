//! Hotplug-driven session lifecycle.
//!
//! Idle → DeviceOpened → Configured → Streaming → Stopping → Idle. The
//! engine consumes match/terminate events from a channel; the platform
//! spawner provides the initial match, the watchdog or the host layer
//! injects termination.

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender};
use thiserror::Error;

use ploytec_shm::RegionMap;

use crate::bus::{DeviceInfo, Pipe, UsbBus};
use crate::config::Config;
use crate::control;
use crate::engine::Engine;
use crate::monitor;
use crate::profile;
use crate::pump;
use crate::xhci::XhciBus;

/// Lifecycle inputs, from the platform spawner and the watchdog.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum DeviceEvent {
    Matched,
    Terminated,
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("enumeration failed: {0}")]
    Enumeration(#[from] crate::bus::UsbError),

    #[error("device {vendor_id:04x}:{product_id:04x} is not in the supported set")]
    Unsupported { vendor_id: u16, product_id: u16 },
}

const OPEN_RETRIES: u32 = 5;
const OPEN_RETRY_DELAY: Duration = Duration::from_millis(100);
const SHUTDOWN_DRAIN: Duration = Duration::from_millis(100);

/// Top-level loop: wait for a match, run one device session, return to
/// idle on loss. Ends when the event channel closes.
pub fn run(
    scheme: &str,
    port: &str,
    config: &Config,
    region: Arc<RegionMap>,
    events_tx: Sender<DeviceEvent>,
    events_rx: Receiver<DeviceEvent>,
) {
    loop {
        match events_rx.recv() {
            Ok(DeviceEvent::Matched) => {}
            Ok(DeviceEvent::Terminated) => continue,
            Err(_) => break,
        }
        match open_session(scheme, port, config, &region, &events_tx, &events_rx) {
            Ok(()) => log::info!("session ended, back to idle"),
            Err(err) => log::error!("session failed: {}", err),
        }
    }
}

fn open_session(
    scheme: &str,
    port: &str,
    config: &Config,
    region: &Arc<RegionMap>,
    events_tx: &Sender<DeviceEvent>,
    events_rx: &Receiver<DeviceEvent>,
) -> Result<(), SessionError> {
    // Exclusive open can race the previous owner's teardown; only that
    // race is worth waiting out. Anything else fails enumeration now.
    let mut attempt = 0;
    let bus = loop {
        match XhciBus::open(scheme, port) {
            Ok(bus) => break bus,
            Err(err @ crate::bus::UsbError::ExclusiveAccess) if attempt + 1 < OPEN_RETRIES => {
                attempt += 1;
                log::warn!("device open attempt {} failed: {}", attempt, err);
                std::thread::sleep(OPEN_RETRY_DELAY);
            }
            Err(err) => return Err(err.into()),
        }
    };

    let info = bus.device_info().clone();
    let profile = profile::profile_for(info.vendor_id, info.product_id).ok_or(
        SessionError::Unsupported {
            vendor_id: info.vendor_id,
            product_id: info.product_id,
        },
    )?;
    log::info!(
        "{} matched ({:04x}:{:04x}, \"{}\" / \"{}\")",
        profile.name,
        info.vendor_id,
        info.product_id,
        info.manufacturer,
        info.product
    );

    let mut bus = bus;
    bus.claim(profile)?;
    let setup = control::configure(&bus, profile, config.sample_rate)?;
    log::debug!(
        "configured: firmware {}, {} Hz, {} transfer mode",
        setup.firmware,
        setup.sample_rate,
        if setup.mode.is_bulk() { "bulk" } else { "interrupt" }
    );

    publish_identity(region, &info);
    let engine = Arc::new(Engine::new(region.clone(), &setup, config.urb_count));
    engine.begin_streaming();

    let bus: Arc<dyn UsbBus> = Arc::new(bus);
    let watchdog = monitor::start(
        engine.clone(),
        events_tx.clone(),
        Duration::from_millis(config.watchdog_ms),
    );
    run_streaming(&engine, &bus, events_rx);
    watchdog.stop();
    Ok(())
}

fn publish_identity(region: &RegionMap, info: &DeviceInfo) {
    region.region().set_identity(&ploytec_shm::DeviceIdentity {
        vendor_id: info.vendor_id,
        product_id: info.product_id,
        manufacturer: &info.manufacturer,
        product: &info.product,
        serial: &info.serial,
    });
}

/// Start the pumps, declare readiness, block until termination, then drain
/// and tear down. Factored off `open_session` so mock transports can drive
/// the whole streaming phase.
pub fn run_streaming(
    engine: &Arc<Engine>,
    bus: &Arc<dyn UsbBus>,
    events: &Receiver<DeviceEvent>,
) {
    let pumps = pump::start(engine.clone(), bus.clone());
    engine.mark_ready();
    log::info!("streaming started");

    loop {
        match events.recv() {
            Ok(DeviceEvent::Terminated) | Err(_) => break,
            // Already streaming this device.
            Ok(DeviceEvent::Matched) => {}
        }
    }

    log::info!("stopping stream");
    engine.request_shutdown();
    for pipe in Pipe::ALL {
        bus.abort(pipe);
    }
    // Let in-flight completions land before the buffers change owners.
    std::thread::sleep(SHUTDOWN_DRAIN);
    pumps.join();
    engine.device_lost();
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::{
        ControlRequest, DeviceInfo, EndpointInfo, ReqData, TransferStatus, UsbError,
    };
    use crate::control::{DeviceSetup, FirmwareVersion};
    use crate::engine::DEFAULT_URB_COUNT;
    use ploytec_codec::TransferMode;
    use std::path::PathBuf;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    /// A transport whose packet transfers tick along until aborted.
    #[derive(Default)]
    struct StreamingMock {
        info: DeviceInfo,
        aborted: [AtomicBool; 3],
        abort_log: Mutex<Vec<Pipe>>,
    }

    impl StreamingMock {
        fn pipe_index(pipe: Pipe) -> usize {
            match pipe {
                Pipe::PcmOut => 0,
                Pipe::PcmIn => 1,
                Pipe::MidiIn => 2,
            }
        }

        fn transfer(&self, pipe: Pipe, len: usize) -> TransferStatus {
            if self.aborted[Self::pipe_index(pipe)].load(Ordering::Acquire) {
                return TransferStatus::Cancelled;
            }
            // Keep the pump busy at a realistic cadence.
            std::thread::sleep(Duration::from_millis(1));
            TransferStatus::Complete(len)
        }
    }

    impl UsbBus for StreamingMock {
        fn device_info(&self) -> &DeviceInfo {
            &self.info
        }

        fn endpoint_info(&self, address: u8) -> Result<EndpointInfo, UsbError> {
            Ok(EndpointInfo {
                address,
                attributes: 0x02,
                max_packet_size: 512,
            })
        }

        fn control(&self, _req: &ControlRequest, _data: ReqData<'_>) -> Result<usize, UsbError> {
            unreachable!("streaming tests never issue control transfers");
        }

        fn write_packet(&self, pipe: Pipe, buf: &[u8]) -> TransferStatus {
            self.transfer(pipe, buf.len())
        }

        fn read_packet(&self, pipe: Pipe, buf: &mut [u8]) -> TransferStatus {
            self.transfer(pipe, buf.len())
        }

        fn abort(&self, pipe: Pipe) {
            self.aborted[Self::pipe_index(pipe)].store(true, Ordering::Release);
            self.abort_log.lock().unwrap().push(pipe);
        }
    }

    fn scratch(name: &str) -> PathBuf {
        std::env::temp_dir().join(format!("ploytecd-life-{}-{}", std::process::id(), name))
    }

    #[test]
    fn terminate_aborts_all_pipes_and_clears_flags() {
        // Device removal in the middle of streaming.
        let region = Arc::new(RegionMap::create(&scratch("terminate")).unwrap());
        let setup = DeviceSetup {
            firmware: FirmwareVersion {
                id: 0,
                major: 1,
                minor: 0,
                patch: 0,
            },
            mode: TransferMode::Bulk,
            sample_rate: 96_000,
            midi_in_packet: 512,
        };
        let engine = Arc::new(Engine::new(region.clone(), &setup, DEFAULT_URB_COUNT));
        engine.begin_streaming();

        let mock = Arc::new(StreamingMock::default());
        let bus: Arc<dyn UsbBus> = mock.clone();
        let (tx, rx) = crossbeam_channel::unbounded();

        let runner = {
            let engine = engine.clone();
            let bus = bus.clone();
            std::thread::spawn(move || run_streaming(&engine, &bus, &rx))
        };

        // Let a few packets cycle, then pull the device.
        std::thread::sleep(Duration::from_millis(30));
        let audio = &region.region().audio;
        assert!(audio.driver_ready.load(Ordering::Acquire));
        assert!(engine.hw_sample_time() > 0);

        tx.send(DeviceEvent::Terminated).unwrap();
        runner.join().unwrap();

        assert!(!audio.hardware_present.load(Ordering::Acquire));
        assert!(!audio.driver_ready.load(Ordering::Acquire));

        let log = mock.abort_log.lock().unwrap();
        for pipe in Pipe::ALL {
            assert!(log.contains(&pipe), "pipe {:?} was not aborted", pipe);
        }
    }
}

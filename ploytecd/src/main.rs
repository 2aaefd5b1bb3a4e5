//! USB engine daemon for the Ploytec family (Xone:DB4/DB2/DX/4D).
//!
//! Spawned by the USB stack with the host controller scheme and port of a
//! matched device. Owns the device exclusively, runs the streaming engine
//! and publishes audio, MIDI and the sample clock through the shared
//! region that `ploytec-audio` consumers map.

use std::path::PathBuf;
use std::sync::Arc;

use ploytec_engine::lifecycle::{self, DeviceEvent};
use ploytec_engine::{config, logging};
use ploytec_shm::RegionMap;

fn main() {
    let mut args = std::env::args().skip(1);

    const USAGE: &str = "ploytecd <scheme> <port> [config.toml]";

    let scheme = args.next().expect(USAGE);
    let port = args.next().expect(USAGE);
    let config_path = args.next().map(PathBuf::from);

    logging::setup_logging(&format!("{}_{}_ploytec", scheme, port));

    let config = config::load(config_path.as_deref())
        .expect("ploytecd: config file does not parse");

    log::info!(
        "Ploytec driver spawned with scheme `{}`, port {}",
        scheme,
        port
    );

    // The region outlives device sessions; losing the device clears the
    // ready flags but keeps consumers mapped. Failure here is fatal.
    let region = Arc::new(
        RegionMap::create(&config.region_path).expect("ploytecd: failed to create shared region"),
    );

    let (events_tx, events_rx) = crossbeam_channel::unbounded();
    // The spawner only starts us for an already-matched device.
    events_tx
        .send(DeviceEvent::Matched)
        .expect("ploytecd: event channel closed at startup");

    lifecycle::run(&scheme, &port, &config, region, events_tx, events_rx);
}

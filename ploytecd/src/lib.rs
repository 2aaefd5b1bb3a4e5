//! Streaming engine for the Ploytec USB audio/MIDI family
//! (Xone:DB4/DB2/DX/4D).
//!
//! The `ploytecd` binary wires this library to the host controller daemon
//! and the platform spawner. The library surface exists so external
//! harnesses can drive the engine against their own [`bus::UsbBus`]
//! transport: the device profiles, the control/enumeration sequencer, the
//! packet pump and the session lifecycle are all reachable without the
//! daemon around them.

pub mod bus;
pub mod config;
pub mod control;
pub mod engine;
pub mod lifecycle;
pub mod logging;
pub mod monitor;
pub mod profile;
pub mod pump;
pub mod xhci;

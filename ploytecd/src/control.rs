//! Vendor control protocol: the fixed request catalogue that brings a
//! freshly opened device into streaming state.

use bitflags::bitflags;

use ploytec_codec::TransferMode;

use crate::bus::{ControlRequest, ReqData, UsbBus, UsbError};
use crate::profile::DeviceProfile;

const CONTROL_TIMEOUT_MS: u32 = 2000;

/// Decoded response to the firmware query (0xC0, 'V').
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FirmwareVersion {
    pub id: u8,
    pub major: u8,
    pub minor: u8,
    pub patch: u8,
}

impl FirmwareVersion {
    /// Byte 0 carries the hardware id, byte 2 encodes minor.patch in
    /// decimal; the major version has always been 1.
    pub fn decode(buf: &[u8]) -> Self {
        Self {
            id: buf[0],
            major: 1,
            minor: buf[2] / 10,
            patch: buf[2] % 10,
        }
    }
}

impl std::fmt::Display for FirmwareVersion {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "v{}.{}.{} (id {:#04x})",
            self.major, self.minor, self.patch, self.id
        )
    }
}

bitflags! {
    /// Hardware status byte, logging only.
    #[derive(Clone, Copy, Debug)]
    pub struct HwStatus: u8 {
        const HIGH_SPEED = 0x80;
        const LEGACY_BCD1 = 0x20;
        const ARMED = 0x10;
        const CLOCK_LOCK = 0x04;
        const STREAMING = 0x02;
        const STABLE = 0x01;
    }
}

impl HwStatus {
    fn describe(self) -> String {
        format!(
            "{} {} {} {} {} {}",
            if self.contains(Self::HIGH_SPEED) { "[HighSpeed]" } else { "[FullSpeed]" },
            if self.contains(Self::LEGACY_BCD1) { "[Legacy/BCD1]" } else { "[Modern/BCD3]" },
            if self.contains(Self::ARMED) { "[Armed]" } else { "[Disarmed]" },
            if self.contains(Self::CLOCK_LOCK) { "[Clock-Lock]" } else { "[No-Lock]" },
            if self.contains(Self::STREAMING) { "[Streaming]" } else { "[Idle]" },
            if self.contains(Self::STABLE) { "[Stable]" } else { "[Syncing]" },
        )
    }
}

/// 3-byte little-endian frequency payload: 44100 → 44 AC 00, 48000 →
/// 80 BB 00, 88200 → 88 58 01, 96000 → 00 77 01.
pub fn rate_bytes(rate: u32) -> [u8; 3] {
    let le = rate.to_le_bytes();
    [le[0], le[1], le[2]]
}

/// What enumeration learned about the device.
#[derive(Clone, Copy, Debug)]
pub struct DeviceSetup {
    pub firmware: FirmwareVersion,
    pub mode: TransferMode,
    pub sample_rate: u32,
    pub midi_in_packet: usize,
}

/// Run the full configuration handshake. Every request is required; the
/// device ignores a lone sample-rate write, hence the five-write pattern
/// alternating wIndex between 0x0086 and 0x0005.
pub fn configure(
    bus: &dyn UsbBus,
    profile: &DeviceProfile,
    rate: u32,
) -> Result<DeviceSetup, UsbError> {
    let firmware = read_firmware(bus)?;
    log::info!("firmware {}", firmware);

    let pcm_out = bus.endpoint_info(profile.pcm_out.address)?;
    let mode = if pcm_out.is_bulk() {
        TransferMode::Bulk
    } else if pcm_out.is_interrupt() {
        TransferMode::Interrupt
    } else {
        return Err(UsbError::Protocol(format!(
            "PCM out endpoint has unusable attributes {:#04x}",
            pcm_out.attributes
        )));
    };
    let midi_in = bus.endpoint_info(profile.midi_in.address)?;
    log::info!(
        "{} transfer mode, midi packet {}",
        if mode.is_bulk() { "bulk" } else { "interrupt" },
        midi_in.max_packet_size
    );

    read_status(bus)?;
    read_rate(bus, profile)?;

    set_rate(bus, rate)?;

    read_status(bus)?;
    let sample_rate = read_rate(bus, profile)?;

    // Arm. Vendor out, no data; the device starts clocking afterwards.
    bus.control(
        &ControlRequest {
            request_type: 0x40,
            request: b'I',
            value: 0xFFB2,
            index: 0,
            timeout_ms: CONTROL_TIMEOUT_MS,
        },
        ReqData::None,
    )?;

    Ok(DeviceSetup {
        firmware,
        mode,
        sample_rate,
        midi_in_packet: midi_in.max_packet_size as usize,
    })
}

fn read_firmware(bus: &dyn UsbBus) -> Result<FirmwareVersion, UsbError> {
    let mut buf = [0u8; 15];
    let got = bus.control(
        &ControlRequest {
            request_type: 0xC0,
            request: b'V',
            value: 0,
            index: 0,
            timeout_ms: CONTROL_TIMEOUT_MS,
        },
        ReqData::In(&mut buf),
    )?;
    if got < 3 {
        return Err(UsbError::ShortControl { got, want: 15 });
    }
    Ok(FirmwareVersion::decode(&buf))
}

fn read_status(bus: &dyn UsbBus) -> Result<HwStatus, UsbError> {
    let mut buf = [0u8; 1];
    let got = bus.control(
        &ControlRequest {
            request_type: 0xC0,
            request: b'I',
            value: 0,
            index: 0,
            timeout_ms: CONTROL_TIMEOUT_MS,
        },
        ReqData::In(&mut buf),
    )?;
    if got < 1 {
        return Err(UsbError::ShortControl { got, want: 1 });
    }
    let status = HwStatus::from_bits_retain(buf[0]);
    log::info!("hardware status [{:#04x}] {}", buf[0], status.describe());
    Ok(status)
}

fn read_rate(bus: &dyn UsbBus, profile: &DeviceProfile) -> Result<u32, UsbError> {
    if !profile.rate_readback {
        // Xone:4D: the query stalls, 96 kHz is the only rate it runs at.
        log::info!("{}: skipping rate readback, assuming 96000 Hz", profile.name);
        return Ok(96_000);
    }
    let mut buf = [0u8; 3];
    let got = bus.control(
        &ControlRequest {
            request_type: 0xA2,
            request: 0x81,
            value: 0x0100,
            index: 0,
            timeout_ms: CONTROL_TIMEOUT_MS,
        },
        ReqData::In(&mut buf),
    )?;
    if got < 3 {
        return Err(UsbError::ShortControl { got, want: 3 });
    }
    let rate = u32::from(buf[0]) | u32::from(buf[1]) << 8 | u32::from(buf[2]) << 16;
    log::info!("device reports {} Hz", rate);
    Ok(rate)
}

fn set_rate(bus: &dyn UsbBus, rate: u32) -> Result<(), UsbError> {
    log::info!("setting device rate to {} Hz", rate);
    let payload = rate_bytes(rate);
    for index in [0x0086u16, 0x0005, 0x0086, 0x0005, 0x0086] {
        bus.control(
            &ControlRequest {
                request_type: 0x22,
                request: 0x01,
                value: 0x0100,
                index,
                timeout_ms: CONTROL_TIMEOUT_MS,
            },
            ReqData::Out(&payload),
        )?;
    }
    Ok(())
}

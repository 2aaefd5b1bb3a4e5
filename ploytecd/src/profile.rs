//! Static descriptions of the supported hardware.

/// Allen & Heath's vendor id, used by the whole Ploytec-based family.
pub const PLOYTEC_VENDOR_ID: u16 = 0x0A4A;

pub const PID_XONE_DB4: u16 = 0xFFDB;
pub const PID_XONE_DB2: u16 = 0xFFD2;
pub const PID_XONE_DX: u16 = 0xFFDD;
pub const PID_XONE_4D: u16 = 0xFF4D;

/// An endpoint plus the interface that owns it. Every pipe the engine
/// references must resolve to exactly one claimed interface.
#[derive(Clone, Copy, Debug)]
pub struct EndpointRef {
    pub address: u8,
    pub interface_index: u8,
}

#[derive(Clone, Copy, Debug)]
pub struct DeviceProfile {
    pub name: &'static str,
    pub product_id: u16,
    /// Interface indices to claim, each at alternate setting 1.
    pub interfaces: &'static [u8],
    pub pcm_out: EndpointRef,
    pub pcm_in: EndpointRef,
    pub midi_in: EndpointRef,
    /// The Xone:4D never answers the current-rate query; the engine assumes
    /// 96 kHz for it instead.
    pub rate_readback: bool,
}

// The family shares one topology: interface 0 carries control, PCM out
// (0x05) and MIDI in (0x83); interface 1 carries PCM in (0x86).
macro_rules! xone {
    ($name:literal, $pid:expr, $readback:expr) => {
        DeviceProfile {
            name: $name,
            product_id: $pid,
            interfaces: &[0, 1],
            pcm_out: EndpointRef {
                address: 0x05,
                interface_index: 0,
            },
            pcm_in: EndpointRef {
                address: 0x86,
                interface_index: 1,
            },
            midi_in: EndpointRef {
                address: 0x83,
                interface_index: 0,
            },
            rate_readback: $readback,
        }
    };
}

static PROFILES: [DeviceProfile; 4] = [
    xone!("Xone:DB4", PID_XONE_DB4, true),
    xone!("Xone:DB2", PID_XONE_DB2, true),
    xone!("Xone:DX", PID_XONE_DX, true),
    xone!("Xone:4D", PID_XONE_4D, false),
];

/// Look up the profile for a matched device, `None` if the ids are not in
/// the supported set.
pub fn profile_for(vendor_id: u16, product_id: u16) -> Option<&'static DeviceProfile> {
    if vendor_id != PLOYTEC_VENDOR_ID {
        return None;
    }
    PROFILES.iter().find(|p| p.product_id == product_id)
}

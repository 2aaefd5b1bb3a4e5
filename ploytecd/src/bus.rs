//! The operations the engine requires of the platform USB transport.
//!
//! Modeled so the streaming engine never touches the host controller
//! directly: enumeration-time control transfers go through [`UsbBus::control`],
//! the packet pump hands ring slots to [`UsbBus::write_packet`] /
//! [`UsbBus::read_packet`] and folds the returned status, and shutdown
//! aborts pipes without caring how the transport cancels.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum UsbError {
    #[error("usb i/o: {0}")]
    Io(#[from] std::io::Error),

    /// Another client still holds the device. The only open failure worth
    /// retrying: it clears once the previous owner's teardown finishes.
    #[error("device is held exclusively by another client")]
    ExclusiveAccess,

    #[error("usb host protocol: {0}")]
    Protocol(String),

    #[error("control transfer moved {got} bytes, expected {want}")]
    ShortControl { got: usize, want: usize },

    #[error("endpoint {0:#04x} not present on any claimed interface")]
    NoEndpoint(u8),
}

/// The three pipes of the streaming profile.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash)]
pub enum Pipe {
    PcmOut,
    PcmIn,
    MidiIn,
}

impl Pipe {
    pub const ALL: [Pipe; 3] = [Pipe::PcmOut, Pipe::PcmIn, Pipe::MidiIn];
}

/// Raw control transfer setup. The vendor protocol is defined in terms of
/// raw `bmRequestType` bytes, so that is what travels here; transports
/// split it into type/recipient/direction as their host stack requires.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct ControlRequest {
    pub request_type: u8,
    pub request: u8,
    pub value: u16,
    pub index: u16,
    pub timeout_ms: u32,
}

/// Payload direction of a control transfer.
pub enum ReqData<'a> {
    In(&'a mut [u8]),
    Out(&'a [u8]),
    None,
}

impl ReqData<'_> {
    pub fn len(&self) -> usize {
        match self {
            ReqData::In(buf) => buf.len(),
            ReqData::Out(buf) => buf.len(),
            ReqData::None => 0,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Completion status of a packet transfer. Cancellation is not an error;
/// a failed transfer is logged and the slot sequence advances past it.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum TransferStatus {
    /// Bytes actually moved.
    Complete(usize),
    /// The pipe was aborted while the transfer was in flight.
    Cancelled,
    /// Transport-level failure.
    Failed,
}

/// The slice of an endpoint descriptor the engine cares about.
#[derive(Clone, Copy, Debug)]
pub struct EndpointInfo {
    pub address: u8,
    pub attributes: u8,
    pub max_packet_size: u16,
}

impl EndpointInfo {
    pub fn is_bulk(&self) -> bool {
        self.attributes & 0x03 == 2
    }

    pub fn is_interrupt(&self) -> bool {
        self.attributes & 0x03 == 3
    }
}

/// Identity read from the device's standard descriptors.
#[derive(Clone, Debug, Default)]
pub struct DeviceInfo {
    pub vendor_id: u16,
    pub product_id: u16,
    pub manufacturer: String,
    pub product: String,
    pub serial: String,
}

pub trait UsbBus: Send + Sync {
    fn device_info(&self) -> &DeviceInfo;

    fn endpoint_info(&self, address: u8) -> Result<EndpointInfo, UsbError>;

    /// Blocking control transfer on the default pipe.
    fn control(&self, req: &ControlRequest, data: ReqData<'_>) -> Result<usize, UsbError>;

    /// Blocking outbound packet transfer; returns when the packet left the
    /// controller or the pipe died.
    fn write_packet(&self, pipe: Pipe, buf: &[u8]) -> TransferStatus;

    /// Blocking inbound packet transfer.
    fn read_packet(&self, pipe: Pipe, buf: &mut [u8]) -> TransferStatus;

    /// Cancel the in-flight transfer on a pipe; the blocked caller sees
    /// [`TransferStatus::Cancelled`].
    fn abort(&self, pipe: Pipe);
}

//! USB transport over the host controller daemon's per-port scheme files.
//!
//! The controller exposes each attached device under
//! `/scheme/<scheme>/port<port>/`: standard descriptors as JSON, a
//! `request` file for control transfers, a `configure` file for
//! configuration/alt-setting selection, and per-endpoint `data`/`ctl` file
//! pairs. Requests travel as JSON records; payload bytes move over the
//! plain file handles.

use std::collections::HashMap;
use std::fs::{File, OpenOptions};
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use smallvec::SmallVec;

use crate::bus::{
    ControlRequest, DeviceInfo, EndpointInfo, Pipe, ReqData, TransferStatus, UsbBus, UsbError,
};
use crate::profile::DeviceProfile;

// Subset of the controller's descriptor tree this driver needs. Unknown
// fields are ignored on purpose; the controller's records carry more.
#[derive(Clone, Debug, Deserialize)]
struct DevDesc {
    vendor: u16,
    product: u16,
    manufacturer_str: Option<String>,
    product_str: Option<String>,
    serial_str: Option<String>,
    config_descs: SmallVec<[ConfDesc; 1]>,
}

#[derive(Clone, Debug, Deserialize)]
struct ConfDesc {
    configuration_value: u8,
    interface_descs: SmallVec<[IfDesc; 1]>,
}

#[derive(Clone, Debug, Deserialize)]
struct IfDesc {
    number: u8,
    endpoints: SmallVec<[EndpDesc; 4]>,
}

#[derive(Clone, Copy, Debug, Deserialize)]
struct EndpDesc {
    address: u8,
    attributes: u8,
    max_packet_size: u16,
}

#[derive(Serialize)]
struct ConfigureEndpointsReq {
    config_desc: u8,
    interface_desc: Option<u8>,
    alternate_setting: Option<u8>,
    hub_ports: Option<u8>,
}

#[derive(Clone, Copy, Debug, Serialize)]
enum PortReqDirection {
    HostToDevice,
    DeviceToHost,
}

#[derive(Clone, Copy, Debug, Serialize)]
enum PortReqTy {
    Class,
    Vendor,
    Standard,
}

#[derive(Clone, Copy, Debug, Serialize)]
enum PortReqRecipient {
    Device,
    Interface,
    Endpoint,
    Other,
    VendorSpecific,
}

#[derive(Serialize)]
struct PortReq {
    direction: PortReqDirection,
    req_type: PortReqTy,
    req_recipient: PortReqRecipient,
    request: u8,
    value: u16,
    index: u16,
    length: u16,
    transfers_data: bool,
}

#[derive(Clone, Copy, Serialize)]
enum EndpCtlDirection {
    Out,
    In,
    #[allow(dead_code)]
    NoData,
}

#[derive(Serialize)]
enum EndpCtlReq {
    Transfer {
        direction: EndpCtlDirection,
        count: u32,
    },
    Reset {
        no_clear_feature: bool,
    },
}

#[derive(Deserialize)]
enum EndpCtlRes {
    Status(serde::de::IgnoredAny),
    TransferResult(PortTransferStatus),
    Pending,
    Idle,
}

#[derive(Clone, Copy, Deserialize)]
struct PortTransferStatus {
    kind: PortTransferStatusKind,
    bytes_transferred: u32,
}

#[derive(Clone, Copy, Eq, PartialEq, Deserialize)]
enum PortTransferStatusKind {
    Success,
    ShortPacket,
    Stalled,
    Unknown,
}

struct Endpoint {
    ctl: Mutex<File>,
    data: Mutex<File>,
    aborted: AtomicBool,
}

pub struct XhciBus {
    scheme: String,
    port: String,
    info: DeviceInfo,
    descs: DevDesc,
    pipes: HashMap<Pipe, Endpoint>,
}

impl XhciBus {
    /// Read the device's descriptors; the exclusive claim happens in
    /// [`Self::claim`].
    pub fn open(scheme: &str, port: &str) -> Result<Self, UsbError> {
        let path = format!("/scheme/{}/port{}/descriptors", scheme, port);
        let json = std::fs::read(&path).map_err(|err| {
            // The controller answers EBUSY while the previous owner is
            // still attached to the port.
            if err.kind() == std::io::ErrorKind::ResourceBusy {
                UsbError::ExclusiveAccess
            } else {
                UsbError::Io(err)
            }
        })?;
        let descs: DevDesc = serde_json::from_slice(&json)
            .map_err(|err| UsbError::Protocol(format!("descriptor record: {}", err)))?;

        let info = DeviceInfo {
            vendor_id: descs.vendor,
            product_id: descs.product,
            manufacturer: descs.manufacturer_str.clone().unwrap_or_default(),
            product: descs.product_str.clone().unwrap_or_default(),
            serial: descs.serial_str.clone().unwrap_or_default(),
        };

        Ok(Self {
            scheme: scheme.into(),
            port: port.into(),
            info,
            descs,
            pipes: HashMap::new(),
        })
    }

    fn port_path(&self, tail: &str) -> String {
        format!("/scheme/{}/port{}/{}", self.scheme, self.port, tail)
    }

    fn config(&self) -> Result<&ConfDesc, UsbError> {
        self.descs
            .config_descs
            .first()
            .ok_or_else(|| UsbError::Protocol("device has no configurations".into()))
    }

    fn find_endpoint(&self, address: u8) -> Result<(u8, EndpDesc), UsbError> {
        // The controller numbers endpoint files by their position across
        // the configuration's interfaces, starting at 1.
        let mut number = 0u8;
        for interface in &self.config()?.interface_descs {
            for ep in &interface.endpoints {
                number += 1;
                if ep.address == address {
                    return Ok((number, *ep));
                }
            }
        }
        Err(UsbError::NoEndpoint(address))
    }

    /// Select configuration 1 with alternate setting 1 on every interface
    /// of the profile, then open the three streaming pipes.
    pub fn claim(&mut self, profile: &DeviceProfile) -> Result<(), UsbError> {
        let config_desc = self.config()?.configuration_value;
        for &interface in profile.interfaces {
            if !self
                .config()?
                .interface_descs
                .iter()
                .any(|desc| desc.number == interface)
            {
                return Err(UsbError::Protocol(format!(
                    "device lacks interface {}",
                    interface
                )));
            }
            let req = ConfigureEndpointsReq {
                config_desc,
                interface_desc: Some(interface),
                alternate_setting: Some(1),
                hub_ports: None,
            };
            let json = serde_json::to_vec(&req)
                .map_err(|err| UsbError::Protocol(err.to_string()))?;
            let mut file = OpenOptions::new()
                .write(true)
                .open(self.port_path("configure"))?;
            let written = file.write(&json)?;
            if written != json.len() {
                return Err(UsbError::Protocol(
                    "configure request was not fully consumed".into(),
                ));
            }
        }

        for (pipe, ep_ref) in [
            (Pipe::PcmOut, profile.pcm_out),
            (Pipe::PcmIn, profile.pcm_in),
            (Pipe::MidiIn, profile.midi_in),
        ] {
            // Every pipe must live on an interface this driver claimed.
            if !profile.interfaces.contains(&ep_ref.interface_index) {
                return Err(UsbError::Protocol(format!(
                    "endpoint {:#04x} belongs to unclaimed interface {}",
                    ep_ref.address, ep_ref.interface_index
                )));
            }
            let (number, _desc) = self.find_endpoint(ep_ref.address)?;
            let ctl = File::open(self.port_path(&format!("endpoints/{}/ctl", number)))?;
            let data = File::open(self.port_path(&format!("endpoints/{}/data", number)))?;
            self.pipes.insert(
                pipe,
                Endpoint {
                    ctl: Mutex::new(ctl),
                    data: Mutex::new(data),
                    aborted: AtomicBool::new(false),
                },
            );
        }
        Ok(())
    }

    fn endpoint(&self, pipe: Pipe) -> Option<&Endpoint> {
        self.pipes.get(&pipe)
    }

    fn transfer(
        &self,
        pipe: Pipe,
        direction: EndpCtlDirection,
        io: impl FnOnce(&mut File) -> std::io::Result<usize>,
        count: usize,
    ) -> TransferStatus {
        let Some(ep) = self.endpoint(pipe) else {
            return TransferStatus::Failed;
        };
        if ep.aborted.load(Ordering::Acquire) {
            return TransferStatus::Cancelled;
        }

        let run = || -> Result<TransferStatus, UsbError> {
            let mut data = ep.data.lock().unwrap();

            let req = EndpCtlReq::Transfer {
                direction,
                count: count as u32,
            };
            let json =
                serde_json::to_vec(&req).map_err(|err| UsbError::Protocol(err.to_string()))?;
            // The ctl lock is dropped across the data phase so an abort can
            // slip a Reset record in while the transfer blocks.
            ep.ctl.lock().unwrap().write_all(&json)?;

            io(&mut data)?;

            let mut res_buf = [0u8; 256];
            let n = ep.ctl.lock().unwrap().read(&mut res_buf)?;
            let res: EndpCtlRes = serde_json::from_slice(&res_buf[..n])
                .map_err(|err| UsbError::Protocol(format!("ctl response: {}", err)))?;
            match res {
                EndpCtlRes::TransferResult(result) => match result.kind {
                    PortTransferStatusKind::Success | PortTransferStatusKind::ShortPacket => {
                        Ok(TransferStatus::Complete(result.bytes_transferred as usize))
                    }
                    _ => Ok(TransferStatus::Failed),
                },
                _ => Err(UsbError::Protocol("expected a transfer result".into())),
            }
        };

        match run() {
            Ok(status) => status,
            Err(err) => {
                if ep.aborted.load(Ordering::Acquire) {
                    TransferStatus::Cancelled
                } else {
                    log::warn!("{:?} transfer error: {}", pipe, err);
                    TransferStatus::Failed
                }
            }
        }
    }
}

fn split_request_type(raw: u8) -> (PortReqDirection, PortReqTy, PortReqRecipient) {
    let direction = if raw & 0x80 != 0 {
        PortReqDirection::DeviceToHost
    } else {
        PortReqDirection::HostToDevice
    };
    let ty = match (raw >> 5) & 0x03 {
        0 => PortReqTy::Standard,
        1 => PortReqTy::Class,
        _ => PortReqTy::Vendor,
    };
    let recipient = match raw & 0x1F {
        0 => PortReqRecipient::Device,
        1 => PortReqRecipient::Interface,
        2 => PortReqRecipient::Endpoint,
        3 => PortReqRecipient::Other,
        _ => PortReqRecipient::VendorSpecific,
    };
    (direction, ty, recipient)
}

impl UsbBus for XhciBus {
    fn device_info(&self) -> &DeviceInfo {
        &self.info
    }

    fn endpoint_info(&self, address: u8) -> Result<EndpointInfo, UsbError> {
        let (_, desc) = self.find_endpoint(address)?;
        Ok(EndpointInfo {
            address: desc.address,
            attributes: desc.attributes,
            max_packet_size: desc.max_packet_size,
        })
    }

    fn control(&self, req: &ControlRequest, mut data: ReqData<'_>) -> Result<usize, UsbError> {
        // The controller owns transfer timing; req.timeout_ms is advisory
        // and not forwarded.
        let (direction, req_type, req_recipient) = split_request_type(req.request_type);
        let record = PortReq {
            direction,
            req_type,
            req_recipient,
            request: req.request,
            value: req.value,
            index: req.index,
            length: data.len() as u16,
            transfers_data: !data.is_empty(),
        };
        let json = serde_json::to_vec(&record)
            .map_err(|err| UsbError::Protocol(err.to_string()))?;

        let mut file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(self.port_path("request"))?;
        let written = file.write(&json)?;
        if written != json.len() {
            return Err(UsbError::Protocol(
                "control record was not fully consumed".into(),
            ));
        }

        match &mut data {
            ReqData::In(buf) => {
                let want = buf.len();
                let got = file.read(buf)?;
                if got < want {
                    // Vendor reads may legally return short; the caller
                    // validates the minimum it needs.
                    log::debug!("control read returned {} of {} bytes", got, want);
                }
                Ok(got)
            }
            ReqData::Out(buf) => {
                let got = file.write(buf)?;
                if got != buf.len() {
                    return Err(UsbError::ShortControl {
                        got,
                        want: buf.len(),
                    });
                }
                Ok(got)
            }
            ReqData::None => Ok(0),
        }
    }

    fn write_packet(&self, pipe: Pipe, buf: &[u8]) -> TransferStatus {
        self.transfer(
            pipe,
            EndpCtlDirection::Out,
            |data| data.write(buf),
            buf.len(),
        )
    }

    fn read_packet(&self, pipe: Pipe, buf: &mut [u8]) -> TransferStatus {
        let len = buf.len();
        self.transfer(pipe, EndpCtlDirection::In, |data| data.read(buf), len)
    }

    fn abort(&self, pipe: Pipe) {
        let Some(ep) = self.endpoint(pipe) else {
            return;
        };
        ep.aborted.store(true, Ordering::Release);
        // Best effort: kick the controller so a blocked transfer returns.
        let reset = EndpCtlReq::Reset {
            no_clear_feature: false,
        };
        if let Ok(json) = serde_json::to_vec(&reset) {
            if let Ok(mut ctl) = ep.ctl.lock() {
                if let Err(err) = ctl.write_all(&json) {
                    log::debug!("{:?} abort write failed: {}", pipe, err);
                }
            }
        }
    }
}

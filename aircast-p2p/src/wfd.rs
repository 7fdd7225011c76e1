//! Wi-Fi Display device information and sub-elements
//!
//! Peers advertise their WFD capabilities during P2P discovery as a
//! hex-encoded "device information" sub-element; wpa_supplicant surfaces it
//! on `P2P-DEVICE-FOUND` as `wfd_dev_info=0x00111c440032`. The six-byte body
//! is device information (2 bytes), RTSP control port (2 bytes) and maximum
//! throughput in Mbps (2 bytes). The local side advertises the same structure
//! through `WFD_SUBELEM_SET`.

use crate::device::{Capability, DeviceRole};
use crate::error::{P2pError, Result};

/// Default RTSP control port for Miracast sessions
pub const RTSP_CTRL_PORT: u16 = 7236;

/// Maximum throughput we advertise, in Mbps
const MAX_THROUGHPUT_MBPS: u16 = 50;

/// Sub-element id of the device information block
const SUBELEMENT_DEVICE_INFO: u8 = 0;

const DEVICE_TYPE_MASK: u16 = 0x0003;
const SESSION_AVAILABLE: u16 = 0x0010;

/// Device type bits of the WFD device information field
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WfdDeviceType {
    Source,
    PrimarySink,
    SecondarySink,
    DualRole,
}

/// Parsed WFD device information of a remote peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WfdDeviceInfo {
    device_info: u16,
    ctrl_port: u16,
    max_throughput: u16,
}

impl WfdDeviceInfo {
    /// Parse the `wfd_dev_info` attribute value, with or without the `0x`
    /// prefix. Expects at least the six-byte device information body.
    pub fn parse(value: &str) -> Result<Self> {
        let hex = value.strip_prefix("0x").unwrap_or(value);

        if hex.len() < 12 || !hex.is_ascii() {
            return Err(P2pError::MalformedMessage(format!(
                "wfd_dev_info too short: {value}"
            )));
        }

        let word = |range: std::ops::Range<usize>| {
            u16::from_str_radix(&hex[range], 16).map_err(|_| {
                P2pError::MalformedMessage(format!("wfd_dev_info not hex: {value}"))
            })
        };

        Ok(Self {
            device_info: word(0..4)?,
            ctrl_port: word(4..8)?,
            max_throughput: word(8..12)?,
        })
    }

    pub fn device_type(&self) -> WfdDeviceType {
        match self.device_info & DEVICE_TYPE_MASK {
            0 => WfdDeviceType::Source,
            1 => WfdDeviceType::PrimarySink,
            2 => WfdDeviceType::SecondarySink,
            _ => WfdDeviceType::DualRole,
        }
    }

    pub fn is_session_available(&self) -> bool {
        self.device_info & SESSION_AVAILABLE != 0
    }

    pub fn ctrl_port(&self) -> u16 {
        self.ctrl_port
    }

    pub fn max_throughput(&self) -> u16 {
        self.max_throughput
    }

    /// A peer that does not advertise an RTSP control port cannot take part
    /// in a WFD session.
    pub fn is_supported(&self) -> bool {
        self.ctrl_port != 0
    }

    pub fn is_supported_sink(&self) -> bool {
        matches!(
            self.device_type(),
            WfdDeviceType::PrimarySink | WfdDeviceType::SecondarySink | WfdDeviceType::DualRole
        )
    }

    pub fn is_supported_source(&self) -> bool {
        matches!(
            self.device_type(),
            WfdDeviceType::Source | WfdDeviceType::DualRole
        )
    }

    /// Roles the peer can take, derived from the device type bits
    pub fn supported_roles(&self) -> Vec<DeviceRole> {
        let mut roles = Vec::with_capacity(2);
        if self.is_supported_source() {
            roles.push(DeviceRole::Source);
        }
        if self.is_supported_sink() {
            roles.push(DeviceRole::Sink);
        }
        roles
    }
}

/// Build the device-information sub-element advertising the local
/// capabilities, as the hex string `WFD_SUBELEM_SET` expects.
///
/// The default Source advertisement serializes to `000600101C440032`.
pub fn device_info_subelement(capabilities: &[Capability]) -> String {
    let mut device_info = SESSION_AVAILABLE;
    if capabilities.contains(&Capability::Sink) {
        device_info |= 0x0001;
    }
    if capabilities.contains(&Capability::Source) && capabilities.contains(&Capability::Sink) {
        device_info |= 0x0002;
    }

    format!(
        "{:02X}{:02X}{:04X}{:04X}{:04X}",
        SUBELEMENT_DEVICE_INFO, 6u8, device_info, RTSP_CTRL_PORT, MAX_THROUGHPUT_MBPS
    )
}

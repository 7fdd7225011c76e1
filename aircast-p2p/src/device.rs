//! Peer device model
//!
//! A `NetworkDevice` is a remote Wi-Fi Display peer discovered over P2P.
//! Devices are created and mutated exclusively by the session engine; the
//! facade hands out snapshots by value.

use std::fmt;

/// Connection state of a peer device
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceState {
    /// Nothing going on with this device
    Idle,
    /// A connection attempt or session ended in an error
    Failure,
    /// P2P group formation is being negotiated
    Association,
    /// Group formed, addresses being configured
    Configuration,
    /// Link is up and addressed
    Connected,
    /// Session ended normally
    Disconnected,
}

impl DeviceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeviceState::Idle => "idle",
            DeviceState::Failure => "failure",
            DeviceState::Association => "association",
            DeviceState::Configuration => "configuration",
            DeviceState::Connected => "connected",
            DeviceState::Disconnected => "disconnected",
        }
    }

    /// Check if the device is part of an active or forming session
    pub fn is_engaged(&self) -> bool {
        matches!(
            self,
            DeviceState::Association | DeviceState::Configuration | DeviceState::Connected
        )
    }
}

impl fmt::Display for DeviceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Role a peer can take in a Wi-Fi Display session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceRole {
    Source,
    Sink,
}

impl fmt::Display for DeviceRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            DeviceRole::Source => "source",
            DeviceRole::Sink => "sink",
        })
    }
}

/// Capability the local side advertises to remote peers
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Capability {
    Source,
    Sink,
}

/// A discovered or active P2P peer
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkDevice {
    address: String,
    /// Human-readable device name, may be empty
    pub name: String,
    /// Roles the peer advertised via its WFD device information
    pub supported_roles: Vec<DeviceRole>,
    pub(crate) state: DeviceState,
}

impl NetworkDevice {
    /// Create a device from discovery data. The address is canonicalized to
    /// lowercase and never changes afterwards.
    pub fn new(address: &str, name: &str, supported_roles: Vec<DeviceRole>) -> Self {
        Self {
            address: address.to_ascii_lowercase(),
            name: name.to_string(),
            supported_roles,
            state: DeviceState::Idle,
        }
    }

    /// MAC address of the peer, lowercase hex with colons
    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    pub fn supports_sink(&self) -> bool {
        self.supported_roles.contains(&DeviceRole::Sink)
    }

    pub fn supports_source(&self) -> bool {
        self.supported_roles.contains(&DeviceRole::Source)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_address_canonicalization() {
        let device = NetworkDevice::new("4E:74:03:70:E2:C1", "Aquaris M10", vec![DeviceRole::Sink]);
        assert_eq!(device.address(), "4e:74:03:70:e2:c1");
        assert_eq!(device.state(), DeviceState::Idle);
    }

    #[test]
    fn test_role_queries() {
        let sink = NetworkDevice::new("aa:bb:cc:dd:ee:ff", "", vec![DeviceRole::Sink]);
        assert!(sink.supports_sink());
        assert!(!sink.supports_source());

        let dual = NetworkDevice::new(
            "aa:bb:cc:dd:ee:00",
            "",
            vec![DeviceRole::Source, DeviceRole::Sink],
        );
        assert!(dual.supports_sink());
        assert!(dual.supports_source());
    }

    #[test]
    fn test_state_predicates() {
        assert!(DeviceState::Association.is_engaged());
        assert!(DeviceState::Connected.is_engaged());
        assert!(!DeviceState::Idle.is_engaged());
        assert!(!DeviceState::Failure.is_engaged());
        assert_eq!(DeviceState::Configuration.to_string(), "configuration");
    }
}

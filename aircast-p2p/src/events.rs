//! Network Events
//!
//! Events emitted by the session engine for the service layer. They are the
//! asynchronous half of the facade API: requests go in through
//! [`NetworkManager`](crate::manager::NetworkManager), state changes come
//! back out here.

use crate::device::NetworkDevice;

/// Event types emitted by the session engine
#[derive(Debug, Clone)]
pub enum NetworkEvent {
    /// A new WFD-capable peer appeared in the peer table
    DeviceFound(NetworkDevice),

    /// A known peer changed (name, roles, or state)
    DeviceChanged(NetworkDevice),

    /// A peer disappeared from the peer table
    DeviceLost(NetworkDevice),

    /// A peer moved to a new connection state
    DeviceStateChanged(NetworkDevice),

    /// Scanning or capabilities toggled
    Changed,

    /// The supplicant link is up and configured
    Ready,

    /// The supplicant could not be kept running; permanent until re-setup
    Unready,
}

impl NetworkEvent {
    /// Get the device if this event is device-related
    pub fn device(&self) -> Option<&NetworkDevice> {
        match self {
            NetworkEvent::DeviceFound(device)
            | NetworkEvent::DeviceChanged(device)
            | NetworkEvent::DeviceLost(device)
            | NetworkEvent::DeviceStateChanged(device) => Some(device),
            _ => None,
        }
    }
}

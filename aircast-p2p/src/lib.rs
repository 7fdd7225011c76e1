//! Aircast P2P Engine
//!
//! This library implements the Wi-Fi Direct side of a Miracast source: it
//! drives an external wpa_supplicant over its control socket, discovers
//! Wi-Fi Display sinks, negotiates a point-to-point group, brings up DHCP in
//! the right role, and reports a connected peer to the service layer, which
//! then starts the RTSP/media pipeline on top.

pub mod command_queue;
pub mod device;
pub mod dhcp;
pub mod engine;
pub mod events;
pub mod firmware;
pub mod manager;
pub mod message;
pub mod supplicant;
pub mod wfd;

mod error;

pub use device::{Capability, DeviceRole, DeviceState, NetworkDevice};
pub use error::{P2pError, Result};
pub use events::NetworkEvent;
pub use manager::{NetworkManager, NetworkManagerConfig};
pub use message::Message;
pub use wfd::RTSP_CTRL_PORT;

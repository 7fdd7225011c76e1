//! D-Bus management surface
//!
//! Exposes the Miracast service to local clients: enable/disable, scan,
//! connect, disconnect and introspection of the peer table and session
//! state, plus signals mirroring the service notifications.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::sync::RwLock;
use tracing::{debug, warn};
use zbus::object_server::SignalContext;
use zbus::{connection, interface, Connection};

use aircast_p2p::{NetworkDevice, P2pError};

use crate::service::{MiracastService, ServiceSignal};

/// D-Bus service name
pub const SERVICE_NAME: &str = "org.aircast.Daemon";

/// D-Bus object path
pub const OBJECT_PATH: &str = "/org/aircast/Manager";

/// Device state for D-Bus serialization
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize, zbus::zvariant::Type)]
pub struct DeviceRecord {
    /// MAC address of the peer
    pub address: String,
    /// Human-readable name
    pub name: String,
    /// Connection state
    pub state: String,
    /// Roles the peer supports
    pub roles: Vec<String>,
}

impl From<&NetworkDevice> for DeviceRecord {
    fn from(device: &NetworkDevice) -> Self {
        Self {
            address: device.address().to_string(),
            name: device.name.clone(),
            state: device.state().to_string(),
            roles: device
                .supported_roles
                .iter()
                .map(|role| role.to_string())
                .collect(),
        }
    }
}

fn to_fdo(error: P2pError) -> zbus::fdo::Error {
    match error {
        P2pError::ParamInvalid(message) => zbus::fdo::Error::InvalidArgs(message),
        other => zbus::fdo::Error::Failed(other.to_string()),
    }
}

/// D-Bus interface backing `org.aircast.Manager1`
struct ManagerInterface {
    service: Arc<RwLock<MiracastService>>,
}

#[interface(name = "org.aircast.Manager1")]
impl ManagerInterface {
    /// Enable or disable the service
    async fn set_enabled(&self, enabled: bool) -> zbus::fdo::Result<()> {
        debug!("DBus: SetEnabled({enabled})");
        self.service
            .write()
            .await
            .set_enabled(enabled)
            .await
            .map_err(to_fdo)
    }

    async fn enabled(&self) -> bool {
        self.service.read().await.enabled()
    }

    /// Current session state
    async fn state(&self) -> String {
        self.service.read().await.state().to_string()
    }

    async fn scanning(&self) -> bool {
        self.service.read().await.scanning().await
    }

    /// Discover sinks for the given number of seconds; zero scans until
    /// stopped
    async fn scan(&self, timeout_seconds: u64) -> zbus::fdo::Result<()> {
        debug!("DBus: Scan({timeout_seconds})");
        self.service
            .read()
            .await
            .scan(Duration::from_secs(timeout_seconds))
            .await
            .map_err(to_fdo)
    }

    /// List all known sinks
    async fn devices(&self) -> zbus::fdo::Result<Vec<DeviceRecord>> {
        let devices = self.service.read().await.devices().await.map_err(to_fdo)?;
        Ok(devices.iter().map(DeviceRecord::from).collect())
    }

    /// Connect the given sink; returns when the attempt concludes
    async fn connect_sink(&self, address: String) -> zbus::fdo::Result<()> {
        debug!("DBus: ConnectSink({address})");

        let pending = self
            .service
            .write()
            .await
            .connect_sink(&address)
            .await
            .map_err(to_fdo)?;

        match pending.await {
            Ok(result) => result.map_err(to_fdo),
            Err(_) => Err(zbus::fdo::Error::Failed(
                "connect attempt abandoned".to_string(),
            )),
        }
    }

    /// Tear down the session with the given sink
    async fn disconnect(&self, address: String) -> zbus::fdo::Result<()> {
        debug!("DBus: Disconnect({address})");
        self.service
            .read()
            .await
            .disconnect(&address)
            .await
            .map_err(to_fdo)
    }

    #[zbus(signal)]
    async fn enabled_changed(ctxt: &SignalContext<'_>, enabled: bool) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn state_changed(ctxt: &SignalContext<'_>, state: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn device_found(ctxt: &SignalContext<'_>, device: DeviceRecord) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn device_changed(ctxt: &SignalContext<'_>, device: DeviceRecord) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn device_lost(ctxt: &SignalContext<'_>, address: &str) -> zbus::Result<()>;

    #[zbus(signal)]
    async fn scanning_changed(ctxt: &SignalContext<'_>, scanning: bool) -> zbus::Result<()>;
}

pub struct DbusServer {
    connection: Connection,
}

impl DbusServer {
    /// Claim the bus name and export the manager object. The system bus is
    /// preferred; unprivileged runs fall back to the session bus.
    pub async fn start(service: Arc<RwLock<MiracastService>>) -> Result<Self> {
        let connection = match Self::build(connection::Builder::system()?, service.clone()).await {
            Ok(connection) => connection,
            Err(e) => {
                warn!("system bus unavailable ({e}), falling back to session bus");
                Self::build(connection::Builder::session()?, service).await?
            }
        };

        debug!("registered bus name {SERVICE_NAME}");
        Ok(Self { connection })
    }

    async fn build(
        builder: connection::Builder<'_>,
        service: Arc<RwLock<MiracastService>>,
    ) -> zbus::Result<Connection> {
        builder
            .name(SERVICE_NAME)?
            .serve_at(OBJECT_PATH, ManagerInterface { service })?
            .build()
            .await
    }

    /// Forward service notifications as D-Bus signals
    pub async fn emit_signals(self, mut signals: UnboundedReceiver<ServiceSignal>) {
        let ctxt = match SignalContext::new(&self.connection, OBJECT_PATH) {
            Ok(ctxt) => ctxt,
            Err(e) => {
                warn!("cannot emit D-Bus signals: {e}");
                return;
            }
        };

        while let Some(signal) = signals.recv().await {
            let result = match signal {
                ServiceSignal::EnabledChanged(enabled) => {
                    ManagerInterface::enabled_changed(&ctxt, enabled).await
                }
                ServiceSignal::StateChanged(state) => {
                    ManagerInterface::state_changed(&ctxt, state.as_str()).await
                }
                ServiceSignal::DeviceFound(device) => {
                    ManagerInterface::device_found(&ctxt, DeviceRecord::from(&device)).await
                }
                ServiceSignal::DeviceChanged(device) => {
                    ManagerInterface::device_changed(&ctxt, DeviceRecord::from(&device)).await
                }
                ServiceSignal::DeviceLost(device) => {
                    ManagerInterface::device_lost(&ctxt, device.address()).await
                }
                ServiceSignal::ScanningChanged(scanning) => {
                    ManagerInterface::scanning_changed(&ctxt, scanning).await
                }
            };

            if let Err(e) = result {
                warn!("failed to emit D-Bus signal: {e}");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use aircast_p2p::DeviceRole;

    #[test]
    fn test_device_record_conversion() {
        let device = NetworkDevice::new(
            "4E:74:03:70:E2:C1",
            "Aquaris M10",
            vec![DeviceRole::Sink],
        );

        let record = DeviceRecord::from(&device);
        assert_eq!(record.address, "4e:74:03:70:e2:c1");
        assert_eq!(record.name, "Aquaris M10");
        assert_eq!(record.state, "idle");
        assert_eq!(record.roles, vec!["sink"]);
    }
}

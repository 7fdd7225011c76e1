//! Network manager facade
//!
//! `NetworkManager` is the API the service layer consumes. It wires the
//! session engine to the real supplicant link and DHCP tools, spawns the
//! engine task, and translates method calls into engine commands. State
//! changes flow back asynchronously as [`NetworkEvent`]s on the receiver
//! returned by [`NetworkManager::new`].
//!
//! No method blocks on supplicant I/O: connect, disconnect and scan return
//! once the request is queued, and their outcomes surface as device-state
//! events.

use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tracing::warn;

use crate::device::{Capability, NetworkDevice};
use crate::dhcp::{DhcpClient, DhcpServer};
use crate::engine::{Engine, EngineCommand, EngineConfig};
use crate::error::{P2pError, Result};
use crate::events::NetworkEvent;
use crate::firmware::FirmwareLoader;
use crate::supplicant::{SupplicantConfig, SupplicantLink};

/// Construction parameters for the facade
#[derive(Debug, Clone)]
pub struct NetworkManagerConfig {
    /// P2P network interface, `p2p0` on most platforms
    pub interface: String,
    pub supplicant: SupplicantConfig,
    /// Roles advertised to remote peers
    pub capabilities: Vec<Capability>,
}

impl NetworkManagerConfig {
    pub fn for_interface(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            supplicant: SupplicantConfig::for_interface(interface),
            capabilities: vec![Capability::Source],
        }
    }
}

impl Default for NetworkManagerConfig {
    fn default() -> Self {
        Self::for_interface("p2p0")
    }
}

/// Handle to the P2P session engine
#[derive(Clone)]
pub struct NetworkManager {
    interface: String,
    commands: UnboundedSender<EngineCommand>,
}

impl NetworkManager {
    /// Spawn the engine with the production collaborators. The returned
    /// receiver carries all asynchronous notifications; it must be consumed
    /// or dropped, never leaked, for the engine to make progress cheaply.
    pub fn new(config: NetworkManagerConfig) -> (Self, UnboundedReceiver<NetworkEvent>) {
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (dhcp_tx, dhcp_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();

        let link = SupplicantLink::new(config.supplicant.clone(), link_tx);
        let dhcp_client = DhcpClient::new(&config.interface, dhcp_tx);
        let dhcp_server = DhcpServer::new(&config.interface);

        let engine = Engine::new(
            EngineConfig {
                interface: config.interface.clone(),
                capabilities: config.capabilities,
            },
            Box::new(link),
            Box::new(dhcp_client),
            Box::new(dhcp_server),
            event_tx,
            timer_tx,
        );

        tokio::spawn(engine.run(command_rx, link_rx, dhcp_rx, timer_rx));

        (
            Self {
                interface: config.interface,
                commands: command_tx,
            },
            event_rx,
        )
    }

    /// Load the P2P firmware when the interface is missing, then start the
    /// supplicant. Fails only when both paths fail immediately.
    pub async fn setup(&self) -> Result<()> {
        let loader = FirmwareLoader::new(&self.interface);
        if loader.is_needed() {
            if let Err(e) = loader.try_load().await {
                warn!("firmware load failed, starting the supplicant anyway: {e}");
            }
        }

        self.send(|reply| EngineCommand::Setup { reply }).await?
    }

    /// Ask the supplicant to discover peers. A zero timeout scans until
    /// explicitly stopped.
    pub async fn scan(&self, timeout: Duration) -> Result<()> {
        self.send(|reply| EngineCommand::Scan { timeout, reply })
            .await?
    }

    /// Start a P2P connection attempt towards a discovered peer
    pub async fn connect(&self, address: &str) -> Result<()> {
        let address = address.to_string();
        self.send(|reply| EngineCommand::Connect { address, reply })
            .await?
    }

    /// Tear down the session with the current peer
    pub async fn disconnect(&self, address: &str) -> Result<()> {
        let address = address.to_string();
        self.send(|reply| EngineCommand::Disconnect { address, reply })
            .await?
    }

    /// Snapshot of the peer table
    pub async fn devices(&self) -> Result<Vec<NetworkDevice>> {
        self.send(|reply| EngineCommand::Devices { reply }).await
    }

    /// Our address on the group interface; set only while connected
    pub async fn local_address(&self) -> Result<Option<Ipv4Addr>> {
        self.send(|reply| EngineCommand::LocalAddress { reply })
            .await
    }

    pub async fn running(&self) -> Result<bool> {
        self.send(|reply| EngineCommand::Running { reply }).await
    }

    pub async fn scanning(&self) -> Result<bool> {
        self.send(|reply| EngineCommand::Scanning { reply }).await
    }

    pub async fn capabilities(&self) -> Result<Vec<Capability>> {
        self.send(|reply| EngineCommand::Capabilities { reply })
            .await
    }

    pub fn set_capabilities(&self, capabilities: Vec<Capability>) {
        let _ = self
            .commands
            .send(EngineCommand::SetCapabilities { capabilities });
    }

    /// Stop the engine, the supplicant, and any active DHCP side
    pub fn shutdown(&self) {
        let _ = self.commands.send(EngineCommand::Shutdown);
    }

    async fn send<T>(
        &self,
        command: impl FnOnce(oneshot::Sender<T>) -> EngineCommand,
    ) -> Result<T> {
        let (tx, rx) = oneshot::channel();
        self.commands
            .send(command(tx))
            .map_err(|_| P2pError::NotReady)?;
        rx.await
            .map_err(|_| P2pError::Failed("engine stopped".to_string()))
    }
}

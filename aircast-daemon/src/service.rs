//! Miracast service state machine
//!
//! Sits between the management surface and the P2P engine: gates everything
//! on the enabled flag, owns the process-wide session state derived from the
//! current device's transitions, completes pending connect attempts, and
//! returns to idle a grace period after a session ends. On `Connected` it
//! records the address the RTSP/media layers attach to; the media pipeline
//! itself lives outside this daemon.

use std::net::Ipv4Addr;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, RwLock};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use aircast_p2p::{
    Capability, DeviceState, NetworkDevice, NetworkEvent, NetworkManager, P2pError, Result,
    RTSP_CTRL_PORT,
};

use crate::config::Config;

/// Grace period before a finished session reports idle again
const STATE_IDLE_TIMEOUT: Duration = Duration::from_secs(5);

/// Notifications the service pushes towards the D-Bus layer
#[derive(Debug, Clone)]
pub enum ServiceSignal {
    EnabledChanged(bool),
    StateChanged(DeviceState),
    DeviceFound(NetworkDevice),
    DeviceChanged(NetworkDevice),
    DeviceLost(NetworkDevice),
    ScanningChanged(bool),
}

pub struct MiracastService {
    config: Config,
    signals: UnboundedSender<ServiceSignal>,
    self_handle: Weak<RwLock<MiracastService>>,
    manager: Option<NetworkManager>,
    enabled: bool,
    state: DeviceState,
    current_address: Option<String>,
    session_address: Option<(Ipv4Addr, u16)>,
    pending_connect: Option<oneshot::Sender<Result<()>>>,
    idle_timer: Option<JoinHandle<()>>,
}

impl MiracastService {
    pub async fn create(
        config: Config,
        signals: UnboundedSender<ServiceSignal>,
    ) -> Arc<RwLock<Self>> {
        let service = Arc::new(RwLock::new(Self {
            config,
            signals,
            self_handle: Weak::new(),
            manager: None,
            enabled: false,
            state: DeviceState::Idle,
            current_address: None,
            session_address: None,
            pending_connect: None,
            idle_timer: None,
        }));

        service.write().await.self_handle = Arc::downgrade(&service);
        service
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    pub fn state(&self) -> DeviceState {
        self.state
    }

    /// Address and port the media layers attach to; set while connected
    pub fn session_address(&self) -> Option<(Ipv4Addr, u16)> {
        self.session_address
    }

    pub async fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        if enabled == self.enabled {
            return Ok(());
        }

        if enabled {
            self.enable().await?;
        } else {
            self.disable().await;
        }

        Ok(())
    }

    async fn enable(&mut self) -> Result<()> {
        let (manager, events) = NetworkManager::new(self.config.network_manager_config());
        manager.set_capabilities(vec![Capability::Source]);
        manager.setup().await?;

        if let Some(service) = self.self_handle.upgrade() {
            tokio::spawn(pump_events(service, events));
        }

        self.manager = Some(manager);
        self.enabled = true;
        info!("service enabled");
        let _ = self.signals.send(ServiceSignal::EnabledChanged(true));

        Ok(())
    }

    async fn disable(&mut self) {
        if let (Some(manager), Some(address)) = (self.manager.as_ref(), self.current_address.as_ref())
        {
            let _ = manager.disconnect(address).await;
        }

        if let Some(manager) = self.manager.take() {
            manager.shutdown();
        }

        self.cancel_idle_timer();
        self.current_address = None;
        self.session_address = None;
        self.enabled = false;
        self.finish_connect_attempt(Err(P2pError::NotReady));

        if self.state != DeviceState::Idle {
            self.state = DeviceState::Idle;
            let _ = self
                .signals
                .send(ServiceSignal::StateChanged(DeviceState::Idle));
        }

        info!("service disabled");
        let _ = self.signals.send(ServiceSignal::EnabledChanged(false));
    }

    /// Begin a connection attempt towards a discovered sink. The returned
    /// receiver resolves when the attempt ends either way.
    pub async fn connect_sink(&mut self, address: &str) -> Result<oneshot::Receiver<Result<()>>> {
        if !self.enabled {
            return Err(P2pError::NotReady);
        }

        if self.current_address.is_some() || self.pending_connect.is_some() {
            debug!("connect requested while an attempt is in progress");
            return Err(P2pError::Already);
        }

        let manager = self.manager.as_ref().ok_or(P2pError::NotReady)?;
        manager.connect(address).await?;

        self.current_address = Some(address.to_ascii_lowercase());
        let (tx, rx) = oneshot::channel();
        self.pending_connect = Some(tx);

        Ok(rx)
    }

    pub async fn disconnect(&self, address: &str) -> Result<()> {
        if !self.enabled {
            return Err(P2pError::NotReady);
        }

        let Some(current) = self.current_address.as_deref() else {
            return Err(P2pError::ParamInvalid("no connected device".to_string()));
        };
        if !address.eq_ignore_ascii_case(current) {
            return Err(P2pError::ParamInvalid(format!(
                "{address} is not the connected device"
            )));
        }

        let manager = self.manager.as_ref().ok_or(P2pError::NotReady)?;
        manager.disconnect(current).await
    }

    pub async fn scan(&self, timeout: Duration) -> Result<()> {
        if !self.enabled {
            return Err(P2pError::NotReady);
        }

        // No discovery while a session is forming or up.
        if self.current_address.is_some() {
            return Err(P2pError::NotReady);
        }

        let manager = self.manager.as_ref().ok_or(P2pError::NotReady)?;
        manager.scan(timeout).await
    }

    pub async fn devices(&self) -> Result<Vec<NetworkDevice>> {
        match self.manager.as_ref() {
            Some(manager) => manager.devices().await,
            None => Ok(Vec::new()),
        }
    }

    pub async fn scanning(&self) -> bool {
        match self.manager.as_ref() {
            Some(manager) => manager.scanning().await.unwrap_or(false),
            None => false,
        }
    }

    async fn handle_network_event(&mut self, event: NetworkEvent) {
        match event {
            NetworkEvent::DeviceFound(device) => {
                info!(address = device.address(), name = %device.name, "sink found");
                let _ = self.signals.send(ServiceSignal::DeviceFound(device));
            }
            NetworkEvent::DeviceChanged(device) => {
                let _ = self.signals.send(ServiceSignal::DeviceChanged(device));
            }
            NetworkEvent::DeviceLost(device) => {
                info!(address = device.address(), "sink lost");
                let _ = self.signals.send(ServiceSignal::DeviceLost(device));
            }
            NetworkEvent::DeviceStateChanged(device) => {
                if self.current_address.as_deref() == Some(device.address()) {
                    self.advance_state(device.state()).await;
                }
            }
            NetworkEvent::Changed => {
                let scanning = self.scanning().await;
                let _ = self.signals.send(ServiceSignal::ScanningChanged(scanning));
            }
            NetworkEvent::Ready => info!("network manager ready"),
            NetworkEvent::Unready => {
                error!("network manager failed permanently, disabling service");
                self.disable().await;
            }
        }
    }

    async fn advance_state(&mut self, new_state: DeviceState) {
        debug!(from = %self.state, to = %new_state, "service state advanced");

        match new_state {
            DeviceState::Connected => {
                if let Some(manager) = self.manager.as_ref() {
                    if let Ok(Some(address)) = manager.local_address().await {
                        info!(%address, port = RTSP_CTRL_PORT, "session link up");
                        self.session_address = Some((address, RTSP_CTRL_PORT));
                    }
                }
                self.finish_connect_attempt(Ok(()));
            }
            DeviceState::Failure => {
                if self.state == DeviceState::Association {
                    self.finish_connect_attempt(Err(P2pError::Failed(
                        "failed to connect remote device".to_string(),
                    )));
                }
                self.session_address = None;
                self.current_address = None;
                self.start_idle_timer();
            }
            DeviceState::Disconnected => {
                self.session_address = None;
                self.current_address = None;
                self.start_idle_timer();
            }
            _ => {}
        }

        self.state = new_state;
        let _ = self.signals.send(ServiceSignal::StateChanged(new_state));
    }

    fn finish_connect_attempt(&mut self, result: Result<()>) {
        if let Some(pending) = self.pending_connect.take() {
            let _ = pending.send(result);
        }
    }

    fn start_idle_timer(&mut self) {
        self.cancel_idle_timer();

        let handle = self.self_handle.clone();
        self.idle_timer = Some(tokio::spawn(async move {
            sleep(STATE_IDLE_TIMEOUT).await;
            if let Some(service) = handle.upgrade() {
                service.write().await.on_idle_timeout();
            }
        }));
    }

    fn cancel_idle_timer(&mut self) {
        if let Some(timer) = self.idle_timer.take() {
            timer.abort();
        }
    }

    fn on_idle_timeout(&mut self) {
        self.idle_timer = None;

        if matches!(self.state, DeviceState::Disconnected | DeviceState::Failure) {
            self.state = DeviceState::Idle;
            let _ = self
                .signals
                .send(ServiceSignal::StateChanged(DeviceState::Idle));
        }
    }
}

async fn pump_events(
    service: Arc<RwLock<MiracastService>>,
    mut events: UnboundedReceiver<NetworkEvent>,
) {
    while let Some(event) = events.recv().await {
        service.write().await.handle_network_event(event).await;
    }
    warn!("network event stream ended");
}

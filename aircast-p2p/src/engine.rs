//! P2P session engine
//!
//! The engine interprets unsolicited supplicant events into device-state
//! transitions, owns the peer table and the single current peer, drives the
//! DHCP pair according to the group role, and serializes every outgoing
//! request through the command queue.
//!
//! It runs as one task owning all session state; the facade talks to it
//! through [`EngineCommand`]s, the supplicant link through [`LinkEvent`]s,
//! and the DHCP client through [`DhcpEvent`]s. Inputs are processed one at a
//! time to completion, which is what makes the ordering guarantees hold
//! without any locking.

use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::net::Ipv4Addr;
use std::time::Duration;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::command_queue::{CommandQueue, Completion};
use crate::device::{Capability, DeviceState, NetworkDevice};
use crate::dhcp::{DhcpEvent, DhcpService};
use crate::error::{P2pError, Result};
use crate::events::NetworkEvent;
use crate::message::{Event, Message};
use crate::supplicant::{ControlLink, LinkEvent};
use crate::wfd::{self, WfdDeviceInfo};

const DHCP_IP_ASSIGNMENT_TIMEOUT: Duration = Duration::from_secs(5);
const PEER_FAILURE_TIMEOUT: Duration = Duration::from_secs(5);

/// Requests the facade sends to the engine task
#[derive(Debug)]
pub enum EngineCommand {
    Setup {
        reply: oneshot::Sender<Result<()>>,
    },
    Scan {
        timeout: Duration,
        reply: oneshot::Sender<Result<()>>,
    },
    Connect {
        address: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Disconnect {
        address: String,
        reply: oneshot::Sender<Result<()>>,
    },
    Devices {
        reply: oneshot::Sender<Vec<NetworkDevice>>,
    },
    LocalAddress {
        reply: oneshot::Sender<Option<Ipv4Addr>>,
    },
    Running {
        reply: oneshot::Sender<bool>,
    },
    Scanning {
        reply: oneshot::Sender<bool>,
    },
    Capabilities {
        reply: oneshot::Sender<Vec<Capability>>,
    },
    SetCapabilities {
        capabilities: Vec<Capability>,
    },
    Shutdown,
}

/// Timer firings routed back into the engine task
#[derive(Debug)]
pub enum TimerEvent {
    /// The DHCP client did not obtain a lease in time
    DhcpTimeout,
    /// Grace period after a failure elapsed; the peer goes quietly idle
    PeerFailure { address: String },
}

/// Static engine parameters
#[derive(Debug, Clone)]
pub struct EngineConfig {
    pub interface: String,
    pub capabilities: Vec<Capability>,
}

pub struct Engine {
    interface: String,
    capabilities: Vec<Capability>,
    link: Box<dyn ControlLink>,
    queue: CommandQueue<Engine>,
    peers: HashMap<String, NetworkDevice>,
    current_peer: Option<String>,
    is_group_owner: bool,
    scanning: bool,
    running: bool,
    dhcp_client: Box<dyn DhcpService>,
    dhcp_server: Box<dyn DhcpService>,
    client_address: Option<Ipv4Addr>,
    events: UnboundedSender<NetworkEvent>,
    timers: UnboundedSender<TimerEvent>,
    dhcp_timeout: Option<JoinHandle<()>>,
    peer_failure_timer: Option<JoinHandle<()>>,
}

impl Engine {
    pub fn new(
        config: EngineConfig,
        link: Box<dyn ControlLink>,
        dhcp_client: Box<dyn DhcpService>,
        dhcp_server: Box<dyn DhcpService>,
        events: UnboundedSender<NetworkEvent>,
        timers: UnboundedSender<TimerEvent>,
    ) -> Self {
        Self {
            interface: config.interface,
            capabilities: config.capabilities,
            link,
            queue: CommandQueue::new(),
            peers: HashMap::new(),
            current_peer: None,
            is_group_owner: false,
            scanning: false,
            running: false,
            dhcp_client,
            dhcp_server,
            client_address: None,
            events,
            timers,
            dhcp_timeout: None,
            peer_failure_timer: None,
        }
    }

    /// Engine main loop. Link and DHCP events take precedence over facade
    /// commands so that a command sent after an event always observes its
    /// effects.
    pub async fn run(
        mut self,
        mut commands: UnboundedReceiver<EngineCommand>,
        mut link_events: UnboundedReceiver<LinkEvent>,
        mut dhcp_events: UnboundedReceiver<DhcpEvent>,
        mut timer_events: UnboundedReceiver<TimerEvent>,
    ) {
        loop {
            tokio::select! {
                biased;
                Some(event) = link_events.recv() => self.handle_link_event(event).await,
                Some(event) = dhcp_events.recv() => self.handle_dhcp_event(event),
                Some(timer) = timer_events.recv() => self.handle_timer(timer).await,
                command = commands.recv() => match command {
                    Some(command) => {
                        if !self.handle_command(command).await {
                            break;
                        }
                    }
                    None => break,
                },
                else => break,
            }
        }

        self.link.stop().await;
        self.dhcp_client.stop().await;
        self.dhcp_server.stop().await;
        self.cancel_dhcp_timeout();
        self.cancel_peer_failure_timer();
    }

    /// Returns false when the engine should shut down
    async fn handle_command(&mut self, command: EngineCommand) -> bool {
        match command {
            EngineCommand::Setup { reply } => {
                let _ = reply.send(self.link.start().await);
            }
            EngineCommand::Scan { timeout, reply } => {
                let _ = reply.send(self.cmd_scan(timeout));
            }
            EngineCommand::Connect { address, reply } => {
                let _ = reply.send(self.cmd_connect(&address));
            }
            EngineCommand::Disconnect { address, reply } => {
                let _ = reply.send(self.cmd_disconnect(&address));
            }
            EngineCommand::Devices { reply } => {
                let _ = reply.send(self.peers.values().cloned().collect());
            }
            EngineCommand::LocalAddress { reply } => {
                let _ = reply.send(self.local_address());
            }
            EngineCommand::Running { reply } => {
                let _ = reply.send(self.running);
            }
            EngineCommand::Scanning { reply } => {
                let _ = reply.send(self.scanning);
            }
            EngineCommand::Capabilities { reply } => {
                let _ = reply.send(self.capabilities.clone());
            }
            EngineCommand::SetCapabilities { capabilities } => {
                self.capabilities = capabilities;
                if self.running {
                    self.send_wfd_subelements();
                }
                let _ = self.events.send(NetworkEvent::Changed);
            }
            EngineCommand::Shutdown => return false,
        }
        true
    }

    fn cmd_scan(&mut self, timeout: Duration) -> Result<()> {
        if !self.running {
            return Err(P2pError::NotReady);
        }

        if self.scanning {
            debug!("scan requested while already scanning");
            return Ok(());
        }

        let mut message = Message::request("P2P_FIND");
        let seconds = timeout.as_secs();
        if seconds > 0 {
            message = message.arg(seconds);
        }

        self.request(
            message,
            Some(Box::new(|engine: &mut Engine, reply: &Message| {
                let scanning = !reply.is_fail();
                if scanning == engine.scanning {
                    return;
                }
                engine.scanning = scanning;
                let _ = engine.events.send(NetworkEvent::Changed);
            })),
        );

        Ok(())
    }

    fn cmd_connect(&mut self, address: &str) -> Result<()> {
        if !self.running {
            return Err(P2pError::NotReady);
        }

        if self.current_peer.is_some() {
            return Err(P2pError::Already);
        }

        let address = address.to_ascii_lowercase();
        if !self.peers.contains_key(&address) {
            return Err(P2pError::Failed(format!("unknown device {address}")));
        }

        info!(%address, "attempting to connect");

        self.current_peer = Some(address.clone());
        self.advance_state(&address, DeviceState::Association);

        if self.scanning {
            debug!("currently scanning, stopping that first");
            self.request(Message::request("P2P_STOP_FIND"), None);
        }

        let target = address.clone();
        self.request(
            Message::request("P2P_CONNECT").arg(&address).arg("pbc"),
            Some(Box::new(move |engine: &mut Engine, reply: &Message| {
                if reply.is_fail() {
                    error!("supplicant refused to connect with {target}");
                    engine.advance_state(&target, DeviceState::Failure);
                }
            })),
        );

        Ok(())
    }

    fn cmd_disconnect(&mut self, address: &str) -> Result<()> {
        if !self.running {
            return Err(P2pError::NotReady);
        }

        let address = address.to_ascii_lowercase();
        if self.current_peer.as_deref() != Some(address.as_str()) {
            return Err(P2pError::ParamInvalid(format!(
                "{address} is not the current peer"
            )));
        }

        // Before the group exists there is nothing to remove yet; the
        // pending negotiation is cancelled instead.
        let associating = self
            .peers
            .get(&address)
            .map(|device| device.state() == DeviceState::Association)
            .unwrap_or(false);

        let message = if associating {
            Message::request("P2P_CANCEL")
        } else {
            Message::request("P2P_GROUP_REMOVE").arg(&self.interface)
        };

        self.request(
            message,
            Some(Box::new(|_engine: &mut Engine, reply: &Message| {
                if reply.is_fail() {
                    error!("supplicant refused to disconnect");
                }
            })),
        );

        Ok(())
    }

    async fn handle_link_event(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                self.running = true;
                // The queue is empty right after (re)connect, so these go
                // out before anything a user can trigger.
                self.request(
                    Message::request("ATTACH"),
                    Some(Box::new(|_engine: &mut Engine, reply: &Message| {
                        if reply.is_fail() {
                            error!("failed to attach for unsolicited supplicant events");
                        }
                    })),
                );
                self.request(Message::request("SET").arg("wifi_display").arg(1), None);
                self.send_wfd_subelements();
                let _ = self.events.send(NetworkEvent::Ready);
            }
            LinkEvent::Message(Message::Event(event)) => self.dispatch_event(event).await,
            LinkEvent::Message(reply @ Message::Reply { .. }) => self.handle_reply(reply),
            LinkEvent::Message(other) => {
                warn!("unexpected message from supplicant: {:?}", other);
            }
            LinkEvent::Down => {
                warn!("supplicant link went down");
                self.running = false;
                let dropped = self.queue.clear();
                if dropped > 0 {
                    debug!("dropped {dropped} queued requests on link loss");
                }
                self.reset().await;
            }
            LinkEvent::Failed => {
                error!("supplicant link failed permanently");
                self.running = false;
                self.queue.clear();
                self.reset().await;
                let _ = self.events.send(NetworkEvent::Unready);
            }
        }
    }

    fn handle_reply(&mut self, reply: Message) {
        let Some(entry) = self.queue.complete_head() else {
            warn!(
                "reply without an in-flight request: {}",
                reply.serialize().trim_end()
            );
            return;
        };

        if let Some(completion) = entry.completion {
            completion(self, &reply);
        }

        if let Some(next) = self.queue.begin_next() {
            self.link.send(next);
        }
    }

    async fn dispatch_event(&mut self, event: Event) {
        const IGNORED: [&str; 4] = [
            "CTRL-EVENT-SCAN-STARTED",
            "CTRL-EVENT-SCAN-RESULTS",
            "CTRL-EVENT-CONNECTED",
            "CTRL-EVENT-DISCONNECTED",
        ];

        if IGNORED.contains(&event.name()) {
            return;
        }

        let outcome = match event.name() {
            "P2P-DEVICE-FOUND" => self.on_device_found(&event),
            "P2P-DEVICE-LOST" => self.on_device_lost(&event),
            "P2P-GROUP-STARTED" => self.on_group_started(&event).await,
            "P2P-GROUP-REMOVED" => self.on_group_removed(&event).await,
            "P2P-GO-NEG-FAILURE" => {
                self.on_go_neg_failure();
                Ok(())
            }
            "P2P-FIND-STOPPED" => {
                self.on_find_stopped();
                Ok(())
            }
            "P2P-GROUP-FORMATION-SUCCESS" => {
                debug!("group formation succeeded");
                Ok(())
            }
            "AP-STA-CONNECTED" | "AP-STA-DISCONNECTED" => {
                debug!(event = event.name(), "station membership change");
                Ok(())
            }
            other => {
                warn!("unhandled supplicant event: {other}");
                Ok(())
            }
        };

        if let Err(e) = outcome {
            warn!(event = event.name(), "dropping malformed event: {e}");
        }
    }

    fn on_device_found(&mut self, event: &Event) -> Result<()> {
        let address = event.require_attr("p2p_dev_addr")?.to_ascii_lowercase();
        let name = event.attr("name").unwrap_or("");
        let config_methods = event.attr("config_methods").unwrap_or("");

        let Some(wfd_value) = event.attr("wfd_dev_info") else {
            debug!(%address, "ignoring peer without WFD device info");
            return Ok(());
        };
        let wfd_info = WfdDeviceInfo::parse(wfd_value)?;

        debug!(%address, name, config_methods, wfd = wfd_value, "device found");

        if !wfd_info.is_supported() {
            debug!(%address, "ignoring unsupported device");
            return Ok(());
        }

        let roles = wfd_info.supported_roles();

        match self.peers.entry(address.clone()) {
            Entry::Occupied(mut entry) => {
                let device = entry.get_mut();
                device.name = name.to_string();
                device.supported_roles = roles;
            }
            Entry::Vacant(entry) => {
                let device = NetworkDevice::new(&address, name, roles);
                let _ = self.events.send(NetworkEvent::DeviceFound(device.clone()));
                entry.insert(device);
            }
        }

        Ok(())
    }

    fn on_device_lost(&mut self, event: &Event) -> Result<()> {
        let address = event.require_attr("p2p_dev_addr")?.to_ascii_lowercase();

        if let Some(device) = self.peers.remove(&address) {
            debug!(%address, "device lost");
            let _ = self.events.send(NetworkEvent::DeviceLost(device));
        }

        Ok(())
    }

    async fn on_group_started(&mut self, event: &Event) -> Result<()> {
        let Some(address) = self.current_peer.clone() else {
            return Ok(());
        };

        let role = event
            .arg(1)
            .ok_or_else(|| P2pError::MissingField("group role".to_string()))?
            .to_string();

        self.advance_state(&address, DeviceState::Configuration);

        if role == "GO" {
            // We are the group owner: start handing out addresses and the
            // link is as up as it gets from our side.
            self.is_group_owner = true;
            if let Err(e) = self.dhcp_server.start().await {
                error!("failed to start DHCP server: {e}");
                self.advance_state(&address, DeviceState::Failure);
                return Ok(());
            }
            self.advance_state(&address, DeviceState::Connected);
        } else {
            // We joined someone else's group and report connected only once
            // the lease arrives.
            self.is_group_owner = false;
            if let Err(e) = self.dhcp_client.start().await {
                error!("failed to start DHCP client: {e}");
                self.advance_state(&address, DeviceState::Failure);
                return Ok(());
            }
            self.arm_dhcp_timeout();
        }

        Ok(())
    }

    async fn on_group_removed(&mut self, event: &Event) -> Result<()> {
        let Some(address) = self.current_peer.take() else {
            return Ok(());
        };

        self.cancel_dhcp_timeout();
        if self.is_group_owner {
            self.dhcp_server.stop().await;
        } else {
            self.dhcp_client.stop().await;
        }
        self.client_address = None;

        let reason = event.attr("reason").unwrap_or("");
        let state = match reason {
            "FORMATION_FAILED" | "PSK_FAILURE" | "FREQ_CONFLICT" => DeviceState::Failure,
            _ => DeviceState::Disconnected,
        };

        debug!(%address, reason, "group removed");

        self.advance_state(&address, state);
        self.is_group_owner = false;

        Ok(())
    }

    fn on_go_neg_failure(&mut self) {
        let Some(address) = self.current_peer.take() else {
            return;
        };

        warn!(%address, "group owner negotiation failed");
        self.advance_state(&address, DeviceState::Failure);
    }

    fn on_find_stopped(&mut self) {
        if !self.scanning {
            return;
        }

        self.scanning = false;
        let _ = self.events.send(NetworkEvent::Changed);
    }

    fn handle_dhcp_event(&mut self, event: DhcpEvent) {
        let DhcpEvent::AddressAssigned(address) = event;

        let Some(peer) = self.current_peer.clone() else {
            debug!("ignoring DHCP lease without a current peer");
            return;
        };

        let configuring = self
            .peers
            .get(&peer)
            .map(|device| device.state() == DeviceState::Configuration)
            .unwrap_or(false);

        if self.is_group_owner || !configuring {
            debug!(%address, "ignoring late DHCP lease");
            return;
        }

        info!(%address, "address assigned by group owner");
        self.client_address = Some(address);
        self.cancel_dhcp_timeout();
        self.advance_state(&peer, DeviceState::Connected);
    }

    async fn handle_timer(&mut self, timer: TimerEvent) {
        match timer {
            TimerEvent::DhcpTimeout => {
                self.dhcp_timeout = None;

                let Some(address) = self.current_peer.clone() else {
                    return;
                };
                let configuring = self
                    .peers
                    .get(&address)
                    .map(|device| device.state() == DeviceState::Configuration)
                    .unwrap_or(false);
                if self.is_group_owner || !configuring {
                    return;
                }

                warn!(%address, "no DHCP lease within {DHCP_IP_ASSIGNMENT_TIMEOUT:?}");
                self.dhcp_client.stop().await;
                self.client_address = None;
                self.advance_state(&address, DeviceState::Failure);
            }
            TimerEvent::PeerFailure { address } => {
                self.peer_failure_timer = None;

                // Quiet transition: no delegate traffic for the cool-down.
                if let Some(device) = self.peers.get_mut(&address) {
                    if device.state() == DeviceState::Failure {
                        device.state = DeviceState::Idle;
                    }
                }
                if self.current_peer.as_deref() == Some(address.as_str()) {
                    self.current_peer = None;
                }
            }
        }
    }

    /// Bring the session state back to square one after the supplicant went
    /// away. Every known peer is reported lost.
    async fn reset(&mut self) {
        if let Some(address) = self.current_peer.take() {
            self.advance_state(&address, DeviceState::Disconnected);
        }

        self.cancel_dhcp_timeout();
        self.cancel_peer_failure_timer();
        self.dhcp_client.stop().await;
        self.dhcp_server.stop().await;
        self.client_address = None;

        for (_, device) in self.peers.drain() {
            let _ = self.events.send(NetworkEvent::DeviceLost(device));
        }

        self.is_group_owner = false;

        if self.scanning {
            self.scanning = false;
            let _ = self.events.send(NetworkEvent::Changed);
        }
    }

    fn advance_state(&mut self, address: &str, state: DeviceState) {
        let Some(device) = self.peers.get_mut(address) else {
            return;
        };

        debug!(%address, from = %device.state(), to = %state, "device state advanced");
        device.state = state;
        let snapshot = device.clone();

        let _ = self
            .events
            .send(NetworkEvent::DeviceStateChanged(snapshot.clone()));
        let _ = self.events.send(NetworkEvent::DeviceChanged(snapshot));

        if state == DeviceState::Failure {
            self.arm_peer_failure_timer(address.to_string());
        }
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        if self.is_group_owner {
            self.dhcp_server.local_address()
        } else {
            self.client_address
        }
    }

    fn send_wfd_subelements(&mut self) {
        let elements = [wfd::device_info_subelement(&self.capabilities)];
        for (index, element) in elements.iter().enumerate() {
            self.request(
                Message::request("WFD_SUBELEM_SET").arg(index).arg(element),
                None,
            );
        }
    }

    fn request(&mut self, message: Message, completion: Option<Completion<Engine>>) {
        if let Some(write) = self.queue.enqueue(message, completion) {
            self.link.send(write);
        }
    }

    fn arm_dhcp_timeout(&mut self) {
        self.cancel_dhcp_timeout();
        let timers = self.timers.clone();
        self.dhcp_timeout = Some(tokio::spawn(async move {
            sleep(DHCP_IP_ASSIGNMENT_TIMEOUT).await;
            let _ = timers.send(TimerEvent::DhcpTimeout);
        }));
    }

    fn cancel_dhcp_timeout(&mut self) {
        if let Some(timer) = self.dhcp_timeout.take() {
            timer.abort();
        }
    }

    fn arm_peer_failure_timer(&mut self, address: String) {
        self.cancel_peer_failure_timer();
        let timers = self.timers.clone();
        self.peer_failure_timer = Some(tokio::spawn(async move {
            sleep(PEER_FAILURE_TIMEOUT).await;
            let _ = timers.send(TimerEvent::PeerFailure { address });
        }));
    }

    fn cancel_peer_failure_timer(&mut self) {
        if let Some(timer) = self.peer_failure_timer.take() {
            timer.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dhcp::SERVER_ADDRESS;
    use async_trait::async_trait;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use tokio::sync::mpsc;
    use tokio::time::{advance, timeout};

    const AQUARIS_FOUND: &str = "<3>P2P-DEVICE-FOUND 4e:74:03:70:e2:c1 \
        p2p_dev_addr=4e:74:03:70:e2:c1 pri_dev_type=8-0050F204-2 name='Aquaris M10' \
        config_methods=0x188 dev_capab=0x5 group_capab=0x0 wfd_dev_info=0x00111c440032 new=1";
    const AQUARIS_ADDR: &str = "4e:74:03:70:e2:c1";
    const GROUP_STARTED_GO: &str = "<3>P2P-GROUP-STARTED p2p0 GO ssid=\"DIRECT-hB\" \
        freq=2412 passphrase=\"x\" go_dev_addr=4e:74:03:64:95:a7";
    const GROUP_STARTED_CLIENT: &str = "<3>P2P-GROUP-STARTED p2p0 client ssid=\"DIRECT-hB\" \
        freq=2412 psk=2e8f76d2 go_dev_addr=4e:74:03:64:95:a7";

    struct RecordingLink {
        sent: mpsc::UnboundedSender<Message>,
    }

    #[async_trait]
    impl ControlLink for RecordingLink {
        async fn start(&mut self) -> Result<()> {
            Ok(())
        }

        fn send(&self, message: Message) {
            let _ = self.sent.send(message);
        }

        async fn stop(&mut self) {}
    }

    struct MockDhcp {
        started: Arc<AtomicBool>,
        address: Ipv4Addr,
    }

    #[async_trait]
    impl DhcpService for MockDhcp {
        async fn start(&mut self) -> Result<()> {
            self.started.store(true, Ordering::SeqCst);
            Ok(())
        }

        async fn stop(&mut self) {
            self.started.store(false, Ordering::SeqCst);
        }

        fn local_address(&self) -> Option<Ipv4Addr> {
            self.started
                .load(Ordering::SeqCst)
                .then_some(self.address)
        }
    }

    struct Harness {
        commands: mpsc::UnboundedSender<EngineCommand>,
        link_events: mpsc::UnboundedSender<LinkEvent>,
        dhcp_events: mpsc::UnboundedSender<DhcpEvent>,
        sent: mpsc::UnboundedReceiver<Message>,
        events: mpsc::UnboundedReceiver<NetworkEvent>,
        server_started: Arc<AtomicBool>,
        client_started: Arc<AtomicBool>,
    }

    fn spawn_engine() -> Harness {
        let (cmd_tx, cmd_rx) = mpsc::unbounded_channel();
        let (link_tx, link_rx) = mpsc::unbounded_channel();
        let (dhcp_tx, dhcp_rx) = mpsc::unbounded_channel();
        let (timer_tx, timer_rx) = mpsc::unbounded_channel();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();

        let server_started = Arc::new(AtomicBool::new(false));
        let client_started = Arc::new(AtomicBool::new(false));

        let engine = Engine::new(
            EngineConfig {
                interface: "p2p0".to_string(),
                capabilities: vec![Capability::Source],
            },
            Box::new(RecordingLink { sent: sent_tx }),
            Box::new(MockDhcp {
                started: client_started.clone(),
                address: Ipv4Addr::new(192, 168, 7, 50),
            }),
            Box::new(MockDhcp {
                started: server_started.clone(),
                address: SERVER_ADDRESS,
            }),
            event_tx,
            timer_tx,
        );

        tokio::spawn(engine.run(cmd_rx, link_rx, dhcp_rx, timer_rx));

        Harness {
            commands: cmd_tx,
            link_events: link_tx,
            dhcp_events: dhcp_tx,
            sent: sent_rx,
            events: event_rx,
            server_started,
            client_started,
        }
    }

    impl Harness {
        async fn next_sent(&mut self) -> String {
            let message = timeout(Duration::from_secs(1), self.sent.recv())
                .await
                .expect("engine should have written a request")
                .expect("link channel open");
            message.serialize().trim_end().to_string()
        }

        fn no_request_written(&mut self) {
            assert!(self.sent.try_recv().is_err(), "unexpected request written");
        }

        fn reply(&self, raw: &str) {
            self.link_events
                .send(LinkEvent::Message(Message::parse(raw.as_bytes()).unwrap()))
                .unwrap();
        }

        fn inject(&self, line: &str) {
            self.link_events
                .send(LinkEvent::Message(Message::parse(line.as_bytes()).unwrap()))
                .unwrap();
        }

        /// Connect the link and acknowledge the three configuration requests
        async fn bring_up(&mut self) {
            self.link_events.send(LinkEvent::Connected).unwrap();

            for expected in [
                "ATTACH",
                "SET wifi_display 1",
                "WFD_SUBELEM_SET 0 000600101C440032",
            ] {
                assert_eq!(self.next_sent().await, expected);
                self.reply("OK");
            }

            self.drain_events();
        }

        async fn discover_aquaris(&mut self) {
            self.inject(AQUARIS_FOUND);
            let devices = self.devices().await;
            assert_eq!(devices.len(), 1);
        }

        async fn connect(&self, address: &str) -> Result<()> {
            let (tx, rx) = oneshot::channel();
            self.commands
                .send(EngineCommand::Connect {
                    address: address.to_string(),
                    reply: tx,
                })
                .unwrap();
            rx.await.unwrap()
        }

        async fn disconnect(&self, address: &str) -> Result<()> {
            let (tx, rx) = oneshot::channel();
            self.commands
                .send(EngineCommand::Disconnect {
                    address: address.to_string(),
                    reply: tx,
                })
                .unwrap();
            rx.await.unwrap()
        }

        async fn scan(&self, seconds: u64) -> Result<()> {
            let (tx, rx) = oneshot::channel();
            self.commands
                .send(EngineCommand::Scan {
                    timeout: Duration::from_secs(seconds),
                    reply: tx,
                })
                .unwrap();
            rx.await.unwrap()
        }

        async fn devices(&self) -> Vec<NetworkDevice> {
            let (tx, rx) = oneshot::channel();
            self.commands
                .send(EngineCommand::Devices { reply: tx })
                .unwrap();
            rx.await.unwrap()
        }

        async fn scanning(&self) -> bool {
            let (tx, rx) = oneshot::channel();
            self.commands
                .send(EngineCommand::Scanning { reply: tx })
                .unwrap();
            rx.await.unwrap()
        }

        async fn running(&self) -> bool {
            let (tx, rx) = oneshot::channel();
            self.commands
                .send(EngineCommand::Running { reply: tx })
                .unwrap();
            rx.await.unwrap()
        }

        async fn local_address(&self) -> Option<Ipv4Addr> {
            let (tx, rx) = oneshot::channel();
            self.commands
                .send(EngineCommand::LocalAddress { reply: tx })
                .unwrap();
            rx.await.unwrap()
        }

        fn drain_events(&mut self) -> Vec<NetworkEvent> {
            let mut events = Vec::new();
            while let Ok(event) = self.events.try_recv() {
                events.push(event);
            }
            events
        }

        /// Device state transitions observed since the last drain
        fn state_changes(&mut self) -> Vec<DeviceState> {
            self.drain_events()
                .into_iter()
                .filter_map(|event| match event {
                    NetworkEvent::DeviceStateChanged(device) => Some(device.state()),
                    _ => None,
                })
                .collect()
        }
    }

    #[tokio::test]
    async fn test_configuration_requests_precede_user_requests() {
        let mut h = spawn_engine();

        // A scan issued immediately after the link comes up still goes out
        // after the configuration sequence.
        h.link_events.send(LinkEvent::Connected).unwrap();
        h.scan(30).await.unwrap();

        assert_eq!(h.next_sent().await, "ATTACH");
        h.reply("OK");
        assert_eq!(h.next_sent().await, "SET wifi_display 1");
        h.reply("OK");
        assert_eq!(h.next_sent().await, "WFD_SUBELEM_SET 0 000600101C440032");
        h.reply("OK");
        assert_eq!(h.next_sent().await, "P2P_FIND 30");
    }

    #[tokio::test]
    async fn test_discovery_inserts_device_once() {
        let mut h = spawn_engine();
        h.bring_up().await;

        h.inject(AQUARIS_FOUND);
        h.inject(AQUARIS_FOUND);

        let devices = h.devices().await;
        assert_eq!(devices.len(), 1);
        assert_eq!(devices[0].address(), AQUARIS_ADDR);
        assert_eq!(devices[0].name, "Aquaris M10");
        assert!(devices[0].supports_sink());
        assert_eq!(devices[0].state(), DeviceState::Idle);

        // device-found fired for the insert only
        let found = h
            .drain_events()
            .into_iter()
            .filter(|event| matches!(event, NetworkEvent::DeviceFound(_)))
            .count();
        assert_eq!(found, 1);
    }

    #[tokio::test]
    async fn test_non_wfd_devices_are_skipped() {
        let mut h = spawn_engine();
        h.bring_up().await;

        h.inject("<3>P2P-DEVICE-FOUND aa:bb:cc:dd:ee:ff p2p_dev_addr=aa:bb:cc:dd:ee:ff name='printer'");
        assert!(h.devices().await.is_empty());

        // No RTSP control port advertised
        h.inject("<3>P2P-DEVICE-FOUND aa:bb:cc:dd:ee:ff p2p_dev_addr=aa:bb:cc:dd:ee:ff \
                  name='odd' wfd_dev_info=0x001000000032");
        assert!(h.devices().await.is_empty());
    }

    #[tokio::test]
    async fn test_device_lost_removes_peer() {
        let mut h = spawn_engine();
        h.bring_up().await;
        h.discover_aquaris().await;

        h.inject("<3>P2P-DEVICE-LOST p2p_dev_addr=4e:74:03:70:e2:c1");

        assert!(h.devices().await.is_empty());
        assert!(h
            .drain_events()
            .iter()
            .any(|event| matches!(event, NetworkEvent::DeviceLost(_))));
    }

    #[tokio::test]
    async fn test_connect_and_group_owner_session() {
        let mut h = spawn_engine();
        h.bring_up().await;
        h.discover_aquaris().await;

        h.connect(AQUARIS_ADDR).await.unwrap();
        assert_eq!(h.next_sent().await, "P2P_CONNECT 4e:74:03:70:e2:c1 pbc");
        h.reply("OK");

        h.inject(GROUP_STARTED_GO);

        // Round-trip a query so every injected event has been processed.
        assert_eq!(h.local_address().await, Some(SERVER_ADDRESS));
        assert!(h.server_started.load(Ordering::SeqCst));
        assert!(!h.client_started.load(Ordering::SeqCst));

        assert_eq!(
            h.state_changes(),
            vec![
                DeviceState::Association,
                DeviceState::Configuration,
                DeviceState::Connected,
            ]
        );
    }

    #[tokio::test]
    async fn test_connect_while_scanning_stops_find_first() {
        let mut h = spawn_engine();
        h.bring_up().await;
        h.discover_aquaris().await;

        h.scan(0).await.unwrap();
        assert_eq!(h.next_sent().await, "P2P_FIND");
        h.reply("OK");
        assert!(h.scanning().await);

        h.connect(AQUARIS_ADDR).await.unwrap();
        assert_eq!(h.next_sent().await, "P2P_STOP_FIND");
        h.reply("OK");
        assert_eq!(h.next_sent().await, "P2P_CONNECT 4e:74:03:70:e2:c1 pbc");
    }

    #[tokio::test]
    async fn test_connect_validations() {
        let mut h = spawn_engine();

        // Not ready before the link is up.
        assert!(matches!(
            h.connect(AQUARIS_ADDR).await,
            Err(P2pError::NotReady)
        ));

        h.bring_up().await;

        // Unknown device fails without touching the supplicant.
        assert!(matches!(
            h.connect("00:11:22:33:44:55").await,
            Err(P2pError::Failed(_))
        ));
        h.no_request_written();

        h.discover_aquaris().await;
        h.connect(AQUARIS_ADDR).await.unwrap();
        assert_eq!(h.next_sent().await, "P2P_CONNECT 4e:74:03:70:e2:c1 pbc");

        // A second connect while one is pending.
        assert!(matches!(
            h.connect(AQUARIS_ADDR).await,
            Err(P2pError::Already)
        ));
    }

    #[tokio::test]
    async fn test_connect_refused_by_supplicant() {
        let mut h = spawn_engine();
        h.bring_up().await;
        h.discover_aquaris().await;

        h.connect(AQUARIS_ADDR).await.unwrap();
        assert_eq!(h.next_sent().await, "P2P_CONNECT 4e:74:03:70:e2:c1 pbc");
        h.reply("FAIL");

        let devices = h.devices().await;
        assert_eq!(devices[0].state(), DeviceState::Failure);
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_role_dhcp_lease_completes_connect() {
        let mut h = spawn_engine();
        h.bring_up().await;
        h.discover_aquaris().await;

        h.connect(AQUARIS_ADDR).await.unwrap();
        assert_eq!(h.next_sent().await, "P2P_CONNECT 4e:74:03:70:e2:c1 pbc");
        h.reply("OK");

        h.inject(GROUP_STARTED_CLIENT);
        let devices = h.devices().await;
        assert_eq!(devices[0].state(), DeviceState::Configuration);
        assert!(h.client_started.load(Ordering::SeqCst));
        assert_eq!(h.local_address().await, None);

        h.dhcp_events
            .send(DhcpEvent::AddressAssigned(Ipv4Addr::new(192, 168, 7, 50)))
            .unwrap();

        assert_eq!(
            h.local_address().await,
            Some(Ipv4Addr::new(192, 168, 7, 50))
        );
        assert_eq!(
            h.state_changes(),
            vec![
                DeviceState::Association,
                DeviceState::Configuration,
                DeviceState::Connected,
            ]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_client_dhcp_timeout_fails_then_goes_idle() {
        let mut h = spawn_engine();
        h.bring_up().await;
        h.discover_aquaris().await;

        h.connect(AQUARIS_ADDR).await.unwrap();
        assert_eq!(h.next_sent().await, "P2P_CONNECT 4e:74:03:70:e2:c1 pbc");
        h.reply("OK");
        h.inject(GROUP_STARTED_CLIENT);

        // Round-trip so the group event is processed and the timer armed.
        assert_eq!(h.devices().await[0].state(), DeviceState::Configuration);

        // Just short of the timeout the lease is still awaited.
        advance(Duration::from_millis(4900)).await;
        assert_eq!(h.devices().await[0].state(), DeviceState::Configuration);

        advance(Duration::from_millis(200)).await;
        assert_eq!(h.devices().await[0].state(), DeviceState::Failure);
        assert!(!h.client_started.load(Ordering::SeqCst));
        assert_eq!(h.local_address().await, None);

        // A lease arriving after the timeout is ignored.
        h.dhcp_events
            .send(DhcpEvent::AddressAssigned(Ipv4Addr::new(192, 168, 7, 50)))
            .unwrap();
        assert_eq!(h.devices().await[0].state(), DeviceState::Failure);

        h.drain_events();

        // The failure grace period flips the peer quietly back to idle and
        // releases the current-peer slot.
        advance(Duration::from_millis(5100)).await;
        assert_eq!(h.devices().await[0].state(), DeviceState::Idle);
        assert!(h.state_changes().is_empty());

        // The slot is free again.
        h.connect(AQUARIS_ADDR).await.unwrap();
    }

    #[tokio::test]
    async fn test_go_negotiation_failure() {
        let mut h = spawn_engine();
        h.bring_up().await;
        h.discover_aquaris().await;

        h.connect(AQUARIS_ADDR).await.unwrap();
        assert_eq!(h.next_sent().await, "P2P_CONNECT 4e:74:03:70:e2:c1 pbc");
        h.reply("OK");

        h.inject("<3>P2P-GO-NEG-FAILURE status=5");

        let devices = h.devices().await;
        assert_eq!(devices[0].state(), DeviceState::Failure);
        assert!(!h.server_started.load(Ordering::SeqCst));
        assert!(!h.client_started.load(Ordering::SeqCst));

        // Current peer was cleared immediately; a new attempt proceeds.
        h.connect(AQUARIS_ADDR).await.unwrap();
    }

    #[tokio::test]
    async fn test_group_removed_reason_mapping() {
        for (reason, expected) in [
            ("reason=FORMATION_FAILED", DeviceState::Failure),
            ("reason=PSK_FAILURE", DeviceState::Failure),
            ("reason=FREQ_CONFLICT", DeviceState::Failure),
            ("reason=REQUESTED", DeviceState::Disconnected),
            ("", DeviceState::Disconnected),
        ] {
            let mut h = spawn_engine();
            h.bring_up().await;
            h.discover_aquaris().await;

            h.connect(AQUARIS_ADDR).await.unwrap();
            assert_eq!(h.next_sent().await, "P2P_CONNECT 4e:74:03:70:e2:c1 pbc");
            h.reply("OK");
            h.inject(GROUP_STARTED_GO);

            h.inject(&format!("<3>P2P-GROUP-REMOVED p2p0 GO {reason}"));

            let devices = h.devices().await;
            assert_eq!(devices[0].state(), expected, "reason {reason:?}");
            assert!(!h.server_started.load(Ordering::SeqCst));
            assert_eq!(h.local_address().await, None);
        }
    }

    #[tokio::test]
    async fn test_disconnect_while_associating_cancels() {
        let mut h = spawn_engine();
        h.bring_up().await;
        h.discover_aquaris().await;

        h.connect(AQUARIS_ADDR).await.unwrap();
        assert_eq!(h.next_sent().await, "P2P_CONNECT 4e:74:03:70:e2:c1 pbc");
        h.reply("OK");

        h.disconnect(AQUARIS_ADDR).await.unwrap();
        assert_eq!(h.next_sent().await, "P2P_CANCEL");
    }

    #[tokio::test]
    async fn test_disconnect_established_group_removes_it() {
        let mut h = spawn_engine();
        h.bring_up().await;
        h.discover_aquaris().await;

        h.connect(AQUARIS_ADDR).await.unwrap();
        assert_eq!(h.next_sent().await, "P2P_CONNECT 4e:74:03:70:e2:c1 pbc");
        h.reply("OK");
        h.inject(GROUP_STARTED_GO);
        h.devices().await;

        h.disconnect(AQUARIS_ADDR).await.unwrap();
        assert_eq!(h.next_sent().await, "P2P_GROUP_REMOVE p2p0");
    }

    #[tokio::test]
    async fn test_disconnect_requires_current_peer() {
        let mut h = spawn_engine();
        h.bring_up().await;
        h.discover_aquaris().await;

        assert!(matches!(
            h.disconnect(AQUARIS_ADDR).await,
            Err(P2pError::ParamInvalid(_))
        ));
    }

    #[tokio::test]
    async fn test_scan_toggles_on_reply_and_find_stopped() {
        let mut h = spawn_engine();
        h.bring_up().await;

        h.scan(30).await.unwrap();
        assert_eq!(h.next_sent().await, "P2P_FIND 30");
        assert!(!h.scanning().await);

        h.reply("OK");
        assert!(h.scanning().await);
        assert!(h
            .drain_events()
            .iter()
            .any(|event| matches!(event, NetworkEvent::Changed)));

        // Scanning again is a no-op.
        h.scan(30).await.unwrap();
        h.no_request_written();

        h.inject("<3>P2P-FIND-STOPPED");
        assert!(!h.scanning().await);
        assert!(h
            .drain_events()
            .iter()
            .any(|event| matches!(event, NetworkEvent::Changed)));
    }

    #[tokio::test]
    async fn test_scan_refused_by_supplicant() {
        let mut h = spawn_engine();
        h.bring_up().await;

        h.scan(30).await.unwrap();
        assert_eq!(h.next_sent().await, "P2P_FIND 30");
        h.reply("FAIL");

        assert!(!h.scanning().await);
    }

    #[tokio::test]
    async fn test_supplicant_crash_resets_session() {
        let mut h = spawn_engine();
        h.bring_up().await;
        h.discover_aquaris().await;

        h.connect(AQUARIS_ADDR).await.unwrap();
        assert_eq!(h.next_sent().await, "P2P_CONNECT 4e:74:03:70:e2:c1 pbc");
        h.reply("OK");
        h.inject(GROUP_STARTED_GO);
        h.devices().await;
        h.drain_events();

        h.link_events.send(LinkEvent::Down).unwrap();

        assert!(!h.running().await);
        assert!(h.devices().await.is_empty());
        assert!(!h.server_started.load(Ordering::SeqCst));
        assert_eq!(h.local_address().await, None);

        let events = h.drain_events();
        assert!(events.iter().any(|event| matches!(
            event,
            NetworkEvent::DeviceStateChanged(device)
                if device.state() == DeviceState::Disconnected
        )));
        assert!(events
            .iter()
            .any(|event| matches!(event, NetworkEvent::DeviceLost(_))));

        // Reconnection re-issues the configuration sequence before anything
        // else (scenario: user request raced the reconnect).
        h.link_events.send(LinkEvent::Connected).unwrap();
        h.scan(30).await.unwrap();

        assert_eq!(h.next_sent().await, "ATTACH");
        h.reply("OK");
        assert_eq!(h.next_sent().await, "SET wifi_display 1");
        h.reply("OK");
        assert_eq!(h.next_sent().await, "WFD_SUBELEM_SET 0 000600101C440032");
        h.reply("OK");
        assert_eq!(h.next_sent().await, "P2P_FIND 30");
    }

    #[tokio::test]
    async fn test_link_failure_emits_unready() {
        let mut h = spawn_engine();
        h.bring_up().await;
        h.discover_aquaris().await;

        h.link_events.send(LinkEvent::Failed).unwrap();

        assert!(!h.running().await);
        assert!(h.devices().await.is_empty());
        assert!(h
            .drain_events()
            .iter()
            .any(|event| matches!(event, NetworkEvent::Unready)));
    }

    #[tokio::test]
    async fn test_group_started_without_current_peer_is_ignored() {
        let mut h = spawn_engine();
        h.bring_up().await;
        h.discover_aquaris().await;

        h.inject(GROUP_STARTED_GO);

        assert_eq!(h.devices().await[0].state(), DeviceState::Idle);
        assert!(!h.server_started.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn test_malformed_events_are_dropped() {
        let mut h = spawn_engine();
        h.bring_up().await;

        // Missing p2p_dev_addr; the queue must stay usable afterwards.
        h.inject("<3>P2P-DEVICE-FOUND");
        h.inject("<3>P2P-DEVICE-LOST");
        assert!(h.devices().await.is_empty());

        h.scan(30).await.unwrap();
        assert_eq!(h.next_sent().await, "P2P_FIND 30");
    }

    #[tokio::test]
    async fn test_set_capabilities_readvertises_subelement() {
        let mut h = spawn_engine();
        h.bring_up().await;

        h.commands
            .send(EngineCommand::SetCapabilities {
                capabilities: vec![Capability::Source, Capability::Sink],
            })
            .unwrap();

        assert_eq!(h.next_sent().await, "WFD_SUBELEM_SET 0 000600131C440032");
    }
}

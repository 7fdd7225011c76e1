//! Supplicant link: process lifecycle and control socket
//!
//! Owns the external wpa_supplicant process pinned to the P2P interface and
//! the `PF_UNIX/SOCK_DGRAM` control socket it is driven through. The link
//! runs as its own task: it spawns the supplicant, polls the control socket
//! into existence, pumps messages in both directions, and respawns the
//! process with a fixed delay when it dies, up to a bounded budget. The
//! session engine observes all of it as [`LinkEvent`]s.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;

use async_trait::async_trait;
use tokio::net::UnixDatagram;
use tokio::process::{Child, Command};
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{debug, error, info, warn};

use crate::error::Result;
use crate::message::Message;

const READ_BUFFER_SIZE: usize = 1024;
const CONNECT_RETRY_INTERVAL: Duration = Duration::from_millis(500);
const RESPAWN_DELAY: Duration = Duration::from_secs(2);
const RESPAWN_LIMIT: u32 = 10;

/// Environment variable that keeps the supplicant's own output visible
const DEBUG_ENV: &str = "AIRCAST_SUPPLICANT_DEBUG";

/// Events the link reports to the session engine
#[derive(Debug)]
pub enum LinkEvent {
    /// Control socket connected; configuration requests may be issued
    Connected,
    /// A message arrived on the control socket
    Message(Message),
    /// The supplicant died or the socket broke; a respawn is scheduled
    Down,
    /// The respawn budget is exhausted; the link is permanently down
    Failed,
}

/// Static parameters of the supplicant process
#[derive(Debug, Clone)]
pub struct SupplicantConfig {
    /// P2P network interface the supplicant is pinned to
    pub interface: String,
    /// Path of the wpa_supplicant binary
    pub binary: PathBuf,
    /// nl80211 by default
    pub driver: String,
    /// Directory the supplicant creates its per-interface socket in
    pub ctrl_dir: PathBuf,
    /// Generated configuration file
    pub config_path: PathBuf,
}

impl SupplicantConfig {
    pub fn for_interface(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            binary: PathBuf::from("/sbin/wpa_supplicant"),
            driver: "nl80211".to_string(),
            ctrl_dir: PathBuf::from(format!("/var/run/{interface}_supplicant")),
            config_path: PathBuf::from(format!("/tmp/supplicant-{interface}.conf")),
        }
    }

    fn socket_path(&self) -> PathBuf {
        self.ctrl_dir.join(&self.interface)
    }

    fn local_socket_path(&self) -> PathBuf {
        PathBuf::from(format!("/tmp/{}-{}", self.interface, std::process::id()))
    }
}

/// Transport seam between the engine and the supplicant. The engine never
/// touches the socket directly; the production implementation is
/// [`SupplicantLink`], tests substitute a recorder.
#[async_trait]
pub trait ControlLink: Send {
    /// Spawn the supplicant and begin connecting to its control socket
    async fn start(&mut self) -> Result<()>;

    /// Queue a message for writing to the control socket
    fn send(&self, message: Message);

    /// Tear the process and socket down
    async fn stop(&mut self);
}

pub struct SupplicantLink {
    config: SupplicantConfig,
    events: UnboundedSender<LinkEvent>,
    outgoing: Option<UnboundedSender<Message>>,
    task: Option<JoinHandle<()>>,
}

impl SupplicantLink {
    pub fn new(config: SupplicantConfig, events: UnboundedSender<LinkEvent>) -> Self {
        Self {
            config,
            events,
            outgoing: None,
            task: None,
        }
    }
}

#[async_trait]
impl ControlLink for SupplicantLink {
    async fn start(&mut self) -> Result<()> {
        if self.task.is_some() {
            return Ok(());
        }

        let (out_tx, out_rx) = mpsc::unbounded_channel();
        self.outgoing = Some(out_tx);
        self.task = Some(tokio::spawn(run_link(
            self.config.clone(),
            self.events.clone(),
            out_rx,
        )));

        Ok(())
    }

    fn send(&self, message: Message) {
        let Some(outgoing) = &self.outgoing else {
            warn!("dropping request, link not started: {}", message.serialize().trim_end());
            return;
        };
        if outgoing.send(message).is_err() {
            warn!("dropping request, link task gone");
        }
    }

    async fn stop(&mut self) {
        self.outgoing = None;
        if let Some(task) = self.task.take() {
            // Aborting drops the Child; kill_on_drop reaps the process.
            task.abort();
            let _ = task.await;
        }
    }
}

async fn run_link(
    config: SupplicantConfig,
    events: UnboundedSender<LinkEvent>,
    mut outgoing: UnboundedReceiver<Message>,
) {
    let mut budget = RESPAWN_LIMIT;

    loop {
        let mut child = match spawn_supplicant(&config) {
            Ok(child) => child,
            Err(e) => {
                error!("failed to spawn supplicant: {e}");
                if !schedule_respawn(&events, &mut budget).await {
                    return;
                }
                continue;
            }
        };

        // The control socket appears some time after the process is up;
        // poll for it until it connects or the process dies on us.
        let socket = loop {
            match connect_control_socket(&config) {
                Ok(socket) => break Some(socket),
                Err(e) => debug!("control socket not ready yet: {e}"),
            }

            tokio::select! {
                status = child.wait() => {
                    warn!("supplicant exited during bring-up: {status:?}");
                    break None;
                }
                _ = sleep(CONNECT_RETRY_INTERVAL) => {}
            }
        };

        let Some(socket) = socket else {
            if !schedule_respawn(&events, &mut budget).await {
                return;
            }
            continue;
        };

        info!(interface = %config.interface, "connected to supplicant control socket");
        budget = RESPAWN_LIMIT;
        let _ = events.send(LinkEvent::Connected);

        let mut buf = [0u8; READ_BUFFER_SIZE];
        loop {
            tokio::select! {
                message = outgoing.recv() => {
                    let Some(message) = message else { return };
                    let line = message.serialize();
                    if let Err(e) = socket.send(line.as_bytes()).await {
                        warn!("failed to send request to supplicant: {e}");
                    }
                }
                received = socket.recv(&mut buf) => {
                    match received {
                        Ok(n) => match Message::parse(&buf[..n]) {
                            Ok(message) => {
                                let _ = events.send(LinkEvent::Message(message));
                            }
                            Err(e) => warn!("dropping undecodable supplicant line: {e}"),
                        },
                        Err(e) => {
                            warn!("control socket read failed: {e}");
                            break;
                        }
                    }
                }
                status = child.wait() => {
                    warn!("supplicant exited: {status:?}");
                    break;
                }
            }
        }

        let _ = child.start_kill();
        let _ = child.wait().await;

        if !schedule_respawn(&events, &mut budget).await {
            return;
        }
    }
}

/// Report the link as down and wait out the respawn delay. Returns false
/// when the budget is exhausted and the link must give up.
async fn schedule_respawn(events: &UnboundedSender<LinkEvent>, budget: &mut u32) -> bool {
    let _ = events.send(LinkEvent::Down);

    if *budget == 0 {
        error!("supplicant respawn budget exhausted, giving up");
        let _ = events.send(LinkEvent::Failed);
        return false;
    }

    *budget -= 1;
    sleep(RESPAWN_DELAY).await;
    true
}

fn spawn_supplicant(config: &SupplicantConfig) -> Result<Child> {
    write_config_file(&config.config_path)?;

    // A stale control directory from a previous run would make the
    // supplicant refuse to create its socket.
    match std::fs::remove_dir_all(&config.ctrl_dir) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!("failed to remove stale control directory: {e}"),
    }

    let mut command = Command::new(&config.binary);
    command
        .arg(format!("-D{}", config.driver))
        .arg(format!("-i{}", config.interface))
        .arg(format!("-C{}", config.ctrl_dir.display()))
        .arg("-ddd")
        .arg("-t")
        .arg("-K")
        .arg(format!("-c{}", config.config_path.display()))
        .arg("-W")
        .kill_on_drop(true);

    if std::env::var_os(DEBUG_ENV).is_none() {
        command.stdout(Stdio::null()).stderr(Stdio::null());
    }

    let child = command.spawn()?;
    debug!(interface = %config.interface, pid = child.id(), "supplicant spawned");

    Ok(child)
}

fn write_config_file(path: &Path) -> Result<()> {
    // PBC is the only pairing method we support.
    std::fs::write(path, "config_methods=pbc\nap_scan=1\n")?;
    Ok(())
}

fn connect_control_socket(config: &SupplicantConfig) -> std::io::Result<UnixDatagram> {
    let local_path = config.local_socket_path();

    match std::fs::remove_file(&local_path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e),
    }

    let socket = UnixDatagram::bind(&local_path)?;
    socket.connect(config.socket_path())?;
    Ok(socket)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_paths_are_per_interface() {
        let config = SupplicantConfig::for_interface("p2p0");
        assert_eq!(config.ctrl_dir, PathBuf::from("/var/run/p2p0_supplicant"));
        assert_eq!(config.socket_path(), PathBuf::from("/var/run/p2p0_supplicant/p2p0"));
        assert_eq!(config.config_path, PathBuf::from("/tmp/supplicant-p2p0.conf"));
    }

    #[test]
    fn test_config_file_contents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("supplicant.conf");

        write_config_file(&path).unwrap();

        let written = std::fs::read_to_string(&path).unwrap();
        assert_eq!(written, "config_methods=pbc\nap_scan=1\n");
    }
}

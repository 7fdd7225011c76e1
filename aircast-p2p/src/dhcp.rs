//! DHCP collaborators for the formed P2P group
//!
//! Exactly one side is active at a time, keyed by the group role: as group
//! owner we run a DHCP server on the P2P interface and use its fixed local
//! address; as client we run a DHCP client and wait for the lease. Neither
//! protocol is reimplemented here; the BusyBox `udhcpd`/`udhcpc` tools are
//! driven as child processes, the same way the supplicant is.

use std::net::Ipv4Addr;
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::Result;

/// Local address the DHCP server assigns itself on the group interface
pub const SERVER_ADDRESS: Ipv4Addr = Ipv4Addr::new(192, 168, 7, 1);

const LEASE_RANGE_START: Ipv4Addr = Ipv4Addr::new(192, 168, 7, 5);
const LEASE_RANGE_END: Ipv4Addr = Ipv4Addr::new(192, 168, 7, 100);

/// Events reported by the DHCP client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DhcpEvent {
    /// The client obtained a lease on the group interface
    AddressAssigned(Ipv4Addr),
}

/// One side of the DHCP pair. Start and stop are idempotent;
/// `local_address` reports the interface address while running.
#[async_trait]
pub trait DhcpService: Send {
    async fn start(&mut self) -> Result<()>;
    async fn stop(&mut self);
    fn local_address(&self) -> Option<Ipv4Addr>;
}

/// DHCP client driving BusyBox `udhcpc`
pub struct DhcpClient {
    interface: String,
    events: UnboundedSender<DhcpEvent>,
    child: Option<Child>,
    reader: Option<JoinHandle<()>>,
    lease: Arc<Mutex<Option<Ipv4Addr>>>,
}

impl DhcpClient {
    pub fn new(interface: &str, events: UnboundedSender<DhcpEvent>) -> Self {
        Self {
            interface: interface.to_string(),
            events,
            child: None,
            reader: None,
            lease: Arc::new(Mutex::new(None)),
        }
    }

    fn script_path(&self) -> PathBuf {
        PathBuf::from(format!("/tmp/udhcpc-{}.script", self.interface))
    }

    /// udhcpc invokes the script on lease events with the lease details in
    /// the environment; the script configures the interface and echoes the
    /// address so the reader task can pick it up.
    fn write_script(&self) -> Result<()> {
        let script = "#!/bin/sh\n\
                      case \"$1\" in\n\
                      bound|renew)\n\
                          ip addr flush dev \"$interface\"\n\
                          ip addr add \"$ip/24\" dev \"$interface\"\n\
                          echo \"lease $ip\"\n\
                          ;;\n\
                      esac\n";

        let path = self.script_path();
        std::fs::write(&path, script)?;
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755))?;
        Ok(())
    }
}

#[async_trait]
impl DhcpService for DhcpClient {
    async fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }

        self.write_script()?;

        let mut child = Command::new("udhcpc")
            .arg("-i")
            .arg(&self.interface)
            .arg("-f")
            .arg("-s")
            .arg(self.script_path())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        debug!(interface = %self.interface, "DHCP client started");

        if let Some(stdout) = child.stdout.take() {
            let events = self.events.clone();
            let lease = self.lease.clone();
            self.reader = Some(tokio::spawn(async move {
                let mut lines = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = lines.next_line().await {
                    let Some(address) = line.strip_prefix("lease ") else {
                        continue;
                    };
                    match address.trim().parse::<Ipv4Addr>() {
                        Ok(address) => {
                            *lease.lock().unwrap() = Some(address);
                            let _ = events.send(DhcpEvent::AddressAssigned(address));
                        }
                        Err(_) => warn!("DHCP client reported unparsable lease: {line}"),
                    }
                }
            }));
        }

        self.child = Some(child);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
            debug!(interface = %self.interface, "DHCP client stopped");
        }
        if let Some(reader) = self.reader.take() {
            reader.abort();
        }
        *self.lease.lock().unwrap() = None;
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        *self.lease.lock().unwrap()
    }
}

/// DHCP server driving BusyBox `udhcpd`
pub struct DhcpServer {
    interface: String,
    child: Option<Child>,
}

impl DhcpServer {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
            child: None,
        }
    }

    fn config_path(&self) -> PathBuf {
        PathBuf::from(format!("/tmp/udhcpd-{}.conf", self.interface))
    }

    fn write_config(&self) -> Result<()> {
        let config = format!(
            "interface {iface}\n\
             start {start}\n\
             end {end}\n\
             option subnet 255.255.255.0\n\
             option router {router}\n\
             option lease 3600\n",
            iface = self.interface,
            start = LEASE_RANGE_START,
            end = LEASE_RANGE_END,
            router = SERVER_ADDRESS,
        );
        std::fs::write(self.config_path(), config)?;
        Ok(())
    }

    async fn configure_interface(&self) -> Result<()> {
        let status = Command::new("ip")
            .args(["addr", "flush", "dev", &self.interface])
            .status()
            .await?;
        if !status.success() {
            warn!(interface = %self.interface, "failed to flush interface addresses");
        }

        let status = Command::new("ip")
            .args([
                "addr",
                "add",
                &format!("{SERVER_ADDRESS}/24"),
                "dev",
                &self.interface,
            ])
            .status()
            .await?;
        if !status.success() {
            warn!(interface = %self.interface, "failed to assign server address");
        }

        Ok(())
    }
}

#[async_trait]
impl DhcpService for DhcpServer {
    async fn start(&mut self) -> Result<()> {
        if self.child.is_some() {
            return Ok(());
        }

        self.write_config()?;
        self.configure_interface().await?;

        let child = Command::new("udhcpd")
            .arg("-f")
            .arg(self.config_path())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .kill_on_drop(true)
            .spawn()?;

        debug!(interface = %self.interface, address = %SERVER_ADDRESS, "DHCP server started");

        self.child = Some(child);
        Ok(())
    }

    async fn stop(&mut self) {
        if let Some(mut child) = self.child.take() {
            let _ = child.start_kill();
            let _ = child.wait().await;
            debug!(interface = %self.interface, "DHCP server stopped");

            let _ = Command::new("ip")
                .args(["addr", "flush", "dev", &self.interface])
                .status()
                .await;
        }
    }

    fn local_address(&self) -> Option<Ipv4Addr> {
        self.child.as_ref().map(|_| SERVER_ADDRESS)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::mpsc;

    #[test]
    fn test_server_address_only_while_running() {
        let server = DhcpServer::new("p2p0");
        assert_eq!(server.local_address(), None);
    }

    #[test]
    fn test_client_has_no_address_before_lease() {
        let (tx, _rx) = mpsc::unbounded_channel();
        let client = DhcpClient::new("p2p0", tx);
        assert_eq!(client.local_address(), None);
    }
}

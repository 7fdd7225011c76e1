//! Firmware loader for Wi-Fi chips without standing P2P support
//!
//! Some devices ship a Wi-Fi firmware without P2P and expose the `p2p0`
//! interface only after the chip is switched to the P2P firmware variant.
//! The switch is performed by wpa_supplicant's vendor extension on the
//! system bus; loading is needed exactly when the interface does not exist
//! yet.

use std::path::Path;

use tracing::{debug, warn};
use zbus::zvariant::ObjectPath;

use crate::error::Result;

const SUPPLICANT_BUS_NAME: &str = "fi.w1.wpa_supplicant1";
const SUPPLICANT_OBJECT_PATH: &str = "/fi/w1/wpa_supplicant1";
const SUPPLICANT_INTERFACE_PATH: &str = "/fi/w1/wpa_supplicant1/Interfaces/1";

pub struct FirmwareLoader {
    interface: String,
}

impl FirmwareLoader {
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.to_string(),
        }
    }

    /// The P2P firmware is needed when the interface is not present in sysfs
    pub fn is_needed(&self) -> bool {
        !Path::new(&format!("/sys/class/net/{}/uevent", self.interface)).exists()
    }

    /// Ask wpa_supplicant to switch the chip to the P2P firmware
    pub async fn try_load(&self) -> Result<()> {
        debug!(interface = %self.interface, "switching WiFi chip firmware for P2P support");

        let connection = zbus::Connection::system().await?;
        let path = ObjectPath::try_from(SUPPLICANT_INTERFACE_PATH).expect("static object path");

        if let Err(e) = connection
            .call_method(
                Some(SUPPLICANT_BUS_NAME),
                SUPPLICANT_OBJECT_PATH,
                Some(SUPPLICANT_BUS_NAME),
                "SetInterfaceFirmware",
                &(path, "p2p"),
            )
            .await
        {
            warn!("failed to switch WiFi chip firmware: {e}");
            return Err(e.into());
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_loopback_never_needs_firmware() {
        // `lo` always exists in sysfs, so no firmware switch is required.
        let loader = FirmwareLoader::new("lo");
        assert!(!loader.is_needed());
    }

    #[test]
    fn test_missing_interface_needs_firmware() {
        let loader = FirmwareLoader::new("definitely-not-an-interface");
        assert!(loader.is_needed());
    }
}

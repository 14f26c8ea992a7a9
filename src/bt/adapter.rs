//! BlueZ adapter control over D-Bus.
//!
//! Everything the emulator needs from the host's Bluetooth control plane:
//! adapter identity (alias, device class), visibility (powered, pairable,
//! discoverable), the local address, and HID SDP record registration through
//! `org.bluez.ProfileManager1`. The device class has no D-Bus setter, so it
//! goes through `hciconfig`.

use std::collections::HashMap;

use anyhow::{bail, Context};
use tracing::{error, info, warn};
use zbus::names::InterfaceName;
use zbus::zvariant::{ObjectPath, Value};
use zbus::Connection;

/// Bluetooth HID service class UUID.
pub const HID_UUID: &str = "00001124-0000-1000-8000-00805f9b34fb";

/// D-Bus object path our profile is registered under.
const HID_PROFILE_PATH: &str = "/bluez/switch/hid";

/// Gamepad/joystick device class.
const GAMEPAD_DEVICE_CLASS: u32 = 0x002508;

/// Handle to one local adapter (e.g. `hci0`).
pub struct HidAdapter {
    connection: Connection,
    props: zbus::fdo::PropertiesProxy<'static>,
    adapter_iface: InterfaceName<'static>,
    name: String,
}

fn is_adapter_name(name: &str) -> bool {
    name.strip_prefix("hci")
        .is_some_and(|rest| !rest.is_empty() && rest.bytes().all(|b| b.is_ascii_digit()))
}

impl HidAdapter {
    pub async fn new(connection: &Connection, device_id: &str) -> anyhow::Result<Self> {
        if !is_adapter_name(device_id) {
            bail!("\"{device_id}\" does not name a bluetooth adapter (expected e.g. hci0)");
        }
        let path = format!("/org/bluez/{device_id}");
        let props = zbus::fdo::PropertiesProxy::builder(connection)
            .destination("org.bluez")?
            .path(path)?
            .build()
            .await
            .context("connecting to the bluez adapter")?;
        Ok(Self {
            connection: connection.clone(),
            props,
            adapter_iface: InterfaceName::from_static_str_unchecked("org.bluez.Adapter1"),
            name: device_id.to_string(),
        })
    }

    /// Local adapter Bluetooth address.
    pub async fn address(&self) -> anyhow::Result<bluer::Address> {
        let value = self.props.get(self.adapter_iface.clone(), "Address").await?;
        let address = String::try_from(value).context("adapter address is not a string")?;
        address
            .parse()
            .with_context(|| format!("cannot parse adapter address \"{address}\""))
    }

    /// Sets the Bluetooth alias the console sees during discovery.
    pub async fn set_name(&self, name: &str) -> anyhow::Result<()> {
        info!("[BT] setting device name to {name}...");
        self.props
            .set(self.adapter_iface.clone(), "Alias", &Value::from(name))
            .await?;
        Ok(())
    }

    /// Sets the gamepad device class. BlueZ offers no D-Bus setter, so this
    /// shells out to `hciconfig`.
    pub async fn set_class(&self) -> anyhow::Result<()> {
        let class = format!("{GAMEPAD_DEVICE_CLASS:#08x}");
        info!("[BT] setting device class to {class}...");
        let _ = tokio::process::Command::new("hciconfig")
            .args([self.name.as_str(), "class", class.as_str()])
            .output()
            .await;

        let value = self.props.get(self.adapter_iface.clone(), "Class").await?;
        if u32::try_from(value).ok() != Some(GAMEPAD_DEVICE_CLASS) {
            error!("[BT] could not set device class {class}; connecting will likely fail");
        }
        Ok(())
    }

    pub async fn set_powered(&self, powered: bool) -> anyhow::Result<()> {
        self.props
            .set(self.adapter_iface.clone(), "Powered", &Value::from(powered))
            .await?;
        Ok(())
    }

    pub async fn set_pairable(&self, pairable: bool) -> anyhow::Result<()> {
        self.props
            .set(self.adapter_iface.clone(), "Pairable", &Value::from(pairable))
            .await?;
        if pairable {
            self.props
                .set(self.adapter_iface.clone(), "PairableTimeout", &Value::from(0u32))
                .await?;
        }
        Ok(())
    }

    pub async fn set_discoverable(&self, discoverable: bool) -> anyhow::Result<()> {
        self.props
            .set(
                self.adapter_iface.clone(),
                "Discoverable",
                &Value::from(discoverable),
            )
            .await?;
        if discoverable {
            self.props
                .set(
                    self.adapter_iface.clone(),
                    "DiscoverableTimeout",
                    &Value::from(0u32),
                )
                .await?;
        }
        Ok(())
    }

    /// Registers the HID SDP record under the HID service UUID.
    pub async fn register_sdp_record(&self, record_xml: &str) -> anyhow::Result<()> {
        info!("[BT] advertising the bluetooth HID SDP record...");
        let proxy = zbus::Proxy::new(
            &self.connection,
            "org.bluez",
            "/org/bluez",
            "org.bluez.ProfileManager1",
        )
        .await?;

        let mut options = HashMap::new();
        options.insert("Role", Value::from("server"));
        options.insert("RequireAuthentication", Value::from(false));
        options.insert("RequireAuthorization", Value::from(false));
        options.insert("ServiceRecord", Value::from(record_xml));

        let path = ObjectPath::try_from(HID_PROFILE_PATH)?;
        let result: Result<(), zbus::Error> = proxy
            .call("RegisterProfile", &(path, HID_UUID, options))
            .await;
        match result {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("AlreadyExists") => {
                // left over from an earlier run of this process
                warn!("[BT] HID SDP record already registered");
                Ok(())
            }
            Err(err) => Err(err).context("registering the HID SDP record"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_adapter_name_pattern() {
        assert!(is_adapter_name("hci0"));
        assert!(is_adapter_name("hci12"));
        assert!(!is_adapter_name("hci"));
        assert!(!is_adapter_name("hciX"));
        assert!(!is_adapter_name("eth0"));
        assert!(!is_adapter_name(""));
    }
}

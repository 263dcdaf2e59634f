//! Host-side TAP device operations.
//!
//! [`TapHost`] is the seam between the pool/registry logic and the kernel.
//! [`IpLinkHost`] drives iproute2; [`crate::fakes::MemoryTapHost`] keeps
//! devices in memory for tests.

use async_trait::async_trait;
use tracing::{debug, warn};

use crate::command::{self, Privilege};
use crate::error::{NetError, Result};
use crate::mac::MacAddr;

/// Operations on virtual network interfaces present on the host.
#[async_trait]
pub trait TapHost: Send + Sync {
    /// Create a TAP device named `name` and bring it up.
    async fn create_tap(&self, name: &str) -> Result<()>;

    /// Remove the device. Removing an absent device is an error.
    async fn delete_tap(&self, name: &str) -> Result<()>;

    /// Assign a MAC address to the device.
    async fn set_mac(&self, name: &str, mac: &MacAddr) -> Result<()>;

    /// Names of every network interface currently present on the host.
    async fn list_devices(&self) -> Result<Vec<String>>;
}

/// iproute2-backed [`TapHost`].
#[derive(Debug, Clone, Default)]
pub struct IpLinkHost {
    /// Bridge each new device is attached to (the guest gateway lives there).
    bridge: Option<String>,
    /// Unprivileged user allowed to open the device (the VMM user).
    owner: Option<String>,
}

impl IpLinkHost {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_bridge(mut self, bridge: impl Into<String>) -> Self {
        self.bridge = Some(bridge.into());
        self
    }

    pub fn with_owner(mut self, owner: impl Into<String>) -> Self {
        self.owner = Some(owner.into());
        self
    }

    async fn configure_new_device(&self, name: &str) -> Result<()> {
        if let Some(bridge) = &self.bridge {
            command::run(
                "ip",
                &["link", "set", "dev", name, "master", bridge],
                Privilege::Sudo,
            )
            .await?;
        }
        command::run("ip", &["link", "set", "dev", name, "up"], Privilege::Sudo).await?;
        Ok(())
    }
}

#[async_trait]
impl TapHost for IpLinkHost {
    async fn create_tap(&self, name: &str) -> Result<()> {
        let mut args = vec!["tuntap", "add", "dev", name, "mode", "tap"];
        if let Some(owner) = &self.owner {
            args.extend(["user", owner.as_str()]);
        }
        command::run("ip", &args, Privilege::Sudo).await?;

        if let Err(e) = self.configure_new_device(name).await {
            // Do not leave a half-configured device behind.
            if let Err(del) = self.delete_tap(name).await {
                warn!(device = %name, error = %del, "failed to remove half-configured TAP device");
            }
            return Err(NetError::TapDevice {
                device: name.to_string(),
                detail: e.to_string(),
            });
        }

        debug!(device = %name, "created TAP device");
        Ok(())
    }

    async fn delete_tap(&self, name: &str) -> Result<()> {
        command::run("ip", &["link", "del", "dev", name], Privilege::Sudo).await?;
        debug!(device = %name, "deleted TAP device");
        Ok(())
    }

    async fn set_mac(&self, name: &str, mac: &MacAddr) -> Result<()> {
        let mac = mac.to_string();
        command::run(
            "ip",
            &["link", "set", "dev", name, "address", &mac],
            Privilege::Sudo,
        )
        .await?;
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<String>> {
        let output = command::run("ip", &["-o", "link", "show"], Privilege::User).await?;
        Ok(parse_link_names(&output))
    }
}

/// Extract interface names from `ip -o link show` output.
///
/// Lines look like `7: vm3: <BROADCAST,...> mtu 1500 ...`; veth peers carry
/// an `@peer` suffix which is stripped.
pub fn parse_link_names(output: &str) -> Vec<String> {
    output
        .lines()
        .filter_map(|line| {
            let mut fields = line.splitn(3, ':');
            let _index = fields.next()?;
            let name = fields.next()?.trim();
            let name = name.split('@').next().unwrap_or(name);
            (!name.is_empty()).then(|| name.to_string())
        })
        .collect()
}

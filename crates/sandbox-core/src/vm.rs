//! MicroVM collaborator seam.
//!
//! The hypervisor wrapper lives outside this crate; the executor only needs
//! to start a VM, read back its guest address, and kill it.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use async_trait::async_trait;
use sandbox_net::NetworkConfig;

use crate::config::VmSettings;

/// Error reported by the VM wrapper.
#[derive(Debug, thiserror::Error)]
#[error("VM {vm_id}: {detail}")]
pub struct VmError {
    pub vm_id: String,
    pub detail: String,
}

/// Parameters for one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VmConfig {
    pub vm_id: String,
    pub vcpus: u32,
    pub memory_mb: u32,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub binary_path: PathBuf,
    pub work_dir: PathBuf,
    pub network: NetworkConfig,
}

impl VmConfig {
    pub fn new(vm_id: &str, settings: &VmSettings, network: NetworkConfig) -> Self {
        Self {
            vm_id: vm_id.to_string(),
            vcpus: settings.vcpus,
            memory_mb: settings.memory_mb,
            kernel_path: settings.kernel_path.clone(),
            rootfs_path: settings.rootfs_path.clone(),
            binary_path: settings.binary_path.clone(),
            work_dir: settings.work_dir.join(vm_id),
            network,
        }
    }

    /// Kernel command line for the guest.
    pub fn boot_args(&self) -> String {
        format!(
            "console=ttyS0 reboot=k panic=1 pci=off {}",
            self.network.kernel_ip_arg()
        )
    }
}

/// A single microVM.
#[async_trait]
pub trait MicroVm: Send + Sync {
    async fn start(&self, config: &VmConfig) -> Result<(), VmError>;

    /// Guest address once started, if the VM has one.
    fn guest_ip(&self) -> Option<Ipv4Addr>;

    async fn kill(&self) -> Result<(), VmError>;
}

/// Creates VM handles.
pub trait VmFactory: Send + Sync {
    fn create(&self, vm_id: &str) -> Arc<dyn MicroVm>;
}

#[cfg(test)]
mod tests {
    use super::*;
    use sandbox_net::MacAddr;

    #[test]
    fn test_config_from_settings() {
        let network = NetworkConfig {
            tap_device: "vm0".into(),
            guest_ip: Ipv4Addr::new(172, 16, 0, 2),
            gateway_ip: Ipv4Addr::new(172, 16, 0, 1),
            netmask: Ipv4Addr::new(255, 255, 255, 0),
            guest_mac: MacAddr::from_index(0),
        };
        let config = VmConfig::new("3f2a9c1e", &VmSettings::default(), network);
        assert_eq!(config.work_dir, PathBuf::from("/var/lib/sandbox/vms/3f2a9c1e"));
        assert!(config
            .boot_args()
            .ends_with("ip=172.16.0.2::172.16.0.1:255.255.255.0::eth0:off"));
    }
}

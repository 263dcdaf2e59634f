//! In-memory fakes for the host seams (testing only)
//!
//! Provides `MemoryTapHost`, `MemoryLock`, and `RecordingFirewall` that
//! satisfy the trait contracts without touching the kernel.

use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;

use crate::command::CommandError;
use crate::error::{NetError, Result};
use crate::firewall::FirewallRules;
use crate::host::TapHost;
use crate::lock::{LockGuard, RegistryLock};
use crate::mac::MacAddr;

fn injected(command: &str) -> NetError {
    NetError::Command(CommandError {
        command: command.to_string(),
        detail: "injected failure".to_string(),
    })
}

// ---------------------------------------------------------------------------
// MemoryTapHost
// ---------------------------------------------------------------------------

/// TAP host backed by a set of device names.
#[derive(Debug, Default)]
pub struct MemoryTapHost {
    devices: Mutex<BTreeSet<String>>,
    macs: Mutex<Vec<(String, MacAddr)>>,
    created: AtomicUsize,
    deleted: AtomicUsize,
    fail_next_set_mac: AtomicBool,
    fail_create: AtomicBool,
}

impl MemoryTapHost {
    pub fn new() -> Self {
        Self::default()
    }

    /// Pretend `name` already exists on the host (e.g. `eth0`).
    pub fn with_device(self, name: &str) -> Self {
        self.devices.lock().unwrap().insert(name.to_string());
        self
    }

    pub fn devices(&self) -> Vec<String> {
        self.devices.lock().unwrap().iter().cloned().collect()
    }

    pub fn has_device(&self, name: &str) -> bool {
        self.devices.lock().unwrap().contains(name)
    }

    /// Drop a device behind the pool's back, as a crash would.
    pub fn vanish(&self, name: &str) {
        self.devices.lock().unwrap().remove(name);
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn deleted(&self) -> usize {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn mac_of(&self, name: &str) -> Option<MacAddr> {
        self.macs
            .lock()
            .unwrap()
            .iter()
            .rev()
            .find(|(n, _)| n == name)
            .map(|(_, m)| *m)
    }

    /// Make the next `set_mac` call fail.
    pub fn fail_next_set_mac(&self) {
        self.fail_next_set_mac.store(true, Ordering::SeqCst);
    }

    /// Make every `create_tap` call fail until reset.
    pub fn set_fail_create(&self, fail: bool) {
        self.fail_create.store(fail, Ordering::SeqCst);
    }
}

#[async_trait]
impl TapHost for MemoryTapHost {
    async fn create_tap(&self, name: &str) -> Result<()> {
        if self.fail_create.load(Ordering::SeqCst) {
            return Err(injected(&format!("ip tuntap add dev {name}")));
        }
        let mut devices = self.devices.lock().unwrap();
        if !devices.insert(name.to_string()) {
            return Err(NetError::TapDevice {
                device: name.to_string(),
                detail: "already exists".to_string(),
            });
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn delete_tap(&self, name: &str) -> Result<()> {
        if !self.devices.lock().unwrap().remove(name) {
            return Err(NetError::TapDevice {
                device: name.to_string(),
                detail: "no such device".to_string(),
            });
        }
        self.deleted.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn set_mac(&self, name: &str, mac: &MacAddr) -> Result<()> {
        if self.fail_next_set_mac.swap(false, Ordering::SeqCst) {
            return Err(injected(&format!("ip link set dev {name} address {mac}")));
        }
        if !self.has_device(name) {
            return Err(NetError::TapDevice {
                device: name.to_string(),
                detail: "no such device".to_string(),
            });
        }
        self.macs.lock().unwrap().push((name.to_string(), *mac));
        Ok(())
    }

    async fn list_devices(&self) -> Result<Vec<String>> {
        Ok(self.devices())
    }
}

// ---------------------------------------------------------------------------
// MemoryLock
// ---------------------------------------------------------------------------

/// In-process stand-in for the advisory file lock.
#[derive(Debug, Clone, Default)]
pub struct MemoryLock {
    inner: Arc<tokio::sync::Mutex<()>>,
    acquisitions: Arc<AtomicUsize>,
}

impl MemoryLock {
    pub fn new() -> Self {
        Self::default()
    }

    /// How many times the lock has been taken.
    pub fn acquisitions(&self) -> usize {
        self.acquisitions.load(Ordering::SeqCst)
    }

    /// Whether someone currently holds the lock.
    pub fn is_held(&self) -> bool {
        self.inner.try_lock().is_err()
    }
}

#[async_trait]
impl RegistryLock for MemoryLock {
    async fn acquire(&self) -> Result<LockGuard> {
        let guard = Arc::clone(&self.inner).lock_owned().await;
        self.acquisitions.fetch_add(1, Ordering::SeqCst);
        Ok(LockGuard::new(guard))
    }
}

// ---------------------------------------------------------------------------
// RecordingFirewall
// ---------------------------------------------------------------------------

/// Firewall that records installs and removals.
#[derive(Debug, Default)]
pub struct RecordingFirewall {
    installed: Mutex<Vec<Ipv4Addr>>,
    removed: Mutex<Vec<Ipv4Addr>>,
    fail_remove: AtomicBool,
}

impl RecordingFirewall {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every `remove` call fail.
    pub fn failing_remove() -> Self {
        let fw = Self::default();
        fw.fail_remove.store(true, Ordering::SeqCst);
        fw
    }

    pub fn installed(&self) -> Vec<Ipv4Addr> {
        self.installed.lock().unwrap().clone()
    }

    pub fn removed(&self) -> Vec<Ipv4Addr> {
        self.removed.lock().unwrap().clone()
    }
}

#[async_trait]
impl FirewallRules for RecordingFirewall {
    async fn install(&self, guest_ip: Ipv4Addr) -> Result<()> {
        self.installed.lock().unwrap().push(guest_ip);
        Ok(())
    }

    async fn remove(&self, guest_ip: Ipv4Addr) -> Result<()> {
        self.removed.lock().unwrap().push(guest_ip);
        if self.fail_remove.load(Ordering::SeqCst) {
            return Err(injected(&format!("iptables -t nat -D PREROUTING -s {guest_ip}")));
        }
        Ok(())
    }
}

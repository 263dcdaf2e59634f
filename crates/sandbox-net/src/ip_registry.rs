//! Crash-safe, lock-protected IPv4 lease registry.
//!
//! The registry document lives on disk and is shared by every runner process
//! on the host. Each mutation is exactly one read-modify-write cycle taken
//! under the advisory lock; the lock is released when the guard drops, on
//! success and on error alike.
//!
//! Document shape:
//!
//! ```json
//! { "allocations": { "172.16.0.2": { "tapDevice": "vm0", "vmId": "3f2a9c1e", "allocatedAt": "..." } } }
//! ```

use std::collections::{BTreeMap, HashSet};
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::error::{NetError, Result};
use crate::host::TapHost;
use crate::lock::RegistryLock;
use crate::persist::write_atomic_async;

/// Default private /24 the guest addresses are drawn from.
pub const DEFAULT_SUBNET: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 0);

/// Default minimum allocation age before an allocation may be treated as orphaned.
pub const DEFAULT_ORPHAN_GRACE: Duration = Duration::from_secs(60);

/// Host octet of the gateway (the bridge/TAP side of the link).
const GATEWAY_HOST: u8 = 1;
/// First leasable host octet (.0 is the network, .1 the gateway).
const FIRST_USABLE_HOST: u8 = 2;
/// Last leasable host octet (.255 is broadcast).
const LAST_USABLE_HOST: u8 = 254;

/// One leased address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IpAllocation {
    /// TAP device the address is bound to
    pub tap_device: String,
    /// VM currently using the address, if any
    #[serde(default)]
    pub vm_id: Option<String>,
    /// When the lease was taken. Entries written without it are treated as
    /// older than any grace period.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allocated_at: Option<DateTime<Utc>>,
}

/// The persisted registry document.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpRegistryDocument {
    #[serde(default)]
    pub allocations: BTreeMap<Ipv4Addr, IpAllocation>,
}

/// Where the registry lives and which range it leases from.
#[derive(Debug, Clone)]
pub struct IpRegistryConfig {
    /// Path of the JSON registry document
    pub registry_path: PathBuf,
    /// Network address of the /24 block (host octet ignored)
    pub subnet: Ipv4Addr,
    /// Minimum allocation age before orphan cleanup may remove it
    pub orphan_grace: Duration,
}

impl IpRegistryConfig {
    pub fn new(registry_path: impl Into<PathBuf>) -> Self {
        Self {
            registry_path: registry_path.into(),
            subnet: DEFAULT_SUBNET,
            orphan_grace: DEFAULT_ORPHAN_GRACE,
        }
    }

    pub fn with_subnet(mut self, subnet: Ipv4Addr) -> Self {
        self.subnet = subnet;
        self
    }

    pub fn with_orphan_grace(mut self, grace: Duration) -> Self {
        self.orphan_grace = grace;
        self
    }

    /// Gateway address guests route through.
    pub fn gateway(&self) -> Ipv4Addr {
        self.host(GATEWAY_HOST)
    }

    /// Netmask of the guest subnet.
    pub fn netmask(&self) -> Ipv4Addr {
        Ipv4Addr::new(255, 255, 255, 0)
    }

    /// Leasable addresses, in ascending order.
    pub fn usable_addresses(&self) -> impl Iterator<Item = Ipv4Addr> + '_ {
        (FIRST_USABLE_HOST..=LAST_USABLE_HOST).map(move |h| self.host(h))
    }

    /// Number of leasable addresses.
    pub fn capacity(&self) -> usize {
        usize::from(LAST_USABLE_HOST - FIRST_USABLE_HOST) + 1
    }

    fn host(&self, last: u8) -> Ipv4Addr {
        let [a, b, c, _] = self.subnet.octets();
        Ipv4Addr::new(a, b, c, last)
    }
}

/// Result of one mutation closure: whether the document must be rewritten.
enum Mutation<T> {
    Changed(T),
    Unchanged(T),
}

/// Lock-protected registry of guest address leases.
pub struct IpRegistry {
    config: IpRegistryConfig,
    lock: Arc<dyn RegistryLock>,
    host: Arc<dyn TapHost>,
}

impl IpRegistry {
    /// Create a registry over `config.registry_path`, serialised by `lock`.
    ///
    /// `host` is consulted by [`IpRegistry::cleanup_orphaned`] for the TAP
    /// devices actually present.
    pub fn new(
        config: IpRegistryConfig,
        lock: Arc<dyn RegistryLock>,
        host: Arc<dyn TapHost>,
    ) -> Self {
        Self { config, lock, host }
    }

    pub fn config(&self) -> &IpRegistryConfig {
        &self.config
    }

    /// Lease the lowest free address for `tap_device`.
    ///
    /// Fails with [`NetError::PoolExhausted`] when the range is full; nothing
    /// is written in that case.
    pub async fn allocate(&self, tap_device: &str) -> Result<Ipv4Addr> {
        let config = &self.config;
        let address = self
            .mutate(|doc| {
                let address = config
                    .usable_addresses()
                    .find(|a| !doc.allocations.contains_key(a))
                    .ok_or(NetError::PoolExhausted {
                        subnet: config.subnet,
                        capacity: config.capacity(),
                    })?;
                doc.allocations.insert(
                    address,
                    IpAllocation {
                        tap_device: tap_device.to_string(),
                        vm_id: None,
                        allocated_at: Some(Utc::now()),
                    },
                );
                Ok(Mutation::Changed(address))
            })
            .await?;

        debug!(%address, tap_device, "allocated guest address");
        Ok(address)
    }

    /// Drop the lease on `address`. Releasing an unknown address is a no-op.
    pub async fn release(&self, address: Ipv4Addr) -> Result<()> {
        let removed = self
            .mutate(|doc| {
                Ok(match doc.allocations.remove(&address) {
                    Some(_) => Mutation::Changed(true),
                    None => Mutation::Unchanged(false),
                })
            })
            .await?;

        if removed {
            debug!(%address, "released guest address");
        } else {
            debug!(%address, "release of unallocated address ignored");
        }
        Ok(())
    }

    /// Record which VM is using `address`.
    pub async fn assign_vm_id(&self, address: Ipv4Addr, vm_id: &str) -> Result<()> {
        self.mutate(|doc| {
            let allocation = doc
                .allocations
                .get_mut(&address)
                .ok_or(NetError::NotAllocated(address))?;
            allocation.vm_id = Some(vm_id.to_string());
            Ok(Mutation::Changed(()))
        })
        .await
    }

    /// Detach `expected_vm_id` from `address`.
    ///
    /// If the address is now held by a different VM (or none), nothing
    /// changes: a stale caller must not clobber a newer allocation.
    pub async fn clear_vm_id(&self, address: Ipv4Addr, expected_vm_id: &str) -> Result<()> {
        self.mutate(|doc| {
            Ok(match doc.allocations.get_mut(&address) {
                Some(a) if a.vm_id.as_deref() == Some(expected_vm_id) => {
                    a.vm_id = None;
                    Mutation::Changed(())
                }
                other => {
                    debug!(
                        %address,
                        expected_vm_id,
                        current = ?other.and_then(|a| a.vm_id.clone()),
                        "vm id mismatch, leaving allocation untouched"
                    );
                    Mutation::Unchanged(())
                }
            })
        })
        .await
    }

    /// Remove allocations whose TAP device no longer exists on the host.
    ///
    /// Allocations younger than the grace period are kept even when their
    /// device is missing, since the device may not be materialised yet.
    /// Returns the number removed; when that is zero the document is not
    /// rewritten.
    pub async fn cleanup_orphaned(&self) -> Result<usize> {
        // Listed outside the lock to keep the hold time to one read + one write.
        let present: HashSet<String> = self.host.list_devices().await?.into_iter().collect();
        let grace = self.config.orphan_grace;
        let now = Utc::now();

        let removed = self
            .mutate(|doc| {
                let before = doc.allocations.len();
                doc.allocations.retain(|address, allocation| {
                    let keep = present.contains(&allocation.tap_device)
                        || !is_past_grace(allocation, now, grace);
                    if !keep {
                        info!(
                            %address,
                            tap_device = %allocation.tap_device,
                            vm_id = ?allocation.vm_id,
                            "removing orphaned allocation"
                        );
                    }
                    keep
                });
                let removed = before - doc.allocations.len();
                Ok(if removed == 0 {
                    Mutation::Unchanged(0)
                } else {
                    Mutation::Changed(removed)
                })
            })
            .await?;

        if removed > 0 {
            info!(removed, "orphaned allocations cleaned up");
        }
        Ok(removed)
    }

    /// Snapshot of every allocation.
    pub async fn list_allocations(&self) -> Result<BTreeMap<Ipv4Addr, IpAllocation>> {
        Ok(self.load().await?.allocations)
    }

    /// Address currently assigned to `vm_id`, if any.
    pub async fn find_address_for_vm(&self, vm_id: &str) -> Result<Option<Ipv4Addr>> {
        let doc = self.load().await?;
        Ok(doc
            .allocations
            .into_iter()
            .find(|(_, a)| a.vm_id.as_deref() == Some(vm_id))
            .map(|(address, _)| address))
    }

    /// One locked read-modify-write cycle. The guard lives for the whole
    /// cycle and is dropped on every exit path.
    async fn mutate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut IpRegistryDocument) -> Result<Mutation<T>>,
    {
        let _guard = self.lock.acquire().await?;
        let mut doc = self.load().await?;
        match f(&mut doc)? {
            Mutation::Changed(value) => {
                let bytes = serde_json::to_vec_pretty(&doc)?;
                write_atomic_async(&self.config.registry_path, bytes).await?;
                Ok(value)
            }
            Mutation::Unchanged(value) => Ok(value),
        }
    }

    /// Read the document; a missing or corrupt file reads as empty.
    async fn load(&self) -> Result<IpRegistryDocument> {
        let path = &self.config.registry_path;
        let bytes = match tokio::fs::read(path).await {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(IpRegistryDocument::default());
            }
            Err(e) => return Err(e.into()),
        };

        match serde_json::from_slice(&bytes) {
            Ok(doc) => Ok(doc),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "IP registry unreadable, starting empty");
                Ok(IpRegistryDocument::default())
            }
        }
    }
}

fn is_past_grace(allocation: &IpAllocation, now: DateTime<Utc>, grace: Duration) -> bool {
    match allocation.allocated_at {
        // A timestamp in the future yields a negative age, which is within grace.
        Some(at) => now
            .signed_duration_since(at)
            .to_std()
            .map(|age| age > grace)
            .unwrap_or(false),
        None => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn allocation(age_secs: Option<i64>) -> IpAllocation {
        IpAllocation {
            tap_device: "vm0".into(),
            vm_id: None,
            allocated_at: age_secs.map(|s| Utc::now() - chrono::Duration::seconds(s)),
        }
    }

    #[test]
    fn test_usable_range_excludes_reserved() {
        let config = IpRegistryConfig::new("/tmp/unused.json");
        let all: Vec<_> = config.usable_addresses().collect();
        assert_eq!(all.len(), config.capacity());
        assert_eq!(all.len(), 253);
        assert_eq!(all[0], Ipv4Addr::new(172, 16, 0, 2));
        assert_eq!(*all.last().unwrap(), Ipv4Addr::new(172, 16, 0, 254));
        assert!(!all.contains(&config.gateway()));
    }

    #[test]
    fn test_subnet_host_octet_ignored() {
        let config =
            IpRegistryConfig::new("/tmp/unused.json").with_subnet(Ipv4Addr::new(10, 9, 8, 77));
        assert_eq!(config.gateway(), Ipv4Addr::new(10, 9, 8, 1));
        assert_eq!(config.usable_addresses().next(), Some(Ipv4Addr::new(10, 9, 8, 2)));
    }

    #[test]
    fn test_grace_period() {
        let now = Utc::now();
        let grace = Duration::from_secs(60);
        assert!(!is_past_grace(&allocation(Some(5)), now, grace));
        assert!(is_past_grace(&allocation(Some(600)), now, grace));
        assert!(is_past_grace(&allocation(None), now, grace));
        assert!(!is_past_grace(&allocation(Some(-30)), now, grace));
    }

    #[test]
    fn test_document_wire_shape() {
        let mut doc = IpRegistryDocument::default();
        doc.allocations.insert(
            Ipv4Addr::new(172, 16, 0, 2),
            IpAllocation {
                tap_device: "vm0".into(),
                vm_id: Some("3f2a9c1e".into()),
                allocated_at: None,
            },
        );
        let json = serde_json::to_value(&doc).unwrap();
        assert_eq!(
            json,
            serde_json::json!({
                "allocations": { "172.16.0.2": { "tapDevice": "vm0", "vmId": "3f2a9c1e" } }
            })
        );
    }

    #[test]
    fn test_document_without_vm_id_parses() {
        let doc: IpRegistryDocument = serde_json::from_str(
            r#"{"allocations":{"172.16.0.9":{"tapDevice":"vm4"}}}"#,
        )
        .unwrap();
        let a = &doc.allocations[&Ipv4Addr::new(172, 16, 0, 9)];
        assert_eq!(a.tap_device, "vm4");
        assert!(a.vm_id.is_none());
    }
}

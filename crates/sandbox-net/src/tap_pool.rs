//! Pre-warmed pool of TAP devices with on-demand overflow.
//!
//! Devices are named `{prefix}{index}` with an index counter that lives as
//! long as the pool. Devices created by [`TapPool::init`] or by background
//! replenishment are *pooled* and recycled on release; devices created
//! because the free set was empty are *on-demand* and deleted on release.
//!
//! Guest addresses are leased from the [`IpRegistry`] at acquire time only,
//! so idle pooled devices never hold an address.

use std::collections::{HashMap, HashSet, VecDeque};
use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::error::Result;
use crate::host::TapHost;
use crate::ip_registry::IpRegistry;
use crate::mac::MacAddr;

/// Default device name prefix.
pub const DEFAULT_DEVICE_PREFIX: &str = "vm";

/// Pool tuning.
#[derive(Debug, Clone)]
pub struct TapPoolConfig {
    /// Device name prefix; devices are `{prefix}{index}`
    pub device_prefix: String,
    /// Free-count at or below which replenishment starts. Defaults to half
    /// the pool size.
    pub replenish_threshold: Option<usize>,
    /// Top the pool up in the background after acquires
    pub auto_replenish: bool,
}

impl Default for TapPoolConfig {
    fn default() -> Self {
        Self {
            device_prefix: DEFAULT_DEVICE_PREFIX.to_string(),
            replenish_threshold: None,
            auto_replenish: true,
        }
    }
}

/// Network identity handed to one VM.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkConfig {
    pub tap_device: String,
    pub guest_ip: Ipv4Addr,
    pub gateway_ip: Ipv4Addr,
    pub netmask: Ipv4Addr,
    pub guest_mac: MacAddr,
}

impl NetworkConfig {
    /// Kernel `ip=` boot parameter configuring the guest's `eth0` statically.
    pub fn kernel_ip_arg(&self) -> String {
        format!(
            "ip={}::{}:{}::eth0:off",
            self.guest_ip, self.gateway_ip, self.netmask
        )
    }
}

/// How a device entered the pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceKind {
    /// Recycled on release
    Pooled,
    /// Deleted on release
    OnDemand,
}

#[derive(Debug, Clone, Copy)]
struct DeviceEntry {
    index: u32,
    kind: DeviceKind,
}

#[derive(Debug, Default)]
struct PoolState {
    free: VecDeque<String>,
    devices: HashMap<String, DeviceEntry>,
    /// Host devices that already existed at init; their names are skipped.
    foreign: HashSet<String>,
    next_index: u32,
    target: usize,
}

impl PoolState {
    fn reserve_name(&mut self, prefix: &str) -> (u32, String) {
        loop {
            let index = self.next_index;
            self.next_index += 1;
            let name = format!("{prefix}{index}");
            if !self.foreign.contains(&name) {
                return (index, name);
            }
        }
    }

    /// Free pooled device with the highest index.
    fn highest_free(&self) -> Option<(usize, u32)> {
        self.free
            .iter()
            .enumerate()
            .filter_map(|(pos, name)| self.devices.get(name).map(|d| (pos, d.index)))
            .max_by_key(|(_, index)| *index)
    }
}

struct PoolShared {
    config: TapPoolConfig,
    host: Arc<dyn TapHost>,
    registry: Arc<IpRegistry>,
    state: Mutex<PoolState>,
    on_demand_created: AtomicU64,
}

/// Undo action for one completed acquire step.
#[derive(Debug)]
enum Compensation {
    ReturnToPool(String),
    DeleteDevice(String),
    ReleaseAddress(Ipv4Addr),
}

/// Completed acquire steps, undone in reverse order on failure.
#[derive(Debug, Default)]
struct Rollback {
    steps: Vec<Compensation>,
}

impl Rollback {
    fn push(&mut self, step: Compensation) {
        self.steps.push(step);
    }

    async fn unwind(self, shared: &PoolShared) {
        for step in self.steps.into_iter().rev() {
            match step {
                Compensation::ReturnToPool(name) => {
                    debug!(device = %name, "returning device to free set");
                    shared.state.lock().await.free.push_front(name);
                }
                Compensation::DeleteDevice(name) => {
                    shared.state.lock().await.devices.remove(&name);
                    if let Err(e) = shared.host.delete_tap(&name).await {
                        warn!(device = %name, error = %e, "rollback: failed to delete TAP device");
                    }
                }
                Compensation::ReleaseAddress(address) => {
                    if let Err(e) = shared.registry.release(address).await {
                        warn!(%address, error = %e, "rollback: failed to release address");
                    }
                }
            }
        }
    }
}

/// Pool of TAP devices shared by every job in this runner.
pub struct TapPool {
    shared: Arc<PoolShared>,
    replenisher: Mutex<Option<JoinHandle<()>>>,
}

impl TapPool {
    pub fn new(config: TapPoolConfig, host: Arc<dyn TapHost>, registry: Arc<IpRegistry>) -> Self {
        Self {
            shared: Arc::new(PoolShared {
                config,
                host,
                registry,
                state: Mutex::new(PoolState::default()),
                on_demand_created: AtomicU64::new(0),
            }),
            replenisher: Mutex::new(None),
        }
    }

    /// Pre-create `size` pooled devices. No addresses are leased.
    ///
    /// Names already present on the host may belong to another runner, so
    /// they are left alone and skipped for the life of the pool.
    pub async fn init(&self, size: usize) -> Result<()> {
        let shared = &self.shared;
        let existing = shared.host.list_devices().await?;
        {
            let mut state = shared.state.lock().await;
            state.target = size;
            for name in existing {
                let indexed = name
                    .strip_prefix(shared.config.device_prefix.as_str())
                    .is_some_and(|i| !i.is_empty() && i.bytes().all(|b| b.is_ascii_digit()));
                if indexed {
                    warn!(device = %name, "TAP device name already in use, skipping");
                    state.foreign.insert(name);
                }
            }
        }

        for _ in 0..size {
            let (index, name) = shared
                .state
                .lock()
                .await
                .reserve_name(&shared.config.device_prefix);

            shared.host.create_tap(&name).await?;
            let mut state = shared.state.lock().await;
            state.devices.insert(
                name.clone(),
                DeviceEntry {
                    index,
                    kind: DeviceKind::Pooled,
                },
            );
            state.free.push_back(name);
        }

        info!(size, "TAP pool initialised");
        Ok(())
    }

    /// Hand out a device with a fresh address lease for `vm_id`.
    ///
    /// On any failure the steps already taken are undone: the address is
    /// released, a pooled device goes back to the free set and an on-demand
    /// device is deleted.
    pub async fn acquire(&self, vm_id: &str) -> Result<NetworkConfig> {
        let mut rollback = Rollback::default();
        match self.acquire_steps(vm_id, &mut rollback).await {
            Ok(config) => {
                debug!(
                    vm_id,
                    device = %config.tap_device,
                    guest_ip = %config.guest_ip,
                    "acquired network identity"
                );
                self.maybe_replenish().await;
                Ok(config)
            }
            Err(e) => {
                warn!(vm_id, error = %e, "acquire failed, rolling back");
                rollback.unwind(&self.shared).await;
                Err(e)
            }
        }
    }

    async fn acquire_steps(&self, vm_id: &str, rollback: &mut Rollback) -> Result<NetworkConfig> {
        let shared = &self.shared;

        let (name, index) = self.reserve_device(rollback).await?;

        let guest_ip = shared.registry.allocate(&name).await?;
        rollback.push(Compensation::ReleaseAddress(guest_ip));
        shared.registry.assign_vm_id(guest_ip, vm_id).await?;

        let guest_mac = MacAddr::from_index(index);
        shared.host.set_mac(&name, &guest_mac).await?;

        let registry_config = shared.registry.config();
        Ok(NetworkConfig {
            tap_device: name,
            guest_ip,
            gateway_ip: registry_config.gateway(),
            netmask: registry_config.netmask(),
            guest_mac,
        })
    }

    /// Take a free pooled device, or create an on-demand one.
    async fn reserve_device(&self, rollback: &mut Rollback) -> Result<(String, u32)> {
        let shared = &self.shared;
        let (index, name) = {
            let mut state = shared.state.lock().await;
            if let Some(name) = state.free.pop_front() {
                let index = state.devices.get(&name).map(|d| d.index).unwrap_or_default();
                rollback.push(Compensation::ReturnToPool(name.clone()));
                return Ok((name, index));
            }
            state.reserve_name(&shared.config.device_prefix)
        };

        shared.host.create_tap(&name).await?;
        shared.state.lock().await.devices.insert(
            name.clone(),
            DeviceEntry {
                index,
                kind: DeviceKind::OnDemand,
            },
        );
        rollback.push(Compensation::DeleteDevice(name.clone()));
        shared.on_demand_created.fetch_add(1, Ordering::Relaxed);
        info!(device = %name, "pool empty, created on-demand TAP device");
        Ok((name, index))
    }

    /// Start a background top-up if the free set is at or below threshold
    /// and none is already running.
    async fn maybe_replenish(&self) {
        if !self.shared.config.auto_replenish {
            return;
        }
        let needed = {
            let state = self.shared.state.lock().await;
            let threshold = self
                .shared
                .config
                .replenish_threshold
                .unwrap_or(state.target / 2);
            state.target > 0 && state.free.len() <= threshold
        };
        if !needed {
            return;
        }

        let mut slot = self.replenisher.lock().await;
        if slot.as_ref().is_some_and(|h| !h.is_finished()) {
            return;
        }
        let shared = Arc::clone(&self.shared);
        *slot = Some(tokio::spawn(async move { replenish(shared).await }));
    }

    /// Wait for an in-flight replenishment, if any.
    pub async fn wait_for_replenish(&self) {
        let handle = self.replenisher.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                warn!(error = %e, "replenish task aborted");
            }
        }
    }

    /// Return a device and its address.
    ///
    /// The address is always released. A pooled device goes back to the
    /// free set. When that puts the set over target size, the
    /// highest-indexed pooled device is deleted, so the low indices created
    /// by [`TapPool::init`] stay in service.
    pub async fn release(&self, tap_device: &str, guest_ip: Ipv4Addr) -> Result<()> {
        let shared = &self.shared;
        let released = shared.registry.release(guest_ip).await;

        let delete = {
            let mut state = shared.state.lock().await;
            let entry = state.devices.get(tap_device).copied();
            match entry {
                Some(DeviceEntry {
                    kind: DeviceKind::Pooled,
                    index,
                }) => {
                    if state.free.len() < state.target {
                        state.free.push_back(tap_device.to_string());
                        None
                    } else {
                        match state.highest_free() {
                            Some((pos, highest)) if highest > index => {
                                let surplus = state.free.remove(pos);
                                state.free.push_back(tap_device.to_string());
                                if let Some(name) = &surplus {
                                    state.devices.remove(name);
                                }
                                surplus
                            }
                            _ => {
                                state.devices.remove(tap_device);
                                Some(tap_device.to_string())
                            }
                        }
                    }
                }
                Some(_) => {
                    state.devices.remove(tap_device);
                    Some(tap_device.to_string())
                }
                None => {
                    warn!(device = %tap_device, "released device unknown to pool, deleting");
                    Some(tap_device.to_string())
                }
            }
        };

        match delete {
            Some(name) => {
                shared.host.delete_tap(&name).await?;
                debug!(device = %name, released = %tap_device, "deleted surplus TAP device");
            }
            None => debug!(device = %tap_device, "returned TAP device to pool"),
        }
        released
    }

    /// Delete every pooled device best-effort and forget all state.
    pub async fn cleanup(&self) {
        self.wait_for_replenish().await;

        let pooled: Vec<String> = {
            let mut state = self.shared.state.lock().await;
            let pooled = state
                .devices
                .iter()
                .filter(|(_, d)| d.kind == DeviceKind::Pooled)
                .map(|(name, _)| name.clone())
                .collect();
            state.free.clear();
            state.devices.clear();
            state.target = 0;
            pooled
        };

        for name in &pooled {
            if let Err(e) = self.shared.host.delete_tap(name).await {
                warn!(device = %name, error = %e, "failed to delete pooled TAP device");
            }
        }
        info!(deleted = pooled.len(), "TAP pool cleaned up");
    }

    pub async fn free_count(&self) -> usize {
        self.shared.state.lock().await.free.len()
    }

    /// Names of every device the pool currently tracks, sorted by index.
    pub async fn device_names(&self) -> Vec<String> {
        let state = self.shared.state.lock().await;
        let mut devices: Vec<_> = state.devices.iter().collect();
        devices.sort_by_key(|(_, d)| d.index);
        devices.into_iter().map(|(name, _)| name.clone()).collect()
    }

    pub async fn kind_of(&self, tap_device: &str) -> Option<DeviceKind> {
        self.shared
            .state
            .lock()
            .await
            .devices
            .get(tap_device)
            .map(|d| d.kind)
    }

    /// On-demand devices created over the pool's lifetime.
    pub fn on_demand_created(&self) -> u64 {
        self.shared.on_demand_created.load(Ordering::Relaxed)
    }
}

/// Create pooled devices until the free set is back at target size.
async fn replenish(shared: Arc<PoolShared>) {
    let mut created = 0usize;
    loop {
        let (index, name) = {
            let mut state = shared.state.lock().await;
            if state.free.len() >= state.target {
                break;
            }
            state.reserve_name(&shared.config.device_prefix)
        };

        if let Err(e) = shared.host.create_tap(&name).await {
            warn!(device = %name, error = %e, "replenish failed");
            break;
        }

        let mut state = shared.state.lock().await;
        state.devices.insert(
            name.clone(),
            DeviceEntry {
                index,
                kind: DeviceKind::Pooled,
            },
        );
        state.free.push_back(name);
        created += 1;
    }

    if created > 0 {
        debug!(created, "TAP pool replenished");
    }
}

//! TAP pool lifecycle and rollback tests against in-memory host seams.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::sync::Arc;

use sandbox_net::fakes::{MemoryLock, MemoryTapHost};
use sandbox_net::{
    DeviceKind, IpRegistry, IpRegistryConfig, MacAddr, NetError, TapPool, TapPoolConfig,
};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    host: Arc<MemoryTapHost>,
    registry: Arc<IpRegistry>,
    pool: TapPool,
}

fn harness(auto_replenish: bool) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(MemoryTapHost::new().with_device("eth0"));
    let registry = Arc::new(IpRegistry::new(
        IpRegistryConfig::new(dir.path().join("ip-registry.json")),
        Arc::new(MemoryLock::new()),
        host.clone(),
    ));
    let pool = TapPool::new(
        TapPoolConfig {
            auto_replenish,
            ..TapPoolConfig::default()
        },
        host.clone(),
        registry.clone(),
    );
    Harness {
        _dir: dir,
        host,
        registry,
        pool,
    }
}

/// Lease every remaining address so the next allocate fails.
async fn exhaust_registry(registry: &IpRegistry) -> Vec<Ipv4Addr> {
    let mut leased = Vec::new();
    loop {
        match registry.allocate("filler").await {
            Ok(addr) => leased.push(addr),
            Err(NetError::PoolExhausted { .. }) => return leased,
            Err(e) => panic!("unexpected error: {e}"),
        }
    }
}

#[tokio::test]
async fn test_init_creates_sequential_devices_without_leases() {
    let h = harness(false);
    h.pool.init(4).await.unwrap();

    assert_eq!(h.pool.device_names().await, vec!["vm0", "vm1", "vm2", "vm3"]);
    assert_eq!(h.pool.free_count().await, 4);
    assert_eq!(h.host.created(), 4);
    assert!(h.registry.list_allocations().await.unwrap().is_empty());
}

#[tokio::test]
async fn test_init_skips_names_already_on_host() {
    let dir = tempfile::tempdir().unwrap();
    let host = Arc::new(MemoryTapHost::new().with_device("vm0"));
    let registry = Arc::new(IpRegistry::new(
        IpRegistryConfig::new(dir.path().join("ip-registry.json")),
        Arc::new(MemoryLock::new()),
        host.clone(),
    ));
    let pool = TapPool::new(TapPoolConfig::default(), host.clone(), registry);

    pool.init(2).await.unwrap();
    assert_eq!(host.deleted(), 0);
    assert_eq!(host.devices(), vec!["vm0", "vm1", "vm2"]);
    assert_eq!(pool.device_names().await, vec!["vm1", "vm2"]);

    pool.cleanup().await;
    assert_eq!(host.devices(), vec!["vm0"]);
}

#[tokio::test]
async fn test_acquire_returns_consistent_identity() {
    let h = harness(false);
    h.pool.init(2).await.unwrap();

    let net = h.pool.acquire("3f2a9c1e").await.unwrap();
    assert_eq!(net.tap_device, "vm0");
    assert_eq!(net.guest_ip, Ipv4Addr::new(172, 16, 0, 2));
    assert_eq!(net.gateway_ip, Ipv4Addr::new(172, 16, 0, 1));
    assert_eq!(net.netmask, Ipv4Addr::new(255, 255, 255, 0));
    assert_eq!(net.guest_mac, MacAddr::from_index(0));
    assert_eq!(h.host.mac_of("vm0"), Some(net.guest_mac));

    let lease = &h.registry.list_allocations().await.unwrap()[&net.guest_ip];
    assert_eq!(lease.tap_device, "vm0");
    assert_eq!(lease.vm_id.as_deref(), Some("3f2a9c1e"));
}

#[tokio::test]
async fn test_exhausted_pool_creates_on_demand_device() {
    let h = harness(false);
    h.pool.init(2).await.unwrap();
    h.pool.acquire("a").await.unwrap();
    h.pool.acquire("b").await.unwrap();

    let net = h.pool.acquire("c").await.unwrap();
    assert_eq!(net.tap_device, "vm2");
    assert_eq!(net.guest_ip, Ipv4Addr::new(172, 16, 0, 4));
    assert_eq!(net.guest_mac, MacAddr::from_index(2));
    assert_eq!(h.pool.kind_of("vm2").await, Some(DeviceKind::OnDemand));
    assert_eq!(h.pool.on_demand_created(), 1);
}

#[tokio::test]
async fn test_ip_failure_returns_pooled_device() {
    let h = harness(false);
    h.pool.init(1).await.unwrap();
    let leased = exhaust_registry(&h.registry).await;

    let err = h.pool.acquire("a").await.unwrap_err();
    assert!(matches!(err, NetError::PoolExhausted { .. }));
    assert_eq!(h.pool.free_count().await, 1);

    h.registry.release(leased[0]).await.unwrap();
    let net = h.pool.acquire("a").await.unwrap();
    assert_eq!(net.tap_device, "vm0");
    assert_eq!(h.host.created(), 1, "no extra device created");
}

#[tokio::test]
async fn test_ip_failure_deletes_on_demand_device() {
    let h = harness(false);
    let leased = exhaust_registry(&h.registry).await;

    assert!(h.pool.acquire("a").await.is_err());
    assert_eq!(h.host.created(), 1);
    assert_eq!(h.host.deleted(), 1);
    assert_eq!(h.host.devices(), vec!["eth0"]);
    assert!(h.pool.device_names().await.is_empty());

    h.registry.release(leased[0]).await.unwrap();
    let net = h.pool.acquire("a").await.unwrap();
    assert_eq!(h.host.devices(), vec!["eth0".to_string(), net.tap_device]);
}

#[tokio::test]
async fn test_mac_failure_releases_lease_and_returns_device() {
    let h = harness(false);
    h.pool.init(1).await.unwrap();
    h.host.fail_next_set_mac();

    assert!(h.pool.acquire("a").await.is_err());
    assert!(h.registry.list_allocations().await.unwrap().is_empty());
    assert_eq!(h.pool.free_count().await, 1);

    let net = h.pool.acquire("a").await.unwrap();
    assert_eq!(net.tap_device, "vm0");
    assert_eq!(net.guest_ip, Ipv4Addr::new(172, 16, 0, 2));
    assert_eq!(h.host.created(), 1);
}

#[tokio::test]
async fn test_mac_failure_deletes_on_demand_device() {
    let h = harness(false);
    h.host.fail_next_set_mac();

    assert!(h.pool.acquire("a").await.is_err());
    assert!(h.registry.list_allocations().await.unwrap().is_empty());
    assert_eq!(h.host.devices(), vec!["eth0"]);
}

#[tokio::test]
async fn test_concurrent_acquires_are_distinct() {
    let h = Arc::new(harness(false));
    h.pool.init(3).await.unwrap();

    let tasks: Vec<_> = (0..3)
        .map(|i| {
            let h = h.clone();
            tokio::spawn(async move { h.pool.acquire(&format!("vm-{i}")).await.unwrap() })
        })
        .collect();
    let nets: Vec<_> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    let taps: HashSet<_> = nets.iter().map(|n| n.tap_device.clone()).collect();
    let ips: HashSet<_> = nets.iter().map(|n| n.guest_ip).collect();
    assert_eq!(taps.len(), 3);
    assert_eq!(ips.len(), 3);
    assert_eq!(h.host.created(), 3);
}

#[tokio::test]
async fn test_release_recycles_pooled_device() {
    let h = harness(false);
    h.pool.init(2).await.unwrap();

    let net = h.pool.acquire("a").await.unwrap();
    h.pool.release(&net.tap_device, net.guest_ip).await.unwrap();
    assert!(h.registry.list_allocations().await.unwrap().is_empty());
    assert_eq!(h.pool.free_count().await, 2);

    h.pool.acquire("b").await.unwrap();
    h.pool.acquire("c").await.unwrap();
    assert_eq!(h.host.created(), 2, "released device reused");
}

#[tokio::test]
async fn test_release_deletes_on_demand_device() {
    let h = harness(false);
    let net = h.pool.acquire("a").await.unwrap();
    assert_eq!(h.pool.kind_of(&net.tap_device).await, Some(DeviceKind::OnDemand));

    h.pool.release(&net.tap_device, net.guest_ip).await.unwrap();
    assert!(!h.host.has_device(&net.tap_device));
    assert!(h.registry.list_allocations().await.unwrap().is_empty());
    assert_eq!(h.pool.free_count().await, 0);
}

#[tokio::test]
async fn test_replenish_tops_pool_up() {
    let h = harness(true);
    h.pool.init(2).await.unwrap();

    h.pool.acquire("a").await.unwrap();
    h.pool.wait_for_replenish().await;
    assert_eq!(h.pool.free_count().await, 2);
    assert_eq!(h.pool.kind_of("vm2").await, Some(DeviceKind::Pooled));
}

#[tokio::test]
async fn test_replenish_failure_is_not_fatal() {
    let h = harness(true);
    h.pool.init(2).await.unwrap();
    h.host.set_fail_create(true);

    let net = h.pool.acquire("a").await.unwrap();
    h.pool.wait_for_replenish().await;
    assert_eq!(net.tap_device, "vm0");
    assert_eq!(h.pool.free_count().await, 1);
}

#[tokio::test]
async fn test_surplus_release_is_trimmed() {
    let h = harness(true);
    h.pool.init(2).await.unwrap();

    let a = h.pool.acquire("a").await.unwrap();
    h.pool.wait_for_replenish().await;
    assert_eq!(h.pool.free_count().await, 2);

    h.pool.release(&a.tap_device, a.guest_ip).await.unwrap();
    assert_eq!(a.tap_device, "vm0");
    assert!(h.host.has_device("vm0"), "released pooled device kept");
    assert!(!h.host.has_device("vm2"), "replenished surplus trimmed");
    assert_eq!(h.pool.device_names().await, vec!["vm0", "vm1"]);
    assert_eq!(h.pool.free_count().await, 2);
}

#[tokio::test]
async fn test_cleanup_deletes_pooled_devices() {
    let h = harness(true);
    h.pool.init(3).await.unwrap();
    h.pool.acquire("a").await.unwrap();

    h.pool.cleanup().await;
    assert_eq!(h.host.devices(), vec!["eth0"]);
    assert!(h.pool.device_names().await.is_empty());
    assert_eq!(h.pool.free_count().await, 0);
}

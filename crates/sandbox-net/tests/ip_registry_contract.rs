//! Contract tests for the on-disk IP registry.

use std::collections::HashSet;
use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sandbox_net::fakes::{MemoryLock, MemoryTapHost};
use sandbox_net::{FlockLock, IpRegistry, IpRegistryConfig, NetError, TapHost};
use tempfile::TempDir;

struct Harness {
    _dir: TempDir,
    path: PathBuf,
    host: Arc<MemoryTapHost>,
    lock: MemoryLock,
    registry: IpRegistry,
}

fn harness() -> Harness {
    harness_with_host(MemoryTapHost::new())
}

fn harness_with_host(host: MemoryTapHost) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ip-registry.json");
    let host = Arc::new(host);
    let lock = MemoryLock::new();
    let registry = IpRegistry::new(
        IpRegistryConfig::new(&path).with_orphan_grace(Duration::from_secs(60)),
        Arc::new(lock.clone()),
        host.clone(),
    );
    Harness {
        _dir: dir,
        path,
        host,
        lock,
        registry,
    }
}

fn ip(last: u8) -> Ipv4Addr {
    Ipv4Addr::new(172, 16, 0, last)
}

#[tokio::test]
async fn test_allocate_release_reuses_lowest_address() {
    let h = harness();

    assert_eq!(h.registry.allocate("tap0").await.unwrap(), ip(2));
    assert_eq!(h.registry.allocate("tap1").await.unwrap(), ip(3));
    h.registry.release(ip(2)).await.unwrap();
    assert_eq!(h.registry.allocate("tap2").await.unwrap(), ip(2));

    let all = h.registry.list_allocations().await.unwrap();
    assert_eq!(all.len(), 2);
    assert_eq!(all[&ip(2)].tap_device, "tap2");
    assert_eq!(all[&ip(3)].tap_device, "tap1");
}

#[tokio::test]
async fn test_allocations_follow_usable_range_in_order() {
    let h = harness();
    let expected: Vec<_> = h.registry.config().usable_addresses().take(10).collect();

    let mut got = Vec::new();
    for i in 0..10 {
        got.push(h.registry.allocate(&format!("vm{i}")).await.unwrap());
    }

    assert_eq!(got, expected);
    assert_eq!(got.iter().collect::<HashSet<_>>().len(), 10);
}

#[tokio::test]
async fn test_exhaustion_persists_nothing() {
    let h = harness();
    let capacity = h.registry.config().capacity();

    for i in 0..capacity {
        h.registry.allocate(&format!("vm{i}")).await.unwrap();
    }
    let before = std::fs::read(&h.path).unwrap();

    let err = h.registry.allocate("one-too-many").await.unwrap_err();
    assert!(matches!(err, NetError::PoolExhausted { capacity: 253, .. }));
    assert_eq!(std::fs::read(&h.path).unwrap(), before);
    assert!(!h.lock.is_held(), "lock must be released on error");

    let all = h.registry.list_allocations().await.unwrap();
    assert_eq!(all.len(), capacity);
    assert!(!all.contains_key(&ip(1)));
    assert!(!all.contains_key(&ip(255)));
}

#[tokio::test]
async fn test_release_unknown_is_noop() {
    let h = harness();
    h.registry.release(ip(99)).await.unwrap();
    assert!(!h.path.exists(), "no-op release must not write");
}

#[tokio::test]
async fn test_vm_id_assignment() {
    let h = harness();
    let addr = h.registry.allocate("vm0").await.unwrap();

    h.registry.assign_vm_id(addr, "3f2a9c1e").await.unwrap();
    assert_eq!(
        h.registry.find_address_for_vm("3f2a9c1e").await.unwrap(),
        Some(addr)
    );
    assert_eq!(h.registry.find_address_for_vm("other").await.unwrap(), None);

    let err = h.registry.assign_vm_id(ip(200), "x").await.unwrap_err();
    assert!(matches!(err, NetError::NotAllocated(a) if a == ip(200)));
}

#[tokio::test]
async fn test_clear_vm_id_ignores_stale_caller() {
    let h = harness();
    let addr = h.registry.allocate("vm0").await.unwrap();
    h.registry.assign_vm_id(addr, "newer").await.unwrap();

    h.registry.clear_vm_id(addr, "stale").await.unwrap();
    assert_eq!(
        h.registry.list_allocations().await.unwrap()[&addr].vm_id.as_deref(),
        Some("newer")
    );

    h.registry.clear_vm_id(addr, "newer").await.unwrap();
    assert!(h.registry.list_allocations().await.unwrap()[&addr].vm_id.is_none());

    // Unknown address is not an error either.
    h.registry.clear_vm_id(ip(250), "newer").await.unwrap();
}

#[tokio::test]
async fn test_cleanup_orphaned_respects_presence_and_grace() {
    let h = harness_with_host(MemoryTapHost::new().with_device("vm1"));
    let old = (Utc::now() - chrono::Duration::minutes(10)).to_rfc3339();
    let fresh = Utc::now().to_rfc3339();
    let doc = serde_json::json!({
        "allocations": {
            // absent and old: removed
            "172.16.0.2": { "tapDevice": "vm0", "vmId": "a", "allocatedAt": old },
            // present and old: kept
            "172.16.0.3": { "tapDevice": "vm1", "vmId": "b", "allocatedAt": old },
            // absent but within grace: kept
            "172.16.0.4": { "tapDevice": "vm2", "vmId": null, "allocatedAt": fresh },
            // absent, no timestamp: removed
            "172.16.0.5": { "tapDevice": "vm3", "vmId": null }
        }
    });
    std::fs::write(&h.path, serde_json::to_vec(&doc).unwrap()).unwrap();

    assert_eq!(h.registry.cleanup_orphaned().await.unwrap(), 2);

    let left: Vec<_> = h
        .registry
        .list_allocations()
        .await
        .unwrap()
        .into_keys()
        .collect();
    assert_eq!(left, vec![ip(3), ip(4)]);
}

#[tokio::test]
async fn test_noop_cleanup_does_not_write() {
    let h = harness_with_host(MemoryTapHost::new().with_device("vm0"));
    let compact = r#"{"allocations":{"172.16.0.2":{"tapDevice":"vm0","vmId":null}}}"#;
    std::fs::write(&h.path, compact).unwrap();

    assert_eq!(h.registry.cleanup_orphaned().await.unwrap(), 0);
    assert_eq!(std::fs::read_to_string(&h.path).unwrap(), compact);
}

#[tokio::test]
async fn test_cleanup_sees_vanished_device() {
    let h = harness_with_host(MemoryTapHost::new());
    let h_registry = IpRegistry::new(
        IpRegistryConfig::new(&h.path).with_orphan_grace(Duration::ZERO),
        Arc::new(h.lock.clone()),
        h.host.clone(),
    );
    h.host.create_tap("vm0").await.unwrap();
    let addr = h_registry.allocate("vm0").await.unwrap();

    assert_eq!(h_registry.cleanup_orphaned().await.unwrap(), 0);
    h.host.vanish("vm0");
    tokio::time::sleep(Duration::from_millis(5)).await;
    assert_eq!(h_registry.cleanup_orphaned().await.unwrap(), 1);
    assert!(!h_registry.list_allocations().await.unwrap().contains_key(&addr));
}

#[tokio::test]
async fn test_corrupt_registry_reads_as_empty() {
    let h = harness();
    std::fs::write(&h.path, b"{ not json").unwrap();

    assert!(h.registry.list_allocations().await.unwrap().is_empty());
    assert_eq!(h.registry.allocate("vm0").await.unwrap(), ip(2));
}

#[tokio::test]
async fn test_every_mutation_takes_the_lock() {
    let h = harness();
    let addr = h.registry.allocate("vm0").await.unwrap();
    h.registry.assign_vm_id(addr, "x").await.unwrap();
    h.registry.clear_vm_id(addr, "x").await.unwrap();
    h.registry.release(addr).await.unwrap();
    assert_eq!(h.lock.acquisitions(), 4);
}

#[tokio::test]
async fn test_concurrent_registries_share_file_lock() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("ip-registry.json");
    let lock_path = dir.path().join("ip-registry.json.lock");
    let host = Arc::new(MemoryTapHost::new());

    let make = || {
        Arc::new(IpRegistry::new(
            IpRegistryConfig::new(&path),
            Arc::new(FlockLock::new(&lock_path)),
            host.clone(),
        ))
    };
    let a = make();
    let b = make();

    let mut tasks = Vec::new();
    for i in 0..20 {
        let registry = if i % 2 == 0 { a.clone() } else { b.clone() };
        tasks.push(tokio::spawn(async move {
            registry.allocate(&format!("vm{i}")).await.unwrap()
        }));
    }
    let got: HashSet<Ipv4Addr> = futures::future::join_all(tasks)
        .await
        .into_iter()
        .map(|r| r.unwrap())
        .collect();

    assert_eq!(got.len(), 20);
    assert_eq!(a.list_allocations().await.unwrap().len(), 20);
}

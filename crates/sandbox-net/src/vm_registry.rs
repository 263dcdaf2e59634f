//! In-memory map of guest IP to owning run, consulted by the intercepting
//! proxy for every connection.
//!
//! The map is authoritative and never persisted. When a publish path is set,
//! a JSON snapshot is rewritten atomically after each change so the proxy
//! process can pick it up; the snapshot is never read back.

use std::collections::{BTreeMap, HashMap};
use std::net::Ipv4Addr;
use std::path::PathBuf;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::Result;
use crate::persist::write_atomic_async;

/// Verdict of a firewall rule.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RuleAction {
    Allow,
    Deny,
}

/// One egress rule. Exactly one of `domain` or `ip` is normally set;
/// `domain` may carry a leading `*.` wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallRule {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,
    pub action: RuleAction,
}

impl FirewallRule {
    pub fn allow_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into()),
            ip: None,
            action: RuleAction::Allow,
        }
    }

    pub fn deny_domain(domain: impl Into<String>) -> Self {
        Self {
            domain: Some(domain.into()),
            ip: None,
            action: RuleAction::Deny,
        }
    }
}

/// Optional parts of a registration.
#[derive(Debug, Clone, Default)]
pub struct RegisterOptions {
    pub firewall_rules: Option<Vec<FirewallRule>>,
    /// Full TLS interception rather than SNI-only filtering
    pub mitm_enabled: bool,
    pub seal_secrets_enabled: bool,
}

/// What the proxy needs to know about one guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VmRegistration {
    pub guest_ip: Ipv4Addr,
    pub run_id: String,
    pub sandbox_token: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall_rules: Option<Vec<FirewallRule>>,
    pub mitm_enabled: bool,
    pub seal_secrets_enabled: bool,
    pub registered_at: DateTime<Utc>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct Snapshot<'a> {
    vms: BTreeMap<Ipv4Addr, &'a VmRegistration>,
    updated_at: DateTime<Utc>,
}

/// Registry of live VMs with network isolation enabled.
#[derive(Debug, Default)]
pub struct VmNetworkRegistry {
    vms: RwLock<HashMap<Ipv4Addr, VmRegistration>>,
    publish_path: Option<PathBuf>,
}

impl VmNetworkRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Also publish a snapshot to `path` after every change.
    pub fn with_publish_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.publish_path = Some(path.into());
        self
    }

    /// Record that `guest_ip` belongs to `run_id`. Re-registering an address
    /// replaces the previous entry.
    pub async fn register(
        &self,
        guest_ip: Ipv4Addr,
        run_id: &str,
        sandbox_token: &str,
        opts: RegisterOptions,
    ) -> Result<()> {
        let registration = VmRegistration {
            guest_ip,
            run_id: run_id.to_string(),
            sandbox_token: sandbox_token.to_string(),
            firewall_rules: opts.firewall_rules,
            mitm_enabled: opts.mitm_enabled,
            seal_secrets_enabled: opts.seal_secrets_enabled,
            registered_at: Utc::now(),
        };

        let mut vms = self.vms.write().await;
        if let Some(previous) = vms.insert(guest_ip, registration) {
            warn!(
                %guest_ip,
                previous_run = %previous.run_id,
                run_id,
                "replaced stale VM registration"
            );
        }
        debug!(%guest_ip, run_id, "registered VM for proxying");
        self.publish(&vms).await
    }

    /// Forget `guest_ip`. Unregistering an unknown address is a no-op.
    pub async fn unregister(&self, guest_ip: Ipv4Addr) -> Result<()> {
        let mut vms = self.vms.write().await;
        if vms.remove(&guest_ip).is_none() {
            return Ok(());
        }
        debug!(%guest_ip, "unregistered VM");
        self.publish(&vms).await
    }

    pub async fn lookup(&self, guest_ip: Ipv4Addr) -> Option<VmRegistration> {
        self.vms.read().await.get(&guest_ip).cloned()
    }

    pub async fn len(&self) -> usize {
        self.vms.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.vms.read().await.is_empty()
    }

    /// Written while the caller still holds the write lock, so snapshots
    /// land in mutation order.
    async fn publish(&self, vms: &HashMap<Ipv4Addr, VmRegistration>) -> Result<()> {
        let Some(path) = &self.publish_path else {
            return Ok(());
        };
        let snapshot = Snapshot {
            vms: vms.iter().map(|(ip, r)| (*ip, r)).collect(),
            updated_at: Utc::now(),
        };
        let bytes = serde_json::to_vec_pretty(&snapshot)?;
        write_atomic_async(path, bytes).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const GUEST: Ipv4Addr = Ipv4Addr::new(172, 16, 0, 2);

    #[tokio::test]
    async fn test_register_lookup_unregister() {
        let registry = VmNetworkRegistry::new();
        registry
            .register(
                GUEST,
                "run-1",
                "tok",
                RegisterOptions {
                    firewall_rules: Some(vec![FirewallRule::allow_domain("*.github.com")]),
                    mitm_enabled: true,
                    seal_secrets_enabled: false,
                },
            )
            .await
            .unwrap();

        let found = registry.lookup(GUEST).await.unwrap();
        assert_eq!(found.run_id, "run-1");
        assert!(found.mitm_enabled);
        assert_eq!(found.firewall_rules.unwrap().len(), 1);

        registry.unregister(GUEST).await.unwrap();
        assert!(registry.lookup(GUEST).await.is_none());
        assert!(registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_unregister_unknown_is_noop() {
        let registry = VmNetworkRegistry::new();
        registry.unregister(GUEST).await.unwrap();
        assert_eq!(registry.len().await, 0);
    }

    #[tokio::test]
    async fn test_publish_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("proxy-registry.json");
        let registry = VmNetworkRegistry::new().with_publish_path(&path);

        registry
            .register(GUEST, "run-1", "tok", RegisterOptions::default())
            .await
            .unwrap();
        let doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert_eq!(doc["vms"]["172.16.0.2"]["runId"], "run-1");
        assert_eq!(doc["vms"]["172.16.0.2"]["mitmEnabled"], false);
        assert!(doc["updatedAt"].is_string());

        registry.unregister(GUEST).await.unwrap();
        let doc: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(doc["vms"].as_object().unwrap().is_empty());
    }

    #[test]
    fn test_rule_wire_shape() {
        let json = serde_json::to_value(FirewallRule::deny_domain("evil.example")).unwrap();
        assert_eq!(
            json,
            serde_json::json!({ "domain": "evil.example", "action": "deny" })
        );
    }
}

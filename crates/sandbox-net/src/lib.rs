//! Sandbox-Net: host networking for the sandbox runner
//!
//! Hands each microVM an isolated network identity and tracks which run owns
//! which guest address.
//!
//! ## Layer 0 - Host resources
//!
//! Focus: crash safety, cross-process exclusivity, and leak-free rollback.
//!
//! ## Key Components
//!
//! - `IpRegistry`: lock-protected, on-disk guest address leases
//! - `TapPool`: pre-warmed TAP devices with on-demand overflow
//! - `VmNetworkRegistry`: guest IP to run mapping consumed by the proxy
//! - `FirewallRules`: host redirection of guest web traffic to the proxy

pub mod command;
mod error;
pub mod fakes;
pub mod firewall;
pub mod host;
pub mod ip_registry;
pub mod lock;
pub mod mac;
mod persist;
pub mod tap_pool;
pub mod vm_registry;

pub use command::{CommandError, Privilege};
pub use error::{NetError, Result};
pub use firewall::{FirewallRules, IptablesRedirect};
pub use host::{IpLinkHost, TapHost};
pub use ip_registry::{IpAllocation, IpRegistry, IpRegistryConfig, IpRegistryDocument};
pub use lock::{FlockLock, LockGuard, RegistryLock};
pub use mac::MacAddr;
pub use tap_pool::{DeviceKind, NetworkConfig, TapPool, TapPoolConfig};
pub use vm_registry::{FirewallRule, RegisterOptions, RuleAction, VmNetworkRegistry, VmRegistration};

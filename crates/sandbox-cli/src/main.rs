//! Sandbox Runner - operator CLI
//!
//! The `sandbox-runner` command inspects and repairs the host networking
//! state shared by runner processes.
//!
//! ## Commands
//!
//! - `allocations`: List guest address leases
//! - `lookup`: Find the address leased to a VM
//! - `release`: Drop one lease
//! - `gc`: Remove leases whose TAP device is gone
//! - `purge-taps`: Delete runner TAP devices that hold no lease

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sandbox_core::{init_tracing, RunnerConfig};
use sandbox_net::{FlockLock, IpLinkHost, IpRegistry, IpRegistryConfig, TapHost};
use tracing::{info, warn, Level};

#[derive(Parser)]
#[command(name = "sandbox-runner")]
#[command(author = "Stevedores Org")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Sandbox runner host networking tools", long_about = None)]
struct Cli {
    /// Runner config file (TOML); `SANDBOX_*` variables override it
    #[arg(short, long, global = true, env = "SANDBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// List guest address leases
    Allocations {
        /// Print the raw registry document
        #[arg(long)]
        raw: bool,
    },

    /// Find the address leased to a VM
    Lookup {
        /// VM id (first segment of the run id)
        #[arg(long)]
        vm: String,
    },

    /// Release one guest address
    Release {
        address: Ipv4Addr,
    },

    /// Remove leases whose TAP device no longer exists
    Gc,

    /// Delete runner TAP devices that hold no lease. Free pool devices
    /// also hold none, so run this only while no runner is active.
    PurgeTaps {
        /// Only print what would be deleted
        #[arg(long)]
        dry_run: bool,
    },
}

struct Host {
    registry: IpRegistry,
    taps: Arc<dyn TapHost>,
    device_prefix: String,
}

impl Host {
    fn from_config(config: &RunnerConfig) -> Self {
        let network = &config.network;
        let mut ip_link = IpLinkHost::new();
        if let Some(bridge) = &network.bridge {
            ip_link = ip_link.with_bridge(bridge.clone());
        }
        if let Some(owner) = &network.tap_owner {
            ip_link = ip_link.with_owner(owner.clone());
        }
        let taps: Arc<dyn TapHost> = Arc::new(ip_link);

        let registry = IpRegistry::new(
            IpRegistryConfig::new(network.registry_path.clone())
                .with_subnet(network.subnet)
                .with_orphan_grace(network.orphan_grace()),
            Arc::new(FlockLock::new(network.lock_path())),
            taps.clone(),
        );

        Self {
            registry,
            taps,
            device_prefix: network.tap_prefix.clone(),
        }
    }

    /// `{prefix}{index}` names only.
    fn is_runner_device(&self, name: &str) -> bool {
        name.strip_prefix(self.device_prefix.as_str())
            .is_some_and(|index| !index.is_empty() && index.bytes().all(|b| b.is_ascii_digit()))
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };
    init_tracing(cli.json, level);

    let config = RunnerConfig::load(cli.config.as_deref()).context("Failed to load runner config")?;
    let host = Host::from_config(&config);

    match cli.command {
        Commands::Allocations { raw } => cmd_allocations(&host, raw).await,
        Commands::Lookup { vm } => cmd_lookup(&host, &vm).await,
        Commands::Release { address } => cmd_release(&host, address).await,
        Commands::Gc => cmd_gc(&host).await,
        Commands::PurgeTaps { dry_run } => cmd_purge_taps(&host, dry_run).await,
    }
}

async fn cmd_allocations(host: &Host, raw: bool) -> Result<()> {
    let allocations = host
        .registry
        .list_allocations()
        .await
        .context("Failed to read IP registry")?;

    if raw {
        let doc = serde_json::json!({ "allocations": allocations });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(());
    }

    if allocations.is_empty() {
        println!("No allocations");
        return Ok(());
    }

    println!("{:<16} {:<12} {:<12} ALLOCATED", "ADDRESS", "DEVICE", "VM");
    for (address, allocation) in &allocations {
        println!(
            "{:<16} {:<12} {:<12} {}",
            address.to_string(),
            allocation.tap_device,
            allocation.vm_id.as_deref().unwrap_or("-"),
            allocation
                .allocated_at
                .map(|t| t.to_rfc3339())
                .unwrap_or_else(|| "-".to_string()),
        );
    }
    println!(
        "{} of {} addresses leased",
        allocations.len(),
        host.registry.config().capacity()
    );
    Ok(())
}

async fn cmd_lookup(host: &Host, vm_id: &str) -> Result<()> {
    match host.registry.find_address_for_vm(vm_id).await? {
        Some(address) => {
            println!("{address}");
            Ok(())
        }
        None => anyhow::bail!("No address leased to VM {vm_id}"),
    }
}

async fn cmd_release(host: &Host, address: Ipv4Addr) -> Result<()> {
    host.registry
        .release(address)
        .await
        .with_context(|| format!("Failed to release {address}"))?;
    info!(%address, "released");
    println!("Released {address}");
    Ok(())
}

async fn cmd_gc(host: &Host) -> Result<()> {
    let removed = host
        .registry
        .cleanup_orphaned()
        .await
        .context("Orphan cleanup failed")?;
    println!("Removed {removed} orphaned allocation(s)");
    Ok(())
}

async fn cmd_purge_taps(host: &Host, dry_run: bool) -> Result<()> {
    let leased: Vec<String> = host
        .registry
        .list_allocations()
        .await?
        .into_values()
        .map(|a| a.tap_device)
        .collect();

    let stale: Vec<String> = host
        .taps
        .list_devices()
        .await
        .context("Failed to list host devices")?
        .into_iter()
        .filter(|name| host.is_runner_device(name) && !leased.contains(name))
        .collect();

    if stale.is_empty() {
        println!("No stale TAP devices");
        return Ok(());
    }

    let mut deleted = 0;
    for name in &stale {
        if dry_run {
            println!("would delete {name}");
            continue;
        }
        match host.taps.delete_tap(name).await {
            Ok(()) => {
                deleted += 1;
                println!("deleted {name}");
            }
            Err(e) => warn!(device = %name, error = %e, "failed to delete TAP device"),
        }
    }
    if !dry_run {
        println!("Deleted {deleted} of {} stale TAP device(s)", stale.len());
    }
    Ok(())
}

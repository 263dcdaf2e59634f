//! Runner process wiring.
//!
//! [`Runner`] is the composition root: it turns a [`RunnerConfig`] into a
//! live [`JobExecutor`] with a warm TAP pool, keeps a background sweep of
//! orphaned address leases running, and tears the host state down on
//! [`Runner::shutdown`].
//!
//! The hypervisor is the one seam the config cannot build, so callers pass
//! their [`VmFactory`] in.

use std::sync::Arc;
use std::time::Duration;

use sandbox_net::{
    FirewallRules, FlockLock, IpLinkHost, IpRegistry, IpRegistryConfig, IptablesRedirect,
    RegistryLock, TapHost, TapPool, TapPoolConfig, VmNetworkRegistry,
};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::config::RunnerConfig;
use crate::context::{ExecutionContext, ExecutionResult};
use crate::control_plane::{ControlPlane, HttpControlPlane};
use crate::error::Result;
use crate::executor::{Collaborators, JobExecutor};
use crate::guest::GuestScripts;
use crate::metrics::METRICS;
use crate::ssh::{OpenSshFactory, ShellFactory};
use crate::vm::VmFactory;

/// The seams that reach outside the process.
#[derive(Clone)]
pub struct HostAdapters {
    pub taps: Arc<dyn TapHost>,
    pub lock: Arc<dyn RegistryLock>,
    pub firewall: Arc<dyn FirewallRules>,
    pub vms: Arc<dyn VmFactory>,
    pub shells: Arc<dyn ShellFactory>,
    pub control_plane: Arc<dyn ControlPlane>,
}

impl HostAdapters {
    /// `ip link`, `flock`, `iptables`, the system `ssh` client and HTTP
    /// webhooks, configured from `config`.
    pub fn from_config(config: &RunnerConfig, vms: Arc<dyn VmFactory>) -> Result<Self> {
        let network = &config.network;
        let mut ip_link = IpLinkHost::new();
        if let Some(bridge) = &network.bridge {
            ip_link = ip_link.with_bridge(bridge.clone());
        }
        if let Some(owner) = &network.tap_owner {
            ip_link = ip_link.with_owner(owner.clone());
        }

        Ok(Self {
            taps: Arc::new(ip_link),
            lock: Arc::new(FlockLock::new(network.lock_path())),
            firewall: Arc::new(IptablesRedirect::new(network.proxy_port)),
            vms,
            shells: Arc::new(OpenSshFactory::new(config.ssh.clone())),
            control_plane: Arc::new(HttpControlPlane::new(config.api.base_url.clone())?),
        })
    }
}

/// A started runner: warm pool, orphan sweep, and the executor jobs run on.
pub struct Runner {
    registry: Arc<IpRegistry>,
    pool: Arc<TapPool>,
    vm_registry: Arc<VmNetworkRegistry>,
    executor: Arc<JobExecutor>,
    stop: watch::Sender<bool>,
    sweeper: Option<JoinHandle<()>>,
}

impl Runner {
    /// Build production adapters, load the guest scripts and start.
    pub async fn from_config(config: RunnerConfig, vms: Arc<dyn VmFactory>) -> Result<Self> {
        let adapters = HostAdapters::from_config(&config, vms)?;
        let scripts = GuestScripts::load_dir(&config.execution.scripts_dir)?;
        Self::start(config, scripts, adapters).await
    }

    /// Create the pooled devices and start the orphan sweep.
    ///
    /// Script and config problems are reported before any host device is
    /// created.
    pub async fn start(
        config: RunnerConfig,
        scripts: GuestScripts,
        adapters: HostAdapters,
    ) -> Result<Self> {
        let network = config.network.clone();

        let registry = Arc::new(IpRegistry::new(
            IpRegistryConfig::new(network.registry_path.clone())
                .with_subnet(network.subnet)
                .with_orphan_grace(network.orphan_grace()),
            adapters.lock,
            adapters.taps.clone(),
        ));
        let pool = Arc::new(TapPool::new(
            TapPoolConfig {
                device_prefix: network.tap_prefix.clone(),
                replenish_threshold: network.replenish_threshold,
                auto_replenish: true,
            },
            adapters.taps,
            Arc::clone(&registry),
        ));
        let vm_registry = Arc::new(match &network.proxy_registry_path {
            Some(path) => VmNetworkRegistry::new().with_publish_path(path.clone()),
            None => VmNetworkRegistry::new(),
        });

        let executor = JobExecutor::new(
            config,
            scripts,
            Collaborators {
                pool: Arc::clone(&pool),
                vm_registry: Arc::clone(&vm_registry),
                firewall: adapters.firewall,
                vms: adapters.vms,
                shells: adapters.shells,
                control_plane: adapters.control_plane,
            },
        )?;

        pool.init(network.pool_size).await?;

        let (stop, stopped) = watch::channel(false);
        let sweeper = tokio::spawn(sweep_orphans(
            Arc::clone(&registry),
            network.orphan_sweep_interval(),
            stopped,
        ));

        info!(
            pool_size = network.pool_size,
            subnet = %network.subnet,
            sweep_secs = network.orphan_sweep_secs,
            "runner started"
        );
        Ok(Self {
            registry,
            pool,
            vm_registry,
            executor: Arc::new(executor),
            stop,
            sweeper: Some(sweeper),
        })
    }

    pub fn executor(&self) -> Arc<JobExecutor> {
        Arc::clone(&self.executor)
    }

    pub fn registry(&self) -> &Arc<IpRegistry> {
        &self.registry
    }

    pub fn pool(&self) -> &Arc<TapPool> {
        &self.pool
    }

    pub fn vm_registry(&self) -> &Arc<VmNetworkRegistry> {
        &self.vm_registry
    }

    pub async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        self.executor.execute(ctx).await
    }

    /// Run a single job and shut down, logging wall time. Used for
    /// benchmark runs, where the result is the whole point of the process.
    pub async fn run_once(self, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let started = Instant::now();
        let result = self.execute(ctx).await;
        let total_ms = started.elapsed().as_millis() as u64;
        match &result {
            Ok(r) => info!(total_ms, exit_code = r.exit_code, "single run complete"),
            Err(e) => warn!(total_ms, error = %e, "single run failed"),
        }
        self.shutdown().await;
        result
    }

    /// Stop the sweep, delete the pooled devices and flush metrics.
    pub async fn shutdown(mut self) {
        // Err only when the sweep already exited.
        let _ = self.stop.send(true);
        if let Some(handle) = self.sweeper.take() {
            if let Err(e) = handle.await {
                warn!(error = %e, "orphan sweep task aborted");
            }
        }
        self.pool.cleanup().await;
        METRICS.flush();
        info!("runner stopped");
    }
}

/// Remove orphaned leases every `period` until `stopped` flips. The first
/// sweep runs immediately, clearing leftovers from an earlier process.
async fn sweep_orphans(
    registry: Arc<IpRegistry>,
    period: Duration,
    mut stopped: watch::Receiver<bool>,
) {
    let mut ticker = tokio::time::interval(period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = ticker.tick() => match registry.cleanup_orphaned().await {
                Ok(0) => debug!("no orphaned leases"),
                Ok(removed) => info!(removed, "orphan sweep removed leases"),
                Err(e) => warn!(error = %e, "orphan sweep failed"),
            },
            _ = stopped.changed() => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fakes::FakeVmFactory;

    #[test]
    fn test_production_adapters_from_default_config() {
        let adapters =
            HostAdapters::from_config(&RunnerConfig::default(), Arc::new(FakeVmFactory::new()));
        assert!(adapters.is_ok());
        assert_eq!(
            adapters.unwrap().control_plane.heartbeat_url(),
            "http://localhost:3000/api/webhooks/agent/heartbeat"
        );
    }
}

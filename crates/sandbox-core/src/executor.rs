//! Drives one job through a microVM, from boot to teardown.
//!
//! ```text
//! Booting -> AwaitingSsh -> Provisioning -> Running -> Polling
//!   -> Completed | Failed | TimedOut -> CleaningUp -> Done
//! ```
//!
//! Job failures never escape [`JobExecutor::execute`]: they become an
//! [`ExecutionResult`] with exit code 1. Cleanup runs exactly once per job,
//! driven by what was actually set up, and each cleanup step runs even if
//! an earlier one failed.

use std::fmt;
use std::net::Ipv4Addr;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;
use sandbox_net::{
    DeviceKind, FirewallRules, NetworkConfig, RegisterOptions, TapPool, VmNetworkRegistry,
};
use tokio::time::Instant;
use tracing::{info, warn, Instrument};

use crate::config::{is_file_name_safe, RunnerConfig};
use crate::context::{ExecutionContext, ExecutionResult};
use crate::control_plane::ControlPlane;
use crate::env::build_guest_env;
use crate::error::{ExecutorError, JobError, Result};
use crate::guest::{self, GuestScripts};
use crate::metrics::METRICS;
use crate::network_log::upload_network_log;
use crate::obs;
use crate::poll::{poll_completion, PollOutcome, PollSettings};
use crate::preflight::run_preflight;
use crate::session::{parent_dir, session_history_path};
use crate::ssh::{shell_quote, GuestShell, ShellFactory, SshError};
use crate::vm::{MicroVm, VmConfig, VmFactory};

/// Upper bound for the guest-side storage download.
const STORAGE_DOWNLOAD_TIMEOUT: Duration = Duration::from_secs(30 * 60);
/// Log lines attached to a non-zero exit.
const FAILURE_LOG_LINES: usize = 50;

/// Where a job is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobPhase {
    Booting,
    AwaitingSsh,
    Provisioning,
    Running,
    Polling,
    Completed,
    Failed,
    TimedOut,
    CleaningUp,
    Done,
}

impl fmt::Display for JobPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            JobPhase::Booting => "booting",
            JobPhase::AwaitingSsh => "awaiting_ssh",
            JobPhase::Provisioning => "provisioning",
            JobPhase::Running => "running",
            JobPhase::Polling => "polling",
            JobPhase::Completed => "completed",
            JobPhase::Failed => "failed",
            JobPhase::TimedOut => "timed_out",
            JobPhase::CleaningUp => "cleaning_up",
            JobPhase::Done => "done",
        };
        f.write_str(name)
    }
}

/// Shared services every job uses.
#[derive(Clone)]
pub struct Collaborators {
    pub pool: Arc<TapPool>,
    pub vm_registry: Arc<VmNetworkRegistry>,
    pub firewall: Arc<dyn FirewallRules>,
    pub vms: Arc<dyn VmFactory>,
    pub shells: Arc<dyn ShellFactory>,
    pub control_plane: Arc<dyn ControlPlane>,
}

/// What a job has set up so far, and so what cleanup must undo.
#[derive(Default)]
struct Setup {
    network: Option<NetworkConfig>,
    vm: Option<Arc<dyn MicroVm>>,
    redirected: Option<Ipv4Addr>,
    registered: Option<Ipv4Addr>,
}

/// Runs jobs. Cheap to share; each [`JobExecutor::execute`] call is an
/// independent job.
pub struct JobExecutor {
    config: Arc<RunnerConfig>,
    scripts: Arc<GuestScripts>,
    services: Collaborators,
}

impl JobExecutor {
    /// Fails if the scripts do not include the configured entrypoint.
    pub fn new(
        config: RunnerConfig,
        scripts: GuestScripts,
        services: Collaborators,
    ) -> Result<Self> {
        if !scripts.contains(&config.execution.entrypoint) {
            return Err(ExecutorError::MissingScript(
                config.execution.entrypoint.clone(),
            ));
        }
        Ok(Self {
            config: Arc::new(config),
            scripts: Arc::new(scripts),
            services,
        })
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Run one job to completion.
    ///
    /// Only host misconfiguration (such as a missing proxy CA certificate)
    /// is returned as an error, and always before anything is set up.
    pub async fn execute(&self, ctx: &ExecutionContext) -> Result<ExecutionResult> {
        let vm_id = ctx.short_vm_id().to_string();
        let span = obs::job_span(&ctx.run_id, &vm_id);
        self.execute_in_span(ctx, &vm_id).instrument(span).await
    }

    async fn execute_in_span(
        &self,
        ctx: &ExecutionContext,
        vm_id: &str,
    ) -> Result<ExecutionResult> {
        // The run id names host files (VM work dir, network log).
        if !is_file_name_safe(&ctx.run_id) {
            warn!("rejecting job with unusable run id");
            return Ok(ExecutionResult::failure(format!(
                "run id {:?} is not a valid file name",
                ctx.run_id
            )));
        }

        let ca_cert = if ctx.mitm_enabled() {
            Some(self.load_ca_cert().await?)
        } else {
            None
        };

        METRICS.inc_started();
        obs::emit_job_started(&ctx.run_id, ctx.agent_type.as_str(), ctx.network_isolation());
        let started = Instant::now();

        let mut setup = Setup::default();
        let outcome = AssertUnwindSafe(self.run_job(ctx, vm_id, ca_cert.as_deref(), &mut setup))
            .catch_unwind()
            .await
            .unwrap_or_else(|_| {
                Err(JobError::Provisioning {
                    step: "internal",
                    detail: "job flow panicked".to_string(),
                })
            });

        let (phase, result) = match outcome {
            Ok(result) if result.is_success() => {
                METRICS.inc_completed();
                (JobPhase::Completed, result)
            }
            Ok(result) => {
                METRICS.inc_failed();
                (JobPhase::Failed, result)
            }
            Err(err) => {
                let phase = match &err {
                    JobError::TimedOut(_) => {
                        METRICS.inc_timed_out();
                        JobPhase::TimedOut
                    }
                    JobError::Crashed(_) => {
                        METRICS.inc_crashed();
                        JobPhase::Failed
                    }
                    _ => {
                        METRICS.inc_failed();
                        JobPhase::Failed
                    }
                };
                warn!(error = %err, "job failed");
                let result = ExecutionResult::failure(err.to_string());
                self.report_completion(ctx, &result).await;
                (phase, result)
            }
        };
        obs::emit_phase(phase);

        obs::emit_phase(JobPhase::CleaningUp);
        self.cleanup(ctx, setup).await;
        obs::emit_phase(JobPhase::Done);

        obs::emit_job_finished(&ctx.run_id, phase, result.exit_code, started.elapsed());
        Ok(result)
    }

    async fn load_ca_cert(&self) -> Result<Vec<u8>> {
        let path = &self.config.network.ca_cert_path;
        tokio::fs::read(path)
            .await
            .map_err(|_| ExecutorError::MissingCaCert { path: path.clone() })
    }

    /// Boot through polling. `Ok` means the guest wrote its sentinel.
    async fn run_job(
        &self,
        ctx: &ExecutionContext,
        vm_id: &str,
        ca_cert: Option<&[u8]>,
        setup: &mut Setup,
    ) -> std::result::Result<ExecutionResult, JobError> {
        // Booting
        obs::emit_phase(JobPhase::Booting);
        let network = self.services.pool.acquire(vm_id).await?;
        if self.services.pool.kind_of(&network.tap_device).await == Some(DeviceKind::OnDemand) {
            METRICS.inc_on_demand_taps();
        }
        setup.network = Some(network.clone());

        let vm = self.services.vms.create(vm_id);
        setup.vm = Some(Arc::clone(&vm));
        vm.start(&VmConfig::new(vm_id, &self.config.vm, network)).await?;
        let guest_ip = vm
            .guest_ip()
            .ok_or_else(|| JobError::NoGuestIp(vm_id.to_string()))?;
        info!(%guest_ip, "VM booted");

        // AwaitingSsh
        obs::emit_phase(JobPhase::AwaitingSsh);
        let shell = self.services.shells.connect(guest_ip);
        let ssh = &self.config.ssh;
        shell
            .wait_until_reachable(ssh.reachable_timeout(), ssh.reachable_interval())
            .await
            .map_err(|e| match e {
                SshError::Unreachable(timeout) => JobError::SshTimeout(timeout),
                other => other.into(),
            })?;

        // Provisioning
        obs::emit_phase(JobPhase::Provisioning);
        if let Some(firewall) = &ctx.firewall {
            self.services.firewall.install(guest_ip).await?;
            setup.redirected = Some(guest_ip);

            self.services
                .vm_registry
                .register(
                    guest_ip,
                    &ctx.run_id,
                    &ctx.sandbox_token,
                    RegisterOptions {
                        firewall_rules: Some(firewall.rules.clone()),
                        mitm_enabled: firewall.mitm,
                        seal_secrets_enabled: firewall.seal_secrets,
                    },
                )
                .await?;
            setup.registered = Some(guest_ip);

            if let Some(pem) = ca_cert {
                install_ca_cert(shell.as_ref(), pem).await?;
            }
        }
        self.configure_dns(shell.as_ref()).await?;
        self.push_scripts(shell.as_ref()).await?;
        if ctx.storage_manifest.is_some() {
            self.download_storage(shell.as_ref(), ctx).await?;
        }
        if ctx.resume_session.is_some() {
            self.restore_session(shell.as_ref(), ctx).await?;
        }
        self.write_env(shell.as_ref(), ctx).await?;
        if self.config.execution.preflight {
            run_preflight(
                shell.as_ref(),
                &self.services.control_plane.heartbeat_url(),
                &ctx.run_id,
                &ctx.sandbox_token,
            )
            .await?;
        }

        // Running
        obs::emit_phase(JobPhase::Running);
        self.launch(shell.as_ref()).await?;

        // Polling
        obs::emit_phase(JobPhase::Polling);
        let settings = PollSettings {
            interval: self.config.execution.poll_interval(),
            ceiling: self.config.execution.max_runtime(),
            unreachable_limit: self.config.execution.unreachable_limit,
        };
        match poll_completion(shell.as_ref(), settings).await {
            PollOutcome::Exited(0) => Ok(ExecutionResult::success()),
            PollOutcome::Exited(code) => {
                let tail = log_tail(shell.as_ref()).await;
                let error = if tail.is_empty() {
                    format!("agent exited with code {code}")
                } else {
                    tail
                };
                Ok(ExecutionResult {
                    exit_code: code,
                    error: Some(error),
                })
            }
            PollOutcome::Crashed(diagnosis) => Err(JobError::Crashed(diagnosis)),
            PollOutcome::TimedOut(ceiling) => Err(JobError::TimedOut(ceiling)),
        }
    }

    /// Guest images may reset the resolver at boot, so it is always rewritten.
    async fn configure_dns(&self, shell: &dyn GuestShell) -> std::result::Result<(), JobError> {
        let resolv: String = self
            .config
            .network
            .dns_servers
            .iter()
            .map(|ns| format!("nameserver {ns}\n"))
            .collect();
        shell
            .write_file_with_sudo(guest::RESOLV_CONF, resolv.as_bytes())
            .await
            .map_err(|e| JobError::provisioning("dns", e))
    }

    async fn push_scripts(&self, shell: &dyn GuestShell) -> std::result::Result<(), JobError> {
        let mut paths = Vec::with_capacity(self.scripts.len());
        for script in self.scripts.iter() {
            let path = guest::script_path(&script.name);
            shell
                .write_file_with_sudo(&path, &script.content)
                .await
                .map_err(|e| JobError::provisioning("scripts", e))?;
            paths.push(shell_quote(&path));
        }
        if !paths.is_empty() {
            shell
                .exec_or_throw(&format!("sudo chmod 755 {}", paths.join(" ")))
                .await
                .map_err(|e| JobError::provisioning("scripts", e))?;
        }
        Ok(())
    }

    async fn download_storage(
        &self,
        shell: &dyn GuestShell,
        ctx: &ExecutionContext,
    ) -> std::result::Result<(), JobError> {
        let manifest = serde_json::to_vec(&ctx.storage_manifest)
            .map_err(|e| JobError::provisioning("storage", e))?;
        shell
            .write_file(guest::STORAGE_MANIFEST_FILE, &manifest)
            .await
            .map_err(|e| JobError::provisioning("storage", e))?;

        let command = format!(
            "{} {}",
            shell_quote(&guest::script_path(&self.config.execution.download_script)),
            shell_quote(guest::STORAGE_MANIFEST_FILE)
        );
        let output = shell
            .exec(&command, Some(STORAGE_DOWNLOAD_TIMEOUT))
            .await
            .map_err(|e| JobError::provisioning("storage", e))?;
        if !output.success() {
            let detail = if output.stderr.trim().is_empty() {
                output.stdout.trim()
            } else {
                output.stderr.trim()
            };
            return Err(JobError::StorageDownload {
                exit_code: output.exit_code,
                output: detail.to_string(),
            });
        }
        Ok(())
    }

    async fn restore_session(
        &self,
        shell: &dyn GuestShell,
        ctx: &ExecutionContext,
    ) -> std::result::Result<(), JobError> {
        let Some(resume) = &ctx.resume_session else {
            return Ok(());
        };
        let path = session_history_path(
            ctx.agent_type,
            &self.config.execution.guest_home,
            &ctx.working_dir,
            &resume.session_id,
        );
        shell
            .exec_or_throw(&format!("mkdir -p {}", shell_quote(parent_dir(&path))))
            .await
            .map_err(|e| JobError::provisioning("resume", e))?;
        shell
            .write_file(&path, resume.history.as_bytes())
            .await
            .map_err(|e| JobError::provisioning("resume", e))?;
        info!(session_id = %resume.session_id, %path, "restored session history");
        Ok(())
    }

    async fn write_env(
        &self,
        shell: &dyn GuestShell,
        ctx: &ExecutionContext,
    ) -> std::result::Result<(), JobError> {
        let env = build_guest_env(ctx, &self.config.api.base_url);
        let payload = serde_json::to_vec(&env).map_err(|e| JobError::provisioning("env", e))?;
        shell
            .write_file(guest::ENV_FILE, &payload)
            .await
            .map_err(|e| JobError::provisioning("env", e))
    }

    /// Start the entrypoint detached. It writes its exit code to the
    /// sentinel through a rename so a reader never sees a partial value.
    async fn launch(&self, shell: &dyn GuestShell) -> std::result::Result<(), JobError> {
        shell
            .exec_or_throw(&launch_command(&self.config.execution.entrypoint))
            .await
            .map_err(|e| JobError::provisioning("launch", e))?;
        Ok(())
    }

    /// Tell the control plane about a failure the guest never reported.
    async fn report_completion(&self, ctx: &ExecutionContext, result: &ExecutionResult) {
        if self.config.execution.benchmark {
            return;
        }
        if let Err(e) = self
            .services
            .control_plane
            .post_complete(
                &ctx.run_id,
                &ctx.sandbox_token,
                result.exit_code,
                result.error.as_deref(),
            )
            .await
        {
            warn!(error = %e, "failed to report job completion");
        }
    }

    /// Undo whatever `setup` records. Every step runs regardless of the
    /// others; failures are logged only.
    async fn cleanup(&self, ctx: &ExecutionContext, setup: Setup) {
        if let Some(ip) = setup.redirected {
            if let Err(e) = self.services.firewall.remove(ip).await {
                obs::emit_cleanup_error("firewall", &e);
            }
        }

        if let Some(ip) = setup.registered {
            if let Err(e) = self.services.vm_registry.unregister(ip).await {
                obs::emit_cleanup_error("vm_registry", &e);
            }
        }

        if ctx.network_isolation() && !self.config.execution.benchmark {
            if let Some(path) = self.config.network.network_log_path(&ctx.run_id) {
                if let Err(e) = upload_network_log(
                    &path,
                    &ctx.run_id,
                    &ctx.sandbox_token,
                    self.services.control_plane.as_ref(),
                )
                .await
                {
                    obs::emit_cleanup_error("network_log", &e);
                }
            }
        }

        if let Some(vm) = setup.vm {
            if let Err(e) = vm.kill().await {
                obs::emit_cleanup_error("vm", &e);
            }
        }

        // Released only after the VM is gone so the device is no longer in use.
        if let Some(network) = setup.network {
            if let Err(e) = self
                .services
                .pool
                .release(&network.tap_device, network.guest_ip)
                .await
            {
                obs::emit_cleanup_error("network", &e);
            }
        }
    }
}

async fn install_ca_cert(shell: &dyn GuestShell, pem: &[u8]) -> std::result::Result<(), JobError> {
    shell
        .write_file_with_sudo(guest::CA_CERT_FILE, pem)
        .await
        .map_err(|e| JobError::provisioning("ca-cert", e))?;
    shell
        .exec_or_throw("sudo update-ca-certificates > /dev/null 2>&1")
        .await
        .map_err(|e| JobError::provisioning("ca-cert", e))?;
    Ok(())
}

async fn log_tail(shell: &dyn GuestShell) -> String {
    let command = format!("tail -n {FAILURE_LOG_LINES} {} 2>/dev/null", guest::LOG_FILE);
    match shell.exec(&command, Some(Duration::from_secs(30))).await {
        Ok(out) => out.stdout.trim_end().to_string(),
        Err(_) => String::new(),
    }
}

/// Shell command that runs `entrypoint` in the background.
pub fn launch_command(entrypoint: &str) -> String {
    let inner = format!(
        "{entry} {env} > {log} 2>&1; echo $? > {exit}.tmp && mv {exit}.tmp {exit}",
        entry = shell_quote(&guest::script_path(entrypoint)),
        env = guest::ENV_FILE,
        log = guest::LOG_FILE,
        exit = guest::EXIT_CODE_FILE,
    );
    format!(
        "rm -f {exit} {pid}; nohup sh -c {inner} > /dev/null 2>&1 & echo $! > {pid}",
        exit = guest::EXIT_CODE_FILE,
        pid = guest::PID_FILE,
        inner = shell_quote(&inner),
    )
}

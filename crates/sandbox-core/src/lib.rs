//! Sandbox-Core: job execution for the sandbox runner
//!
//! Re-exports the components needed to run one agent job in a microVM.
//!
//! ## Layer 1 - Job lifecycle
//!
//! Focus: every job ends with exactly one result and exactly one cleanup.
//!
//! ## Key Components
//!
//! - `JobExecutor`: boot, provision, launch, poll, clean up
//! - `GuestShell` / `MicroVm` / `ControlPlane`: seams to the guest, the
//!   hypervisor and the control plane
//! - `RunnerConfig`: TOML configuration with `SANDBOX_*` overrides
//! - `Runner`: builds everything above from a `RunnerConfig`

pub mod config;
pub mod context;
pub mod control_plane;
pub mod env;
pub mod error;
pub mod executor;
pub mod fakes;
pub mod guest;
pub mod metrics;
pub mod network_log;
pub mod obs;
pub mod poll;
pub mod preflight;
pub mod runner;
pub mod session;
pub mod ssh;
pub mod telemetry;
pub mod vm;

pub use config::{
    ApiConfig, ConfigError, ExecutionSettings, NetworkSettings, RunnerConfig, SshSettings,
    VmSettings,
};
pub use context::{
    AgentType, ArtifactMount, ExecutionContext, ExecutionResult, FirewallConfig, ResumeSession,
    StorageManifest,
};
pub use control_plane::{ControlPlane, ControlPlaneError, HttpControlPlane};
pub use error::{ExecutorError, JobError, Result};
pub use executor::{Collaborators, JobExecutor, JobPhase};
pub use guest::{GuestScript, GuestScripts};
pub use poll::{CrashDiagnosis, CrashKind, PollOutcome, PollSettings};
pub use preflight::{PreflightFailure, PreflightKind};
pub use runner::{HostAdapters, Runner};
pub use ssh::{
    ExecOutput, GuestShell, OpenSshFactory, OpenSshShell, ShellFactory, SshError,
    DEFAULT_COMMAND_TIMEOUT,
};
pub use telemetry::init_tracing;
pub use vm::{MicroVm, VmConfig, VmError, VmFactory};

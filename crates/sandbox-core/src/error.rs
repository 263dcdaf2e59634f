//! Error taxonomy for job execution.

use std::path::PathBuf;
use std::time::Duration;

use sandbox_net::NetError;

use crate::config::ConfigError;
use crate::control_plane::ControlPlaneError;
use crate::poll::CrashDiagnosis;
use crate::preflight::PreflightFailure;
use crate::ssh::SshError;
use crate::vm::VmError;

/// Host misconfiguration. The only errors [`crate::JobExecutor`] returns.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("proxy CA certificate not found at {}", .path.display())]
    MissingCaCert { path: PathBuf },

    #[error("failed to load guest scripts from {}: {source}", .path.display())]
    Scripts {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("guest scripts are missing the {0} script")]
    MissingScript(String),

    #[error(transparent)]
    Config(#[from] ConfigError),

    /// Pool initialisation on the host
    #[error("host network setup failed: {0}")]
    Network(#[from] NetError),

    #[error(transparent)]
    ControlPlane(#[from] ControlPlaneError),
}

/// Job-intrinsic failures. Always converted into an
/// [`crate::ExecutionResult`], never returned to the caller.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    /// Includes IP pool exhaustion
    #[error("network setup failed: {0}")]
    Network(#[from] NetError),

    #[error(transparent)]
    Vm(#[from] VmError),

    #[error("VM {0} started without a guest IP")]
    NoGuestIp(String),

    #[error("SSH did not become reachable within {0:?}")]
    SshTimeout(Duration),

    #[error(transparent)]
    Ssh(#[from] SshError),

    #[error("provisioning failed at {step}: {detail}")]
    Provisioning { step: &'static str, detail: String },

    #[error("storage download failed with exit code {exit_code}: {output}")]
    StorageDownload { exit_code: i32, output: String },

    #[error("{0}")]
    Preflight(PreflightFailure),

    #[error("{0}")]
    Crashed(CrashDiagnosis),

    #[error("agent did not finish within {0:?}")]
    TimedOut(Duration),
}

impl JobError {
    /// Wrap a control channel error with the provisioning step it broke.
    pub fn provisioning(step: &'static str, err: impl std::fmt::Display) -> Self {
        JobError::Provisioning {
            step,
            detail: err.to_string(),
        }
    }
}

/// Result type for executor construction and misconfiguration.
pub type Result<T> = std::result::Result<T, ExecutorError>;

//! Guest-to-control-plane connectivity check.
//!
//! Before the agent starts, the guest POSTs to the heartbeat endpoint with
//! `curl`. A failing exit code is mapped to a cause an operator can act on.

use std::fmt;
use std::time::Duration;

use tracing::{debug, warn};

use crate::error::JobError;
use crate::ssh::{shell_quote, GuestShell};

/// Guest path of the generated curl config.
const CURL_CONFIG_FILE: &str = "/tmp/sandbox-preflight.curl";
const CURL_MAX_TIME_SECS: u64 = 10;

/// Classified curl failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PreflightKind {
    Dns,
    ConnectionRefused,
    Timeout,
    TlsTrust,
    HttpError,
    Other,
}

/// A failed preflight, with the raw curl exit code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PreflightFailure {
    pub kind: PreflightKind,
    pub curl_exit: i32,
}

impl PreflightFailure {
    /// Classify a curl exit code. `None` for success.
    pub fn from_curl_exit(code: i32) -> Option<Self> {
        let kind = match code {
            0 => return None,
            6 => PreflightKind::Dns,
            7 => PreflightKind::ConnectionRefused,
            28 => PreflightKind::Timeout,
            35 | 51 | 58 | 60 | 77 => PreflightKind::TlsTrust,
            22 => PreflightKind::HttpError,
            _ => PreflightKind::Other,
        };
        Some(Self {
            kind,
            curl_exit: code,
        })
    }

    pub fn cause(&self) -> &'static str {
        match self.kind {
            PreflightKind::Dns => "DNS resolution failed; check the guest resolver and upstream DNS",
            PreflightKind::ConnectionRefused => {
                "connection refused; the control plane is down or a firewall rejects the guest"
            }
            PreflightKind::Timeout => {
                "connection timed out; traffic from the guest is being dropped"
            }
            PreflightKind::TlsTrust => {
                "TLS verification failed; the guest does not trust the presented certificate"
            }
            PreflightKind::HttpError => "the control plane rejected the heartbeat request",
            PreflightKind::Other => "request failed",
        }
    }
}

impl fmt::Display for PreflightFailure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "connectivity preflight failed: {} (curl exit code {})",
            self.cause(),
            self.curl_exit
        )
    }
}

/// Quote a value for a curl config file.
fn curl_quote(value: &str) -> String {
    let mut out = String::with_capacity(value.len() + 2);
    out.push('"');
    for c in value.chars() {
        match c {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            c => out.push(c),
        }
    }
    out.push('"');
    out
}

/// Render the curl config for one heartbeat request.
pub fn curl_config(heartbeat_url: &str, run_id: &str, token: &str) -> String {
    let body = serde_json::json!({ "runId": run_id }).to_string();
    let lines = [
        format!("url = {}", curl_quote(heartbeat_url)),
        "request = \"POST\"".to_string(),
        format!("header = {}", curl_quote(&format!("Authorization: Bearer {token}"))),
        "header = \"Content-Type: application/json\"".to_string(),
        format!("data = {}", curl_quote(&body)),
        "output = \"/dev/null\"".to_string(),
        format!("max-time = {CURL_MAX_TIME_SECS}"),
        "silent".to_string(),
        "show-error".to_string(),
        "fail".to_string(),
    ];
    let mut config = lines.join("\n");
    config.push('\n');
    config
}

/// Run the heartbeat request from inside the guest.
pub async fn run_preflight(
    shell: &dyn GuestShell,
    heartbeat_url: &str,
    run_id: &str,
    token: &str,
) -> Result<(), JobError> {
    shell
        .write_file(CURL_CONFIG_FILE, curl_config(heartbeat_url, run_id, token).as_bytes())
        .await
        .map_err(|e| JobError::provisioning("preflight", e))?;

    let command = format!(
        "curl -K {config}; code=$?; rm -f {config}; exit $code",
        config = shell_quote(CURL_CONFIG_FILE)
    );
    let output = shell
        .exec(&command, Some(Duration::from_secs(CURL_MAX_TIME_SECS + 20)))
        .await?;

    match PreflightFailure::from_curl_exit(output.exit_code) {
        None => {
            debug!("connectivity preflight passed");
            Ok(())
        }
        Some(failure) => {
            warn!(
                curl_exit = failure.curl_exit,
                stderr = %output.stderr.trim(),
                "connectivity preflight failed"
            );
            Err(JobError::Preflight(failure))
        }
    }
}

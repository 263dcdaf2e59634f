//! Control plane webhooks used by the runner itself.
//!
//! The guest talks to the same endpoints on its own; the runner only posts
//! network logs and reports completions the guest could not report.

use std::time::Duration;

use async_trait::async_trait;
use serde::Serialize;
use tracing::debug;

/// Webhook errors.
#[derive(Debug, thiserror::Error)]
pub enum ControlPlaneError {
    #[error("request to {url} failed: {detail}")]
    Request { url: String, detail: String },

    #[error("{url} returned HTTP {status}")]
    Status { url: String, status: u16 },
}

/// Endpoints under `{base}/api/webhooks/agent`.
pub fn webhook_url(base_url: &str, endpoint: &str) -> String {
    format!("{}/api/webhooks/agent/{endpoint}", base_url.trim_end_matches('/'))
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct TelemetryBody<'a> {
    run_id: &'a str,
    network_logs: &'a [serde_json::Value],
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct CompleteBody<'a> {
    run_id: &'a str,
    exit_code: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<&'a str>,
}

/// Webhooks the runner calls on behalf of a job.
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// `POST .../telemetry {runId, networkLogs}`
    async fn post_telemetry(
        &self,
        run_id: &str,
        token: &str,
        network_logs: &[serde_json::Value],
    ) -> Result<(), ControlPlaneError>;

    /// `POST .../complete {runId, exitCode, error}`
    async fn post_complete(
        &self,
        run_id: &str,
        token: &str,
        exit_code: i32,
        error: Option<&str>,
    ) -> Result<(), ControlPlaneError>;

    /// URL the guest preflight targets.
    fn heartbeat_url(&self) -> String;
}

/// reqwest-backed [`ControlPlane`].
#[derive(Debug, Clone)]
pub struct HttpControlPlane {
    base_url: String,
    client: reqwest::Client,
}

impl HttpControlPlane {
    pub fn new(base_url: impl Into<String>) -> Result<Self, ControlPlaneError> {
        let base_url = base_url.into();
        let client = reqwest::Client::builder()
            .user_agent(concat!("sandbox-runner/", env!("CARGO_PKG_VERSION")))
            .connect_timeout(Duration::from_secs(10))
            .timeout(Duration::from_secs(60))
            .build()
            .map_err(|e| ControlPlaneError::Request {
                url: base_url.clone(),
                detail: e.to_string(),
            })?;
        Ok(Self { base_url, client })
    }

    async fn post<T: Serialize + Sync>(
        &self,
        endpoint: &str,
        token: &str,
        body: &T,
    ) -> Result<(), ControlPlaneError> {
        let url = webhook_url(&self.base_url, endpoint);
        let response = self
            .client
            .post(&url)
            .bearer_auth(token)
            .json(body)
            .send()
            .await
            .map_err(|e| ControlPlaneError::Request {
                url: url.clone(),
                detail: e.to_string(),
            })?;

        let status = response.status();
        if !status.is_success() {
            return Err(ControlPlaneError::Status {
                url,
                status: status.as_u16(),
            });
        }
        debug!(%url, "webhook delivered");
        Ok(())
    }
}

#[async_trait]
impl ControlPlane for HttpControlPlane {
    async fn post_telemetry(
        &self,
        run_id: &str,
        token: &str,
        network_logs: &[serde_json::Value],
    ) -> Result<(), ControlPlaneError> {
        self.post(
            "telemetry",
            token,
            &TelemetryBody {
                run_id,
                network_logs,
            },
        )
        .await
    }

    async fn post_complete(
        &self,
        run_id: &str,
        token: &str,
        exit_code: i32,
        error: Option<&str>,
    ) -> Result<(), ControlPlaneError> {
        self.post(
            "complete",
            token,
            &CompleteBody {
                run_id,
                exit_code,
                error,
            },
        )
        .await
    }

    fn heartbeat_url(&self) -> String {
        webhook_url(&self.base_url, "heartbeat")
    }
}

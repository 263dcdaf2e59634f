//! Upload of per-run network logs written by the intercepting proxy.

use std::path::Path;

use tracing::{debug, warn};

use crate::control_plane::{ControlPlane, ControlPlaneError};

/// Upload failures. The local file is kept in every case.
#[derive(Debug, thiserror::Error)]
pub enum NetworkLogError {
    #[error("failed to read network log {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Upload(#[from] ControlPlaneError),
}

/// Parse JSONL, skipping blank and malformed lines.
pub fn parse_entries(text: &str) -> Vec<serde_json::Value> {
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .filter_map(|line| match serde_json::from_str(line) {
            Ok(entry) => Some(entry),
            Err(e) => {
                warn!(error = %e, "skipping malformed network log line");
                None
            }
        })
        .collect()
}

/// Upload `path` to the telemetry endpoint and delete it once the upload is
/// confirmed. Returns the number of entries sent; a missing file sends none.
pub async fn upload_network_log(
    path: &Path,
    run_id: &str,
    token: &str,
    control_plane: &dyn ControlPlane,
) -> Result<usize, NetworkLogError> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(NetworkLogError::Read {
                path: path.display().to_string(),
                source,
            })
        }
    };

    let entries = parse_entries(&text);
    if !entries.is_empty() {
        control_plane.post_telemetry(run_id, token, &entries).await?;
    }

    if let Err(e) = tokio::fs::remove_file(path).await {
        warn!(path = %path.display(), error = %e, "uploaded network log could not be removed");
    }
    debug!(run_id, entries = entries.len(), "network log uploaded");
    Ok(entries.len())
}

//! Job input and output.

use std::collections::BTreeMap;

use sandbox_net::FirewallRule;
use serde::{Deserialize, Serialize};

/// Which agent CLI the guest runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum AgentType {
    #[default]
    ClaudeCode,
    Codex,
}

impl AgentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentType::ClaudeCode => "claude-code",
            AgentType::Codex => "codex",
        }
    }
}

/// Where the artifact volume is mounted in the guest.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ArtifactMount {
    pub mount_path: String,
    pub volume_name: String,
    pub driver: String,
}

/// Storages the guest downloads before the agent starts.
///
/// `storages` is passed to the guest downloader untouched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StorageManifest {
    #[serde(default)]
    pub storages: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact: Option<ArtifactMount>,
}

/// Prior session to continue.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResumeSession {
    pub session_id: String,
    /// Raw JSONL session history
    pub history: String,
}

/// Network isolation requested for the job.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FirewallConfig {
    #[serde(default)]
    pub rules: Vec<FirewallRule>,
    /// Full TLS interception instead of SNI-only filtering
    #[serde(default)]
    pub mitm: bool,
    #[serde(default)]
    pub seal_secrets: bool,
}

/// Everything one job needs. Immutable once the job starts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    pub run_id: String,
    pub sandbox_token: String,
    pub prompt: String,
    pub working_dir: String,
    #[serde(default)]
    pub agent_type: AgentType,
    #[serde(default)]
    pub vars: BTreeMap<String, String>,
    #[serde(default)]
    pub secrets: BTreeMap<String, String>,
    #[serde(default)]
    pub environment: BTreeMap<String, String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub storage_manifest: Option<StorageManifest>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resume_session: Option<ResumeSession>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub firewall: Option<FirewallConfig>,
}

impl ExecutionContext {
    pub fn new(
        run_id: impl Into<String>,
        sandbox_token: impl Into<String>,
        prompt: impl Into<String>,
    ) -> Self {
        Self {
            run_id: run_id.into(),
            sandbox_token: sandbox_token.into(),
            prompt: prompt.into(),
            working_dir: "/home/user/workspace".to_string(),
            agent_type: AgentType::default(),
            vars: BTreeMap::new(),
            secrets: BTreeMap::new(),
            environment: BTreeMap::new(),
            storage_manifest: None,
            resume_session: None,
            firewall: None,
        }
    }

    /// First segment of the run id, used to name the VM.
    pub fn short_vm_id(&self) -> &str {
        self.run_id.split('-').next().unwrap_or(&self.run_id)
    }

    pub fn network_isolation(&self) -> bool {
        self.firewall.is_some()
    }

    pub fn mitm_enabled(&self) -> bool {
        self.firewall.as_ref().is_some_and(|f| f.mitm)
    }
}

/// The only output of a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub exit_code: i32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success() -> Self {
        Self {
            exit_code: 0,
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            exit_code: 1,
            error: Some(error.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.exit_code == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_short_vm_id() {
        let ctx = ExecutionContext::new("3f2a9c1e-7b41-4c0e-9d1a-0c5b8e2f6a11", "t", "p");
        assert_eq!(ctx.short_vm_id(), "3f2a9c1e");

        let ctx = ExecutionContext::new("plain", "t", "p");
        assert_eq!(ctx.short_vm_id(), "plain");
    }

    #[test]
    fn test_context_from_control_plane_json() {
        let ctx: ExecutionContext = serde_json::from_value(serde_json::json!({
            "runId": "r-1",
            "sandboxToken": "tok",
            "prompt": "fix the bug",
            "workingDir": "/home/user/repo",
            "agentType": "codex",
            "firewall": { "rules": [{ "domain": "*.npmjs.org", "action": "allow" }], "mitm": true }
        }))
        .unwrap();
        assert_eq!(ctx.agent_type, AgentType::Codex);
        assert!(ctx.network_isolation());
        assert!(ctx.mitm_enabled());
        assert!(ctx.vars.is_empty());
    }

    #[test]
    fn test_result_shape() {
        let json = serde_json::to_value(ExecutionResult::failure("boom")).unwrap();
        assert_eq!(json, serde_json::json!({ "exitCode": 1, "error": "boom" }));
        assert!(ExecutionResult::success().is_success());
    }
}

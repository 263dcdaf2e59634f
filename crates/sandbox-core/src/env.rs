//! Environment payload for the guest entrypoint.
//!
//! Everything the guest needs travels as one JSON object written to
//! [`crate::guest::ENV_FILE`], so no value ever passes through a shell.

use std::collections::BTreeMap;

use crate::context::ExecutionContext;
use crate::guest;

/// Assemble the guest environment for `ctx`.
///
/// User-supplied `environment` entries and secrets come first; runner-owned
/// variables are applied last and cannot be overridden by the job.
pub fn build_guest_env(ctx: &ExecutionContext, api_url: &str) -> BTreeMap<String, String> {
    let mut env = BTreeMap::new();

    env.extend(ctx.environment.iter().map(|(k, v)| (k.clone(), v.clone())));
    env.extend(ctx.secrets.iter().map(|(k, v)| (k.clone(), v.clone())));

    env.insert("SANDBOX_RUN_ID".into(), ctx.run_id.clone());
    env.insert("SANDBOX_API_URL".into(), api_url.to_string());
    env.insert("SANDBOX_API_TOKEN".into(), ctx.sandbox_token.clone());
    env.insert("SANDBOX_PROMPT".into(), ctx.prompt.clone());
    env.insert("SANDBOX_WORKING_DIR".into(), ctx.working_dir.clone());
    env.insert("CLI_AGENT_TYPE".into(), ctx.agent_type.as_str().to_string());

    if !ctx.vars.is_empty() {
        // BTreeMap<String, String> always serializes.
        if let Ok(vars) = serde_json::to_string(&ctx.vars) {
            env.insert("SANDBOX_VARS".into(), vars);
        }
    }

    if let Some(artifact) = ctx
        .storage_manifest
        .as_ref()
        .and_then(|m| m.artifact.as_ref())
    {
        env.insert("SANDBOX_ARTIFACT_DRIVER".into(), artifact.driver.clone());
        env.insert("SANDBOX_ARTIFACT_MOUNT_PATH".into(), artifact.mount_path.clone());
        env.insert("SANDBOX_ARTIFACT_VOLUME_NAME".into(), artifact.volume_name.clone());
    }

    if let Some(resume) = &ctx.resume_session {
        env.insert("SANDBOX_RESUME_SESSION_ID".into(), resume.session_id.clone());
    }

    if !ctx.secrets.is_empty() {
        // Values only, for output masking in the guest.
        let values: Vec<&String> = ctx.secrets.values().collect();
        if let Ok(values) = serde_json::to_string(&values) {
            env.insert("SANDBOX_SECRET_VALUES".into(), values);
        }
    }

    if ctx.mitm_enabled() {
        env.insert("NODE_EXTRA_CA_CERTS".into(), guest::CA_CERT_FILE.to_string());
    }

    env
}

//! Where each agent CLI keeps its session history inside the guest.

use crate::context::AgentType;

/// Path of the history file for `session_id`.
///
/// - claude-code: `{home}/.claude/projects/-{cwd with '/' as '-'}/{session}.jsonl`
/// - codex: `{home}/.codex/sessions/{session}.jsonl`
pub fn session_history_path(
    agent: AgentType,
    home: &str,
    working_dir: &str,
    session_id: &str,
) -> String {
    let home = home.trim_end_matches('/');
    match agent {
        AgentType::ClaudeCode => {
            let project = working_dir.trim_start_matches('/').replace('/', "-");
            format!("{home}/.claude/projects/-{project}/{session_id}.jsonl")
        }
        AgentType::Codex => format!("{home}/.codex/sessions/{session_id}.jsonl"),
    }
}

/// Parent directory of a guest path.
pub fn parent_dir(path: &str) -> &str {
    match path.rfind('/') {
        Some(0) => "/",
        Some(i) => &path[..i],
        None => ".",
    }
}

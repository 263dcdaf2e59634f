//! Host command execution for network plumbing (`ip`, `iptables`).
//!
//! Commands are spawned with an explicit argument vector, never through a
//! shell, so addresses and device names cannot be reinterpreted.

use std::process::Stdio;

use tokio::process::Command;
use tracing::trace;

/// Error from a failed host command.
#[derive(Debug, thiserror::Error)]
#[error("command failed: {command}: {detail}")]
pub struct CommandError {
    pub command: String,
    pub detail: String,
}

/// How a host command should be executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Privilege {
    /// Run via non-interactive `sudo -n`.
    Sudo,
    /// Run as the current user.
    User,
}

/// Run `program` with `args` and return trimmed stdout on success.
pub async fn run(
    program: &str,
    args: &[&str],
    privilege: Privilege,
) -> Result<String, CommandError> {
    let rendered = render(program, args);
    trace!(command = %rendered, ?privilege, "running host command");

    let mut command = match privilege {
        Privilege::Sudo => {
            let mut c = Command::new("sudo");
            c.arg("-n").arg(program);
            c
        }
        Privilege::User => Command::new(program),
    };

    let output = command
        .args(args)
        .stdin(Stdio::null())
        .output()
        .await
        .map_err(|e| CommandError {
            command: rendered.clone(),
            detail: e.to_string(),
        })?;

    if output.status.success() {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(CommandError {
            command: rendered,
            detail: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        })
    }
}

fn render(program: &str, args: &[&str]) -> String {
    std::iter::once(program)
        .chain(args.iter().copied())
        .collect::<Vec<_>>()
        .join(" ")
}

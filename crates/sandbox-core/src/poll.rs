//! Completion polling for the detached guest entrypoint.
//!
//! Each tick evaluates three exit conditions in order:
//!
//! 1. the exit-code sentinel exists: the agent finished;
//! 2. the entrypoint process is gone and the sentinel still absent: crash;
//! 3. the runtime ceiling has passed: timeout.
//!
//! Otherwise the loop sleeps one interval and checks again. A guest that
//! stops answering for `unreachable_limit` consecutive ticks counts as
//! crashed.

use std::fmt;
use std::sync::OnceLock;
use std::time::Duration;

use regex::Regex;
use tokio::time::Instant;
use tracing::{debug, warn};

use crate::guest;
use crate::ssh::{GuestShell, SshError};

/// Timeout for each status command.
const CHECK_TIMEOUT: Duration = Duration::from_secs(30);
/// Log lines kept in a crash report.
const LOG_TAIL_LINES: usize = 50;

/// How often to poll and when to give up.
#[derive(Debug, Clone, Copy)]
pub struct PollSettings {
    pub interval: Duration,
    pub ceiling: Duration,
    /// Consecutive ticks without an answer from the guest before giving up.
    pub unreachable_limit: u32,
}

/// Why the process is gone.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CrashKind {
    OutOfMemory,
    /// The guest stopped answering; nothing could be read from it.
    Unreachable,
    Unknown,
}

/// Evidence gathered after the entrypoint died without a sentinel.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CrashDiagnosis {
    pub kind: CrashKind,
    /// Matching kernel log line for OOM kills, last transport error when
    /// unreachable
    pub kernel_evidence: Option<String>,
    pub log_tail: String,
}

impl fmt::Display for CrashDiagnosis {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.kind, &self.kernel_evidence) {
            (CrashKind::OutOfMemory, Some(line)) => {
                write!(f, "agent was killed by the kernel OOM killer ({line})")?
            }
            (CrashKind::OutOfMemory, None) => {
                write!(f, "agent was killed by the kernel OOM killer")?
            }
            (CrashKind::Unreachable, Some(error)) => {
                write!(f, "guest stopped responding while the agent was running ({error})")?
            }
            (CrashKind::Unreachable, None) => {
                write!(f, "guest stopped responding while the agent was running")?
            }
            (CrashKind::Unknown, _) => {
                write!(f, "agent process exited without reporting an exit code")?
            }
        }
        if !self.log_tail.is_empty() {
            write!(f, "\n--- last output ---\n{}", self.log_tail)?;
        }
        Ok(())
    }
}

/// How polling ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollOutcome {
    Exited(i32),
    Crashed(CrashDiagnosis),
    TimedOut(Duration),
}

/// One status check against the guest.
enum Status {
    Exited(i32),
    Running,
    Gone,
    NoAnswer(SshError),
}

/// Poll until the entrypoint exits, crashes, or outlives the ceiling.
pub async fn poll_completion(shell: &dyn GuestShell, settings: PollSettings) -> PollOutcome {
    let started = Instant::now();
    let mut missed = 0u32;
    loop {
        match check(shell).await {
            Status::Exited(code) => {
                debug!(exit_code = code, "sentinel found");
                return PollOutcome::Exited(code);
            }
            Status::Gone => {
                warn!("entrypoint died without an exit code");
                return PollOutcome::Crashed(diagnose_crash(shell).await);
            }
            Status::Running => missed = 0,
            Status::NoAnswer(e) => {
                missed += 1;
                warn!(
                    error = %e,
                    missed,
                    limit = settings.unreachable_limit,
                    "guest did not answer"
                );
                if missed >= settings.unreachable_limit {
                    return PollOutcome::Crashed(CrashDiagnosis {
                        kind: CrashKind::Unreachable,
                        kernel_evidence: Some(e.to_string()),
                        log_tail: String::new(),
                    });
                }
            }
        }

        if started.elapsed() >= settings.ceiling {
            warn!(ceiling = ?settings.ceiling, "agent exceeded runtime ceiling");
            return PollOutcome::TimedOut(settings.ceiling);
        }

        tokio::time::sleep(settings.interval).await;
    }
}

async fn check(shell: &dyn GuestShell) -> Status {
    match read_exit_code(shell).await {
        Ok(Some(code)) => return Status::Exited(code),
        Ok(None) => {}
        Err(e) => return Status::NoAnswer(e),
    }
    match is_alive(shell).await {
        Ok(true) => Status::Running,
        // The process may have written the sentinel between the two checks.
        Ok(false) => match read_exit_code(shell).await {
            Ok(Some(code)) => Status::Exited(code),
            Ok(None) => Status::Gone,
            Err(e) => Status::NoAnswer(e),
        },
        Err(e) => Status::NoAnswer(e),
    }
}

/// Read the sentinel. `Ok(None)` when absent or unparsable.
async fn read_exit_code(shell: &dyn GuestShell) -> Result<Option<i32>, SshError> {
    let command = format!("cat {} 2>/dev/null", guest::EXIT_CODE_FILE);
    let out = shell.exec(&command, Some(CHECK_TIMEOUT)).await?;
    Ok(if out.success() {
        out.stdout.trim().parse().ok()
    } else {
        None
    })
}

async fn is_alive(shell: &dyn GuestShell) -> Result<bool, SshError> {
    let command = format!("kill -0 \"$(cat {})\" 2>/dev/null", guest::PID_FILE);
    Ok(shell.exec(&command, Some(CHECK_TIMEOUT)).await?.success())
}

/// Collect the log tail and scan the kernel log for OOM kills.
pub async fn diagnose_crash(shell: &dyn GuestShell) -> CrashDiagnosis {
    let log_tail = match shell
        .exec(
            &format!("tail -n {LOG_TAIL_LINES} {} 2>/dev/null", guest::LOG_FILE),
            Some(CHECK_TIMEOUT),
        )
        .await
    {
        Ok(out) => out.stdout.trim_end().to_string(),
        Err(_) => String::new(),
    };

    let kernel_log = match shell
        .exec("sudo -n dmesg 2>/dev/null | tail -n 200", Some(CHECK_TIMEOUT))
        .await
    {
        Ok(out) => out.stdout,
        Err(e) => {
            warn!(error = %e, "could not read kernel log");
            String::new()
        }
    };

    let kernel_evidence = find_oom_evidence(&kernel_log);
    CrashDiagnosis {
        kind: if kernel_evidence.is_some() {
            CrashKind::OutOfMemory
        } else {
            CrashKind::Unknown
        },
        kernel_evidence,
        log_tail,
    }
}

fn oom_pattern() -> Option<&'static Regex> {
    static PATTERN: OnceLock<Option<Regex>> = OnceLock::new();
    PATTERN
        .get_or_init(|| {
            Regex::new(r"(?i)(out of memory|oom-kill|oom_reaper|killed process \d+)").ok()
        })
        .as_ref()
}

/// Last kernel log line that records an OOM kill.
pub fn find_oom_evidence(kernel_log: &str) -> Option<String> {
    let pattern = oom_pattern()?;
    kernel_log
        .lines()
        .rev()
        .find(|line| pattern.is_match(line))
        .map(|line| line.trim().to_string())
}

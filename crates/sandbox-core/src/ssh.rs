//! Guest control channel.
//!
//! [`GuestShell`] is what the executor drives; [`OpenSshShell`] implements it
//! on top of the system `ssh` client.

use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, trace};

use crate::config::SshSettings;

/// Per-command limit when the caller does not pass one.
pub const DEFAULT_COMMAND_TIMEOUT: Duration = Duration::from_secs(300);

/// Control channel errors.
#[derive(Debug, thiserror::Error)]
pub enum SshError {
    #[error("guest not reachable over SSH within {0:?}")]
    Unreachable(Duration),

    #[error("command timed out after {timeout:?}: {command}")]
    Timeout { command: String, timeout: Duration },

    #[error("command exited with {exit_code}: {command}: {stderr}")]
    NonZero {
        command: String,
        exit_code: i32,
        stderr: String,
    },

    #[error("failed to write {path}: {detail}")]
    WriteFile { path: String, detail: String },

    #[error("ssh transport: {0}")]
    Transport(String),
}

/// Result of one remote command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl ExecOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            exit_code: 0,
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(exit_code: i32) -> Self {
        Self {
            exit_code,
            ..Self::default()
        }
    }

    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

/// Commands and file writes inside one guest.
#[async_trait]
pub trait GuestShell: Send + Sync {
    async fn exec(&self, command: &str, timeout: Option<Duration>) -> Result<ExecOutput, SshError>;

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SshError>;

    async fn write_file_with_sudo(&self, path: &str, content: &[u8]) -> Result<(), SshError>;

    /// Limit applied to [`GuestShell::exec_or_throw`] and file writes.
    fn command_timeout(&self) -> Duration {
        DEFAULT_COMMAND_TIMEOUT
    }

    /// [`GuestShell::exec`] bounded by [`GuestShell::command_timeout`],
    /// turning a non-zero exit into an error.
    async fn exec_or_throw(&self, command: &str) -> Result<ExecOutput, SshError> {
        let output = self.exec(command, Some(self.command_timeout())).await?;
        if output.success() {
            Ok(output)
        } else {
            Err(SshError::NonZero {
                command: command.to_string(),
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            })
        }
    }

    /// Retry a trivial command every `interval` until it succeeds or
    /// `timeout` elapses.
    async fn wait_until_reachable(
        &self,
        timeout: Duration,
        interval: Duration,
    ) -> Result<(), SshError> {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            match self.exec("true", Some(interval.max(Duration::from_secs(1)))).await {
                Ok(out) if out.success() => return Ok(()),
                Ok(out) => trace!(exit_code = out.exit_code, "guest not ready"),
                Err(e) => trace!(error = %e, "guest not ready"),
            }
            if tokio::time::Instant::now() + interval > deadline {
                return Err(SshError::Unreachable(timeout));
            }
            tokio::time::sleep(interval).await;
        }
    }
}

/// Opens a shell to a guest address.
pub trait ShellFactory: Send + Sync {
    fn connect(&self, host: Ipv4Addr) -> Arc<dyn GuestShell>;
}

/// Quote `s` for a POSIX shell.
pub fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

/// [`GuestShell`] over the system `ssh` binary.
#[derive(Debug, Clone)]
pub struct OpenSshShell {
    host: Ipv4Addr,
    user: String,
    key_path: PathBuf,
    command_timeout: Duration,
}

impl OpenSshShell {
    pub fn new(host: Ipv4Addr, settings: &SshSettings) -> Self {
        Self {
            host,
            user: settings.user.clone(),
            key_path: settings.key_path.clone(),
            command_timeout: settings.command_timeout(),
        }
    }

    fn command(&self, remote: &str) -> Command {
        let mut cmd = Command::new("ssh");
        cmd.arg("-i")
            .arg(&self.key_path)
            .args([
                "-o",
                "StrictHostKeyChecking=no",
                "-o",
                "UserKnownHostsFile=/dev/null",
                "-o",
                "BatchMode=yes",
                "-o",
                "ConnectTimeout=5",
                "-o",
                "LogLevel=ERROR",
            ])
            .arg(format!("{}@{}", self.user, self.host))
            .arg(remote)
            .kill_on_drop(true);
        cmd
    }

    async fn pipe_to(&self, remote: &str, path: &str, content: &[u8]) -> Result<(), SshError> {
        tokio::time::timeout(self.command_timeout, self.pipe(remote, path, content))
            .await
            .map_err(|_| SshError::Timeout {
                command: remote.to_string(),
                timeout: self.command_timeout,
            })?
    }

    async fn pipe(&self, remote: &str, path: &str, content: &[u8]) -> Result<(), SshError> {
        let write_err = |detail: String| SshError::WriteFile {
            path: path.to_string(),
            detail,
        };

        let mut child = self
            .command(remote)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| write_err(e.to_string()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(content)
                .await
                .map_err(|e| write_err(e.to_string()))?;
        }

        let output = child
            .wait_with_output()
            .await
            .map_err(|e| write_err(e.to_string()))?;
        if output.status.success() {
            debug!(host = %self.host, path, bytes = content.len(), "wrote guest file");
            Ok(())
        } else {
            Err(write_err(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ))
        }
    }
}

#[async_trait]
impl GuestShell for OpenSshShell {
    async fn exec(&self, command: &str, timeout: Option<Duration>) -> Result<ExecOutput, SshError> {
        trace!(host = %self.host, command, "ssh exec");
        let mut cmd = self.command(command);
        cmd.stdin(Stdio::null());
        let limit = timeout.unwrap_or(self.command_timeout);

        let output = tokio::time::timeout(limit, cmd.output())
            .await
            .map_err(|_| SshError::Timeout {
                command: command.to_string(),
                timeout: limit,
            })?
            .map_err(|e| SshError::Transport(e.to_string()))?;

        // ssh reports its own failures as 255.
        let exit_code = output.status.code().unwrap_or(255);
        if exit_code == 255 {
            return Err(SshError::Transport(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        Ok(ExecOutput {
            exit_code,
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn command_timeout(&self) -> Duration {
        self.command_timeout
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SshError> {
        self.pipe_to(&format!("cat > {}", shell_quote(path)), path, content)
            .await
    }

    async fn write_file_with_sudo(&self, path: &str, content: &[u8]) -> Result<(), SshError> {
        self.pipe_to(
            &format!("sudo tee {} > /dev/null", shell_quote(path)),
            path,
            content,
        )
        .await
    }
}

/// Connects [`OpenSshShell`]s with shared settings.
#[derive(Debug, Clone)]
pub struct OpenSshFactory {
    settings: SshSettings,
}

impl OpenSshFactory {
    pub fn new(settings: SshSettings) -> Self {
        Self { settings }
    }
}

impl ShellFactory for OpenSshFactory {
    fn connect(&self, host: Ipv4Addr) -> Arc<dyn GuestShell> {
        Arc::new(OpenSshShell::new(host, &self.settings))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("/tmp/a b"), "'/tmp/a b'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    /// Becomes reachable on the `ready_after`th attempt.
    struct SlowBoot {
        attempts: AtomicUsize,
        ready_after: usize,
    }

    #[async_trait]
    impl GuestShell for SlowBoot {
        async fn exec(&self, _: &str, _: Option<Duration>) -> Result<ExecOutput, SshError> {
            let n = self.attempts.fetch_add(1, Ordering::SeqCst) + 1;
            if n >= self.ready_after {
                Ok(ExecOutput::ok(""))
            } else {
                Err(SshError::Transport("connection refused".into()))
            }
        }
        async fn write_file(&self, _: &str, _: &[u8]) -> Result<(), SshError> {
            Ok(())
        }
        async fn write_file_with_sudo(&self, _: &str, _: &[u8]) -> Result<(), SshError> {
            Ok(())
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_reachable_retries() {
        let shell = SlowBoot {
            attempts: AtomicUsize::new(0),
            ready_after: 3,
        };
        shell
            .wait_until_reachable(Duration::from_secs(10), Duration::from_millis(500))
            .await
            .unwrap();
        assert_eq!(shell.attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_until_reachable_times_out() {
        let shell = SlowBoot {
            attempts: AtomicUsize::new(0),
            ready_after: usize::MAX,
        };
        let err = shell
            .wait_until_reachable(Duration::from_secs(2), Duration::from_millis(500))
            .await
            .unwrap_err();
        assert!(matches!(err, SshError::Unreachable(_)));
    }

    #[tokio::test]
    async fn test_exec_or_throw_maps_exit_code() {
        struct Fails;
        #[async_trait]
        impl GuestShell for Fails {
            async fn exec(&self, _: &str, _: Option<Duration>) -> Result<ExecOutput, SshError> {
                Ok(ExecOutput {
                    exit_code: 2,
                    stdout: String::new(),
                    stderr: "no such file\n".into(),
                })
            }
            async fn write_file(&self, _: &str, _: &[u8]) -> Result<(), SshError> {
                Ok(())
            }
            async fn write_file_with_sudo(&self, _: &str, _: &[u8]) -> Result<(), SshError> {
                Ok(())
            }
        }

        let err = Fails.exec_or_throw("cat /nope").await.unwrap_err();
        match err {
            SshError::NonZero { exit_code, stderr, .. } => {
                assert_eq!(exit_code, 2);
                assert_eq!(stderr, "no such file");
            }
            other => panic!("unexpected: {other}"),
        }
    }

    /// Records the limit each command ran under.
    #[derive(Default)]
    struct Recording {
        limits: std::sync::Mutex<Vec<(String, Option<Duration>)>>,
    }

    #[async_trait]
    impl GuestShell for Recording {
        async fn exec(
            &self,
            command: &str,
            timeout: Option<Duration>,
        ) -> Result<ExecOutput, SshError> {
            self.limits
                .lock()
                .unwrap()
                .push((command.to_string(), timeout));
            Ok(ExecOutput::ok(""))
        }
        async fn write_file(&self, _: &str, _: &[u8]) -> Result<(), SshError> {
            Ok(())
        }
        async fn write_file_with_sudo(&self, _: &str, _: &[u8]) -> Result<(), SshError> {
            Ok(())
        }
    }

    #[tokio::test]
    async fn test_exec_or_throw_is_bounded() {
        let shell = Recording::default();
        shell
            .exec_or_throw("sudo update-ca-certificates")
            .await
            .unwrap();
        assert_eq!(
            *shell.limits.lock().unwrap(),
            vec![(
                "sudo update-ca-certificates".to_string(),
                Some(DEFAULT_COMMAND_TIMEOUT)
            )]
        );
    }

    #[test]
    fn test_openssh_shell_takes_timeout_from_settings() {
        let settings = SshSettings {
            command_timeout_secs: 42,
            ..SshSettings::default()
        };
        let shell = OpenSshShell::new(Ipv4Addr::new(172, 16, 0, 2), &settings);
        assert_eq!(shell.command_timeout(), Duration::from_secs(42));
    }
}

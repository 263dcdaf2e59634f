//! In-memory collaborators for driving [`crate::JobExecutor`] in tests.
//!
//! `FakeVmFactory` hands out VMs that take their guest address from the
//! network config, `ScriptedShell` answers guest commands from a table, and
//! `RecordingControlPlane` captures webhook calls.

use std::net::Ipv4Addr;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;

use crate::control_plane::{webhook_url, ControlPlane, ControlPlaneError};
use crate::guest;
use crate::ssh::{ExecOutput, GuestShell, ShellFactory, SshError};
use crate::vm::{MicroVm, VmConfig, VmError, VmFactory};

// ---------------------------------------------------------------------------
// FakeVm
// ---------------------------------------------------------------------------

/// VM that "boots" instantly with the configured guest address.
#[derive(Debug)]
pub struct FakeVm {
    vm_id: String,
    fail_start: bool,
    fail_kill: bool,
    report_ip: bool,
    config: Mutex<Option<VmConfig>>,
    guest_ip: Mutex<Option<Ipv4Addr>>,
    kills: AtomicUsize,
}

impl FakeVm {
    pub fn vm_id(&self) -> &str {
        &self.vm_id
    }

    /// Config passed to `start`, if it was called.
    pub fn config(&self) -> Option<VmConfig> {
        self.config.lock().unwrap().clone()
    }

    pub fn kills(&self) -> usize {
        self.kills.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl MicroVm for FakeVm {
    async fn start(&self, config: &VmConfig) -> Result<(), VmError> {
        *self.config.lock().unwrap() = Some(config.clone());
        if self.fail_start {
            return Err(VmError {
                vm_id: self.vm_id.clone(),
                detail: "injected start failure".to_string(),
            });
        }
        if self.report_ip {
            *self.guest_ip.lock().unwrap() = Some(config.network.guest_ip);
        }
        Ok(())
    }

    fn guest_ip(&self) -> Option<Ipv4Addr> {
        *self.guest_ip.lock().unwrap()
    }

    async fn kill(&self) -> Result<(), VmError> {
        self.kills.fetch_add(1, Ordering::SeqCst);
        if self.fail_kill {
            return Err(VmError {
                vm_id: self.vm_id.clone(),
                detail: "injected kill failure".to_string(),
            });
        }
        *self.guest_ip.lock().unwrap() = None;
        Ok(())
    }
}

/// Creates [`FakeVm`]s and keeps every one it created.
#[derive(Debug, Default)]
pub struct FakeVmFactory {
    vms: Mutex<Vec<Arc<FakeVm>>>,
    fail_start: AtomicBool,
    fail_kill: AtomicBool,
    no_guest_ip: AtomicBool,
}

impl FakeVmFactory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_start(&self, fail: bool) {
        self.fail_start.store(fail, Ordering::SeqCst);
    }

    /// VMs created from now on fail `kill` (the attempt is still counted).
    pub fn set_fail_kill(&self, fail: bool) {
        self.fail_kill.store(fail, Ordering::SeqCst);
    }

    /// Started VMs report no guest address.
    pub fn set_no_guest_ip(&self, missing: bool) {
        self.no_guest_ip.store(missing, Ordering::SeqCst);
    }

    pub fn created(&self) -> Vec<Arc<FakeVm>> {
        self.vms.lock().unwrap().clone()
    }
}

impl VmFactory for FakeVmFactory {
    fn create(&self, vm_id: &str) -> Arc<dyn MicroVm> {
        let vm = Arc::new(FakeVm {
            vm_id: vm_id.to_string(),
            fail_start: self.fail_start.load(Ordering::SeqCst),
            fail_kill: self.fail_kill.load(Ordering::SeqCst),
            report_ip: !self.no_guest_ip.load(Ordering::SeqCst),
            config: Mutex::new(None),
            guest_ip: Mutex::new(None),
            kills: AtomicUsize::new(0),
        });
        self.vms.lock().unwrap().push(Arc::clone(&vm));
        vm
    }
}

// ---------------------------------------------------------------------------
// ScriptedShell
// ---------------------------------------------------------------------------

/// A file written into the guest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestWrite {
    pub path: String,
    pub content: Vec<u8>,
    pub sudo: bool,
}

impl GuestWrite {
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.content).into_owned()
    }
}

/// Guest shell whose answers are set up front.
///
/// The sentinel and liveness checks are answered from [`ScriptedShell::finish_with`]
/// and [`ScriptedShell::set_alive`]; other commands match the first
/// registered pattern they contain, or succeed with empty output.
#[derive(Debug)]
pub struct ScriptedShell {
    reachable: AtomicBool,
    disconnect_after: Mutex<Option<String>>,
    disconnected: AtomicBool,
    alive: AtomicBool,
    exit_code: Mutex<Option<i32>>,
    responses: Mutex<Vec<(String, ExecOutput)>>,
    failing_writes: Mutex<Vec<String>>,
    commands: Mutex<Vec<(String, Option<Duration>)>>,
    writes: Mutex<Vec<GuestWrite>>,
    connections: Mutex<Vec<Ipv4Addr>>,
}

impl Default for ScriptedShell {
    fn default() -> Self {
        Self {
            reachable: AtomicBool::new(true),
            disconnect_after: Mutex::new(None),
            disconnected: AtomicBool::new(false),
            alive: AtomicBool::new(true),
            exit_code: Mutex::new(None),
            responses: Mutex::new(Vec::new()),
            failing_writes: Mutex::new(Vec::new()),
            commands: Mutex::new(Vec::new()),
            writes: Mutex::new(Vec::new()),
            connections: Mutex::new(Vec::new()),
        }
    }
}

impl ScriptedShell {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_reachable(&self, reachable: bool) {
        self.reachable.store(reachable, Ordering::SeqCst);
    }

    /// Once a command containing `pattern` has run, every later command
    /// and write fails with a transport error.
    pub fn disconnect_after(&self, pattern: &str) {
        *self.disconnect_after.lock().unwrap() = Some(pattern.to_string());
    }

    pub fn set_alive(&self, alive: bool) {
        self.alive.store(alive, Ordering::SeqCst);
    }

    /// The entrypoint has written `code` to the sentinel.
    pub fn finish_with(&self, code: i32) {
        *self.exit_code.lock().unwrap() = Some(code);
    }

    /// Answer commands containing `pattern` with `output`.
    pub fn respond(&self, pattern: &str, output: ExecOutput) {
        self.responses
            .lock()
            .unwrap()
            .push((pattern.to_string(), output));
    }

    /// Fail writes to paths containing `fragment`.
    pub fn fail_writes_to(&self, fragment: &str) {
        self.failing_writes.lock().unwrap().push(fragment.to_string());
    }

    pub fn commands(&self) -> Vec<String> {
        self.timeouts().into_iter().map(|(command, _)| command).collect()
    }

    /// Timeout each command ran with, in command order.
    pub fn timeouts(&self) -> Vec<(String, Option<Duration>)> {
        self.commands.lock().unwrap().clone()
    }

    pub fn ran(&self, fragment: &str) -> bool {
        self.commands().iter().any(|c| c.contains(fragment))
    }

    pub fn writes(&self) -> Vec<GuestWrite> {
        self.writes.lock().unwrap().clone()
    }

    /// Last write to `path`.
    pub fn written(&self, path: &str) -> Option<GuestWrite> {
        self.writes().into_iter().rev().find(|w| w.path == path)
    }

    pub fn connections(&self) -> Vec<Ipv4Addr> {
        self.connections.lock().unwrap().clone()
    }

    fn check_connected(&self) -> Result<(), SshError> {
        if self.disconnected.load(Ordering::SeqCst) {
            Err(SshError::Transport("No route to host".to_string()))
        } else {
            Ok(())
        }
    }

    fn record_write(&self, path: &str, content: &[u8], sudo: bool) -> Result<(), SshError> {
        self.check_connected()?;
        let failing = self
            .failing_writes
            .lock()
            .unwrap()
            .iter()
            .any(|f| path.contains(f.as_str()));
        if failing {
            return Err(SshError::WriteFile {
                path: path.to_string(),
                detail: "injected write failure".to_string(),
            });
        }
        self.writes.lock().unwrap().push(GuestWrite {
            path: path.to_string(),
            content: content.to_vec(),
            sudo,
        });
        Ok(())
    }
}

#[async_trait]
impl GuestShell for ScriptedShell {
    async fn exec(&self, command: &str, timeout: Option<Duration>) -> Result<ExecOutput, SshError> {
        self.commands
            .lock()
            .unwrap()
            .push((command.to_string(), timeout));
        self.check_connected()?;
        let disconnects = self
            .disconnect_after
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|pattern| command.contains(pattern));
        if disconnects {
            self.disconnected.store(true, Ordering::SeqCst);
        }

        if command == "true" {
            return if self.reachable.load(Ordering::SeqCst) {
                Ok(ExecOutput::ok(""))
            } else {
                Err(SshError::Transport("connection refused".to_string()))
            };
        }
        if command.starts_with(&format!("cat {}", guest::EXIT_CODE_FILE)) {
            return Ok(match *self.exit_code.lock().unwrap() {
                Some(code) => ExecOutput::ok(format!("{code}\n")),
                None => ExecOutput::failed(1),
            });
        }
        if command.starts_with("kill -0") {
            return Ok(if self.alive.load(Ordering::SeqCst) {
                ExecOutput::ok("")
            } else {
                ExecOutput::failed(1)
            });
        }

        let responses = self.responses.lock().unwrap();
        Ok(responses
            .iter()
            .find(|(pattern, _)| command.contains(pattern.as_str()))
            .map(|(_, output)| output.clone())
            .unwrap_or_default())
    }

    async fn write_file(&self, path: &str, content: &[u8]) -> Result<(), SshError> {
        self.record_write(path, content, false)
    }

    async fn write_file_with_sudo(&self, path: &str, content: &[u8]) -> Result<(), SshError> {
        self.record_write(path, content, true)
    }
}

/// Hands out the same [`ScriptedShell`] for every guest.
#[derive(Debug, Clone)]
pub struct ScriptedShellFactory {
    shell: Arc<ScriptedShell>,
}

impl ScriptedShellFactory {
    pub fn new(shell: Arc<ScriptedShell>) -> Self {
        Self { shell }
    }
}

impl ShellFactory for ScriptedShellFactory {
    fn connect(&self, host: Ipv4Addr) -> Arc<dyn GuestShell> {
        self.shell.connections.lock().unwrap().push(host);
        self.shell.clone()
    }
}

// ---------------------------------------------------------------------------
// RecordingControlPlane
// ---------------------------------------------------------------------------

/// A recorded `/complete` call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Completion {
    pub run_id: String,
    pub exit_code: i32,
    pub error: Option<String>,
}

/// Control plane that records every call.
#[derive(Debug, Default)]
pub struct RecordingControlPlane {
    telemetry: Mutex<Vec<(String, Vec<serde_json::Value>)>>,
    completions: Mutex<Vec<Completion>>,
    fail_telemetry: AtomicBool,
}

impl RecordingControlPlane {
    pub const BASE_URL: &'static str = "http://control-plane.test";

    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_fail_telemetry(&self, fail: bool) {
        self.fail_telemetry.store(fail, Ordering::SeqCst);
    }

    pub fn telemetry(&self) -> Vec<(String, Vec<serde_json::Value>)> {
        self.telemetry.lock().unwrap().clone()
    }

    pub fn completions(&self) -> Vec<Completion> {
        self.completions.lock().unwrap().clone()
    }
}

#[async_trait]
impl ControlPlane for RecordingControlPlane {
    async fn post_telemetry(
        &self,
        run_id: &str,
        _token: &str,
        network_logs: &[serde_json::Value],
    ) -> Result<(), ControlPlaneError> {
        if self.fail_telemetry.load(Ordering::SeqCst) {
            return Err(ControlPlaneError::Status {
                url: webhook_url(Self::BASE_URL, "telemetry"),
                status: 503,
            });
        }
        self.telemetry
            .lock()
            .unwrap()
            .push((run_id.to_string(), network_logs.to_vec()));
        Ok(())
    }

    async fn post_complete(
        &self,
        run_id: &str,
        _token: &str,
        exit_code: i32,
        error: Option<&str>,
    ) -> Result<(), ControlPlaneError> {
        self.completions.lock().unwrap().push(Completion {
            run_id: run_id.to_string(),
            exit_code,
            error: error.map(str::to_string),
        });
        Ok(())
    }

    fn heartbeat_url(&self) -> String {
        webhook_url(Self::BASE_URL, "heartbeat")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_shell_status_commands() {
        let shell = ScriptedShell::new();
        let sentinel = format!("cat {} 2>/dev/null", guest::EXIT_CODE_FILE);

        assert!(!shell.exec(&sentinel, None).await.unwrap().success());
        shell.finish_with(3);
        assert_eq!(shell.exec(&sentinel, None).await.unwrap().stdout.trim(), "3");

        shell.respond("download-storage", ExecOutput::failed(2));
        let out = shell.exec("/usr/local/lib/sandbox/download-storage x", None).await.unwrap();
        assert_eq!(out.exit_code, 2);
        assert!(shell.exec("echo hi", None).await.unwrap().success());
    }

    #[tokio::test]
    async fn test_scripted_shell_disconnects() {
        let shell = ScriptedShell::new();
        shell.disconnect_after("nohup");

        assert!(shell.exec("nohup run &", None).await.is_ok());
        let err = shell.exec("kill -0 1", None).await.unwrap_err();
        assert!(matches!(err, SshError::Transport(_)));
        assert!(shell.write_file("/tmp/x", b"x").await.is_err());
    }
}

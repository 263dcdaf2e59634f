//! Runner configuration.
//!
//! Loaded from a TOML file, then selected `SANDBOX_*` environment variables
//! override individual fields. Every section has defaults, so an empty file
//! is a valid configuration.

use std::net::Ipv4Addr;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors from loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid value for {key}: {detail}")]
    InvalidValue { key: String, detail: String },
}

/// Top-level runner configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RunnerConfig {
    pub api: ApiConfig,
    pub vm: VmSettings,
    pub network: NetworkSettings,
    pub ssh: SshSettings,
    pub execution: ExecutionSettings,
}

/// Control plane endpoint.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
    pub base_url: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:3000".to_string(),
        }
    }
}

/// MicroVM shape and images.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VmSettings {
    pub vcpus: u32,
    pub memory_mb: u32,
    pub kernel_path: PathBuf,
    pub rootfs_path: PathBuf,
    pub binary_path: PathBuf,
    pub work_dir: PathBuf,
}

impl Default for VmSettings {
    fn default() -> Self {
        Self {
            vcpus: 2,
            memory_mb: 2048,
            kernel_path: PathBuf::from("/opt/sandbox/vmlinux"),
            rootfs_path: PathBuf::from("/opt/sandbox/rootfs.ext4"),
            binary_path: PathBuf::from("/usr/local/bin/firecracker"),
            work_dir: PathBuf::from("/var/lib/sandbox/vms"),
        }
    }
}

/// Host networking.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct NetworkSettings {
    pub subnet: Ipv4Addr,
    pub bridge: Option<String>,
    pub tap_owner: Option<String>,
    pub tap_prefix: String,
    pub pool_size: usize,
    pub replenish_threshold: Option<usize>,
    pub registry_path: PathBuf,
    /// Defaults to `registry_path` with a `.lock` suffix.
    pub lock_path: Option<PathBuf>,
    pub orphan_grace_secs: u64,
    /// Period of the background orphaned-lease sweep.
    pub orphan_sweep_secs: u64,
    pub proxy_port: u16,
    /// Published VM registry snapshot for the proxy process.
    pub proxy_registry_path: Option<PathBuf>,
    /// CA certificate installed in guests when TLS interception is on.
    pub ca_cert_path: PathBuf,
    pub dns_servers: Vec<Ipv4Addr>,
    /// Directory the proxy writes per-run network logs into.
    pub network_log_dir: PathBuf,
}

impl Default for NetworkSettings {
    fn default() -> Self {
        Self {
            subnet: sandbox_net::ip_registry::DEFAULT_SUBNET,
            bridge: Some("br-sandbox".to_string()),
            tap_owner: None,
            tap_prefix: sandbox_net::tap_pool::DEFAULT_DEVICE_PREFIX.to_string(),
            pool_size: 4,
            replenish_threshold: None,
            registry_path: PathBuf::from("/var/lib/sandbox/ip-registry.json"),
            lock_path: None,
            orphan_grace_secs: sandbox_net::ip_registry::DEFAULT_ORPHAN_GRACE.as_secs(),
            orphan_sweep_secs: 300,
            proxy_port: sandbox_net::firewall::DEFAULT_PROXY_PORT,
            proxy_registry_path: Some(PathBuf::from("/var/lib/sandbox/proxy-registry.json")),
            ca_cert_path: PathBuf::from("/etc/sandbox/proxy-ca.crt"),
            dns_servers: vec![Ipv4Addr::new(8, 8, 8, 8), Ipv4Addr::new(1, 1, 1, 1)],
            network_log_dir: PathBuf::from("/var/log/sandbox/network"),
        }
    }
}

impl NetworkSettings {
    pub fn lock_path(&self) -> PathBuf {
        self.lock_path.clone().unwrap_or_else(|| {
            let mut name = self.registry_path.clone().into_os_string();
            name.push(".lock");
            PathBuf::from(name)
        })
    }

    pub fn orphan_grace(&self) -> Duration {
        Duration::from_secs(self.orphan_grace_secs)
    }

    pub fn orphan_sweep_interval(&self) -> Duration {
        Duration::from_secs(self.orphan_sweep_secs)
    }

    /// Network log written by the proxy for one run. `None` when the run
    /// id cannot name a file inside the log directory.
    pub fn network_log_path(&self, run_id: &str) -> Option<PathBuf> {
        is_file_name_safe(run_id).then(|| self.network_log_dir.join(format!("{run_id}.jsonl")))
    }
}

/// Whether `id` can be joined onto a directory without leaving it.
pub fn is_file_name_safe(id: &str) -> bool {
    !id.is_empty()
        && !id.contains("..")
        && !id.chars().any(|c| c == '/' || c == '\\' || c.is_control())
}

/// Guest control channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SshSettings {
    pub user: String,
    pub key_path: PathBuf,
    pub reachable_timeout_secs: u64,
    pub reachable_interval_ms: u64,
    /// Limit for commands and file writes that do not set their own.
    pub command_timeout_secs: u64,
}

impl Default for SshSettings {
    fn default() -> Self {
        Self {
            user: "user".to_string(),
            key_path: PathBuf::from("/etc/sandbox/ssh/id_ed25519"),
            reachable_timeout_secs: 120,
            reachable_interval_ms: 500,
            command_timeout_secs: crate::ssh::DEFAULT_COMMAND_TIMEOUT.as_secs(),
        }
    }
}

impl SshSettings {
    pub fn reachable_timeout(&self) -> Duration {
        Duration::from_secs(self.reachable_timeout_secs)
    }

    pub fn reachable_interval(&self) -> Duration {
        Duration::from_millis(self.reachable_interval_ms)
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }
}

/// Job execution tuning.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutionSettings {
    pub poll_interval_secs: u64,
    pub max_runtime_secs: u64,
    /// Consecutive unanswered polls before the guest counts as crashed.
    pub unreachable_limit: u32,
    /// Host directory holding the scripts pushed into every guest.
    pub scripts_dir: PathBuf,
    pub entrypoint: String,
    pub download_script: String,
    pub guest_home: String,
    pub preflight: bool,
    /// Skips network-log upload and host-side completion reports.
    pub benchmark: bool,
}

impl Default for ExecutionSettings {
    fn default() -> Self {
        Self {
            poll_interval_secs: 2,
            max_runtime_secs: 24 * 60 * 60,
            unreachable_limit: 5,
            scripts_dir: PathBuf::from("/opt/sandbox/guest-scripts"),
            entrypoint: "run-agent".to_string(),
            download_script: "download-storage".to_string(),
            guest_home: "/home/user".to_string(),
            preflight: true,
            benchmark: false,
        }
    }
}

impl ExecutionSettings {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs)
    }

    pub fn max_runtime(&self) -> Duration {
        Duration::from_secs(self.max_runtime_secs)
    }
}

impl RunnerConfig {
    /// Parse TOML text. Environment overrides are not applied.
    pub fn from_toml_str(text: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` (or defaults when `None`), then apply `SANDBOX_*`
    /// environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(path) => {
                let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
                    path: path.display().to_string(),
                    source,
                })?;
                toml::from_str(&text)?
            }
            None => Self::default(),
        };
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Override fields from the environment.
    ///
    /// - `SANDBOX_API_URL`
    /// - `SANDBOX_REGISTRY_PATH`
    /// - `SANDBOX_POOL_SIZE`
    /// - `SANDBOX_SCRIPTS_DIR`
    /// - `SANDBOX_BENCHMARK` (`true`/`false`)
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup("SANDBOX_API_URL") {
            self.api.base_url = url;
        }
        if let Some(path) = lookup("SANDBOX_REGISTRY_PATH") {
            self.network.registry_path = PathBuf::from(path);
        }
        if let Some(size) = lookup("SANDBOX_POOL_SIZE") {
            self.network.pool_size = size.parse().map_err(|_| ConfigError::InvalidValue {
                key: "SANDBOX_POOL_SIZE".to_string(),
                detail: format!("expected a non-negative integer, got {size:?}"),
            })?;
        }
        if let Some(dir) = lookup("SANDBOX_SCRIPTS_DIR") {
            self.execution.scripts_dir = PathBuf::from(dir);
        }
        if let Some(flag) = lookup("SANDBOX_BENCHMARK") {
            self.execution.benchmark = flag.eq_ignore_ascii_case("true");
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |key: &str, detail: &str| ConfigError::InvalidValue {
            key: key.to_string(),
            detail: detail.to_string(),
        };

        if !self.api.base_url.starts_with("http://") && !self.api.base_url.starts_with("https://") {
            return Err(invalid("api.base_url", "must be an http(s) URL"));
        }
        if self.vm.vcpus == 0 {
            return Err(invalid("vm.vcpus", "must be at least 1"));
        }
        if self.vm.memory_mb < 128 {
            return Err(invalid("vm.memory_mb", "must be at least 128"));
        }
        if self.network.tap_prefix.is_empty() {
            return Err(invalid("network.tap_prefix", "must not be empty"));
        }
        if self.network.subnet.octets()[3] != 0 {
            return Err(invalid("network.subnet", "must be a /24 network address"));
        }
        if self.network.orphan_sweep_secs == 0 {
            return Err(invalid("network.orphan_sweep_secs", "must be positive"));
        }
        if self.execution.unreachable_limit == 0 {
            return Err(invalid("execution.unreachable_limit", "must be at least 1"));
        }
        if self.ssh.command_timeout_secs == 0 {
            return Err(invalid("ssh.command_timeout_secs", "must be positive"));
        }
        if self.execution.poll_interval_secs == 0 {
            return Err(invalid("execution.poll_interval_secs", "must be positive"));
        }
        if self.execution.max_runtime_secs < self.execution.poll_interval_secs {
            return Err(invalid(
                "execution.max_runtime_secs",
                "must not be shorter than the poll interval",
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_file_is_default() {
        let config = RunnerConfig::from_toml_str("").unwrap();
        assert_eq!(config, RunnerConfig::default());
        assert_eq!(config.execution.max_runtime(), Duration::from_secs(86_400));
        assert_eq!(config.network.subnet, Ipv4Addr::new(172, 16, 0, 0));
    }

    #[test]
    fn test_partial_sections() {
        let config = RunnerConfig::from_toml_str(
            r#"
            [api]
            base_url = "https://api.example.com"

            [network]
            pool_size = 8
            registry_path = "/tmp/reg.json"
            dns_servers = ["9.9.9.9"]
            "#,
        )
        .unwrap();
        assert_eq!(config.api.base_url, "https://api.example.com");
        assert_eq!(config.network.pool_size, 8);
        assert_eq!(config.network.dns_servers, vec![Ipv4Addr::new(9, 9, 9, 9)]);
        assert_eq!(config.network.lock_path(), PathBuf::from("/tmp/reg.json.lock"));
        assert_eq!(config.vm.vcpus, 2);
    }

    #[test]
    fn test_env_overrides() {
        let mut config = RunnerConfig::default();
        config
            .apply_env_overrides(|key| match key {
                "SANDBOX_API_URL" => Some("https://override.example".into()),
                "SANDBOX_POOL_SIZE" => Some("12".into()),
                "SANDBOX_BENCHMARK" => Some("TRUE".into()),
                _ => None,
            })
            .unwrap();
        assert_eq!(config.api.base_url, "https://override.example");
        assert_eq!(config.network.pool_size, 12);
        assert!(config.execution.benchmark);
    }

    #[test]
    fn test_bad_pool_size_override() {
        let mut config = RunnerConfig::default();
        let err = config
            .apply_env_overrides(|key| (key == "SANDBOX_POOL_SIZE").then(|| "many".into()))
            .unwrap_err();
        assert!(err.to_string().contains("SANDBOX_POOL_SIZE"));
    }

    #[test]
    fn test_validation_rejects_bad_values() {
        let err = RunnerConfig::from_toml_str("[vm]\nvcpus = 0").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue { ref key, .. } if key == "vm.vcpus"));

        let err = RunnerConfig::from_toml_str("[network]\nsubnet = \"10.0.0.5\"").unwrap_err();
        assert!(err.to_string().contains("network.subnet"));

        let err = RunnerConfig::from_toml_str("[api]\nbase_url = \"ftp://x\"").unwrap_err();
        assert!(err.to_string().contains("api.base_url"));
    }

    #[test]
    fn test_network_log_path() {
        let settings = NetworkSettings {
            network_log_dir: PathBuf::from("/logs"),
            ..NetworkSettings::default()
        };
        assert_eq!(
            settings.network_log_path("run-1"),
            Some(PathBuf::from("/logs/run-1.jsonl"))
        );
        assert_eq!(settings.network_log_path("../../etc/passwd"), None);
        assert_eq!(settings.network_log_path("a/b"), None);
        assert_eq!(settings.network_log_path(".."), None);
        assert_eq!(settings.network_log_path(""), None);
    }

    #[test]
    fn test_file_name_safe_ids() {
        assert!(is_file_name_safe("3f2c9a1e-77b0-4d4e-9f1a-0c2b5e8d9a10"));
        assert!(is_file_name_safe("run.v2"));
        assert!(!is_file_name_safe("run\\x"));
        assert!(!is_file_name_safe("run\nid"));
    }

    #[test]
    fn test_load_missing_file() {
        let err = RunnerConfig::load(Some(Path::new("/definitely/missing.toml"))).unwrap_err();
        assert!(matches!(err, ConfigError::Read { .. }));
    }
}

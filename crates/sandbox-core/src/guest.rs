//! Fixed guest-side paths and the scripts pushed into every guest.

use std::path::{Path, PathBuf};

use crate::error::ExecutorError;

/// Directory the orchestration scripts are installed into.
pub const SCRIPTS_DIR: &str = "/usr/local/lib/sandbox";
/// Environment payload read by the entrypoint.
pub const ENV_FILE: &str = "/tmp/sandbox-env.json";
/// Combined stdout/stderr of the entrypoint.
pub const LOG_FILE: &str = "/tmp/sandbox-run.log";
/// Written with the entrypoint's exit code when it finishes.
pub const EXIT_CODE_FILE: &str = "/tmp/sandbox-run.exitcode";
/// PID of the detached entrypoint.
pub const PID_FILE: &str = "/tmp/sandbox-run.pid";
/// Storage manifest consumed by the download script.
pub const STORAGE_MANIFEST_FILE: &str = "/tmp/sandbox-storage.json";
/// Proxy CA as installed in the guest trust store.
pub const CA_CERT_FILE: &str = "/usr/local/share/ca-certificates/sandbox-proxy-ca.crt";
pub const RESOLV_CONF: &str = "/etc/resolv.conf";

/// Guest path of an installed script.
pub fn script_path(name: &str) -> String {
    format!("{SCRIPTS_DIR}/{name}")
}

/// One script: file name and contents.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GuestScript {
    pub name: String,
    pub content: Vec<u8>,
}

/// Scripts loaded once at startup and pushed to each guest.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GuestScripts {
    scripts: Vec<GuestScript>,
}

impl GuestScripts {
    pub fn from_entries<I, N, C>(entries: I) -> Self
    where
        I: IntoIterator<Item = (N, C)>,
        N: Into<String>,
        C: Into<Vec<u8>>,
    {
        Self {
            scripts: entries
                .into_iter()
                .map(|(name, content)| GuestScript {
                    name: name.into(),
                    content: content.into(),
                })
                .collect(),
        }
    }

    /// Load every regular file in `dir`, sorted by name.
    pub fn load_dir(dir: &Path) -> Result<Self, ExecutorError> {
        let scripts_err = |source| ExecutorError::Scripts {
            path: dir.to_path_buf(),
            source,
        };

        let mut paths: Vec<PathBuf> = std::fs::read_dir(dir)
            .map_err(scripts_err)?
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|p| p.is_file())
            .collect();
        paths.sort();

        let mut scripts = Vec::with_capacity(paths.len());
        for path in paths {
            let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let content = std::fs::read(&path).map_err(scripts_err)?;
            scripts.push(GuestScript {
                name: name.to_string(),
                content,
            });
        }
        Ok(Self { scripts })
    }

    pub fn iter(&self) -> impl Iterator<Item = &GuestScript> {
        self.scripts.iter()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.scripts.iter().any(|s| s.name == name)
    }

    pub fn len(&self) -> usize {
        self.scripts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.scripts.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_dir_sorted_files_only() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("run-agent"), "#!/bin/sh\n").unwrap();
        std::fs::write(dir.path().join("download-storage"), "#!/bin/sh\n").unwrap();
        std::fs::create_dir(dir.path().join("lib")).unwrap();

        let scripts = GuestScripts::load_dir(dir.path()).unwrap();
        let names: Vec<_> = scripts.iter().map(|s| s.name.as_str()).collect();
        assert_eq!(names, vec!["download-storage", "run-agent"]);
        assert!(scripts.contains("run-agent"));
    }

    #[test]
    fn test_load_missing_dir() {
        let err = GuestScripts::load_dir(Path::new("/definitely/not/here")).unwrap_err();
        assert!(matches!(err, ExecutorError::Scripts { .. }));
    }

    #[test]
    fn test_script_path() {
        assert_eq!(script_path("run-agent"), "/usr/local/lib/sandbox/run-agent");
    }
}

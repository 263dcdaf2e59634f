//! Cross-process advisory locking for shared registry files.
//!
//! [`RegistryLock`] is the seam the IP registry depends on. Production code
//! uses [`FlockLock`]; tests inject an in-process lock from [`crate::fakes`].

use std::fs::File;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use nix::fcntl::{Flock, FlockArg};

use crate::error::{NetError, Result};

/// A held lock. Dropping the guard releases the lock.
pub struct LockGuard {
    _inner: Box<dyn Send>,
}

impl LockGuard {
    /// Wrap any RAII value whose drop releases the underlying lock.
    pub fn new<G: Send + 'static>(inner: G) -> Self {
        Self {
            _inner: Box::new(inner),
        }
    }
}

impl std::fmt::Debug for LockGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("LockGuard")
    }
}

/// Exclusive lock guarding one read-modify-write cycle.
#[async_trait]
pub trait RegistryLock: Send + Sync {
    /// Wait until the lock is available and take it.
    async fn acquire(&self) -> Result<LockGuard>;
}

/// `flock(2)`-based advisory lock on a sibling lock file.
#[derive(Debug, Clone)]
pub struct FlockLock {
    path: PathBuf,
}

impl FlockLock {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Take the lock without waiting; fails with [`NetError::LockHeld`] if
    /// another holder has it.
    pub async fn try_acquire(&self) -> Result<LockGuard> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let file = open_lock_file(&path)?;
            Flock::lock(file, FlockArg::LockExclusiveNonblock)
                .map(LockGuard::new)
                .map_err(|(_, e)| {
                    if e == nix::errno::Errno::EWOULDBLOCK {
                        NetError::LockHeld {
                            path: path.display().to_string(),
                        }
                    } else {
                        NetError::Lock(format!("flock {}: {e}", path.display()))
                    }
                })
        })
        .await?
    }
}

#[async_trait]
impl RegistryLock for FlockLock {
    async fn acquire(&self) -> Result<LockGuard> {
        let path = self.path.clone();
        tokio::task::spawn_blocking(move || {
            let file = open_lock_file(&path)?;
            Flock::lock(file, FlockArg::LockExclusive)
                .map(LockGuard::new)
                .map_err(|(_, e)| NetError::Lock(format!("flock {}: {e}", path.display())))
        })
        .await?
    }
}

/// Open (or create) the lock file, creating parent directories as needed.
fn open_lock_file(path: &Path) -> Result<File> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| NetError::Lock(format!("create lock dir {}: {e}", parent.display())))?;
    }
    File::options()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(path)
        .map_err(|e| NetError::Lock(format!("open lock {}: {e}", path.display())))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_acquire_creates_lock_file_and_parents() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state").join("ip-registry.json.lock");

        let guard = FlockLock::new(&path).acquire().await.unwrap();
        assert!(path.exists());
        drop(guard);
    }

    #[tokio::test]
    async fn test_held_lock_rejects_try_acquire() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FlockLock::new(dir.path().join("registry.lock"));

        let _guard = lock.acquire().await.unwrap();
        let err = lock.try_acquire().await.unwrap_err();
        assert!(matches!(err, NetError::LockHeld { .. }));
    }

    #[tokio::test]
    async fn test_lock_released_on_drop() {
        let dir = tempfile::tempdir().unwrap();
        let lock = FlockLock::new(dir.path().join("registry.lock"));

        let guard = lock.acquire().await.unwrap();
        drop(guard);
        let _again = lock.try_acquire().await.unwrap();
    }

    #[tokio::test]
    async fn test_invalid_path_is_an_error() {
        // /dev/null is a file, so no directory can be created beneath it.
        let lock = FlockLock::new("/dev/null/impossible/registry.lock");
        assert!(lock.acquire().await.is_err());
    }
}

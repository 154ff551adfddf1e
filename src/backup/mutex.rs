use crate::backup::result_error::error::Error;
use crate::backup::result_error::result::Result;
use crate::backup::result_error::AddMsg;
use nix::errno::Errno;
use nix::fcntl::{flock, FlockArg};
use std::fs::{File, OpenOptions};
use std::os::fd::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Hands out per-rule exclusive locks backed by `<lock dir>/<rule>`.
#[derive(Clone, Debug)]
pub struct MutexManager {
    lock_dir: PathBuf,
}

/// Held lock of one rule. The lock is released when this value is dropped or
/// the process dies, since it lives with the open file.
#[derive(Debug)]
pub struct RuleLock {
    _file: File,
    rule: String,
}

impl RuleLock {
    pub fn rule(&self) -> &str {
        &self.rule
    }
}

impl MutexManager {
    pub fn new<P: Into<PathBuf>>(lock_dir: P) -> Self {
        Self {
            lock_dir: lock_dir.into(),
        }
    }

    pub fn lock_dir(&self) -> &Path {
        &self.lock_dir
    }

    /// Never blocks: a lock held elsewhere fails with [`Error::LockHeld`].
    pub fn lock(&self, rule: &str) -> Result<RuleLock> {
        let path = self.lock_dir.join(rule);
        let file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(false)
            .open(&path)
            .map_err(Error::from)
            .add_msg(format!("Opening lock file {path:?} failed"))?;
        match flock(file.as_raw_fd(), FlockArg::LockExclusiveNonblock) {
            Ok(()) => {
                debug!("Locked rule {rule:?}");
                Ok(RuleLock {
                    _file: file,
                    rule: rule.to_string(),
                })
            }
            Err(Errno::EWOULDBLOCK) => Err(Error::lock_held(rule)),
            Err(e) => Err(Error::from(e).add_msg(format!("Locking {path:?} failed"))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    #[test]
    fn test_second_lock_fails_fast() {
        let dir = TempDir::new().unwrap();
        let manager = MutexManager::new(dir.path());

        let held = manager.lock("nightly").unwrap();
        assert_eq!(held.rule(), "nightly");

        let started = Instant::now();
        let error = manager.lock("nightly").unwrap_err();
        assert!(error.is_lock_held());
        assert!(started.elapsed() < Duration::from_secs(1));

        assert!(manager.lock("weekly").is_ok());
        drop(held);
        assert!(manager.lock("nightly").is_ok());
    }

    #[test]
    fn test_missing_lock_dir_is_error() {
        let dir = TempDir::new().unwrap();
        let manager = MutexManager::new(dir.path().join("missing"));
        let error = manager.lock("nightly").unwrap_err();
        assert!(!error.is_lock_held());
    }
}

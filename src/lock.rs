//! Singleton cross-process lock (spec §4.6). Only one Shipper process may hold upload
//! authority at a time; a holder that stops refreshing is presumed dead and may be taken
//! over by a challenger once the lease looks stale.
//!
//! Uses `flock(2)` directly via `libc`, the same direct-syscall idiom
//! node-forwarder/src/spool.rs::statvfs_bytes uses for disk accounting, since an
//! advisory lock held for the life of the process doesn't fit a borrowed-guard API
//! cleanly. A sidecar heartbeat file is refreshed on an interval the way node-forwarder
//! persists its spool state: write to a `.tmp` path, then atomically rename over the
//! real one.

use crate::error::{AgentError, Result};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::time;
use tracing::{info, warn};

/// A lease is considered stale once its heartbeat file hasn't been refreshed for this
/// long, regardless of how often the holder says it refreshes (a crashed holder stops
/// writing entirely).
pub const STALE_AFTER: Duration = Duration::from_secs(90);

pub struct SingletonLock {
    file: File,
    heartbeat_path: PathBuf,
}

impl SingletonLock {
    /// Try to acquire the lock at `dir/shipper.lock`. If another live holder has it,
    /// returns `Ok(None)`. If the existing heartbeat is stale, takes it over by
    /// stealing the flock (the dead holder's fd is gone, so the kernel already
    /// released it; this just documents the takeover in the log).
    pub fn try_acquire(dir: &Path) -> Result<Option<Self>> {
        std::fs::create_dir_all(dir)?;
        let lock_path = dir.join("shipper.lock");
        let heartbeat_path = dir.join("shipper.heartbeat");

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&lock_path)?;

        let rc = unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(AgentError::Io(err));
        }

        if is_heartbeat_stale(&heartbeat_path) && heartbeat_path.exists() {
            warn!(path = %heartbeat_path.display(), "acquired lock with stale heartbeat, previous holder presumed dead");
        }

        let lock = Self { file, heartbeat_path };
        lock.refresh()?;
        info!("acquired shipper singleton lock");
        Ok(Some(lock))
    }

    /// Record a fresh heartbeat so other candidates don't treat this lease as stale.
    pub fn refresh(&self) -> Result<()> {
        let tmp = self.heartbeat_path.with_extension("tmp");
        let now = chrono::Utc::now().to_rfc3339();
        {
            let mut f = File::create(&tmp)?;
            f.write_all(now.as_bytes())?;
            f.sync_all()?;
        }
        std::fs::rename(&tmp, &self.heartbeat_path)?;
        Ok(())
    }

    /// Background refresh loop; exits when `stop` resolves.
    pub async fn run_refresh_loop(&self, interval: Duration, mut stop: tokio::sync::oneshot::Receiver<()>) {
        let mut ticker = time::interval(interval);
        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    if let Err(err) = self.refresh() {
                        warn!(%err, "failed to refresh singleton lock heartbeat");
                    }
                }
                _ = &mut stop => break,
            }
        }
    }
}

impl Drop for SingletonLock {
    fn drop(&mut self) {
        unsafe {
            libc::flock(self.file.as_raw_fd(), libc::LOCK_UN);
        }
        let _ = std::fs::remove_file(&self.heartbeat_path);
    }
}

fn is_heartbeat_stale(path: &Path) -> bool {
    let Ok(meta) = std::fs::metadata(path) else {
        return true;
    };
    let Ok(modified) = meta.modified() else {
        return true;
    };
    match modified.elapsed() {
        Ok(elapsed) => elapsed > STALE_AFTER,
        Err(_) => false,
    }
}

pub fn lock_error(msg: impl Into<String>) -> AgentError {
    AgentError::Lock(msg.into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn second_process_cannot_acquire_while_first_holds() {
        let dir = tempdir().unwrap();
        let first = SingletonLock::try_acquire(dir.path()).unwrap();
        assert!(first.is_some());

        let second = SingletonLock::try_acquire(dir.path()).unwrap();
        assert!(second.is_none());
    }

    #[test]
    fn lock_is_reacquirable_after_drop() {
        let dir = tempdir().unwrap();
        {
            let first = SingletonLock::try_acquire(dir.path()).unwrap();
            assert!(first.is_some());
        }
        let second = SingletonLock::try_acquire(dir.path()).unwrap();
        assert!(second.is_some());
    }

    #[test]
    fn stale_heartbeat_is_stale_when_file_missing() {
        let dir = tempdir().unwrap();
        assert!(is_heartbeat_stale(&dir.path().join("nonexistent")));
    }
}

//! Engine instance lock.
//!
//! A single lock file under the state directory prevents two engine
//! instances from grinding the same repository. Acquisition writes pid and
//! start time; release unlinks. A lock whose pid is no longer alive is
//! stale and reclaimed.

use chrono::{DateTime, Utc};
use nix::sys::signal::kill;
use nix::unistd::Pid;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::domain::errors::{EngineError, EngineResult};
use crate::infrastructure::state::{read_json, write_json_atomic};

const LOCK_FILE: &str = "lockfile";

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    pid: i32,
    started_at: DateTime<Utc>,
}

/// Held lock on the state directory; released on drop.
#[derive(Debug)]
pub struct GrindLock {
    path: PathBuf,
}

impl GrindLock {
    /// Acquire the lock, reclaiming it if the recorded pid is dead.
    pub fn acquire(state_dir: &Path) -> EngineResult<Self> {
        std::fs::create_dir_all(state_dir)?;
        let path = state_dir.join(LOCK_FILE);

        if let Some(existing) = read_json::<LockRecord>(&path).unwrap_or(None) {
            if pid_alive(existing.pid) {
                return Err(EngineError::LockHeld {
                    pid: existing.pid,
                    started_at: existing.started_at.to_rfc3339(),
                });
            }
            warn!(
                pid = existing.pid,
                "reclaiming stale lock from dead process"
            );
        }

        #[allow(clippy::cast_possible_wrap)]
        let record = LockRecord {
            pid: std::process::id() as i32,
            started_at: Utc::now(),
        };
        write_json_atomic(&path, &record)?;
        info!(pid = record.pid, path = %path.display(), "lock acquired");

        Ok(Self { path })
    }

    /// Explicit release; equivalent to dropping the guard.
    pub fn release(self) {
        drop(self);
    }
}

impl Drop for GrindLock {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(path = %self.path.display(), error = %e, "failed to remove lockfile");
            }
        }
    }
}

/// Signal-0 liveness probe.
fn pid_alive(pid: i32) -> bool {
    kill(Pid::from_raw(pid), None).is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_acquire_and_release() {
        let dir = tempfile::tempdir().unwrap();
        let lock = GrindLock::acquire(dir.path()).unwrap();
        assert!(dir.path().join(LOCK_FILE).exists());
        lock.release();
        assert!(!dir.path().join(LOCK_FILE).exists());
    }

    #[test]
    fn test_second_acquire_fails_while_held() {
        let dir = tempfile::tempdir().unwrap();
        let _lock = GrindLock::acquire(dir.path()).unwrap();

        // Same pid is alive (it's us), so a second acquire must refuse.
        match GrindLock::acquire(dir.path()) {
            Err(EngineError::LockHeld { pid, .. }) => {
                #[allow(clippy::cast_possible_wrap)]
                let own = std::process::id() as i32;
                assert_eq!(pid, own);
            }
            other => panic!("expected LockHeld, got {other:?}"),
        }
    }

    #[test]
    fn test_stale_lock_is_reclaimed() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join(LOCK_FILE);

        // Write a lock owned by a pid that cannot be alive.
        write_json_atomic(
            &path,
            &LockRecord {
                pid: i32::MAX - 1,
                started_at: Utc::now(),
            },
        )
        .unwrap();

        let lock = GrindLock::acquire(dir.path());
        assert!(lock.is_ok());
    }
}

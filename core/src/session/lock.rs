//! Cross-process file lock guarding the session store.
//!
//! Exclusive creation of a sibling `.lock` file; contents record the
//! holder's process id and acquisition time so a crashed holder's lock can
//! be detected and evicted.

use crate::error::{CoreError, Result};
use crate::util::now_ms;
use serde::{Deserialize, Serialize};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;

const POLL_INTERVAL: Duration = Duration::from_millis(25);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(10);
const STALE_AGE_MS: i64 = 30_000;

#[derive(Debug, Serialize, Deserialize)]
struct LockPayload {
    pid: u32,
    started_at_ms: i64,
}

/// An acquired lock; releases (best effort) on drop.
pub struct FileLock {
    path: PathBuf,
}

impl FileLock {
    /// Acquire the lock at `lock_path`, retrying every 25ms up to a 10s
    /// timeout. A lock file older than 30s is considered abandoned and is
    /// forcibly removed once before a final retry.
    pub fn acquire(lock_path: &Path) -> Result<Self> {
        let deadline = std::time::Instant::now() + ACQUIRE_TIMEOUT;
        let mut evicted_stale = false;

        loop {
            match Self::try_create(lock_path) {
                Ok(()) => return Ok(Self { path: lock_path.to_path_buf() }),
                Err(_) => {
                    if !evicted_stale {
                        if let Some(age) = Self::existing_age_ms(lock_path) {
                            if age > STALE_AGE_MS {
                                let _ = std::fs::remove_file(lock_path);
                                evicted_stale = true;
                                continue;
                            }
                        }
                    }

                    if std::time::Instant::now() >= deadline {
                        return Err(CoreError::LockTimeout {
                            path: lock_path.to_path_buf(),
                            waited: ACQUIRE_TIMEOUT,
                        });
                    }
                    std::thread::sleep(POLL_INTERVAL);
                }
            }
        }
    }

    fn try_create(lock_path: &Path) -> std::io::Result<()> {
        if let Some(parent) = lock_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(lock_path)?;
        let payload = LockPayload {
            pid: std::process::id(),
            started_at_ms: now_ms(),
        };
        let bytes = serde_json::to_vec(&payload).unwrap_or_default();
        file.write_all(&bytes)?;
        Ok(())
    }

    fn existing_age_ms(lock_path: &Path) -> Option<i64> {
        let content = std::fs::read_to_string(lock_path).ok()?;
        let payload: LockPayload = serde_json::from_str(&content).ok()?;
        Some((now_ms() - payload.started_at_ms).max(0))
    }
}

impl Drop for FileLock {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

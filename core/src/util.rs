//! Small supporting utilities shared across subsystems: atomic file I/O and
//! timestamp helpers. Grounded in `scheduler/store.rs`'s `atomic_write`.

use crate::error::{CoreError, Result};
use chrono::{DateTime, Utc};
use std::fs;
use std::path::Path;

/// Write `bytes` to `dest` atomically: write to a sibling temp file, then
/// rename over the destination. The temp file is removed on a failed
/// rename (best effort).
pub fn atomic_write(dest: &Path, bytes: &[u8]) -> Result<()> {
    let parent = dest.parent().ok_or_else(|| CoreError::Internal {
        message: format!("destination path {dest:?} has no parent directory"),
    })?;
    fs::create_dir_all(parent)?;

    let tmp = dest.with_extension(format!(
        "tmp.{}",
        uuid::Uuid::new_v4().simple()
    ));

    fs::write(&tmp, bytes)?;

    if let Err(rename_err) = fs::rename(&tmp, dest) {
        let _ = fs::remove_file(&tmp);
        return Err(rename_err.into());
    }

    Ok(())
}

/// Current time in epoch milliseconds.
pub fn now_ms() -> i64 {
    Utc::now().timestamp_millis()
}

/// Format a millisecond epoch timestamp as `hh:mm:ss` in UTC, used for the
/// `System: [hh:mm:ss] <text>` lines the heartbeat coordinator prepends to
/// agent input.
pub fn format_hms(ts_ms: i64) -> String {
    DateTime::<Utc>::from_timestamp_millis(ts_ms)
        .unwrap_or_else(Utc::now)
        .format("%H:%M:%S")
        .to_string()
}

/// Rename `path` aside with a timestamp suffix, used by store-corruption
/// recovery.
pub fn rename_aside(path: &Path) -> Result<std::path::PathBuf> {
    let suffix = Utc::now().format("%Y%m%dT%H%M%S%.3f");
    let renamed = path.with_extension(format!("corrupt.{suffix}"));
    if path.exists() {
        fs::rename(path, &renamed)?;
    }
    Ok(renamed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn atomic_write_round_trips() {
        let dir = TempDir::new().unwrap();
        let dest = dir.path().join("x.json");
        atomic_write(&dest, b"{\"a\":1}").unwrap();
        assert_eq!(fs::read_to_string(&dest).unwrap(), "{\"a\":1}");
    }

    #[test]
    fn format_hms_is_stable_width() {
        let s = format_hms(0);
        assert_eq!(s.len(), 8);
    }
}

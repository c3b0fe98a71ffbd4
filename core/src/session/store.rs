//! Durable, cross-process-safe session store.
//!
//! Backed by a single JSON file mapping session key to session entry. Reads
//! are served from a 45-second TTL cache keyed on the file's modification
//! time; writes go through a cross-process file lock and rewrite the whole
//! document atomically.

use crate::error::{CoreError, Result};
use crate::session::entry::SessionEntry;
use crate::session::key::SessionKey;
use crate::session::lock::FileLock;
use crate::util::{atomic_write, now_ms};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::SystemTime;

const CACHE_TTL_MS: i64 = 45_000;
const MAX_AGE_MS: i64 = 30 * 24 * 60 * 60 * 1000;
const MAX_ENTRIES: usize = 500;
const ROTATE_BYTES: u64 = 10 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SessionDocument {
    #[serde(flatten)]
    pub entries: BTreeMap<String, SessionEntry>,
}

struct Cache {
    mtime: Option<SystemTime>,
    doc: SessionDocument,
}

pub struct SessionStore {
    path: PathBuf,
    lock_path: PathBuf,
    cache: Mutex<Option<(Cache, i64)>>,
}

impl SessionStore {
    pub fn new(path: PathBuf) -> Self {
        let lock_path = path.with_extension("json.lock");
        Self {
            path,
            lock_path,
            cache: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Return a snapshot copy, served from the TTL cache when the file's
    /// mtime is unchanged and the cache is still fresh.
    pub fn load(&self) -> Result<SessionDocument> {
        let mtime = self.file_mtime();
        let mut guard = self.cache.lock().unwrap();

        if let Some((cache, cached_at)) = guard.as_ref() {
            let fresh = now_ms() - cached_at < CACHE_TTL_MS;
            if fresh && cache.mtime == mtime {
                return Ok(cache.doc.clone());
            }
        }

        let doc = self.read_from_disk()?;
        *guard = Some((
            Cache {
                mtime,
                doc: doc.clone(),
            },
            now_ms(),
        ));
        Ok(doc)
    }

    /// Acquire the lock, re-read bypassing cache, apply `mutator`, run
    /// maintenance, write atomically, invalidate the cache.
    pub fn update<F>(&self, mutator: F) -> Result<SessionDocument>
    where
        F: FnOnce(&mut SessionDocument),
    {
        let _lock = FileLock::acquire(&self.lock_path)?;

        let mut doc = self.read_from_disk()?;
        mutator(&mut doc);
        self.run_maintenance(&mut doc);
        self.write_to_disk(&mut doc)?;

        let mut guard = self.cache.lock().unwrap();
        *guard = Some((
            Cache {
                mtime: self.file_mtime(),
                doc: doc.clone(),
            },
            now_ms(),
        ));

        Ok(doc)
    }

    /// Convenience: fetch or create the entry for `key`, mutate it, persist.
    pub fn upsert<F>(&self, key: &SessionKey, mutator: F) -> Result<SessionEntry>
    where
        F: FnOnce(&mut SessionEntry),
    {
        let key_str = key.as_str().to_string();
        let doc = self.update(|doc| {
            let entry = doc
                .entries
                .entry(key_str.clone())
                .or_insert_with(|| SessionEntry::new(now_ms()));
            mutator(entry);
            entry.touch(now_ms());
        })?;
        Ok(doc.entries.get(key.as_str()).cloned().expect("just inserted"))
    }

    /// Async counterpart to `update`, off-loaded to the blocking thread pool:
    /// `FileLock::acquire` can sleep for up to 10s under contention, which
    /// would otherwise stall a Tokio worker thread.
    pub async fn update_async<F>(self: Arc<Self>, mutator: F) -> Result<SessionDocument>
    where
        F: FnOnce(&mut SessionDocument) + Send + 'static,
    {
        tokio::task::spawn_blocking(move || self.update(mutator))
            .await
            .map_err(|e| CoreError::Internal { message: e.to_string() })?
    }

    /// Async counterpart to `upsert`; see `update_async`.
    pub async fn upsert_async<F>(self: Arc<Self>, key: SessionKey, mutator: F) -> Result<SessionEntry>
    where
        F: FnOnce(&mut SessionEntry) + Send + 'static,
    {
        tokio::task::spawn_blocking(move || self.upsert(&key, mutator))
            .await
            .map_err(|e| CoreError::Internal { message: e.to_string() })?
    }

    fn run_maintenance(&self, doc: &mut SessionDocument) {
        let now = now_ms();

        doc.entries
            .retain(|_, entry| now - entry.updated_at_ms <= MAX_AGE_MS);

        if doc.entries.len() > MAX_ENTRIES {
            let mut by_age: Vec<(String, i64)> = doc
                .entries
                .iter()
                .map(|(k, v)| (k.clone(), v.updated_at_ms))
                .collect();
            by_age.sort_by_key(|(_, ts)| *ts);
            let excess = doc.entries.len() - MAX_ENTRIES;
            for (key, _) in by_age.into_iter().take(excess) {
                doc.entries.remove(&key);
            }
        }
    }

    fn read_from_disk(&self) -> Result<SessionDocument> {
        if !self.path.exists() {
            return Ok(SessionDocument::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(SessionDocument::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    fn write_to_disk(&self, doc: &mut SessionDocument) -> Result<()> {
        if self.should_rotate() {
            self.rotate(doc);
        }
        let bytes = serde_json::to_vec_pretty(doc)?;
        atomic_write(&self.path, &bytes)
    }

    fn should_rotate(&self) -> bool {
        std::fs::metadata(&self.path)
            .map(|m| m.len() > ROTATE_BYTES)
            .unwrap_or(false)
    }

    /// Split `doc` in half by `updatedAt`, archive the older half to a
    /// timestamped sidecar file, and leave only the newer half for
    /// `write_to_disk` to persist to the primary path.
    fn rotate(&self, doc: &mut SessionDocument) {
        let mut by_age: Vec<(String, i64)> = doc
            .entries
            .iter()
            .map(|(k, v)| (k.clone(), v.updated_at_ms))
            .collect();
        by_age.sort_by_key(|(_, ts)| *ts);

        let half = by_age.len() / 2;
        if half == 0 {
            return;
        }

        let mut archived = BTreeMap::new();
        for (key, _) in &by_age[..half] {
            if let Some(entry) = doc.entries.remove(key) {
                archived.insert(key.clone(), entry);
            }
        }

        let archive_doc = SessionDocument { entries: archived };
        if let Ok(bytes) = serde_json::to_vec_pretty(&archive_doc) {
            let archive_path = self.path.with_extension(format!("json.{}.archive", now_ms()));
            let _ = std::fs::write(archive_path, bytes);
        }
    }

    fn file_mtime(&self) -> Option<SystemTime> {
        std::fs::metadata(&self.path).and_then(|m| m.modified()).ok()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::entry::SessionEntry;
    use tempfile::TempDir;

    fn store_in(dir: &TempDir) -> SessionStore {
        SessionStore::new(dir.path().join("sessions.json"))
    }

    #[test]
    fn load_missing_file_is_empty() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let doc = store.load().unwrap();
        assert!(doc.entries.is_empty());
    }

    #[test]
    fn update_persists_and_load_reflects_it() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        store
            .update(|doc| {
                doc.entries
                    .insert("agent:a1:main".to_string(), SessionEntry::new(now_ms()));
            })
            .unwrap();

        let doc = store.load().unwrap();
        assert_eq!(doc.entries.len(), 1);
        assert!(doc.entries.contains_key("agent:a1:main"));
    }

    #[test]
    fn session_id_is_stable_across_updates() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let key = SessionKey::parse("agent:a1:main").unwrap();

        let first = store.upsert(&key, |_| {}).unwrap();
        let second = store.upsert(&key, |e| e.subject = Some("hi".into())).unwrap();

        assert_eq!(first.session_id, second.session_id);
        assert_eq!(second.subject.as_deref(), Some("hi"));
    }

    #[test]
    fn maintenance_prunes_entries_older_than_30_days() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);
        let stale_ts = now_ms() - (31 * 24 * 60 * 60 * 1000);

        let mut entry = SessionEntry::new(stale_ts);
        entry.updated_at_ms = stale_ts;
        let mut doc = SessionDocument::default();
        doc.entries.insert("agent:old:main".to_string(), entry);
        std::fs::write(store.path(), serde_json::to_vec(&doc).unwrap()).unwrap();

        // An update re-reads from disk (bypassing any cache) and runs
        // maintenance, which should drop the stale entry.
        let doc = store.update(|_| {}).unwrap();
        assert!(!doc.entries.contains_key("agent:old:main"));
    }

    #[test]
    fn maintenance_caps_total_entries() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        store
            .update(|doc| {
                for i in 0..(MAX_ENTRIES + 10) {
                    let mut entry = SessionEntry::new(now_ms());
                    entry.updated_at_ms = i as i64;
                    doc.entries.insert(format!("agent:{i}:main"), entry);
                }
            })
            .unwrap();

        let doc = store.load().unwrap();
        assert_eq!(doc.entries.len(), MAX_ENTRIES);
    }

    #[tokio::test]
    async fn upsert_async_runs_off_the_async_worker_thread() {
        let dir = TempDir::new().unwrap();
        let store = Arc::new(store_in(&dir));
        let key = SessionKey::parse("agent:a1:main").unwrap();

        let entry = store
            .clone()
            .upsert_async(key.clone(), |e| e.subject = Some("hi".into()))
            .await
            .unwrap();
        assert_eq!(entry.subject.as_deref(), Some("hi"));

        let doc = store.load().unwrap();
        assert!(doc.entries.contains_key(key.as_str()));
    }

    #[test]
    fn rotate_archives_oldest_half_and_shrinks_primary_file() {
        let dir = TempDir::new().unwrap();
        let store = store_in(&dir);

        let mut doc = SessionDocument::default();
        for i in 0..10 {
            let mut entry = SessionEntry::new(now_ms());
            entry.updated_at_ms = i;
            doc.entries.insert(format!("agent:{i}:main"), entry);
        }
        store.write_to_disk(&mut doc.clone()).unwrap();
        assert_eq!(doc.entries.len(), 10);

        store.rotate(&mut doc);
        assert_eq!(doc.entries.len(), 5);
        for i in 0..5 {
            assert!(!doc.entries.contains_key(&format!("agent:{i}:main")));
        }
        for i in 5..10 {
            assert!(doc.entries.contains_key(&format!("agent:{i}:main")));
        }

        let archives: Vec<_> = std::fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().contains(".archive"))
            .collect();
        assert_eq!(archives.len(), 1);
    }
}

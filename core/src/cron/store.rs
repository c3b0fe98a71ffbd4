//! Atomic persistence for the cron job table.

use crate::cron::model::JobsDocument;
use crate::error::Result;
use crate::util::atomic_write;
use std::path::{Path, PathBuf};

pub struct JobStore {
    path: PathBuf,
}

impl JobStore {
    pub fn new(path: PathBuf) -> Self {
        Self { path }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<JobsDocument> {
        if !self.path.exists() {
            return Ok(JobsDocument::default());
        }
        let content = std::fs::read_to_string(&self.path)?;
        if content.trim().is_empty() {
            return Ok(JobsDocument::default());
        }
        Ok(serde_json::from_str(&content)?)
    }

    pub fn save(&self, doc: &JobsDocument) -> Result<()> {
        if let Ok(existing) = std::fs::read(&self.path) {
            let _ = std::fs::write(self.path.with_extension("json.bak"), existing);
        }
        let bytes = serde_json::to_vec_pretty(doc)?;
        atomic_write(&self.path, &bytes)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::model::{CronJob, Payload, Schedule, SessionTarget, WakeMode};
    use tempfile::TempDir;

    #[test]
    fn round_trips_jobs() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path().join("jobs.json"));

        let job = CronJob::new(
            "ping",
            Schedule::Every {
                every_ms: 60_000,
                anchor_ms: None,
            },
            SessionTarget::Main,
            WakeMode::Now,
            Payload::SystemEvent { text: "ping".into() },
        );
        let doc = JobsDocument {
            version: 1,
            jobs: vec![job.clone()],
        };
        store.save(&doc).unwrap();

        let loaded = store.load().unwrap();
        assert_eq!(loaded.jobs.len(), 1);
        assert_eq!(loaded.jobs[0].id, job.id);
    }

    #[test]
    fn missing_file_returns_default() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path().join("jobs.json"));
        let doc = store.load().unwrap();
        assert_eq!(doc.version, 1);
        assert!(doc.jobs.is_empty());
    }

    #[test]
    fn save_keeps_a_backup_copy() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path().join("jobs.json"));
        store.save(&JobsDocument::default()).unwrap();
        store.save(&JobsDocument::default()).unwrap();
        assert!(dir.path().join("jobs.json.bak").exists());
    }
}

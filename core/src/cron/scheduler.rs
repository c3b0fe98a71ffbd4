//! Cron scheduler: timer engine, schedule computation, backoff,
//! main/isolated dispatch, and the ephemeral cron-session reaper.

use crate::cron::backoff::backoff_ms;
use crate::cron::model::{
    CronJob, Delivery, DeliveryChannel, DeliveryMode, JobId, JobState, LastStatus, Payload, SessionTarget,
    WakeMode,
};
use crate::cron::schedule::next_run_ms;
use crate::cron::store::JobStore;
use crate::error::Result;
use crate::events::EventQueue;
use crate::facade::{AgentExecutor, RunRequest};
use crate::heartbeat::HeartbeatCoordinator;
use crate::lanes::{EnqueueOpts, LaneDispatcher};
use crate::session::{SessionKey, SessionStore};
use crate::util::now_ms;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

const CRON_LANE: &str = "cron";
const DEFAULT_JOB_TIMEOUT_MS: u64 = 10 * 60 * 1000;
const MAX_DELAY_MS: i64 = 60_000;
const REAP_INTERVAL_MS: i64 = 5 * 60_000;
const STUCK_THRESHOLD_MS: i64 = 2 * 60 * 60 * 1000;
const DEFAULT_EPHEMERAL_RETENTION_MS: i64 = 24 * 60 * 60 * 1000;

pub struct CronScheduler {
    store: JobStore,
    jobs: Mutex<HashMap<JobId, CronJob>>,
    last_reap_ms: Mutex<i64>,
    lanes: Arc<LaneDispatcher>,
    sessions: Arc<SessionStore>,
    events: Arc<EventQueue>,
    heartbeat: Arc<HeartbeatCoordinator>,
    executor: Arc<dyn AgentExecutor>,
}

impl CronScheduler {
    pub fn new(
        store: JobStore,
        lanes: Arc<LaneDispatcher>,
        sessions: Arc<SessionStore>,
        events: Arc<EventQueue>,
        heartbeat: Arc<HeartbeatCoordinator>,
        executor: Arc<dyn AgentExecutor>,
    ) -> Arc<Self> {
        Arc::new(Self {
            store,
            jobs: Mutex::new(HashMap::new()),
            last_reap_ms: Mutex::new(0),
            lanes,
            sessions,
            events,
            heartbeat,
            executor,
        })
    }

    pub async fn upsert_job(&self, mut job: CronJob) -> Result<()> {
        if job.state.next_run_at_ms.is_none() {
            job.state.next_run_at_ms = Some(next_run_ms(&job.schedule, now_ms(), None)?);
        }
        let mut jobs = self.jobs.lock().await;
        jobs.insert(job.id.clone(), job);
        self.persist_locked(&jobs).await
    }

    pub async fn remove_job(&self, job_id: &str) -> Result<bool> {
        let mut jobs = self.jobs.lock().await;
        let removed = jobs.remove(job_id).is_some();
        if removed {
            self.persist_locked(&jobs).await?;
        }
        Ok(removed)
    }

    pub async fn list_jobs(&self) -> Vec<CronJob> {
        self.jobs.lock().await.values().cloned().collect()
    }

    async fn persist_locked(&self, jobs: &HashMap<JobId, CronJob>) -> Result<()> {
        let doc = crate::cron::model::JobsDocument {
            version: 1,
            jobs: jobs.values().cloned().collect(),
        };
        self.store.save(&doc)
    }

    /// Startup crash recovery: load, clear stuck `runningAtMs`, run missed
    /// jobs synchronously in `nextRunAtMs` order, recompute, persist.
    pub async fn recover_on_startup(&self) -> Result<()> {
        let doc = self.store.load()?;
        let now = now_ms();
        let mut jobs: HashMap<JobId, CronJob> = HashMap::new();

        for mut job in doc.jobs {
            if job.is_stuck(now) {
                job.state.running_at_ms = None;
            }
            jobs.insert(job.id.clone(), job);
        }

        let mut missed: Vec<JobId> = jobs
            .values()
            .filter(|j| j.enabled && j.state.next_run_at_ms.map(|t| t <= now).unwrap_or(false))
            .map(|j| j.id.clone())
            .collect();
        missed.sort_by_key(|id| jobs.get(id).and_then(|j| j.state.next_run_at_ms).unwrap_or(0));

        for job_id in missed {
            if let Some(job) = jobs.get(&job_id).cloned() {
                let outcome = self.run_job(&job).await;
                let delete = if let Some(updated) = jobs.get_mut(&job_id) {
                    Self::apply_outcome(updated, outcome)
                } else {
                    false
                };
                if delete {
                    jobs.remove(&job_id);
                }
            }
        }

        for job in jobs.values_mut() {
            if job.enabled && job.state.next_run_at_ms.is_none() {
                job.state.next_run_at_ms = next_run_ms(&job.schedule, now, job.state.last_run_at_ms).ok();
            }
        }

        {
            let mut guard = self.jobs.lock().await;
            *guard = jobs;
            self.persist_locked(&guard).await?;
        }
        Ok(())
    }

    /// Spawn the timer loop: re-computes the minimum delay after every tick.
    pub fn spawn_timer(self: &Arc<Self>) {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                let delay = this.next_delay_ms().await;
                tokio::time::sleep(Duration::from_millis(delay as u64)).await;
                this.tick().await;
            }
        });
    }

    async fn next_delay_ms(&self) -> i64 {
        let jobs = self.jobs.lock().await;
        let now = now_ms();
        let min_due = jobs
            .values()
            .filter(|j| j.enabled && j.state.running_at_ms.is_none())
            .filter_map(|j| j.state.next_run_at_ms)
            .min();
        match min_due {
            Some(due) => (due - now).clamp(0, MAX_DELAY_MS),
            None => MAX_DELAY_MS,
        }
    }

    /// Mark due jobs running, dispatch each, update state on completion.
    pub async fn tick(&self) {
        let now = now_ms();
        let due_ids: Vec<JobId> = {
            let mut jobs = self.jobs.lock().await;
            let ids: Vec<JobId> = jobs
                .values()
                .filter(|j| j.is_due(now))
                .map(|j| j.id.clone())
                .collect();
            for id in &ids {
                if let Some(job) = jobs.get_mut(id) {
                    job.state.running_at_ms = Some(now);
                }
            }
            ids
        };

        for job_id in due_ids {
            let job = { self.jobs.lock().await.get(&job_id).cloned() };
            let Some(job) = job else { continue };
            let outcome = self.run_job(&job).await;
            let mut jobs = self.jobs.lock().await;
            let delete = if let Some(updated) = jobs.get_mut(&job_id) {
                Self::apply_outcome(updated, outcome)
            } else {
                false
            };
            if delete {
                jobs.remove(&job_id);
            }
            let _ = self.persist_locked(&jobs).await;
        }

        self.reap_ephemeral_sessions().await;
    }

    /// Updates `job`'s run-state fields in place and returns whether the
    /// caller should remove it from the job table entirely (an `at`-schedule
    /// job with `deleteAfterRun` set, once it has run).
    fn apply_outcome(job: &mut CronJob, outcome: std::result::Result<(), String>) -> bool {
        let ended_at = now_ms();
        let started_at = job.state.running_at_ms;
        job.state.running_at_ms = None;
        job.state.last_run_at_ms = Some(ended_at);
        job.state.last_duration_ms = started_at
            .map(|started| ended_at - started)
            .filter(|d| *d >= 0);

        match &outcome {
            Ok(()) => {
                job.state.last_status = Some(LastStatus::Ok);
                job.state.last_error = None;
                job.state.consecutive_errors = 0;
            }
            Err(message) => {
                job.state.last_status = Some(LastStatus::Error);
                job.state.last_error = Some(message.clone());
                job.state.consecutive_errors += 1;
            }
        }

        match &job.schedule {
            crate::cron::model::Schedule::At { .. } => {
                job.state.next_run_at_ms = None;
                if job.delete_after_run {
                    return true;
                }
                job.enabled = false;
                false
            }
            schedule => {
                let natural = next_run_ms(schedule, ended_at, Some(ended_at)).unwrap_or(ended_at);
                let backoff = backoff_ms(job.state.consecutive_errors);
                job.state.next_run_at_ms = Some(natural.max(ended_at + backoff));
                false
            }
        }
    }

    /// Run one job to completion, returning `Ok(())` or `Err(message)`.
    async fn run_job(&self, job: &CronJob) -> std::result::Result<(), String> {
        let timeout_ms = match &job.payload {
            Payload::AgentTurn { timeout_seconds: Some(secs), .. } => secs * 1000,
            _ => DEFAULT_JOB_TIMEOUT_MS,
        };

        let job = job.clone();
        let lanes = self.lanes.clone();
        let sessions = self.sessions.clone();
        let events = self.events.clone();
        let heartbeat = self.heartbeat.clone();
        let executor = self.executor.clone();

        let result = lanes
            .enqueue_in_lane(CRON_LANE, EnqueueOpts::default(), move || async move {
                let work = Self::dispatch(job, sessions, events, heartbeat, executor);
                match tokio::time::timeout(Duration::from_millis(timeout_ms), work).await {
                    Ok(inner) => inner,
                    Err(_) => Err("job timed out".to_string()),
                }
            })
            .await;

        match result {
            Ok(inner) => inner,
            Err(e) => Err(e.to_string()),
        }
    }

    async fn dispatch(
        job: CronJob,
        sessions: Arc<SessionStore>,
        events: Arc<EventQueue>,
        heartbeat: Arc<HeartbeatCoordinator>,
        executor: Arc<dyn AgentExecutor>,
    ) -> std::result::Result<(), String> {
        match job.session_target {
            SessionTarget::Main => Self::dispatch_main(&job, events, heartbeat).await,
            SessionTarget::Isolated => {
                Self::dispatch_isolated(&job, sessions, events, executor).await
            }
        }
    }

    async fn dispatch_main(
        job: &CronJob,
        events: Arc<EventQueue>,
        heartbeat: Arc<HeartbeatCoordinator>,
    ) -> std::result::Result<(), String> {
        let text = match &job.payload {
            Payload::SystemEvent { text } => text.clone(),
            Payload::AgentTurn { message, .. } => message.clone(),
        };
        let key = SessionKey::from_parts(&["agent", "main", "main"]);
        events.enqueue(&key, if text.trim().is_empty() { "scheduled reminder" } else { &text }).await;

        match job.wake_mode {
            WakeMode::Now => {
                heartbeat
                    .request_heartbeat_now(&format!("cron:{}", job.id), 0)
                    .await;
            }
            WakeMode::NextHeartbeat => {}
        }
        Ok(())
    }

    async fn dispatch_isolated(
        job: &CronJob,
        sessions: Arc<SessionStore>,
        events: Arc<EventQueue>,
        executor: Arc<dyn AgentExecutor>,
    ) -> std::result::Result<(), String> {
        let run_id = uuid::Uuid::new_v4();
        let key = SessionKey::from_parts(&["cron", &job.id, "run", &run_id.to_string()]);

        let message = match &job.payload {
            Payload::SystemEvent { text } => text.clone(),
            Payload::AgentTurn { message, .. } => message.clone(),
        };
        let timeout_ms = match &job.payload {
            Payload::AgentTurn { timeout_seconds: Some(s), .. } => s * 1000,
            _ => DEFAULT_JOB_TIMEOUT_MS,
        };

        let entry = sessions
            .clone()
            .upsert_async(key.clone(), |_| {})
            .await
            .map_err(|e| e.to_string())?;

        let run_result = executor
            .run(
                RunRequest {
                    session_id: entry.session_id,
                    session_key: key.as_str().to_string(),
                    prompt: message,
                    think_level: None,
                    timeout_ms,
                },
                None,
            )
            .await;

        let run_result = match run_result {
            Ok(r) => r,
            Err(e) => return Err(e.to_string()),
        };

        if let Some(delivery) = &job.delivery {
            let best_effort = delivery.best_effort;
            let delivered = Self::deliver(delivery, &run_result.text, &sessions, &events).await;
            if let Err(e) = delivered {
                if !best_effort {
                    return Err(e.to_string());
                }
            }
        }

        Ok(())
    }

    /// Resolve the delivery target and hand the run's result text to the
    /// main agent's event queue, where the next heartbeat will pick it up.
    /// `Last` requires the main session to already have recorded a prior
    /// delivery route; `Named` requires `delivery.to`. Either failing is a
    /// real error so `bestEffort` on the job can decide whether it matters.
    async fn deliver(
        delivery: &Delivery,
        text: &str,
        sessions: &Arc<SessionStore>,
        events: &Arc<EventQueue>,
    ) -> Result<()> {
        if delivery.mode == DeliveryMode::None {
            return Ok(());
        }

        let main_key = SessionKey::from_parts(&["agent", "main", "main"]);
        match delivery.channel.unwrap_or(DeliveryChannel::Last) {
            DeliveryChannel::Last => {
                let doc = sessions.load()?;
                let has_route = doc
                    .entries
                    .get(main_key.as_str())
                    .is_some_and(|entry| entry.last_delivery.channel.is_some());
                if !has_route {
                    return Err(crate::error::CoreError::NotFound {
                        what: "last delivery route".to_string(),
                    });
                }
            }
            DeliveryChannel::Named => {
                if delivery.to.is_none() {
                    return Err(crate::error::CoreError::InvalidRequest {
                        message: "named delivery requires `to`".into(),
                    });
                }
            }
        }

        let body = if text.trim().is_empty() { "cron job completed" } else { text };
        events.enqueue(&main_key, body).await;
        Ok(())
    }

    /// Throttled to run at most every 5 minutes: deletes `cron:`-prefixed
    /// session entries whose `updatedAt` exceeds retention.
    async fn reap_ephemeral_sessions(&self) {
        let now = now_ms();
        {
            let mut last = self.last_reap_ms.lock().await;
            if now - *last < REAP_INTERVAL_MS {
                return;
            }
            *last = now;
        }

        let _ = self
            .sessions
            .clone()
            .update_async(move |doc| {
                doc.entries.retain(|key, entry| {
                    if !key.starts_with("cron:") {
                        return true;
                    }
                    now - entry.updated_at_ms <= DEFAULT_EPHEMERAL_RETENTION_MS
                });
            })
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cron::model::{Payload, Schedule, SessionTarget, WakeMode};
    use crate::facade::StubAgentExecutor;
    use tempfile::TempDir;

    fn coordinator() -> Arc<HeartbeatCoordinator> {
        struct NoopHandler;
        #[async_trait::async_trait]
        impl crate::heartbeat::HeartbeatHandler for NoopHandler {
            async fn handle(&self, _reason: &str) -> crate::heartbeat::HeartbeatOutcome {
                crate::heartbeat::HeartbeatOutcome::skipped("test")
            }
        }
        HeartbeatCoordinator::new(Arc::new(NoopHandler))
    }

    #[tokio::test]
    async fn recover_runs_missed_jobs_and_reschedules() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path().join("jobs.json"));
        let lanes = Arc::new(LaneDispatcher::new());
        let sessions = Arc::new(SessionStore::new(dir.path().join("sessions.json")));
        let events = Arc::new(EventQueue::new());
        let executor: Arc<dyn AgentExecutor> = Arc::new(StubAgentExecutor);

        let mut job = CronJob::new(
            "ping",
            Schedule::Every {
                every_ms: 60_000,
                anchor_ms: None,
            },
            SessionTarget::Main,
            WakeMode::NextHeartbeat,
            Payload::SystemEvent { text: "ping".into() },
        );
        job.state.next_run_at_ms = Some(now_ms() - 5_000);
        store
            .save(&crate::cron::model::JobsDocument {
                version: 1,
                jobs: vec![job.clone()],
            })
            .unwrap();

        let scheduler = CronScheduler::new(store, lanes, sessions, events, coordinator(), executor);
        scheduler.recover_on_startup().await.unwrap();

        let jobs = scheduler.list_jobs().await;
        assert_eq!(jobs.len(), 1);
        assert_eq!(jobs[0].state.last_status, Some(LastStatus::Ok));
        assert!(jobs[0].state.next_run_at_ms.unwrap() > now_ms());
    }

    #[tokio::test]
    async fn backoff_increases_next_run_after_errors() {
        let dir = TempDir::new().unwrap();
        let mut job = CronJob::new(
            "errs",
            Schedule::Every {
                every_ms: 1_000,
                anchor_ms: None,
            },
            SessionTarget::Isolated,
            WakeMode::NextHeartbeat,
            Payload::AgentTurn {
                message: "x".into(),
                model: None,
                thinking: None,
                timeout_seconds: None,
            },
        );
        job.state.consecutive_errors = 2;
        CronScheduler::apply_outcome(&mut job, Err("boom".to_string()));

        let natural = next_run_ms(&job.schedule, now_ms(), Some(now_ms())).unwrap();
        assert!(job.state.next_run_at_ms.unwrap() >= natural);
        assert_eq!(job.state.consecutive_errors, 3);
        let _ = dir;
    }

    #[test]
    fn apply_outcome_signals_deletion_for_delete_after_run_at_job() {
        let mut job = CronJob::new(
            "once",
            Schedule::At { at_ms: 1_000 },
            SessionTarget::Main,
            WakeMode::Now,
            Payload::SystemEvent { text: "hi".into() },
        );
        job.delete_after_run = true;
        let should_delete = CronScheduler::apply_outcome(&mut job, Ok(()));
        assert!(should_delete);
    }

    #[test]
    fn apply_outcome_disables_non_deleting_at_job() {
        let mut job = CronJob::new(
            "once",
            Schedule::At { at_ms: 1_000 },
            SessionTarget::Main,
            WakeMode::Now,
            Payload::SystemEvent { text: "hi".into() },
        );
        let should_delete = CronScheduler::apply_outcome(&mut job, Ok(()));
        assert!(!should_delete);
        assert!(!job.enabled);
    }

    #[tokio::test]
    async fn tick_removes_delete_after_run_job_once_it_fires() {
        let dir = TempDir::new().unwrap();
        let store = JobStore::new(dir.path().join("jobs.json"));
        let lanes = Arc::new(LaneDispatcher::new());
        let sessions = Arc::new(SessionStore::new(dir.path().join("sessions.json")));
        let events = Arc::new(EventQueue::new());
        let executor: Arc<dyn AgentExecutor> = Arc::new(StubAgentExecutor);

        let mut job = CronJob::new(
            "once",
            Schedule::At { at_ms: now_ms() - 1_000 },
            SessionTarget::Main,
            WakeMode::NextHeartbeat,
            Payload::SystemEvent { text: "hi".into() },
        );
        job.delete_after_run = true;
        job.state.next_run_at_ms = Some(now_ms() - 1_000);

        let scheduler = CronScheduler::new(store, lanes, sessions, events, coordinator(), executor);
        scheduler.upsert_job(job).await.unwrap();
        scheduler.tick().await;

        assert!(scheduler.list_jobs().await.is_empty());
    }

    #[tokio::test]
    async fn deliver_last_fails_without_a_recorded_route() {
        let dir = TempDir::new().unwrap();
        let sessions = Arc::new(SessionStore::new(dir.path().join("sessions.json")));
        let events = Arc::new(EventQueue::new());
        let delivery = Delivery {
            mode: DeliveryMode::Announce,
            channel: Some(DeliveryChannel::Last),
            to: None,
            best_effort: false,
        };

        let result = CronScheduler::deliver(&delivery, "done", &sessions, &events).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn deliver_last_succeeds_once_a_route_is_recorded_and_enqueues_text() {
        let dir = TempDir::new().unwrap();
        let sessions = Arc::new(SessionStore::new(dir.path().join("sessions.json")));
        let events = Arc::new(EventQueue::new());
        let main_key = SessionKey::from_parts(&["agent", "main", "main"]);
        sessions
            .upsert(&main_key, |entry| {
                entry.last_delivery.channel = Some("telegram".to_string());
            })
            .unwrap();

        let delivery = Delivery {
            mode: DeliveryMode::Announce,
            channel: Some(DeliveryChannel::Last),
            to: None,
            best_effort: false,
        };

        CronScheduler::deliver(&delivery, "job output", &sessions, &events)
            .await
            .unwrap();

        let drained = events.drain(&main_key).await;
        assert_eq!(drained.len(), 1);
        assert_eq!(drained[0].text, "job output");
    }

    #[tokio::test]
    async fn deliver_named_requires_to_field() {
        let dir = TempDir::new().unwrap();
        let sessions = Arc::new(SessionStore::new(dir.path().join("sessions.json")));
        let events = Arc::new(EventQueue::new());
        let delivery = Delivery {
            mode: DeliveryMode::Announce,
            channel: Some(DeliveryChannel::Named),
            to: None,
            best_effort: false,
        };

        let result = CronScheduler::deliver(&delivery, "done", &sessions, &events).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn deliver_none_mode_is_a_noop() {
        let dir = TempDir::new().unwrap();
        let sessions = Arc::new(SessionStore::new(dir.path().join("sessions.json")));
        let events = Arc::new(EventQueue::new());
        let delivery = Delivery {
            mode: DeliveryMode::None,
            channel: None,
            to: None,
            best_effort: false,
        };

        CronScheduler::deliver(&delivery, "done", &sessions, &events).await.unwrap();
        let main_key = SessionKey::from_parts(&["agent", "main", "main"]);
        assert!(events.is_empty(&main_key).await);
    }
}

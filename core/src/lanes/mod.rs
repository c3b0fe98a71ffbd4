//! Command-lane dispatcher: named FIFO lanes with per-lane concurrency.
//!
//! Built-in lanes are `main`, `cron`, `subagent`, `nested`; arbitrary lane
//! names are accepted, and `session:{sessionKey}` is the convention used
//! to serialize work per session.

use crate::error::{CoreError, Result};
use crate::session::SessionKey;
use futures_util::FutureExt;
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Mutex};

type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send>>;
type OnWait = Box<dyn Fn(u64, usize) + Send + Sync>;

/// Options for a single `enqueue_in_lane` call.
#[derive(Default)]
pub struct EnqueueOpts {
    pub warn_after_ms: Option<u64>,
    pub on_wait: Option<OnWait>,
}

struct QueuedTask {
    run: Box<dyn FnOnce() -> BoxFuture + Send>,
}

struct LaneInner {
    queue: VecDeque<QueuedTask>,
    active: usize,
    draining: bool,
}

struct Lane {
    max_concurrent: usize,
    inner: Mutex<LaneInner>,
}

/// Returns the conventional per-session lane name for `key`.
pub fn session_lane(key: &SessionKey) -> String {
    format!("session:{}", key.as_str())
}

fn default_concurrency(lane_name: &str) -> usize {
    match lane_name {
        "main" => 1,
        "cron" => 1,
        "subagent" => 2,
        "nested" => 1,
        _ => 1,
    }
}

/// In-process scheduler keyed by lane name.
pub struct LaneDispatcher {
    lanes: Mutex<HashMap<String, Arc<Lane>>>,
}

impl Default for LaneDispatcher {
    fn default() -> Self {
        Self::new()
    }
}

impl LaneDispatcher {
    pub fn new() -> Self {
        Self {
            lanes: Mutex::new(HashMap::new()),
        }
    }

    async fn get_or_create_lane(&self, lane_name: &str) -> Arc<Lane> {
        let mut lanes = self.lanes.lock().await;
        lanes
            .entry(lane_name.to_string())
            .or_insert_with(|| {
                Arc::new(Lane {
                    max_concurrent: default_concurrency(lane_name),
                    inner: Mutex::new(LaneInner {
                        queue: VecDeque::new(),
                        active: 0,
                        draining: false,
                    }),
                })
            })
            .clone()
    }

    /// Enqueue an opaque asynchronous task on `lane_name`. Tasks on the same
    /// lane observe happens-before ordering; tasks on different lanes may run
    /// concurrently up to the lane's `maxConcurrent`.
    pub async fn enqueue_in_lane<F, Fut, T>(
        &self,
        lane_name: &str,
        opts: EnqueueOpts,
        task: F,
    ) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let lane = self.get_or_create_lane(lane_name).await;
        let (tx, rx) = oneshot::channel::<Result<T>>();

        let run: Box<dyn FnOnce() -> BoxFuture + Send> = Box::new(move || {
            Box::pin(async move {
                let outcome = AssertUnwindSafe(task()).catch_unwind().await;
                let mapped = outcome.map_err(|_| CoreError::Internal {
                    message: "lane task panicked".into(),
                });
                let _ = tx.send(mapped);
            })
        });

        let queued_at = Instant::now();
        {
            let mut inner = lane.inner.lock().await;
            inner.queue.push_back(QueuedTask { run });
        }
        tokio::spawn(pump(lane.clone()));

        let mut rx = rx;
        if let Some(warn_ms) = opts.warn_after_ms {
            loop {
                tokio::select! {
                    result = &mut rx => {
                        return result.unwrap_or_else(|_| Err(CoreError::Internal {
                            message: "lane task dropped before completion".into(),
                        }));
                    }
                    _ = tokio::time::sleep(Duration::from_millis(warn_ms)) => {
                        if let Some(cb) = &opts.on_wait {
                            let waited_ms = queued_at.elapsed().as_millis() as u64;
                            let ahead = lane.inner.lock().await.queue.len();
                            cb(waited_ms, ahead);
                        }
                    }
                }
            }
        }

        rx.await.unwrap_or_else(|_| {
            Err(CoreError::Internal {
                message: "lane task dropped before completion".into(),
            })
        })
    }

    /// Drop pending (not yet started) tasks on `lane_name`; returns how many
    /// were dropped. In-flight tasks are unaffected.
    pub async fn clear_lane(&self, lane_name: &str) -> usize {
        let lanes = self.lanes.lock().await;
        match lanes.get(lane_name) {
            Some(lane) => {
                let mut inner = lane.inner.lock().await;
                let dropped = inner.queue.len();
                inner.queue.clear();
                dropped
            }
            None => 0,
        }
    }

    pub async fn queue_size(&self, lane_name: &str) -> usize {
        let lanes = self.lanes.lock().await;
        match lanes.get(lane_name) {
            Some(lane) => lane.inner.lock().await.queue.len(),
            None => 0,
        }
    }
}

/// Drain pump: while `active < maxConcurrent` and the queue is non-empty,
/// pop the head and spawn it. The `draining` flag keeps concurrent pump
/// invocations (from concurrent enqueues) from overlapping.
fn pump(lane: Arc<Lane>) -> Pin<Box<dyn Future<Output = ()> + Send>> {
    Box::pin(async move {
        {
            let mut inner = lane.inner.lock().await;
            if inner.draining {
                return;
            }
            inner.draining = true;
        }

        loop {
            let task = {
                let mut inner = lane.inner.lock().await;
                if inner.active >= lane.max_concurrent {
                    break;
                }
                match inner.queue.pop_front() {
                    Some(task) => {
                        inner.active += 1;
                        task
                    }
                    None => break,
                }
            };

            let lane_for_task = lane.clone();
            tokio::spawn(async move {
                (task.run)().await;
                {
                    let mut inner = lane_for_task.inner.lock().await;
                    inner.active -= 1;
                }
                pump(lane_for_task).await;
            });
        }

        let mut inner = lane.inner.lock().await;
        inner.draining = false;
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn same_lane_tasks_run_in_order() {
        let dispatcher = LaneDispatcher::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        let mut handles = Vec::new();
        for i in 0..5 {
            let order = order.clone();
            handles.push(async {
                dispatcher
                    .enqueue_in_lane("main", EnqueueOpts::default(), move || async move {
                        order.lock().await.push(i);
                        i
                    })
                    .await
            });
        }

        let mut results = Vec::new();
        for h in handles {
            results.push(h.await.unwrap());
        }
        assert_eq!(results, vec![0, 1, 2, 3, 4]);
        assert_eq!(*order.lock().await, vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn different_lanes_run_concurrently() {
        let dispatcher = Arc::new(LaneDispatcher::new());
        let concurrent = Arc::new(AtomicUsize::new(0));
        let max_seen = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for i in 0..4 {
            let dispatcher = dispatcher.clone();
            let concurrent = concurrent.clone();
            let max_seen = max_seen.clone();
            handles.push(tokio::spawn(async move {
                dispatcher
                    .enqueue_in_lane(&format!("lane-{i}"), EnqueueOpts::default(), move || async move {
                        let now = concurrent.fetch_add(1, Ordering::SeqCst) + 1;
                        max_seen.fetch_max(now, Ordering::SeqCst);
                        tokio::time::sleep(Duration::from_millis(20)).await;
                        concurrent.fetch_sub(1, Ordering::SeqCst);
                    })
                    .await
            }));
        }

        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert!(max_seen.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test]
    async fn panics_are_reported_not_wedging_the_lane() {
        let dispatcher = LaneDispatcher::new();

        let failed = dispatcher
            .enqueue_in_lane("main", EnqueueOpts::default(), || async move {
                panic!("boom");
                #[allow(unreachable_code)]
                0
            })
            .await;
        assert!(failed.is_err());

        let ok = dispatcher
            .enqueue_in_lane("main", EnqueueOpts::default(), || async move { 42 })
            .await
            .unwrap();
        assert_eq!(ok, 42);
    }

    #[tokio::test]
    async fn clear_lane_drops_pending_tasks() {
        let dispatcher = Arc::new(LaneDispatcher::new());

        // Occupy the lane's only slot so subsequent tasks stay queued.
        let blocker = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .enqueue_in_lane("main", EnqueueOpts::default(), || async move {
                        tokio::time::sleep(Duration::from_millis(100)).await;
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(10)).await;

        for _ in 0..3 {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                let _ = dispatcher
                    .enqueue_in_lane("main", EnqueueOpts::default(), || async move { () })
                    .await;
            });
        }
        tokio::time::sleep(Duration::from_millis(10)).await;

        let dropped = dispatcher.clear_lane("main").await;
        assert_eq!(dropped, 3);
        blocker.await.unwrap().unwrap();
    }

    #[test]
    fn session_lane_naming() {
        let key = SessionKey::parse("agent:a1:main").unwrap();
        assert_eq!(session_lane(&key), "session:agent:a1:main");
    }
}

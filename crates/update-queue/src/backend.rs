use crate::task::UpdateTask;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum WorkerState {
    Idle,
    Active,
}

impl WorkerState {
    pub fn as_str(self) -> &'static str {
        match self {
            WorkerState::Idle => "idle",
            WorkerState::Active => "active",
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub pending_depth: u64,
    pub priority_depth: u64,
    pub inflight_count: u64,
    pub tasks_processed: u64,
    pub tasks_failed: u64,
}

/// An in-flight lease: the task plus when the visibility timeout expires
/// and which worker holds it, used by the supervisor scan.
#[derive(Debug, Clone, Serialize)]
pub struct InflightEntry {
    pub task: UpdateTask,
    pub worker_id: String,
    pub expires_at: DateTime<Utc>,
}

/// One row of `GET /batch/queue/workers` (spec.md §6).
#[derive(Debug, Clone, Serialize)]
pub struct WorkerSnapshot {
    pub worker_id: String,
    pub state: WorkerState,
    pub current_task_id: Option<uuid::Uuid>,
}

/// Everything the update queue needs from its storage layer. Split out as a
/// trait (mirrors `checkpoint-store::CheckpointStore`) so the consumer
/// protocol and visibility-timeout supervisor can be exercised against an
/// in-memory fake without a live Redis instance.
#[async_trait]
pub trait QueueBackend: Send + Sync {
    async fn push_pending(&self, task: &UpdateTask) -> Result<(), QueueError>;
    async fn push_priority(&self, task: &UpdateTask) -> Result<(), QueueError>;

    /// Right-pops the next task, priority lane first, blocking up to
    /// `timeout` per lane. `None` means both lanes were empty this round.
    async fn pop_next(&self, timeout: Duration) -> Result<Option<UpdateTask>, QueueError>;

    async fn set_inflight(
        &self,
        task: &UpdateTask,
        worker_id: &str,
        ttl: Duration,
    ) -> Result<(), QueueError>;
    async fn clear_inflight(&self, task_id: uuid::Uuid) -> Result<(), QueueError>;
    async fn scan_expired_inflight(&self) -> Result<Vec<InflightEntry>, QueueError>;

    async fn mark_completed(&self, place_id: i64) -> Result<(), QueueError>;
    async fn mark_failed(&self, place_id: i64) -> Result<(), QueueError>;

    async fn set_worker_status(
        &self,
        worker_id: &str,
        state: WorkerState,
        current_task_id: Option<uuid::Uuid>,
        ttl: Duration,
    ) -> Result<(), QueueError>;
    /// True if the worker's heartbeat hash has expired (no heartbeat within
    /// `ttl` of the last write).
    async fn worker_heartbeat_stale(&self, worker_id: &str) -> Result<bool, QueueError>;

    async fn incr_stat(&self, field: &str, by: u64) -> Result<(), QueueError>;
    async fn stats(&self) -> Result<QueueStats, QueueError>;

    /// All workers with a live heartbeat hash (spec.md §6 `GET
    /// /batch/queue/workers`).
    async fn list_workers(&self) -> Result<Vec<WorkerSnapshot>, QueueError>;

    /// The in-flight lease for a single task, if it is currently claimed
    /// (spec.md §6 `GET /batch/queue/task/{task_id}`). A task that already
    /// completed or failed is no longer in-flight and returns `None` here —
    /// callers check `completed`/`failed` membership separately.
    async fn lookup_task(&self, task_id: uuid::Uuid) -> Result<Option<InflightEntry>, QueueError>;

    /// Empties the dead-letter set, returning the place ids it held (spec.md
    /// §6 `POST /batch/queue/retry-failed`).
    async fn drain_failed(&self) -> Result<Vec<i64>, QueueError>;

    /// Non-destructive read of the dead-letter set (spec.md §6 `GET
    /// /batch/queue/failed`).
    async fn list_failed(&self) -> Result<Vec<i64>, QueueError>;

    /// Clears both queue lanes, returning how many tasks were discarded.
    async fn clear_pending(&self) -> Result<u64, QueueError>;
    async fn clear_completed(&self) -> Result<u64, QueueError>;
    async fn clear_failed(&self) -> Result<u64, QueueError>;
}

pub mod redis_backend {
    use super::*;
    use redis::aio::ConnectionManager;
    use redis::AsyncCommands;

    const PENDING_KEY: &str = "update:pending";
    const PRIORITY_KEY: &str = "update:priority";
    const COMPLETED_KEY: &str = "update:completed";
    const FAILED_KEY: &str = "update:failed";
    const STATS_KEY: &str = "update:stats";

    fn inflight_key(task_id: uuid::Uuid) -> String {
        format!("update:inflight:{task_id}")
    }

    fn worker_key(worker_id: &str) -> String {
        format!("update:worker:{worker_id}")
    }

    /// Redis-backed implementation of `QueueBackend` (spec.md §4.5
    /// keyspace), grounded on `CortexLM-dataforge`'s `JobQueue` —
    /// reliable-dequeue-via-BRPOPLPUSH, per-job TTL hash, dead-letter set.
    pub struct RedisQueueBackend {
        conn: ConnectionManager,
    }

    impl RedisQueueBackend {
        pub async fn connect(redis_url: &str) -> Result<Self, QueueError> {
            let client = redis::Client::open(redis_url)?;
            let conn = ConnectionManager::new(client).await?;
            Ok(Self { conn })
        }
    }

    #[async_trait]
    impl QueueBackend for RedisQueueBackend {
        async fn push_pending(&self, task: &UpdateTask) -> Result<(), QueueError> {
            let payload = serde_json::to_string(task)?;
            let mut conn = self.conn.clone();
            conn.lpush::<_, _, ()>(PENDING_KEY, payload).await?;
            Ok(())
        }

        async fn push_priority(&self, task: &UpdateTask) -> Result<(), QueueError> {
            let payload = serde_json::to_string(task)?;
            let mut conn = self.conn.clone();
            conn.lpush::<_, _, ()>(PRIORITY_KEY, payload).await?;
            Ok(())
        }

        async fn pop_next(&self, timeout: Duration) -> Result<Option<UpdateTask>, QueueError> {
            let mut conn = self.conn.clone();
            let secs = timeout.as_secs().max(1) as f64;

            let priority: Option<(String, String)> = conn.brpop(PRIORITY_KEY, secs).await?;
            if let Some((_, payload)) = priority {
                return Ok(Some(serde_json::from_str(&payload)?));
            }

            let pending: Option<(String, String)> = conn.brpop(PENDING_KEY, secs).await?;
            match pending {
                Some((_, payload)) => Ok(Some(serde_json::from_str(&payload)?)),
                None => Ok(None),
            }
        }

        async fn set_inflight(
            &self,
            task: &UpdateTask,
            worker_id: &str,
            ttl: Duration,
        ) -> Result<(), QueueError> {
            let payload = serde_json::to_string(task)?;
            let key = inflight_key(task.task_id);
            let mut conn = self.conn.clone();
            conn.hset_multiple::<_, _, _, ()>(
                &key,
                &[("task", payload), ("worker_id", worker_id.to_string())],
            )
            .await?;
            conn.expire::<_, ()>(&key, ttl.as_secs() as i64).await?;
            Ok(())
        }

        async fn clear_inflight(&self, task_id: uuid::Uuid) -> Result<(), QueueError> {
            let mut conn = self.conn.clone();
            conn.del::<_, ()>(inflight_key(task_id)).await?;
            Ok(())
        }

        async fn scan_expired_inflight(&self) -> Result<Vec<InflightEntry>, QueueError> {
            // A production deployment would SCAN with a cursor; this core
            // assumes a modest in-flight set size (bounded by total worker
            // concurrency) and uses KEYS for the supervisor's periodic pass.
            let mut conn = self.conn.clone();
            let keys: Vec<String> = conn.keys("update:inflight:*").await?;
            let mut out = Vec::new();
            for key in keys {
                let ttl: i64 = conn.ttl(&key).await?;
                if ttl > 2 {
                    continue;
                }
                let fields: std::collections::HashMap<String, String> = conn.hgetall(&key).await?;
                let (Some(task_json), Some(worker_id)) =
                    (fields.get("task"), fields.get("worker_id"))
                else {
                    continue;
                };
                let task: UpdateTask = serde_json::from_str(task_json)?;
                out.push(InflightEntry {
                    task,
                    worker_id: worker_id.clone(),
                    expires_at: Utc::now(),
                });
            }
            Ok(out)
        }

        async fn mark_completed(&self, place_id: i64) -> Result<(), QueueError> {
            let mut conn = self.conn.clone();
            conn.sadd::<_, _, ()>(COMPLETED_KEY, place_id).await?;
            Ok(())
        }

        async fn mark_failed(&self, place_id: i64) -> Result<(), QueueError> {
            let mut conn = self.conn.clone();
            conn.sadd::<_, _, ()>(FAILED_KEY, place_id).await?;
            Ok(())
        }

        async fn set_worker_status(
            &self,
            worker_id: &str,
            state: WorkerState,
            current_task_id: Option<uuid::Uuid>,
            ttl: Duration,
        ) -> Result<(), QueueError> {
            let key = worker_key(worker_id);
            let mut conn = self.conn.clone();
            conn.hset_multiple::<_, _, _, ()>(
                &key,
                &[
                    ("status", state.as_str().to_string()),
                    (
                        "current_task_id",
                        current_task_id.map(|id| id.to_string()).unwrap_or_default(),
                    ),
                    ("last_heartbeat", Utc::now().to_rfc3339()),
                ],
            )
            .await?;
            conn.expire::<_, ()>(&key, ttl.as_secs() as i64).await?;
            Ok(())
        }

        async fn worker_heartbeat_stale(&self, worker_id: &str) -> Result<bool, QueueError> {
            let mut conn = self.conn.clone();
            let exists: bool = conn.exists(worker_key(worker_id)).await?;
            Ok(!exists)
        }

        async fn incr_stat(&self, field: &str, by: u64) -> Result<(), QueueError> {
            let mut conn = self.conn.clone();
            conn.hincr::<_, _, _, ()>(STATS_KEY, field, by as i64).await?;
            Ok(())
        }

        async fn stats(&self) -> Result<QueueStats, QueueError> {
            let mut conn = self.conn.clone();
            let pending_depth: u64 = conn.llen(PENDING_KEY).await?;
            let priority_depth: u64 = conn.llen(PRIORITY_KEY).await?;
            let inflight_count: u64 = conn.keys::<_, Vec<String>>("update:inflight:*").await?.len() as u64;
            let tasks_processed: u64 = conn.hget(STATS_KEY, "tasks_processed").await.unwrap_or(0);
            let tasks_failed: u64 = conn.hget(STATS_KEY, "tasks_failed").await.unwrap_or(0);
            Ok(QueueStats {
                pending_depth,
                priority_depth,
                inflight_count,
                tasks_processed,
                tasks_failed,
            })
        }

        async fn list_workers(&self) -> Result<Vec<WorkerSnapshot>, QueueError> {
            let mut conn = self.conn.clone();
            let keys: Vec<String> = conn.keys("update:worker:*").await?;
            let mut out = Vec::with_capacity(keys.len());
            for key in keys {
                let fields: std::collections::HashMap<String, String> = conn.hgetall(&key).await?;
                let Some(status) = fields.get("status") else {
                    continue;
                };
                let worker_id = key.trim_start_matches("update:worker:").to_string();
                let state = if status == WorkerState::Active.as_str() {
                    WorkerState::Active
                } else {
                    WorkerState::Idle
                };
                let current_task_id = fields
                    .get("current_task_id")
                    .filter(|s| !s.is_empty())
                    .and_then(|s| uuid::Uuid::parse_str(s).ok());
                out.push(WorkerSnapshot {
                    worker_id,
                    state,
                    current_task_id,
                });
            }
            Ok(out)
        }

        async fn lookup_task(&self, task_id: uuid::Uuid) -> Result<Option<InflightEntry>, QueueError> {
            let mut conn = self.conn.clone();
            let key = inflight_key(task_id);
            let fields: std::collections::HashMap<String, String> = conn.hgetall(&key).await?;
            let (Some(task_json), Some(worker_id)) = (fields.get("task"), fields.get("worker_id")) else {
                return Ok(None);
            };
            Ok(Some(InflightEntry {
                task: serde_json::from_str(task_json)?,
                worker_id: worker_id.clone(),
                expires_at: Utc::now(),
            }))
        }

        async fn drain_failed(&self) -> Result<Vec<i64>, QueueError> {
            let mut conn = self.conn.clone();
            let members: Vec<i64> = conn.smembers(FAILED_KEY).await?;
            conn.del::<_, ()>(FAILED_KEY).await?;
            Ok(members)
        }

        async fn list_failed(&self) -> Result<Vec<i64>, QueueError> {
            let mut conn = self.conn.clone();
            Ok(conn.smembers(FAILED_KEY).await?)
        }

        async fn clear_pending(&self) -> Result<u64, QueueError> {
            let mut conn = self.conn.clone();
            let pending: u64 = conn.llen(PENDING_KEY).await?;
            let priority: u64 = conn.llen(PRIORITY_KEY).await?;
            conn.del::<_, ()>(PENDING_KEY).await?;
            conn.del::<_, ()>(PRIORITY_KEY).await?;
            Ok(pending + priority)
        }

        async fn clear_completed(&self) -> Result<u64, QueueError> {
            let mut conn = self.conn.clone();
            let count: u64 = conn.scard(COMPLETED_KEY).await?;
            conn.del::<_, ()>(COMPLETED_KEY).await?;
            Ok(count)
        }

        async fn clear_failed(&self) -> Result<u64, QueueError> {
            let mut conn = self.conn.clone();
            let count: u64 = conn.scard(FAILED_KEY).await?;
            conn.del::<_, ()>(FAILED_KEY).await?;
            Ok(count)
        }
    }
}

pub use redis_backend::RedisQueueBackend;

/// In-memory test double reproducing the same lane/priority/TTL semantics,
/// so the consumer protocol and supervisor logic can be unit-tested without
/// a live Redis instance.
pub mod mem_backend {
    use super::*;
    use std::collections::{HashMap, VecDeque};
    use std::sync::Mutex;
    use tokio::time::Instant;

    #[derive(Default)]
    struct State {
        pending: VecDeque<UpdateTask>,
        priority: VecDeque<UpdateTask>,
        inflight: HashMap<uuid::Uuid, (UpdateTask, String, Instant)>,
        completed: std::collections::HashSet<i64>,
        failed: std::collections::HashSet<i64>,
        workers: HashMap<String, (WorkerState, Option<uuid::Uuid>, Instant)>,
        stats: HashMap<String, u64>,
    }

    #[derive(Default)]
    pub struct MemQueueBackend {
        state: Mutex<State>,
    }

    impl MemQueueBackend {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn completed_places(&self) -> Vec<i64> {
            self.state.lock().unwrap().completed.iter().copied().collect()
        }

        pub fn failed_places(&self) -> Vec<i64> {
            self.state.lock().unwrap().failed.iter().copied().collect()
        }

        /// Test hook: force a task's in-flight lease into the past so the
        /// next `scan_expired_inflight` treats it as abandoned.
        pub fn expire_inflight_now(&self, task_id: uuid::Uuid) {
            let mut state = self.state.lock().unwrap();
            if let Some((_, _, expires_at)) = state.inflight.get_mut(&task_id) {
                *expires_at = Instant::now() - Duration::from_secs(1);
            }
        }
    }

    #[async_trait]
    impl QueueBackend for MemQueueBackend {
        async fn push_pending(&self, task: &UpdateTask) -> Result<(), QueueError> {
            self.state.lock().unwrap().pending.push_front(task.clone());
            Ok(())
        }

        async fn push_priority(&self, task: &UpdateTask) -> Result<(), QueueError> {
            self.state.lock().unwrap().priority.push_front(task.clone());
            Ok(())
        }

        async fn pop_next(&self, _timeout: Duration) -> Result<Option<UpdateTask>, QueueError> {
            let mut state = self.state.lock().unwrap();
            if let Some(task) = state.priority.pop_back() {
                return Ok(Some(task));
            }
            Ok(state.pending.pop_back())
        }

        async fn set_inflight(
            &self,
            task: &UpdateTask,
            worker_id: &str,
            ttl: Duration,
        ) -> Result<(), QueueError> {
            let mut state = self.state.lock().unwrap();
            state.inflight.insert(
                task.task_id,
                (task.clone(), worker_id.to_string(), Instant::now() + ttl),
            );
            Ok(())
        }

        async fn clear_inflight(&self, task_id: uuid::Uuid) -> Result<(), QueueError> {
            self.state.lock().unwrap().inflight.remove(&task_id);
            Ok(())
        }

        async fn scan_expired_inflight(&self) -> Result<Vec<InflightEntry>, QueueError> {
            let state = self.state.lock().unwrap();
            let now = Instant::now();
            Ok(state
                .inflight
                .values()
                .filter(|(_, _, expires_at)| *expires_at <= now)
                .map(|(task, worker_id, _)| InflightEntry {
                    task: task.clone(),
                    worker_id: worker_id.clone(),
                    expires_at: Utc::now(),
                })
                .collect())
        }

        async fn mark_completed(&self, place_id: i64) -> Result<(), QueueError> {
            self.state.lock().unwrap().completed.insert(place_id);
            Ok(())
        }

        async fn mark_failed(&self, place_id: i64) -> Result<(), QueueError> {
            self.state.lock().unwrap().failed.insert(place_id);
            Ok(())
        }

        async fn set_worker_status(
            &self,
            worker_id: &str,
            state: WorkerState,
            current_task_id: Option<uuid::Uuid>,
            ttl: Duration,
        ) -> Result<(), QueueError> {
            self.state
                .lock()
                .unwrap()
                .workers
                .insert(worker_id.to_string(), (state, current_task_id, Instant::now() + ttl));
            Ok(())
        }

        async fn worker_heartbeat_stale(&self, worker_id: &str) -> Result<bool, QueueError> {
            let state = self.state.lock().unwrap();
            Ok(match state.workers.get(worker_id) {
                Some((_, _, expires_at)) => *expires_at <= Instant::now(),
                None => true,
            })
        }

        async fn incr_stat(&self, field: &str, by: u64) -> Result<(), QueueError> {
            *self.state.lock().unwrap().stats.entry(field.to_string()).or_insert(0) += by;
            Ok(())
        }

        async fn stats(&self) -> Result<QueueStats, QueueError> {
            let state = self.state.lock().unwrap();
            Ok(QueueStats {
                pending_depth: state.pending.len() as u64,
                priority_depth: state.priority.len() as u64,
                inflight_count: state.inflight.len() as u64,
                tasks_processed: *state.stats.get("tasks_processed").unwrap_or(&0),
                tasks_failed: *state.stats.get("tasks_failed").unwrap_or(&0),
            })
        }

        async fn list_workers(&self) -> Result<Vec<WorkerSnapshot>, QueueError> {
            let state = self.state.lock().unwrap();
            let now = Instant::now();
            Ok(state
                .workers
                .iter()
                .filter(|(_, (_, _, expires_at))| *expires_at > now)
                .map(|(worker_id, (wstate, task_id, _))| WorkerSnapshot {
                    worker_id: worker_id.clone(),
                    state: *wstate,
                    current_task_id: *task_id,
                })
                .collect())
        }

        async fn lookup_task(&self, task_id: uuid::Uuid) -> Result<Option<InflightEntry>, QueueError> {
            let state = self.state.lock().unwrap();
            Ok(state.inflight.get(&task_id).map(|(task, worker_id, _)| InflightEntry {
                task: task.clone(),
                worker_id: worker_id.clone(),
                expires_at: Utc::now(),
            }))
        }

        async fn drain_failed(&self) -> Result<Vec<i64>, QueueError> {
            let mut state = self.state.lock().unwrap();
            Ok(state.failed.drain().collect())
        }

        async fn list_failed(&self) -> Result<Vec<i64>, QueueError> {
            Ok(self.state.lock().unwrap().failed.iter().copied().collect())
        }

        async fn clear_pending(&self) -> Result<u64, QueueError> {
            let mut state = self.state.lock().unwrap();
            let count = (state.pending.len() + state.priority.len()) as u64;
            state.pending.clear();
            state.priority.clear();
            Ok(count)
        }

        async fn clear_completed(&self) -> Result<u64, QueueError> {
            let mut state = self.state.lock().unwrap();
            let count = state.completed.len() as u64;
            state.completed.clear();
            Ok(count)
        }

        async fn clear_failed(&self) -> Result<u64, QueueError> {
            let mut state = self.state.lock().unwrap();
            let count = state.failed.len() as u64;
            state.failed.clear();
            Ok(count)
        }
    }
}

pub use mem_backend::MemQueueBackend;

use crate::backend::{InflightEntry, QueueBackend, QueueError, QueueStats, WorkerSnapshot, WorkerState};
use crate::task::{OperationFlags, Priority, UpdateTask};
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// What `DELETE /batch/queue/{...}` should wipe (spec.md §6).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearTarget {
    All,
    Pending,
    Completed,
    Failed,
}

#[derive(Debug, Clone, Copy)]
pub struct QueueConfig {
    pub visibility_timeout: Duration,
    pub heartbeat_interval: Duration,
    pub max_attempts: u32,
    pub poll_timeout: Duration,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            visibility_timeout: Duration::from_secs(300),
            heartbeat_interval: Duration::from_secs(30),
            max_attempts: 3,
            poll_timeout: Duration::from_secs(1),
        }
    }
}

/// What a consumer should do after executing a task, fed back to
/// `UpdateQueue::ack`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskOutcome {
    Success,
    Failure,
}

/// High-level producer/consumer/supervisor API over a `QueueBackend`
/// (spec.md §4.5). Generic over the backend so the same logic runs against
/// `RedisQueueBackend` in production and `MemQueueBackend` in tests.
pub struct UpdateQueue<B: QueueBackend> {
    backend: Arc<B>,
    config: QueueConfig,
}

impl<B: QueueBackend> Clone for UpdateQueue<B> {
    fn clone(&self) -> Self {
        Self {
            backend: self.backend.clone(),
            config: self.config,
        }
    }
}

impl<B: QueueBackend> UpdateQueue<B> {
    pub fn new(backend: B, config: QueueConfig) -> Self {
        Self {
            backend: Arc::new(backend),
            config,
        }
    }

    /// `push(place_id, ops, priority)`: spec.md §4.5 producer contract.
    pub async fn push(
        &self,
        place_id: i64,
        ops: OperationFlags,
        priority: Priority,
    ) -> Result<uuid::Uuid, QueueError> {
        let task = UpdateTask::new(place_id, ops, priority);
        self.enqueue(&task).await?;
        Ok(task.task_id)
    }

    /// `push_all`: batch-enqueues in insertion order, chunked in groups of
    /// ~100 to bound command latency (spec.md §4.5).
    pub async fn push_all(
        &self,
        place_ids: &[i64],
        ops: OperationFlags,
        priority: Priority,
    ) -> Result<u64, QueueError> {
        const CHUNK: usize = 100;
        let mut pushed = 0u64;
        for group in place_ids.chunks(CHUNK) {
            for &place_id in group {
                self.push(place_id, ops, priority).await?;
                pushed += 1;
            }
        }
        Ok(pushed)
    }

    async fn enqueue(&self, task: &UpdateTask) -> Result<(), QueueError> {
        match task.priority {
            Priority::High => self.backend.push_priority(task).await,
            Priority::Normal => self.backend.push_pending(task).await,
        }
    }

    /// Consumer protocol steps 1-3: blocking pop (priority lane first),
    /// claim via the in-flight hash, mark the worker active.
    pub async fn dequeue_and_claim(
        &self,
        worker_id: &str,
    ) -> Result<Option<UpdateTask>, QueueError> {
        let Some(task) = self.backend.pop_next(self.config.poll_timeout).await? else {
            return Ok(None);
        };
        self.backend
            .set_inflight(&task, worker_id, self.config.visibility_timeout)
            .await?;
        self.backend
            .set_worker_status(
                worker_id,
                WorkerState::Active,
                Some(task.task_id),
                self.config.heartbeat_interval * 3,
            )
            .await?;
        Ok(Some(task))
    }

    /// Consumer protocol steps 4-5: success deletes the in-flight lease and
    /// marks the place completed; failure either re-enqueues under a new
    /// `task_id` (attempts below the cap) or moves to the dead-letter set.
    pub async fn ack(&self, task: &UpdateTask, outcome: TaskOutcome) -> Result<(), QueueError> {
        self.backend.clear_inflight(task.task_id).await?;

        match outcome {
            TaskOutcome::Success => {
                self.backend.mark_completed(task.place_id).await?;
                self.backend.incr_stat("tasks_processed", 1).await?;
            }
            TaskOutcome::Failure => {
                if task.attempts + 1 < self.config.max_attempts {
                    let retry = task.retry();
                    self.backend.push_pending(&retry).await?;
                } else {
                    self.backend.mark_failed(task.place_id).await?;
                    self.backend.incr_stat("tasks_failed", 1).await?;
                }
            }
        }
        Ok(())
    }

    /// Consumer protocol step 6: refresh the worker's heartbeat TTL without
    /// changing its current task.
    pub async fn heartbeat(&self, worker_id: &str, current_task: Option<uuid::Uuid>) -> Result<(), QueueError> {
        self.backend
            .set_worker_status(
                worker_id,
                WorkerState::Active,
                current_task,
                self.config.heartbeat_interval * 3,
            )
            .await
    }

    /// Visibility-timeout supervisor: re-enqueues in-flight tasks whose
    /// lease has expired and whose owning worker's heartbeat is stale
    /// (spec.md §4.5 "Visibility-timeout recovery").
    pub async fn reap_expired(&self) -> Result<u64, QueueError> {
        let expired = self.backend.scan_expired_inflight().await?;
        let mut requeued = 0u64;
        for entry in expired {
            if !self.backend.worker_heartbeat_stale(&entry.worker_id).await? {
                continue;
            }
            warn!(
                task_id = %entry.task.task_id,
                worker_id = %entry.worker_id,
                "visibility timeout expired with stale owner, re-enqueuing"
            );
            self.backend.clear_inflight(entry.task.task_id).await?;
            self.backend.push_pending(&entry.task).await?;
            requeued += 1;
        }
        if requeued > 0 {
            info!(requeued, "supervisor reaped expired in-flight tasks");
        }
        Ok(requeued)
    }

    pub async fn stats(&self) -> Result<QueueStats, QueueError> {
        self.backend.stats().await
    }

    pub async fn workers(&self) -> Result<Vec<WorkerSnapshot>, QueueError> {
        self.backend.list_workers().await
    }

    pub async fn lookup_task(&self, task_id: uuid::Uuid) -> Result<Option<InflightEntry>, QueueError> {
        self.backend.lookup_task(task_id).await
    }

    pub async fn failed(&self) -> Result<Vec<i64>, QueueError> {
        self.backend.list_failed().await
    }

    /// Re-enqueues every place currently in the dead-letter set as a fresh,
    /// zero-attempt task (spec.md §6 `POST /batch/queue/retry-failed`). The
    /// original per-task operation flags are not retained by the
    /// dead-letter set, so retried tasks request every operation.
    pub async fn retry_failed(&self) -> Result<u64, QueueError> {
        let place_ids = self.backend.drain_failed().await?;
        if place_ids.is_empty() {
            return Ok(0);
        }
        info!(count = place_ids.len(), "retrying dead-lettered tasks");
        self.push_all(&place_ids, OperationFlags::all(), Priority::Normal).await
    }

    pub async fn clear(&self, target: ClearTarget) -> Result<u64, QueueError> {
        match target {
            ClearTarget::Pending => self.backend.clear_pending().await,
            ClearTarget::Completed => self.backend.clear_completed().await,
            ClearTarget::Failed => self.backend.clear_failed().await,
            ClearTarget::All => {
                let pending = self.backend.clear_pending().await?;
                let completed = self.backend.clear_completed().await?;
                let failed = self.backend.clear_failed().await?;
                Ok(pending + completed + failed)
            }
        }
    }

    pub fn config(&self) -> QueueConfig {
        self.config
    }
}

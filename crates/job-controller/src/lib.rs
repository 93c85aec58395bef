//! Named-job registry and lifecycle manager (spec.md §4.4). Generalizes
//! `IndexerExecutor`'s single-process-per-executor model to a registry of
//! many concurrently running engines, addressable by `(job_name,
//! worker_id)` slot, each owning its own `CancellationToken` child of a
//! process-wide root token.

use chrono::{DateTime, Utc};
use pipeline_engine::{EngineCounters, EngineReport, EngineStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::RwLock;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Error)]
pub enum ControllerError {
    #[error("job {job_name:?} worker {worker_id} already has a live execution")]
    AlreadyRunning { job_name: String, worker_id: usize },

    #[error("no slot registered for job {job_name:?} worker {worker_id}")]
    NotFound { job_name: String, worker_id: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SlotStatus {
    NotStarted,
    Starting,
    Started,
    Stopping,
    Completed,
    Failed,
    Stopped,
}

impl SlotStatus {
    fn is_live(self) -> bool {
        matches!(
            self,
            SlotStatus::Starting | SlotStatus::Started | SlotStatus::Stopping
        )
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct SlotSnapshot {
    pub job_name: String,
    pub worker_id: usize,
    pub status: SlotStatus,
    pub execution_id: Option<Uuid>,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub counters: EngineCounters,
}

struct Slot {
    status: SlotStatus,
    execution_id: Option<Uuid>,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    counters: EngineCounters,
    stop_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl Slot {
    fn snapshot(&self, job_name: &str, worker_id: usize) -> SlotSnapshot {
        SlotSnapshot {
            job_name: job_name.to_string(),
            worker_id,
            status: self.status,
            execution_id: self.execution_id,
            start_time: self.start_time,
            end_time: self.end_time,
            counters: self.counters,
        }
    }
}

/// Registry of running/completed engine slots. One process typically holds
/// one `JobController`; the root token is cancelled on process shutdown to
/// unwind every live slot.
pub struct JobController {
    root_token: CancellationToken,
    slots: Arc<RwLock<HashMap<(String, usize), Slot>>>,
}

impl Default for JobController {
    fn default() -> Self {
        Self::new()
    }
}

impl JobController {
    pub fn new() -> Self {
        Self {
            root_token: CancellationToken::new(),
            slots: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    /// `start(job_name, worker_id)`: spec.md §4.4. `make_engine` receives
    /// the slot's `CancellationToken` so the caller can bind it into the
    /// `JobSpec` it builds before handing back the future to run. Launch is
    /// asynchronous — this returns as soon as the slot is registered, not
    /// when the engine finishes.
    pub async fn start<F, Fut>(
        &self,
        job_name: &str,
        worker_id: usize,
        make_engine: F,
    ) -> Result<Uuid, ControllerError>
    where
        F: FnOnce(CancellationToken) -> Fut,
        Fut: Future<Output = EngineReport> + Send + 'static,
    {
        let key = (job_name.to_string(), worker_id);
        let mut slots = self.slots.write().await;

        if let Some(existing) = slots.get(&key) {
            if existing.status.is_live() {
                return Err(ControllerError::AlreadyRunning {
                    job_name: job_name.to_string(),
                    worker_id,
                });
            }
        }

        let execution_id = Uuid::new_v4();
        let stop_token = self.root_token.child_token();
        let engine_future = make_engine(stop_token.clone());

        slots.insert(
            key.clone(),
            Slot {
                status: SlotStatus::Starting,
                execution_id: Some(execution_id),
                start_time: Some(Utc::now()),
                end_time: None,
                counters: EngineCounters::default(),
                stop_token,
                handle: None,
            },
        );
        drop(slots);

        let slots_for_task = self.slots.clone();
        let key_for_task = key.clone();
        let handle = tokio::spawn(async move {
            let mut table = slots_for_task.write().await;
            if let Some(slot) = table.get_mut(&key_for_task) {
                slot.status = SlotStatus::Started;
            }
            drop(table);

            let report = engine_future.await;

            let mut table = slots_for_task.write().await;
            if let Some(slot) = table.get_mut(&key_for_task) {
                slot.status = match report.status {
                    EngineStatus::Completed => SlotStatus::Completed,
                    EngineStatus::Failed => SlotStatus::Failed,
                    EngineStatus::Stopped => SlotStatus::Stopped,
                };
                slot.counters = report.counters;
                slot.end_time = Some(Utc::now());
            }
            info!(job = %key_for_task.0, worker_id = key_for_task.1, status = ?report.status, "engine slot finished");
        });

        let mut slots = self.slots.write().await;
        if let Some(slot) = slots.get_mut(&key) {
            slot.handle = Some(handle);
        }

        Ok(execution_id)
    }

    pub async fn stop(&self, job_name: &str, worker_id: usize) -> Result<SlotStatus, ControllerError> {
        let mut slots = self.slots.write().await;
        let key = (job_name.to_string(), worker_id);
        let slot = slots
            .get_mut(&key)
            .ok_or_else(|| ControllerError::NotFound {
                job_name: job_name.to_string(),
                worker_id,
            })?;
        slot.stop_token.cancel();
        if slot.status.is_live() {
            slot.status = SlotStatus::Stopping;
        }
        Ok(slot.status)
    }

    pub async fn stop_all(&self) {
        let slots = self.slots.read().await;
        for slot in slots.values() {
            slot.stop_token.cancel();
        }
    }

    pub async fn status(&self, job_name: &str, worker_id: usize) -> Option<SlotSnapshot> {
        let slots = self.slots.read().await;
        slots.get(&(job_name.to_string(), worker_id)).map(|s| s.snapshot(job_name, worker_id))
    }

    pub async fn status_all(&self) -> Vec<SlotSnapshot> {
        let slots = self.slots.read().await;
        slots
            .iter()
            .map(|((job_name, worker_id), slot)| slot.snapshot(job_name, *worker_id))
            .collect()
    }

    /// `current_jobs()`: every slot whose engine is still running, of any
    /// kind (crawl, update, embedding) — callers distinguish kind by
    /// `job_name` convention, the controller itself is kind-agnostic.
    pub async fn current_jobs(&self) -> Vec<SlotSnapshot> {
        self.status_all()
            .await
            .into_iter()
            .filter(|s| s.status.is_live())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pipeline_engine::EngineCounters as Counters;
    use std::time::Duration;

    fn completed_after(millis: u64, status: EngineStatus) -> impl Future<Output = EngineReport> {
        async move {
            tokio::time::sleep(Duration::from_millis(millis)).await;
            EngineReport {
                status,
                counters: Counters {
                    read: 1,
                    written: 1,
                    skipped: 0,
                    failed: 0,
                },
            }
        }
    }

    #[tokio::test]
    async fn start_twice_on_same_slot_is_rejected_while_live() {
        let controller = JobController::new();
        controller
            .start("crawl", 0, |_token| completed_after(50, EngineStatus::Completed))
            .await
            .unwrap();

        let err = controller
            .start("crawl", 0, |_token| completed_after(50, EngineStatus::Completed))
            .await
            .unwrap_err();
        assert!(matches!(err, ControllerError::AlreadyRunning { .. }));
    }

    #[tokio::test]
    async fn slot_transitions_to_completed_after_engine_finishes() {
        let controller = JobController::new();
        controller
            .start("crawl", 0, |_token| completed_after(10, EngineStatus::Completed))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(50)).await;
        let snapshot = controller.status("crawl", 0).await.unwrap();
        assert_eq!(snapshot.status, SlotStatus::Completed);
        assert_eq!(snapshot.counters.written, 1);
    }

    #[tokio::test]
    async fn stop_marks_stopping_and_cancels_token() {
        let controller = JobController::new();
        let cancelled = Arc::new(std::sync::atomic::AtomicBool::new(false));
        let cancelled_clone = cancelled.clone();

        controller
            .start("crawl", 0, move |token| {
                let cancelled = cancelled_clone;
                async move {
                    token.cancelled().await;
                    cancelled.store(true, std::sync::atomic::Ordering::SeqCst);
                    EngineReport {
                        status: EngineStatus::Stopped,
                        counters: Counters::default(),
                    }
                }
            })
            .await
            .unwrap();

        let status = controller.stop("crawl", 0).await.unwrap();
        assert_eq!(status, SlotStatus::Stopping);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(cancelled.load(std::sync::atomic::Ordering::SeqCst));
    }

    #[tokio::test]
    async fn current_jobs_excludes_finished_slots() {
        let controller = JobController::new();
        controller
            .start("crawl", 0, |_token| completed_after(5, EngineStatus::Completed))
            .await
            .unwrap();
        controller
            .start("crawl", 1, |_token| completed_after(500, EngineStatus::Completed))
            .await
            .unwrap();

        tokio::time::sleep(Duration::from_millis(30)).await;
        let live = controller.current_jobs().await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].worker_id, 1);
    }

    #[tokio::test]
    async fn stop_on_unknown_slot_returns_not_found() {
        let controller = JobController::new();
        let err = controller.stop("crawl", 0).await.unwrap_err();
        assert!(matches!(err, ControllerError::NotFound { .. }));
    }
}

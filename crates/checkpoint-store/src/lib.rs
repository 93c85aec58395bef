//! Durable progress tracking for region-sweep batches (spec.md §3/§4.2) plus
//! the narrow `places` lifecycle-flag accessors shared by the embedding
//! pipeline and the update queue.
//!
//! The state machine per region is PENDING -> PROCESSING -> (COMPLETED |
//! FAILED). FAILED is terminal by policy: a crashed or skip-limited region
//! does not get silently retried on the next batch run. Recovering it is an
//! explicit operator action (`reset_to_pending`), matching the Open Question
//! decision recorded in DESIGN.md.

pub mod place_repository;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

pub use place_repository::{
    EmbedStatus, MemPlaceRepository, PgPlaceRepository, PlaceRepository, PlaceRepositoryError,
};

#[derive(Debug, Error)]
pub enum CheckpointError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("batch {batch_name:?} already has a running execution")]
    ConcurrentExecution { batch_name: String },

    #[error("checkpoint {0} not found")]
    NotFound(i64),

    #[error("checkpoint {id} is in state {actual:?}, expected {expected:?}")]
    UnexpectedStatus {
        id: i64,
        expected: CheckpointStatus,
        actual: CheckpointStatus,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum RegionType {
    Sido,
    Sigungu,
    Dong,
}

impl RegionType {
    pub fn as_str(self) -> &'static str {
        match self {
            RegionType::Sido => "SIDO",
            RegionType::Sigungu => "SIGUNGU",
            RegionType::Dong => "DONG",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "SIDO" => Some(RegionType::Sido),
            "SIGUNGU" => Some(RegionType::Sigungu),
            "DONG" => Some(RegionType::Dong),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CheckpointStatus {
    Pending,
    Processing,
    Completed,
    Failed,
}

impl CheckpointStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CheckpointStatus::Pending => "PENDING",
            CheckpointStatus::Processing => "PROCESSING",
            CheckpointStatus::Completed => "COMPLETED",
            CheckpointStatus::Failed => "FAILED",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "PENDING" => Some(CheckpointStatus::Pending),
            "PROCESSING" => Some(CheckpointStatus::Processing),
            "COMPLETED" => Some(CheckpointStatus::Completed),
            "FAILED" => Some(CheckpointStatus::Failed),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecutionStatus {
    Running,
    Completed,
    Failed,
    Interrupted,
}

impl ExecutionStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            ExecutionStatus::Running => "RUNNING",
            ExecutionStatus::Completed => "COMPLETED",
            ExecutionStatus::Failed => "FAILED",
            ExecutionStatus::Interrupted => "INTERRUPTED",
        }
    }
}

#[derive(Debug, Clone)]
pub struct RegionCheckpoint {
    pub id: i64,
    pub batch_name: String,
    pub region_type: RegionType,
    pub region_code: String,
    pub region_name: String,
    pub parent_code: Option<String>,
    pub status: CheckpointStatus,
    pub start_time: Option<DateTime<Utc>>,
    pub end_time: Option<DateTime<Utc>>,
    pub processed_count: i64,
    pub error_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct BatchExecution {
    pub id: i64,
    pub batch_name: String,
    pub execution_id: Uuid,
    pub status: ExecutionStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: Option<DateTime<Utc>>,
    pub total_regions: i64,
    pub completed_regions: i64,
    pub failed_regions: i64,
}

/// A row to seed during `initialize`. `id`/timestamps are assigned by the
/// store.
#[derive(Debug, Clone)]
pub struct RegionSeed {
    pub region_type: RegionType,
    pub region_code: String,
    pub region_name: String,
    pub parent_code: Option<String>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct InitializeOutcome {
    pub inserted: u64,
    pub skipped: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchProgress {
    pub total: i64,
    pub pending: i64,
    pub processing: i64,
    pub completed: i64,
    pub failed: i64,
}

impl BatchProgress {
    /// Percentage of total regions that have left PENDING/PROCESSING,
    /// regardless of outcome. `0.0` for an empty batch rather than NaN.
    pub fn pct_done(&self) -> f64 {
        if self.total == 0 {
            return 0.0;
        }
        (self.completed + self.failed) as f64 / self.total as f64 * 100.0
    }
}

/// Durable region-checkpoint and batch-execution bookkeeping for one
/// region-sweep batch. Implementations must make `next_pending` an atomic
/// PENDING -> PROCESSING transition so two workers never claim the same
/// region (spec.md §4.2, §8 scenario 2).
#[async_trait]
pub trait CheckpointStore: Send + Sync {
    /// Inserts any `regions` not already present for `(batch_name,
    /// region_type, region_code)`. Idempotent: re-running with the same seed
    /// set skips rows that already exist instead of erroring or duplicating.
    async fn initialize(
        &self,
        batch_name: &str,
        regions: Vec<RegionSeed>,
    ) -> Result<InitializeOutcome, CheckpointError>;

    /// Opens a new execution record for `batch_name`. Rejects the call if an
    /// execution for the same batch is already RUNNING — batches are
    /// single-flight (spec.md §4.2 "one live execution per batch_name").
    async fn start_execution(&self, batch_name: &str) -> Result<BatchExecution, CheckpointError>;

    async fn finish_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
    ) -> Result<(), CheckpointError>;

    /// Atomically claims the next PENDING region of `region_type` for
    /// `batch_name`, transitioning it to PROCESSING and stamping
    /// `start_time`. Returns `None` when no PENDING rows remain.
    async fn next_pending(
        &self,
        batch_name: &str,
        region_type: RegionType,
    ) -> Result<Option<RegionCheckpoint>, CheckpointError>;

    async fn mark_completed(&self, id: i64, processed_count: i64) -> Result<(), CheckpointError>;

    async fn mark_failed(&self, id: i64, error_message: &str) -> Result<(), CheckpointError>;

    async fn progress(&self, batch_name: &str) -> Result<BatchProgress, CheckpointError>;

    /// True when at least one PROCESSING row exists for `batch_name` with no
    /// matching RUNNING execution — the signature of a process that died
    /// mid-region rather than finishing cleanly.
    async fn has_interrupted(&self, batch_name: &str) -> Result<bool, CheckpointError>;

    /// Recovery step for the interrupted case above: PROCESSING -> PENDING
    /// for every region in `batch_name`, so the next execution picks them up
    /// instead of treating them as permanently claimed.
    async fn reset_processing_to_pending(&self, batch_name: &str) -> Result<u64, CheckpointError>;

    /// Manual operator escape hatch for a single FAILED region (spec.md §8
    /// Open Question: FAILED is terminal by default, recoverable only on
    /// request).
    async fn reset_to_pending(&self, id: i64) -> Result<(), CheckpointError>;
}

/// Applies the embedded `migrations/` to `pool`: `batch_checkpoint` and
/// `batch_execution_metadata`. Idempotent — safe to call on every startup.
pub async fn migrate(pool: &sqlx::PgPool) -> Result<(), sqlx::migrate::MigrateError> {
    sqlx::migrate!("./migrations").run(pool).await
}

/// sqlx-backed implementation against the `batch_checkpoint` /
/// `batch_execution_metadata` tables (see `migrations/`).
pub struct PgCheckpointStore {
    pool: sqlx::PgPool,
}

impl PgCheckpointStore {
    pub fn new(pool: sqlx::PgPool) -> Self {
        Self { pool }
    }
}

fn row_to_checkpoint(row: CheckpointRow) -> RegionCheckpoint {
    RegionCheckpoint {
        id: row.id,
        batch_name: row.batch_name,
        region_type: RegionType::parse(&row.region_type).expect("valid region_type in storage"),
        region_code: row.region_code,
        region_name: row.region_name,
        parent_code: row.parent_code,
        status: CheckpointStatus::parse(&row.status).expect("valid status in storage"),
        start_time: row.start_time,
        end_time: row.end_time,
        processed_count: row.processed_count,
        error_message: row.error_message,
        created_at: row.created_at,
        updated_at: row.updated_at,
    }
}

#[derive(sqlx::FromRow)]
struct CheckpointRow {
    id: i64,
    batch_name: String,
    region_type: String,
    region_code: String,
    region_name: String,
    parent_code: Option<String>,
    status: String,
    start_time: Option<DateTime<Utc>>,
    end_time: Option<DateTime<Utc>>,
    processed_count: i64,
    error_message: Option<String>,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

#[async_trait]
impl CheckpointStore for PgCheckpointStore {
    async fn initialize(
        &self,
        batch_name: &str,
        regions: Vec<RegionSeed>,
    ) -> Result<InitializeOutcome, CheckpointError> {
        let mut outcome = InitializeOutcome::default();
        let mut tx = self.pool.begin().await?;
        for region in regions {
            let result = sqlx::query(
                "INSERT INTO batch_checkpoint \
                    (batch_name, region_type, region_code, region_name, parent_code, status) \
                 VALUES ($1, $2, $3, $4, $5, 'PENDING') \
                 ON CONFLICT (batch_name, region_type, region_code) DO NOTHING",
            )
            .bind(batch_name)
            .bind(region.region_type.as_str())
            .bind(&region.region_code)
            .bind(&region.region_name)
            .bind(&region.parent_code)
            .execute(&mut *tx)
            .await?;

            if result.rows_affected() == 1 {
                outcome.inserted += 1;
            } else {
                outcome.skipped += 1;
            }
        }
        tx.commit().await?;
        Ok(outcome)
    }

    async fn start_execution(&self, batch_name: &str) -> Result<BatchExecution, CheckpointError> {
        let already_running: Option<(i64,)> = sqlx::query_as(
            "SELECT id FROM batch_execution_metadata WHERE batch_name = $1 AND status = 'RUNNING'",
        )
        .bind(batch_name)
        .fetch_optional(&self.pool)
        .await?;
        if already_running.is_some() {
            warn!(batch_name, "refusing start_execution: already running");
            return Err(CheckpointError::ConcurrentExecution {
                batch_name: batch_name.to_string(),
            });
        }

        let total: (i64,) =
            sqlx::query_as("SELECT count(*) FROM batch_checkpoint WHERE batch_name = $1")
                .bind(batch_name)
                .fetch_one(&self.pool)
                .await?;

        let execution_id = Uuid::new_v4();
        let row: (i64, DateTime<Utc>) = sqlx::query_as(
            "INSERT INTO batch_execution_metadata \
                (batch_name, execution_id, status, total_regions) \
             VALUES ($1, $2, 'RUNNING', $3) \
             RETURNING id, start_time",
        )
        .bind(batch_name)
        .bind(execution_id)
        .bind(total.0)
        .fetch_one(&self.pool)
        .await?;

        Ok(BatchExecution {
            id: row.0,
            batch_name: batch_name.to_string(),
            execution_id,
            status: ExecutionStatus::Running,
            start_time: row.1,
            end_time: None,
            total_regions: total.0,
            completed_regions: 0,
            failed_regions: 0,
        })
    }

    async fn finish_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
    ) -> Result<(), CheckpointError> {
        sqlx::query(
            "UPDATE batch_execution_metadata \
             SET status = $2, end_time = now() \
             WHERE execution_id = $1",
        )
        .bind(execution_id)
        .bind(status.as_str())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn next_pending(
        &self,
        batch_name: &str,
        region_type: RegionType,
    ) -> Result<Option<RegionCheckpoint>, CheckpointError> {
        let row: Option<CheckpointRow> = sqlx::query_as(
            "UPDATE batch_checkpoint \
             SET status = 'PROCESSING', start_time = now() \
             WHERE id = ( \
                 SELECT id FROM batch_checkpoint \
                 WHERE batch_name = $1 AND region_type = $2 AND status = 'PENDING' \
                 ORDER BY id ASC \
                 LIMIT 1 \
                 FOR UPDATE SKIP LOCKED \
             ) \
             RETURNING id, batch_name, region_type, region_code, region_name, parent_code, \
                       status, start_time, end_time, processed_count, error_message, \
                       created_at, updated_at",
        )
        .bind(batch_name)
        .bind(region_type.as_str())
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(row_to_checkpoint))
    }

    async fn mark_completed(&self, id: i64, processed_count: i64) -> Result<(), CheckpointError> {
        let result = sqlx::query(
            "UPDATE batch_checkpoint \
             SET status = 'COMPLETED', end_time = now(), processed_count = $2 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(processed_count)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CheckpointError::NotFound(id));
        }
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error_message: &str) -> Result<(), CheckpointError> {
        let result = sqlx::query(
            "UPDATE batch_checkpoint \
             SET status = 'FAILED', end_time = now(), error_message = $2 \
             WHERE id = $1",
        )
        .bind(id)
        .bind(error_message)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CheckpointError::NotFound(id));
        }
        Ok(())
    }

    async fn progress(&self, batch_name: &str) -> Result<BatchProgress, CheckpointError> {
        let row: (i64, i64, i64, i64, i64) = sqlx::query_as(
            "SELECT count(*), \
                    count(*) FILTER (WHERE status = 'PENDING'), \
                    count(*) FILTER (WHERE status = 'PROCESSING'), \
                    count(*) FILTER (WHERE status = 'COMPLETED'), \
                    count(*) FILTER (WHERE status = 'FAILED') \
             FROM batch_checkpoint WHERE batch_name = $1",
        )
        .bind(batch_name)
        .fetch_one(&self.pool)
        .await?;

        Ok(BatchProgress {
            total: row.0,
            pending: row.1,
            processing: row.2,
            completed: row.3,
            failed: row.4,
        })
    }

    async fn has_interrupted(&self, batch_name: &str) -> Result<bool, CheckpointError> {
        let row: (i64,) = sqlx::query_as(
            "SELECT count(*) FROM batch_checkpoint \
             WHERE batch_name = $1 AND status = 'PROCESSING'",
        )
        .bind(batch_name)
        .fetch_one(&self.pool)
        .await?;
        Ok(row.0 > 0)
    }

    async fn reset_processing_to_pending(&self, batch_name: &str) -> Result<u64, CheckpointError> {
        let result = sqlx::query(
            "UPDATE batch_checkpoint SET status = 'PENDING', start_time = NULL \
             WHERE batch_name = $1 AND status = 'PROCESSING'",
        )
        .bind(batch_name)
        .execute(&self.pool)
        .await?;
        Ok(result.rows_affected())
    }

    async fn reset_to_pending(&self, id: i64) -> Result<(), CheckpointError> {
        let result = sqlx::query(
            "UPDATE batch_checkpoint \
             SET status = 'PENDING', start_time = NULL, end_time = NULL, error_message = NULL \
             WHERE id = $1 AND status = 'FAILED'",
        )
        .bind(id)
        .execute(&self.pool)
        .await?;
        if result.rows_affected() == 0 {
            return Err(CheckpointError::NotFound(id));
        }
        Ok(())
    }
}

/// In-memory test double. Mirrors the state-machine semantics of
/// `PgCheckpointStore` exactly so behavioral tests can run without Postgres.
pub struct MemCheckpointStore {
    next_id: AtomicI64,
    rows: Mutex<HashMap<i64, RegionCheckpoint>>,
    executions: Mutex<HashMap<Uuid, BatchExecution>>,
}

impl Default for MemCheckpointStore {
    fn default() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            rows: Mutex::new(HashMap::new()),
            executions: Mutex::new(HashMap::new()),
        }
    }
}

impl MemCheckpointStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CheckpointStore for MemCheckpointStore {
    async fn initialize(
        &self,
        batch_name: &str,
        regions: Vec<RegionSeed>,
    ) -> Result<InitializeOutcome, CheckpointError> {
        let mut rows = self.rows.lock().unwrap();
        let mut outcome = InitializeOutcome::default();
        for region in regions {
            let exists = rows.values().any(|r| {
                r.batch_name == batch_name
                    && r.region_type == region.region_type
                    && r.region_code == region.region_code
            });
            if exists {
                outcome.skipped += 1;
                continue;
            }
            let id = self.next_id.fetch_add(1, Ordering::SeqCst);
            let now = Utc::now();
            rows.insert(
                id,
                RegionCheckpoint {
                    id,
                    batch_name: batch_name.to_string(),
                    region_type: region.region_type,
                    region_code: region.region_code,
                    region_name: region.region_name,
                    parent_code: region.parent_code,
                    status: CheckpointStatus::Pending,
                    start_time: None,
                    end_time: None,
                    processed_count: 0,
                    error_message: None,
                    created_at: now,
                    updated_at: now,
                },
            );
            outcome.inserted += 1;
        }
        Ok(outcome)
    }

    async fn start_execution(&self, batch_name: &str) -> Result<BatchExecution, CheckpointError> {
        let mut executions = self.executions.lock().unwrap();
        if executions
            .values()
            .any(|e| e.batch_name == batch_name && e.status == ExecutionStatus::Running)
        {
            return Err(CheckpointError::ConcurrentExecution {
                batch_name: batch_name.to_string(),
            });
        }
        let rows = self.rows.lock().unwrap();
        let total = rows.values().filter(|r| r.batch_name == batch_name).count() as i64;
        drop(rows);

        let execution = BatchExecution {
            id: executions.len() as i64 + 1,
            batch_name: batch_name.to_string(),
            execution_id: Uuid::new_v4(),
            status: ExecutionStatus::Running,
            start_time: Utc::now(),
            end_time: None,
            total_regions: total,
            completed_regions: 0,
            failed_regions: 0,
        };
        executions.insert(execution.execution_id, execution.clone());
        Ok(execution)
    }

    async fn finish_execution(
        &self,
        execution_id: Uuid,
        status: ExecutionStatus,
    ) -> Result<(), CheckpointError> {
        let mut executions = self.executions.lock().unwrap();
        if let Some(exec) = executions.get_mut(&execution_id) {
            exec.status = status;
            exec.end_time = Some(Utc::now());
        }
        Ok(())
    }

    async fn next_pending(
        &self,
        batch_name: &str,
        region_type: RegionType,
    ) -> Result<Option<RegionCheckpoint>, CheckpointError> {
        let mut rows = self.rows.lock().unwrap();
        let mut candidate_ids: Vec<i64> = rows
            .values()
            .filter(|r| {
                r.batch_name == batch_name
                    && r.region_type == region_type
                    && r.status == CheckpointStatus::Pending
            })
            .map(|r| r.id)
            .collect();
        candidate_ids.sort_unstable();

        let Some(&id) = candidate_ids.first() else {
            return Ok(None);
        };
        let row = rows.get_mut(&id).unwrap();
        row.status = CheckpointStatus::Processing;
        row.start_time = Some(Utc::now());
        row.updated_at = Utc::now();
        Ok(Some(row.clone()))
    }

    async fn mark_completed(&self, id: i64, processed_count: i64) -> Result<(), CheckpointError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&id).ok_or(CheckpointError::NotFound(id))?;
        row.status = CheckpointStatus::Completed;
        row.end_time = Some(Utc::now());
        row.processed_count = processed_count;
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn mark_failed(&self, id: i64, error_message: &str) -> Result<(), CheckpointError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&id).ok_or(CheckpointError::NotFound(id))?;
        row.status = CheckpointStatus::Failed;
        row.end_time = Some(Utc::now());
        row.error_message = Some(error_message.to_string());
        row.updated_at = Utc::now();
        Ok(())
    }

    async fn progress(&self, batch_name: &str) -> Result<BatchProgress, CheckpointError> {
        let rows = self.rows.lock().unwrap();
        let mut progress = BatchProgress::default();
        for row in rows.values().filter(|r| r.batch_name == batch_name) {
            progress.total += 1;
            match row.status {
                CheckpointStatus::Pending => progress.pending += 1,
                CheckpointStatus::Processing => progress.processing += 1,
                CheckpointStatus::Completed => progress.completed += 1,
                CheckpointStatus::Failed => progress.failed += 1,
            }
        }
        Ok(progress)
    }

    async fn has_interrupted(&self, batch_name: &str) -> Result<bool, CheckpointError> {
        let rows = self.rows.lock().unwrap();
        Ok(rows
            .values()
            .any(|r| r.batch_name == batch_name && r.status == CheckpointStatus::Processing))
    }

    async fn reset_processing_to_pending(&self, batch_name: &str) -> Result<u64, CheckpointError> {
        let mut rows = self.rows.lock().unwrap();
        let mut count = 0u64;
        for row in rows
            .values_mut()
            .filter(|r| r.batch_name == batch_name && r.status == CheckpointStatus::Processing)
        {
            row.status = CheckpointStatus::Pending;
            row.start_time = None;
            row.updated_at = Utc::now();
            count += 1;
        }
        Ok(count)
    }

    async fn reset_to_pending(&self, id: i64) -> Result<(), CheckpointError> {
        let mut rows = self.rows.lock().unwrap();
        let row = rows.get_mut(&id).ok_or(CheckpointError::NotFound(id))?;
        if row.status != CheckpointStatus::Failed {
            return Err(CheckpointError::UnexpectedStatus {
                id,
                expected: CheckpointStatus::Failed,
                actual: row.status,
            });
        }
        row.status = CheckpointStatus::Pending;
        row.start_time = None;
        row.end_time = None;
        row.error_message = None;
        row.updated_at = Utc::now();
        Ok(())
    }
}

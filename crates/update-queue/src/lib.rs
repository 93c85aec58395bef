//! Redis-backed task queue for enrichment workloads: priority lanes,
//! multi-consumer in-flight tracking, worker heartbeats, and a
//! visibility-timeout supervisor for at-least-once delivery (spec.md §4.5).
//!
//! Grounded on the `CortexLM-dataforge` scheduler module's
//! `JobQueue`/`WorkerPool`/`Job` split: reliable dequeue, crash recovery via
//! lease expiry, and a dead-letter set for exhausted retries.

mod backend;
mod queue;
mod reader;
mod task;

pub use backend::{
    InflightEntry, MemQueueBackend, QueueBackend, QueueError, QueueStats, RedisQueueBackend,
    WorkerSnapshot, WorkerState,
};
pub use queue::{ClearTarget, QueueConfig, TaskOutcome, UpdateQueue};
pub use reader::QueueReader;
pub use task::{OperationFlags, Priority, UpdateTask};

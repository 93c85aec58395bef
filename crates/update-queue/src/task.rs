use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Which lane a task is enqueued to. Priority tasks are always drained
/// before pending ones (spec.md §4.5 "Ordering").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    Normal,
    High,
}

impl Priority {
    pub fn from_flag(value: u8) -> Self {
        if value == 0 {
            Priority::Normal
        } else {
            Priority::High
        }
    }

    pub fn as_flag(self) -> u8 {
        match self {
            Priority::Normal => 0,
            Priority::High => 1,
        }
    }
}

/// Which enrichment operations a task should run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OperationFlags {
    pub menus: bool,
    pub images: bool,
    pub reviews: bool,
}

impl OperationFlags {
    pub fn all() -> Self {
        Self {
            menus: true,
            images: true,
            reviews: true,
        }
    }
}

/// A queued unit of enrichment work (spec.md §3 "UpdateTask"). `task_id` is
/// unique per *attempt*: a retry after failure gets a fresh `task_id` while
/// keeping the same `place_id` (spec.md §3 invariant).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UpdateTask {
    pub task_id: Uuid,
    pub place_id: i64,
    pub ops: OperationFlags,
    pub priority: Priority,
    pub attempts: u32,
    pub created_at: DateTime<Utc>,
    pub enqueued_at: DateTime<Utc>,
}

impl UpdateTask {
    pub fn new(place_id: i64, ops: OperationFlags, priority: Priority) -> Self {
        let now = Utc::now();
        Self {
            task_id: Uuid::new_v4(),
            place_id,
            ops,
            priority,
            attempts: 0,
            created_at: now,
            enqueued_at: now,
        }
    }

    /// Produces the task for a retry attempt: same `place_id`, a fresh
    /// `task_id`, `attempts` incremented, `enqueued_at` refreshed.
    pub fn retry(&self) -> Self {
        Self {
            task_id: Uuid::new_v4(),
            place_id: self.place_id,
            ops: self.ops,
            priority: self.priority,
            attempts: self.attempts + 1,
            created_at: self.created_at,
            enqueued_at: Utc::now(),
        }
    }
}

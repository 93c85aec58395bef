//! Enforces the mutual-exclusion half of Open Question decision #1
//! (DESIGN.md): a `batch_name` runs under region-sweep checkpointing or
//! worker-modulo partitioning, never both at once. `place_ingest_config`
//! carries the configured default; this registry is the runtime guard that
//! refuses to mix modes for a batch that's already live under the other one.

use place_ingest_config::DeploymentMode;
use std::collections::HashMap;
use std::sync::Mutex;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DeploymentModeError {
    #[error("batch {batch_name:?} is running in {running:?} mode, refusing to start in {requested:?} mode")]
    Conflict {
        batch_name: String,
        running: DeploymentMode,
        requested: DeploymentMode,
    },
}

#[derive(Default)]
pub struct DeploymentModeRegistry {
    active: Mutex<HashMap<String, DeploymentMode>>,
}

impl DeploymentModeRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registers `batch_name` as running under `mode`. Rejects the call if
    /// the batch is already registered under the other mode; repeated
    /// registration under the same mode (e.g. a second partitioned worker)
    /// is fine.
    pub fn claim(&self, batch_name: &str, mode: DeploymentMode) -> Result<(), DeploymentModeError> {
        let mut active = self.active.lock().unwrap();
        match active.get(batch_name) {
            Some(running) if *running != mode => Err(DeploymentModeError::Conflict {
                batch_name: batch_name.to_string(),
                running: *running,
                requested: mode,
            }),
            _ => {
                active.insert(batch_name.to_string(), mode);
                Ok(())
            }
        }
    }

    /// Releases the claim once every slot for `batch_name` has stopped. The
    /// caller (the stop-all path) is responsible for knowing no slot is
    /// still live; this registry does not itself track slot counts.
    pub fn release(&self, batch_name: &str) {
        self.active.lock().unwrap().remove(batch_name);
    }
}

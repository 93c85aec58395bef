//! Prometheus metrics shared by the pipeline engine, update queue, and job
//! controller. One registry, constructed once at server start and cloned
//! (all handles are `Clone` wrappers around `prometheus`'s internal `Arc`s).

use prometheus::{
    register_int_counter_vec_with_registry, register_int_gauge_vec_with_registry,
    IntCounterVec, IntGaugeVec, Registry,
};

#[derive(Clone)]
pub struct IngestMetrics {
    /// Chunks read/written/skipped/failed, labeled by job name and outcome.
    pub chunk_items: IntCounterVec,
    /// Current checkpoint watermark per `(batch_name, region_type)`.
    pub checkpoint_watermark: IntGaugeVec,
    /// Redis queue depth, labeled by lane (`pending` | `priority`).
    pub queue_depth: IntGaugeVec,
    /// In-flight task count currently leased to a worker.
    pub queue_inflight: IntGaugeVec,
}

impl IngestMetrics {
    pub fn new(registry: &Registry) -> Self {
        Self {
            chunk_items: register_int_counter_vec_with_registry!(
                "ingest_chunk_items_total",
                "Items processed by the chunk pipeline engine, by job and outcome.",
                &["job", "outcome"],
                registry,
            )
            .unwrap(),
            checkpoint_watermark: register_int_gauge_vec_with_registry!(
                "ingest_checkpoint_completed_regions",
                "Completed region count per batch/region-type.",
                &["batch_name", "region_type"],
                registry,
            )
            .unwrap(),
            queue_depth: register_int_gauge_vec_with_registry!(
                "ingest_queue_depth",
                "Pending task count per queue lane.",
                &["lane"],
                registry,
            )
            .unwrap(),
            queue_inflight: register_int_gauge_vec_with_registry!(
                "ingest_queue_inflight",
                "Leased-but-unacknowledged task count.",
                &["worker_id"],
                registry,
            )
            .unwrap(),
        }
    }

    pub fn record_outcome(&self, job: &str, outcome: &str, count: i64) {
        self.chunk_items
            .with_label_values(&[job, outcome])
            .inc_by(count.max(0) as u64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registers_without_panicking() {
        let registry = Registry::new();
        let metrics = IngestMetrics::new(&registry);
        metrics.record_outcome("crawl-batch", "written", 5);
        assert_eq!(
            metrics
                .chunk_items
                .with_label_values(&["crawl-batch", "written"])
                .get(),
            5
        );
    }
}

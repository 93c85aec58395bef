//! Bridges `pipeline-engine`/`update-queue`/`checkpoint-store` result types
//! into `place-ingest-metrics`'s Prometheus gauges/counters. Kept out of
//! `place-ingest-metrics` itself so that crate stays dependency-free beyond
//! `prometheus`.

use place_ingest_metrics::IngestMetrics;
use pipeline_engine::EngineReport;

/// Records one finished chunk engine run's counters against `job`, labeled
/// by outcome (spec.md §5 "chunk engine counters").
pub fn record_engine_report(metrics: &IngestMetrics, job: &str, report: &EngineReport) {
    metrics.record_outcome(job, "read", report.counters.read as i64);
    metrics.record_outcome(job, "written", report.counters.written as i64);
    metrics.record_outcome(job, "skipped", report.counters.skipped as i64);
    metrics.record_outcome(job, "failed", report.counters.failed as i64);
}

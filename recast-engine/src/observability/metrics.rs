//! Metrics facade for the ingestion pipeline, following Prometheus naming
//! conventions. Recording is a no-op unless a recorder is installed; the
//! binary installs one at startup via [`install_recorder`].

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use recast_core::Stage;

/// Install the process-wide Prometheus recorder (no HTTP listener; callers
/// render the handle when they want a snapshot). Returns `None` when a
/// recorder is already installed.
pub fn install_recorder() -> Option<PrometheusHandle> {
    PrometheusBuilder::new().install_recorder().ok()
}

pub mod stages {
    use super::*;

    pub fn success(stage: Stage) {
        ::metrics::counter!("recast_stage_success_total", "stage" => stage.as_str()).increment(1);
    }

    pub fn error(stage: Stage) {
        ::metrics::counter!("recast_stage_error_total", "stage" => stage.as_str()).increment(1);
    }

    pub fn retry(stage: Stage) {
        ::metrics::counter!("recast_stage_retries_total", "stage" => stage.as_str()).increment(1);
    }

    pub fn skipped(stage: Stage) {
        ::metrics::counter!("recast_stage_skipped_total", "stage" => stage.as_str()).increment(1);
    }

    pub fn duration(stage: Stage, secs: f64) {
        ::metrics::histogram!("recast_stage_duration_seconds", "stage" => stage.as_str())
            .record(secs);
    }

    pub fn rows_processed(stage: Stage, rows: u64) {
        ::metrics::counter!("recast_stage_rows_processed_total", "stage" => stage.as_str())
            .increment(rows);
    }
}

pub mod ingestions {
    pub fn started() {
        ::metrics::counter!("recast_ingestions_started_total").increment(1);
    }

    pub fn completed() {
        ::metrics::counter!("recast_ingestions_completed_total").increment(1);
    }

    pub fn failed() {
        ::metrics::counter!("recast_ingestions_failed_total").increment(1);
    }

    pub fn suspended() {
        ::metrics::counter!("recast_ingestions_suspended_total").increment(1);
    }

    pub fn resumed() {
        ::metrics::counter!("recast_ingestions_resumed_total").increment(1);
    }
}

// Prometheus counters for the execution engine

use lazy_static::lazy_static;
use prometheus::{
    register_histogram, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, Histogram, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use scriptbox_common::types::JobStatus;

lazy_static! {
    pub static ref JOBS_SUBMITTED: IntCounter = register_int_counter!(
        "scriptbox_jobs_submitted_total",
        "Jobs accepted for execution"
    )
    .expect("metric can be registered");
    pub static ref JOBS_FINISHED: IntCounterVec = register_int_counter_vec!(
        "scriptbox_jobs_finished_total",
        "Jobs that reached a terminal state",
        &["status"]
    )
    .expect("metric can be registered");
    pub static ref JOBS_RUNNING: IntGauge = register_int_gauge!(
        "scriptbox_jobs_running",
        "Sandboxes currently supervised"
    )
    .expect("metric can be registered");
    pub static ref JOB_DURATION: Histogram = register_histogram!(
        "scriptbox_job_duration_seconds",
        "Wall time from start to finish",
        vec![1.0, 5.0, 15.0, 60.0, 300.0, 900.0, 1800.0, 3600.0]
    )
    .expect("metric can be registered");
    pub static ref GPU_FALLBACKS: IntCounter = register_int_counter!(
        "scriptbox_gpu_fallbacks_total",
        "GPU jobs downgraded to CPU"
    )
    .expect("metric can be registered");
}

pub fn record_finished(status: JobStatus, duration_seconds: Option<f64>) {
    JOBS_FINISHED.with_label_values(&[status.as_str()]).inc();
    if let Some(d) = duration_seconds {
        JOB_DURATION.observe(d);
    }
}

/// Text exposition of the default registry
pub fn gather() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&prometheus::gather(), &mut buffer) {
        tracing::warn!(error = %e, "Failed to encode metrics");
    }
    String::from_utf8_lossy(&buffer).into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gather_includes_counters() {
        JOBS_SUBMITTED.inc();
        record_finished(JobStatus::Timeout, Some(61.0));
        let text = gather();
        assert!(text.contains("scriptbox_jobs_submitted_total"));
        assert!(text.contains("scriptbox_jobs_finished_total{status=\"timeout\"}"));
    }
}

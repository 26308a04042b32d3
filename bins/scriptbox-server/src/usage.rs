// Resource usage aggregation
// Folds periodic runtime samples into the JobMetrics record

use crate::runtime::UsageSample;
use chrono::{DateTime, Utc};
use scriptbox_common::types::{JobId, JobMetrics};

const BYTES_PER_MB: f64 = 1024.0 * 1024.0;

#[derive(Debug, Default)]
pub struct UsageTracker {
    previous: Option<UsageSample>,
    last: Option<UsageSample>,
    cpu_percents: Vec<f64>,
    memory_mb: Vec<f64>,
}

/// CPU percent between two cumulative readings, scaled to online CPUs
pub fn cpu_percent(previous: &UsageSample, current: &UsageSample) -> Option<f64> {
    let cpu_delta = current.cpu_total_ns.checked_sub(previous.cpu_total_ns)?;
    let system_delta = current.system_cpu_ns.checked_sub(previous.system_cpu_ns)?;
    if system_delta == 0 {
        return None;
    }
    let cpus = current.online_cpus.max(1) as f64;
    Some(cpu_delta as f64 / system_delta as f64 * cpus * 100.0)
}

impl UsageTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn record(&mut self, sample: UsageSample) {
        if let Some(prev) = &self.previous {
            if let Some(pct) = cpu_percent(prev, &sample) {
                self.cpu_percents.push(pct);
            }
        }
        self.memory_mb.push(sample.memory_bytes as f64 / BYTES_PER_MB);
        self.previous = Some(sample);
        self.last = Some(sample);
    }

    pub fn is_empty(&self) -> bool {
        self.last.is_none()
    }

    /// Aggregate into a metrics record; `None` when nothing was sampled
    pub fn summarize(
        &self,
        job_id: JobId,
        gpu_seconds: f64,
        collected_at: DateTime<Utc>,
    ) -> Option<JobMetrics> {
        let last = self.last?;

        let avg = |values: &[f64]| {
            if values.is_empty() {
                0.0
            } else {
                values.iter().sum::<f64>() / values.len() as f64
            }
        };
        let max = |values: &[f64]| values.iter().copied().fold(0.0_f64, f64::max);

        Some(JobMetrics {
            job_id,
            cpu_seconds: last.cpu_total_ns as f64 / 1e9,
            avg_cpu_percent: avg(&self.cpu_percents),
            max_cpu_percent: max(&self.cpu_percents),
            peak_ram_mb: max(&self.memory_mb),
            avg_ram_mb: avg(&self.memory_mb),
            gpu_seconds,
            network_rx_bytes: last.network_rx_bytes,
            network_tx_bytes: last.network_tx_bytes,
            disk_read_bytes: last.disk_read_bytes,
            disk_write_bytes: last.disk_write_bytes,
            collected_at: Some(collected_at),
        })
    }
}

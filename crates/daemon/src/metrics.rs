//! Metrics module
//!
//! Provides structs for job metrics, sweep summaries, system metrics, and
//! metrics snapshots with JSON serialization support.

use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::RwLock;

/// Number of finished jobs kept in the snapshot; running jobs are always kept
pub const JOB_HISTORY_LIMIT: usize = 200;

/// Per-job metrics tracking a correction job through the pipeline
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct JobMetrics {
    pub id: String,
    pub input_path: String,
    pub calibration_path: Option<String>,
    pub stage: String,
    pub threads_hint: u32,
    pub started_unix_ms: i64,
    pub updated_unix_ms: i64,
    pub output_records: usize,
    pub error: Option<String>,
}

impl JobMetrics {
    pub fn is_active(&self) -> bool {
        matches!(self.stage.as_str(), "queued" | "correcting" | "aggregating")
    }
}

/// Summary of the last finished sweep
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SweepMetrics {
    pub finished_unix_ms: i64,
    pub folders: usize,
    pub candidates: usize,
    pub submitted: usize,
    pub already_handled: usize,
    pub settling: usize,
    pub missing_calibration: usize,
    pub cancelled: bool,
}

/// System-level metrics for resource monitoring
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SystemMetrics {
    pub cpu_usage_percent: f32,
    pub mem_usage_percent: f32,
    pub load_avg_1: f32,
    pub load_avg_5: f32,
    pub load_avg_15: f32,
}

/// Complete metrics snapshot including jobs, sweeps, system, and aggregate stats
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct MetricsSnapshot {
    pub timestamp_unix_ms: i64,
    pub jobs: Vec<JobMetrics>,
    pub system: SystemMetrics,
    pub running_jobs: usize,
    pub completed_jobs: u64,
    pub failed_jobs: u64,
    /// Jobs that gave their claim back (calibration missing or vanished)
    pub released_jobs: u64,
    pub handled_files: usize,
    pub output_records: usize,
    pub sweeps: u64,
    pub last_sweep: Option<SweepMetrics>,
    pub next_scan_unix_ms: Option<i64>,
}

impl MetricsSnapshot {
    /// Insert or replace the entry for a job and refresh the running count
    pub fn upsert_job(&mut self, job: JobMetrics) {
        if let Some(existing) = self.jobs.iter_mut().find(|j| j.id == job.id) {
            *existing = job;
        } else {
            self.jobs.push(job);
        }
        self.trim_history();
        self.running_jobs = self.jobs.iter().filter(|j| j.is_active()).count();
    }

    // Oldest finished jobs go first
    fn trim_history(&mut self) {
        let finished = self.jobs.iter().filter(|j| !j.is_active()).count();
        let mut excess = finished.saturating_sub(JOB_HISTORY_LIMIT);
        if excess == 0 {
            return;
        }
        self.jobs.retain(|j| {
            if excess > 0 && !j.is_active() {
                excess -= 1;
                false
            } else {
                true
            }
        });
    }
}

/// Shared metrics state for concurrent access across daemon components
pub type SharedMetrics = Arc<RwLock<MetricsSnapshot>>;

/// Creates a new SharedMetrics instance with default values
pub fn new_shared_metrics() -> SharedMetrics {
    Arc::new(RwLock::new(MetricsSnapshot::default()))
}

/// Current wall-clock time in Unix milliseconds
pub fn now_unix_ms() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Collects current system metrics using sysinfo
pub fn collect_system_metrics() -> SystemMetrics {
    use sysinfo::System;

    let mut sys = System::new();
    sys.refresh_cpu_usage();
    sys.refresh_memory();

    let cpu_usage = sys.global_cpu_usage();
    let total_memory = sys.total_memory();
    let used_memory = sys.used_memory();
    let mem_usage = if total_memory > 0 {
        (used_memory as f64 / total_memory as f64 * 100.0) as f32
    } else {
        0.0
    };

    let load_avg = System::load_average();

    SystemMetrics {
        cpu_usage_percent: cpu_usage,
        mem_usage_percent: mem_usage,
        load_avg_1: load_avg.one as f32,
        load_avg_5: load_avg.five as f32,
        load_avg_15: load_avg.fifteen as f32,
    }
}

//! Concurrency planning module
//!
//! Derives the worker pool size and per-job thread hint from CPU core count and configuration.

use crate::config::Config;

/// Concurrency plan derived from configuration and system resources
#[derive(Debug, Clone, PartialEq)]
pub struct ConcurrencyPlan {
    /// Total logical CPU cores available
    pub total_cores: u32,
    /// Maximum number of correction jobs running at once
    pub max_concurrent_jobs: u32,
    /// Thread hint handed to each correction tool run
    pub threads_per_job: u32,
}

impl ConcurrencyPlan {
    /// Derive a concurrency plan from configuration
    ///
    /// Uses the following rules:
    /// - Detects CPU cores via num_cpus if not specified in config
    /// - Derives max_concurrent_jobs: cores / 8, clamped to [1, 4] (unless explicit)
    /// - Derives threads_per_job: 4 for 16+ cores, 2 otherwise (unless explicit)
    pub fn derive(cfg: &Config) -> Self {
        let total_cores = cfg
            .cpu
            .logical_cores
            .unwrap_or_else(|| num_cpus::get() as u32)
            .max(1);

        let max_concurrent_jobs = if cfg.workers.max_concurrent_jobs > 0 {
            cfg.workers.max_concurrent_jobs
        } else {
            derive_max_jobs(total_cores)
        };

        let threads_per_job = if cfg.workers.threads_per_job > 0 {
            cfg.workers.threads_per_job
        } else {
            derive_threads(total_cores)
        };

        Self {
            total_cores,
            max_concurrent_jobs,
            threads_per_job,
        }
    }
}

/// Fiji runs are memory heavy, one job per 8 cores and never more than 4
fn derive_max_jobs(cores: u32) -> u32 {
    (cores / 8).clamp(1, 4)
}

/// Derive thread hint based on core count
/// - 4 threads for 16+ cores
/// - 2 threads otherwise
fn derive_threads(cores: u32) -> u32 {
    if cores >= 16 {
        4
    } else {
        2
    }
}

/// Public function to derive a concurrency plan from configuration
pub fn derive_plan(cfg: &Config) -> ConcurrencyPlan {
    ConcurrencyPlan::derive(cfg)
}

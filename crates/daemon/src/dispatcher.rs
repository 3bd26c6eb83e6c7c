//! Scan loop.
//!
//! A sweep walks the watched tree, decides for every candidate file whether
//! it should be corrected now, and submits the ready ones to the worker pool
//! without waiting for them. Between sweeps the loop sleeps for the scan
//! interval, or until cancelled.

use crate::config::{Config, ConfigError};
use crate::job_executor::{Job, JobError, JobExecutor};
use crate::metrics::{now_unix_ms, SharedMetrics, SweepMetrics};
use crate::scan::{find_calibration_file, find_processing_folders, list_candidates, CandidateFile};
use crate::stability::{readiness_at, Readiness};
use crate::tracker::JobStateTracker;
use ofm_corrector_config::format_duration;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

/// Settings of the scan loop
#[derive(Debug, Clone, PartialEq)]
pub struct DispatchSettings {
    pub root: PathBuf,
    pub calibration_pattern: String,
    pub quiescence: Duration,
    pub scan_interval: Duration,
    pub reference_channel: u32,
    pub skip_hidden_dirs: bool,
}

impl DispatchSettings {
    pub fn from_config(cfg: &Config) -> Result<Self, ConfigError> {
        Ok(Self {
            root: cfg.watch_root()?.to_path_buf(),
            calibration_pattern: cfg.watch.calibration_pattern.clone(),
            quiescence: cfg.quiescence()?,
            scan_interval: cfg.scan_interval()?,
            reference_channel: cfg.correction.reference_channel,
            skip_hidden_dirs: cfg.watch.skip_hidden_dirs,
        })
    }
}

/// What happened to one candidate file
#[derive(Debug)]
pub enum Decision {
    /// Claimed earlier in this run, or already corrected on disk
    AlreadyHandled,
    /// Modified too recently, re-checked next sweep
    Settling { remaining: Duration },
    /// No calibration file in the folder, re-checked next sweep
    MissingCalibration,
    /// Queued on the worker pool
    Submitted(JoinHandle<Result<Job, JobError>>),
}

/// Outcome of one sweep
#[derive(Debug, Default)]
pub struct SweepReport {
    pub folders: usize,
    pub candidates: usize,
    pub submitted: usize,
    pub already_handled: usize,
    pub settling: usize,
    pub missing_calibration: usize,
    /// The sweep stopped early because the token was cancelled
    pub cancelled: bool,
    /// Handles of the jobs submitted during the sweep
    pub handles: Vec<JoinHandle<Result<Job, JobError>>>,
}

impl SweepReport {
    fn record(&mut self, decision: Decision) {
        self.candidates += 1;
        match decision {
            Decision::AlreadyHandled => self.already_handled += 1,
            Decision::Settling { .. } => self.settling += 1,
            Decision::MissingCalibration => self.missing_calibration += 1,
            Decision::Submitted(handle) => {
                self.submitted += 1;
                self.handles.push(handle);
            }
        }
    }

    pub fn to_metrics(&self) -> SweepMetrics {
        SweepMetrics {
            finished_unix_ms: now_unix_ms(),
            folders: self.folders,
            candidates: self.candidates,
            submitted: self.submitted,
            already_handled: self.already_handled,
            settling: self.settling,
            missing_calibration: self.missing_calibration,
            cancelled: self.cancelled,
        }
    }
}

/// Discovers candidate files and feeds the worker pool
pub struct Dispatcher {
    settings: DispatchSettings,
    tracker: Arc<JobStateTracker>,
    executor: Arc<JobExecutor>,
    metrics: SharedMetrics,
}

impl Dispatcher {
    pub fn new(
        settings: DispatchSettings,
        tracker: Arc<JobStateTracker>,
        executor: Arc<JobExecutor>,
        metrics: SharedMetrics,
    ) -> Self {
        Self {
            settings,
            tracker,
            executor,
            metrics,
        }
    }

    pub fn settings(&self) -> &DispatchSettings {
        &self.settings
    }

    /// Decide what to do with one candidate
    ///
    /// Known files are skipped before their readiness is checked, and the
    /// claim is only taken once the file is ready and has a calibration
    /// file, so unready files stay unclaimed.
    pub fn evaluate(&self, candidate: &CandidateFile, calibration: Option<&Path>) -> Decision {
        let path = &candidate.path;

        if self.tracker.is_known(path) {
            return Decision::AlreadyHandled;
        }

        if let Readiness::Settling { remaining } =
            readiness_at(candidate.modified, SystemTime::now(), self.settings.quiescence)
        {
            debug!(
                input = %path.display(),
                remaining = %format_duration(remaining),
                "File still settling"
            );
            return Decision::Settling { remaining };
        }

        let Some(calibration) = calibration else {
            info!(input = %path.display(), "No calibration file next to input, will retry");
            return Decision::MissingCalibration;
        };

        if self.tracker.is_already_handled(path) {
            debug!(input = %path.display(), "Result folder already present, skipping");
            return Decision::AlreadyHandled;
        }

        let job = Job::new(
            path.clone(),
            Some(calibration.to_path_buf()),
            self.settings.reference_channel,
            self.executor.concurrency_plan().threads_per_job,
        );
        info!(
            job_id = %job.id,
            input = %path.display(),
            calibration = %calibration.display(),
            "Submitting correction job"
        );
        Decision::Submitted(self.executor.submit(job))
    }

    fn resolve_calibration(&self, folder: &Path) -> Option<PathBuf> {
        match find_calibration_file(folder, &self.settings.calibration_pattern) {
            Ok(found) => found,
            Err(e) => {
                debug!(folder = %folder.display(), error = %e, "Cannot list folder");
                None
            }
        }
    }

    /// One pass over the watched tree
    ///
    /// Does blocking filesystem work, call it from a blocking context.
    /// Cancellation is checked between folders.
    pub fn sweep(&self, cancel: &CancellationToken) -> SweepReport {
        let mut report = SweepReport::default();

        let folders = find_processing_folders(
            &self.settings.root,
            &self.settings.calibration_pattern,
            self.settings.skip_hidden_dirs,
        );

        for folder in folders {
            if cancel.is_cancelled() {
                report.cancelled = true;
                break;
            }
            report.folders += 1;

            // The calibration file may have changed since the walk saw it
            let calibration = self.resolve_calibration(&folder.path);

            let listed = list_candidates(&folder.path, &self.settings.calibration_pattern);
            let candidates = match listed {
                Ok(candidates) => candidates,
                Err(e) => {
                    debug!(folder = %folder.path.display(), error = %e, "Cannot list folder");
                    continue;
                }
            };

            for candidate in &candidates {
                report.record(self.evaluate(candidate, calibration.as_deref()));
            }
        }

        report
    }

    async fn record_sweep(&self, report: &SweepReport, next_scan_unix_ms: Option<i64>) {
        let mut metrics = self.metrics.write().await;
        metrics.sweeps += 1;
        metrics.last_sweep = Some(report.to_metrics());
        metrics.handled_files = self.tracker.len();
        metrics.next_scan_unix_ms = next_scan_unix_ms;
    }

    /// Sweep, sleep, repeat until `cancel` fires
    ///
    /// Jobs submitted by a sweep keep running while the loop sleeps.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        loop {
            info!(root = %self.settings.root.display(), "Scanning");

            let this = Arc::clone(&self);
            let token = cancel.clone();
            let report = match tokio::task::spawn_blocking(move || this.sweep(&token)).await {
                Ok(report) => report,
                Err(e) => {
                    error!(error = %e, "Sweep task failed");
                    SweepReport::default()
                }
            };

            info!(
                folders = report.folders,
                candidates = report.candidates,
                submitted = report.submitted,
                already_handled = report.already_handled,
                settling = report.settling,
                missing_calibration = report.missing_calibration,
                "Sweep finished"
            );

            if cancel.is_cancelled() {
                self.record_sweep(&report, None).await;
                break;
            }

            let interval = self.settings.scan_interval;
            let next_check = chrono::Duration::from_std(interval)
                .ok()
                .and_then(|d| chrono::Local::now().checked_add_signed(d));
            match next_check {
                Some(at) => info!(
                    interval = %format_duration(interval),
                    "Next check at {}",
                    at.format("%Y-%m-%d %H:%M:%S")
                ),
                None => info!(interval = %format_duration(interval), "Sleeping"),
            }
            self.record_sweep(&report, next_check.map(|at| at.timestamp_millis()))
                .await;

            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(interval) => {}
            }
        }

        info!("Scan loop stopped");
    }
}

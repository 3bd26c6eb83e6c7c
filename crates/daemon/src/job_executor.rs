//! Job executor module
//!
//! Runs correction jobs with concurrency limiting via semaphore and hands
//! successful results to the output aggregator.

use crate::aggregate::{AggregateError, OutputAggregator};
use crate::correct::{
    build_correction_command, render_command_line, run_correction, CorrectionError,
    CorrectionParams, CorrectionSettings,
};
use crate::marker::write_completion_marker;
use crate::metrics::{now_unix_ms, JobMetrics, SharedMetrics};
use crate::tracker::{output_folder_for, JobStateTracker};
use crate::ConcurrencyPlan;
use chrono::{DateTime, Utc};
use std::path::PathBuf;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Error type for job execution operations
#[derive(Debug, Error)]
pub enum JobError {
    /// Job was queued without a calibration file
    #[error("no calibration file for input")]
    MissingCalibration,

    /// Calibration file disappeared between queueing and running
    #[error("calibration file {0} no longer exists")]
    CalibrationVanished(PathBuf),

    /// Correction tool failed
    #[error("Correction failed: {0}")]
    Correction(#[from] CorrectionError),

    /// Registering the outputs failed
    #[error("Aggregation failed: {0}")]
    Aggregation(#[from] AggregateError),

    /// Failed to write the completion marker
    #[error("Failed to write completion marker: {0}")]
    Marker(std::io::Error),

    /// Blocking task panicked or was cancelled
    #[error("Job task failed: {0}")]
    Task(String),

    /// Worker pool was shut down
    #[error("worker pool is closed")]
    PoolClosed,
}

impl JobError {
    /// Whether the failure gives the claim back so a later sweep retries
    pub fn releases_claim(&self) -> bool {
        matches!(
            self,
            JobError::MissingCalibration | JobError::CalibrationVanished(_)
        )
    }
}

/// Job state representing the current stage in the pipeline
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JobState {
    /// Job is waiting for a worker slot
    Queued,
    /// Correction tool is running
    Correcting,
    /// Outputs are being registered
    Aggregating,
    /// Job completed successfully
    Completed,
    /// Job failed, the input stays claimed
    Failed(String),
    /// Job gave its claim back
    Released(String),
}

impl JobState {
    /// Convert state to string for metrics
    pub fn as_str(&self) -> &str {
        match self {
            JobState::Queued => "queued",
            JobState::Correcting => "correcting",
            JobState::Aggregating => "aggregating",
            JobState::Completed => "completed",
            JobState::Failed(_) => "failed",
            JobState::Released(_) => "released",
        }
    }
}

/// A correction job for one input file
#[derive(Debug, Clone)]
pub struct Job {
    /// Unique job identifier
    pub id: Uuid,
    /// Input image file
    pub input_path: PathBuf,
    /// Calibration file resolved when the job was queued
    pub calibration_path: Option<PathBuf>,
    /// Directory handed to the tool, the input's folder
    pub output_dir: PathBuf,
    /// Channel used as fixed reference
    pub reference_channel: u32,
    /// Thread hint passed to the tool
    pub threads_hint: u32,
    /// Current state of the job
    pub state: JobState,
    /// When the job was created
    pub queued_at: DateTime<Utc>,
}

impl Job {
    /// Create a new job for `input_path`
    pub fn new(
        input_path: PathBuf,
        calibration_path: Option<PathBuf>,
        reference_channel: u32,
        threads_hint: u32,
    ) -> Self {
        let output_dir = input_path
            .parent()
            .map(|p| p.to_path_buf())
            .unwrap_or_default();
        Self {
            id: Uuid::new_v4(),
            input_path,
            calibration_path,
            output_dir,
            reference_channel,
            threads_hint,
            state: JobState::Queued,
            queued_at: Utc::now(),
        }
    }

    /// Folder where the tool writes this job's series
    pub fn result_folder(&self) -> PathBuf {
        output_folder_for(&self.input_path)
    }

    /// Create JobMetrics from current job state
    pub fn to_metrics(&self, output_records: usize) -> JobMetrics {
        let error = match &self.state {
            JobState::Failed(reason) | JobState::Released(reason) => Some(reason.clone()),
            _ => None,
        };
        JobMetrics {
            id: self.id.to_string(),
            input_path: self.input_path.to_string_lossy().to_string(),
            calibration_path: self
                .calibration_path
                .as_ref()
                .map(|p| p.to_string_lossy().to_string()),
            stage: self.state.as_str().to_string(),
            threads_hint: self.threads_hint,
            started_unix_ms: self.queued_at.timestamp_millis(),
            updated_unix_ms: now_unix_ms(),
            output_records,
            error,
        }
    }
}

/// Job executor that runs correction jobs with concurrency limiting
///
/// Uses a tokio Semaphore to limit the number of concurrent tool runs
/// according to the concurrency plan.
pub struct JobExecutor {
    /// Semaphore for limiting concurrent jobs
    semaphore: Arc<Semaphore>,
    /// Concurrency plan with job and thread limits
    concurrency_plan: ConcurrencyPlan,
    /// Shared metrics state
    metrics: SharedMetrics,
    /// Handled set, released on calibration failures
    tracker: Arc<JobStateTracker>,
    /// Registers successful outputs
    aggregator: OutputAggregator,
    /// How the correction tool is launched
    correction: CorrectionSettings,
}

impl JobExecutor {
    /// Create a new JobExecutor
    ///
    /// # Arguments
    /// * `plan` - Concurrency plan determining max concurrent jobs
    /// * `metrics` - Shared metrics state for updating job progress
    /// * `tracker` - Handled set shared with the dispatcher
    /// * `aggregator` - Output aggregator for finished jobs
    /// * `correction` - Launcher, script and flags of the correction tool
    pub fn new(
        plan: ConcurrencyPlan,
        metrics: SharedMetrics,
        tracker: Arc<JobStateTracker>,
        aggregator: OutputAggregator,
        correction: CorrectionSettings,
    ) -> Self {
        let permits = plan.max_concurrent_jobs.max(1) as usize;
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            concurrency_plan: plan,
            metrics,
            tracker,
            aggregator,
            correction,
        }
    }

    /// Get the number of available permits (slots for concurrent jobs)
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Get the concurrency plan
    pub fn concurrency_plan(&self) -> &ConcurrencyPlan {
        &self.concurrency_plan
    }

    /// Acquire a permit for job execution
    ///
    /// This will wait until a permit is available if all slots are in use.
    pub async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, JobError> {
        self.semaphore
            .clone()
            .acquire_owned()
            .await
            .map_err(|_| JobError::PoolClosed)
    }

    /// Queue a job without waiting for it
    ///
    /// The returned handle resolves once the job has finished.
    pub fn submit(self: &Arc<Self>, job: Job) -> JoinHandle<Result<Job, JobError>> {
        let executor = Arc::clone(self);
        tokio::spawn(async move { executor.execute(job).await })
    }

    /// Execute a job through the correction pipeline
    ///
    /// 1. Waits for a worker slot
    /// 2. Gives the claim back if the calibration file is missing or gone
    /// 3. Runs the correction tool on the blocking pool
    /// 4. Registers the outputs and writes the completion marker
    ///
    /// A failed tool run keeps the claim, the input is not retried in this run.
    pub async fn execute(&self, mut job: Job) -> Result<Job, JobError> {
        self.update_job_metrics(&job, 0).await;

        let _permit = self.acquire_permit().await?;

        let calibration_path = match job.calibration_path.clone() {
            Some(path) => path,
            None => {
                warn!(
                    job_id = %job.id,
                    input = %job.input_path.display(),
                    "No calibration file, releasing"
                );
                return Err(self.release(job, JobError::MissingCalibration).await);
            }
        };
        if !calibration_path.exists() {
            warn!(
                job_id = %job.id,
                input = %job.input_path.display(),
                calibration = %calibration_path.display(),
                "Calibration file vanished before the job ran, releasing"
            );
            return Err(self
                .release(job, JobError::CalibrationVanished(calibration_path))
                .await);
        }

        job.state = JobState::Correcting;
        self.update_job_metrics(&job, 0).await;

        let params = CorrectionParams {
            input_path: job.input_path.clone(),
            calibration_path,
            output_dir: job.output_dir.clone(),
            reference_channel: job.reference_channel,
            threads_hint: job.threads_hint,
        };
        info!(
            job_id = %job.id,
            input = %job.input_path.display(),
            command = %render_command_line(&build_correction_command(&self.correction, &params)),
            "Starting correction"
        );

        let settings = self.correction.clone();
        let run_result =
            tokio::task::spawn_blocking(move || run_correction(&settings, &params)).await;

        match run_result {
            Ok(Ok(())) => {}
            Ok(Err(e)) => return Err(self.fail(job, JobError::Correction(e)).await),
            Err(join_err) => {
                return Err(self.fail(job, JobError::Task(join_err.to_string())).await)
            }
        }

        job.state = JobState::Aggregating;
        self.update_job_metrics(&job, 0).await;

        let aggregator = self.aggregator.clone();
        let aggregate_job = job.clone();
        let aggregated = tokio::task::spawn_blocking(move || {
            let records = aggregator.register(&aggregate_job)?;
            write_completion_marker(&aggregate_job.result_folder()).map_err(JobError::Marker)?;
            Ok::<_, JobError>(records)
        })
        .await;

        let records = match aggregated {
            Ok(Ok(records)) => records,
            Ok(Err(e)) => return Err(self.fail(job, e).await),
            Err(join_err) => {
                return Err(self.fail(job, JobError::Task(join_err.to_string())).await)
            }
        };

        job.state = JobState::Completed;
        info!(
            job_id = %job.id,
            input = %job.input_path.display(),
            records = records.len(),
            "Correction completed"
        );
        {
            let mut metrics = self.metrics.write().await;
            metrics.upsert_job(job.to_metrics(records.len()));
            metrics.completed_jobs += 1;
            metrics.output_records = self.aggregator.collection().len();
        }

        Ok(job)
    }

    async fn fail(&self, mut job: Job, err: JobError) -> JobError {
        warn!(
            job_id = %job.id,
            input = %job.input_path.display(),
            error = %err,
            "Correction job failed, input stays claimed"
        );
        job.state = JobState::Failed(err.to_string());
        let mut metrics = self.metrics.write().await;
        metrics.upsert_job(job.to_metrics(0));
        metrics.failed_jobs += 1;
        err
    }

    async fn release(&self, mut job: Job, err: JobError) -> JobError {
        self.tracker.release(&job.input_path);
        debug!(job_id = %job.id, input = %job.input_path.display(), "Claim released");
        job.state = JobState::Released(err.to_string());
        let mut metrics = self.metrics.write().await;
        metrics.upsert_job(job.to_metrics(0));
        metrics.released_jobs += 1;
        metrics.handled_files = self.tracker.len();
        err
    }

    /// Update job metrics in shared state
    async fn update_job_metrics(&self, job: &Job, output_records: usize) {
        let mut metrics = self.metrics.write().await;
        metrics.upsert_job(job.to_metrics(output_records));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::marker::has_completion_marker;
    use crate::metrics::new_shared_metrics;
    use crate::outputs::OutputCollection;
    use ofm_corrector_config::CompletionCheck;
    use std::fs::{self, File};
    use std::path::Path;
    use std::time::Duration;
    use tempfile::TempDir;

    // Writes four files into <stem>/series_1 of the inputFile parameter
    const FAKE_TOOL: &str = r#"in=$(printf '%s\n' "$3" | sed -n "s/^inputFile='\([^']*\)'.*/\1/p")
out="${in%.*}/series_1"
mkdir -p "$out"
for f in a b c d; do : > "$out/$f.tif"; done"#;

    fn create_test_plan(max_concurrent_jobs: u32) -> ConcurrencyPlan {
        ConcurrencyPlan {
            total_cores: 32,
            max_concurrent_jobs,
            threads_per_job: 4,
        }
    }

    fn shell_tool(script: &str) -> CorrectionSettings {
        CorrectionSettings {
            launcher: PathBuf::from("/bin/sh"),
            script: PathBuf::from("bUnwarpJ_code.groovy"),
            flags: vec!["-c".to_string(), script.to_string(), "fake-fiji".to_string()],
        }
    }

    struct Fixture {
        temp_dir: TempDir,
        metrics: SharedMetrics,
        tracker: Arc<JobStateTracker>,
        collection: Arc<OutputCollection>,
        executor: Arc<JobExecutor>,
    }

    fn fixture(max_jobs: u32, tool: CorrectionSettings) -> Fixture {
        let temp_dir = TempDir::new().unwrap();
        let metrics = new_shared_metrics();
        let tracker = Arc::new(JobStateTracker::new(CompletionCheck::MarkerFile));
        let collection =
            Arc::new(OutputCollection::open(&temp_dir.path().join(".state/outputs.jsonl")).unwrap());
        let executor = Arc::new(JobExecutor::new(
            create_test_plan(max_jobs),
            metrics.clone(),
            tracker.clone(),
            OutputAggregator::new(collection.clone()),
            tool,
        ));
        Fixture {
            temp_dir,
            metrics,
            tracker,
            collection,
            executor,
        }
    }

    fn claimed_job(fx: &Fixture, with_calibration: bool) -> Job {
        let run = fx.temp_dir.path().join("run");
        fs::create_dir_all(&run).unwrap();
        let input = run.join("sample.lif");
        File::create(&input).unwrap();
        let calibration = run.join("Beads.lif");
        if with_calibration {
            File::create(&calibration).unwrap();
        }
        assert!(!fx.tracker.is_already_handled(&input));
        Job::new(input, Some(calibration), 0, 4)
    }

    fn create_test_job(input: &Path) -> Job {
        Job::new(input.to_path_buf(), Some(PathBuf::from("/tmp/Beads.lif")), 1, 2)
    }

    #[tokio::test]
    async fn test_executor_initial_permits() {
        let fx = fixture(3, shell_tool("exit 0"));
        assert_eq!(fx.executor.available_permits(), 3);
        assert_eq!(fx.executor.concurrency_plan().threads_per_job, 4);
    }

    #[test]
    fn test_job_state_as_str() {
        assert_eq!(JobState::Queued.as_str(), "queued");
        assert_eq!(JobState::Correcting.as_str(), "correcting");
        assert_eq!(JobState::Aggregating.as_str(), "aggregating");
        assert_eq!(JobState::Completed.as_str(), "completed");
        assert_eq!(JobState::Failed("error".to_string()).as_str(), "failed");
        assert_eq!(JobState::Released("gone".to_string()).as_str(), "released");
    }

    #[test]
    fn test_job_creation() {
        let job = create_test_job(Path::new("/data/run/sample.lif"));

        assert_eq!(job.state, JobState::Queued);
        assert_eq!(job.output_dir, PathBuf::from("/data/run"));
        assert_eq!(job.result_folder(), PathBuf::from("/data/run/sample"));
        assert_eq!(job.reference_channel, 1);
        assert_ne!(job.id, create_test_job(Path::new("/data/run/sample.lif")).id);
    }

    #[test]
    fn test_job_to_metrics() {
        let mut job = create_test_job(Path::new("/data/run/sample.lif"));
        job.state = JobState::Failed("tool crashed".to_string());

        let metrics = job.to_metrics(0);
        assert_eq!(metrics.id, job.id.to_string());
        assert_eq!(metrics.stage, "failed");
        assert_eq!(metrics.threads_hint, 2);
        assert_eq!(metrics.error.as_deref(), Some("tool crashed"));
        assert!(!metrics.is_active());
    }

    #[tokio::test]
    async fn test_successful_job_registers_outputs() {
        let fx = fixture(1, shell_tool(FAKE_TOOL));
        let job = claimed_job(&fx, true);
        let series = fx.temp_dir.path().join("run/sample/series_1");

        let done = fx.executor.submit(job).await.unwrap().unwrap();
        assert_eq!(done.state, JobState::Completed);

        let records = fx.collection.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].id, done.id);
        assert_eq!(records[0].primary, series.join("a.tif"));
        assert_eq!(records[0].aux1, Some(series.join("b.tif")));
        assert_eq!(records[0].aux2, Some(series.join("c.tif")));

        assert!(has_completion_marker(&done.result_folder()));
        assert!(fx.tracker.is_known(&done.input_path));

        let snapshot = fx.metrics.read().await;
        assert_eq!(snapshot.completed_jobs, 1);
        assert_eq!(snapshot.output_records, 1);
        assert_eq!(snapshot.running_jobs, 0);
    }

    #[tokio::test]
    async fn test_failing_tool_keeps_claim() {
        let fx = fixture(1, shell_tool("exit 2"));
        let job = claimed_job(&fx, true);
        let input = job.input_path.clone();

        let result = fx.executor.submit(job).await.unwrap();
        assert!(matches!(
            result,
            Err(JobError::Correction(CorrectionError::ToolFailed(2)))
        ));
        assert!(fx.tracker.is_known(&input));
        assert!(fx.collection.is_empty());
        assert_eq!(fx.metrics.read().await.failed_jobs, 1);
    }

    #[tokio::test]
    async fn test_tool_success_without_result_folder_fails() {
        let fx = fixture(1, shell_tool("exit 0"));
        let job = claimed_job(&fx, true);

        let result = fx.executor.execute(job).await;
        assert!(matches!(
            result,
            Err(JobError::Aggregation(AggregateError::MissingResultFolder(_)))
        ));
        assert_eq!(fx.metrics.read().await.failed_jobs, 1);
    }

    #[tokio::test]
    async fn test_vanished_calibration_releases_claim() {
        let fx = fixture(1, shell_tool(FAKE_TOOL));
        let job = claimed_job(&fx, false);
        let input = job.input_path.clone();

        let result = fx.executor.execute(job).await;
        assert!(matches!(result, Err(JobError::CalibrationVanished(_))));
        assert!(result.unwrap_err().releases_claim());
        assert!(!fx.tracker.is_known(&input));
        assert!(!fx.temp_dir.path().join("run/sample").exists());
        assert_eq!(fx.metrics.read().await.released_jobs, 1);
    }

    #[tokio::test]
    async fn test_missing_calibration_releases_claim() {
        let fx = fixture(1, shell_tool(FAKE_TOOL));
        let mut job = claimed_job(&fx, true);
        job.calibration_path = None;
        let input = job.input_path.clone();

        assert!(matches!(
            fx.executor.execute(job).await,
            Err(JobError::MissingCalibration)
        ));
        assert!(!fx.tracker.is_known(&input));
    }

    // Test concurrent permit acquisition with async tasks
    #[tokio::test]
    async fn test_concurrent_permit_acquisition() {
        let fx = fixture(2, shell_tool("exit 0"));
        let executor = fx.executor.clone();

        let executor1 = executor.clone();
        let executor2 = executor.clone();
        let executor3 = executor.clone();

        let handle1 = tokio::spawn(async move {
            let _permit = executor1.acquire_permit().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        let handle2 = tokio::spawn(async move {
            let _permit = executor2.acquire_permit().await.unwrap();
            tokio::time::sleep(Duration::from_millis(100)).await;
        });

        // Give first two tasks time to acquire permits
        tokio::time::sleep(Duration::from_millis(10)).await;

        let start = std::time::Instant::now();
        let handle3 = tokio::spawn(async move {
            let _permit = executor3.acquire_permit().await.unwrap();
        });

        let _ = tokio::join!(handle1, handle2, handle3);

        // Third task should have waited for a permit
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
    }
}

//! Daemon startup and main loop
//!
//! Wires configuration, tracker, worker pool, output collection and scan
//! loop together, and runs them until cancelled.

use crate::aggregate::OutputAggregator;
use crate::concurrency::{derive_plan, ConcurrencyPlan};
use crate::config::{Config, ConfigError};
use crate::correct::CorrectionSettings;
use crate::dispatcher::{DispatchSettings, Dispatcher};
use crate::job_executor::JobExecutor;
use crate::metrics::{collect_system_metrics, new_shared_metrics, now_unix_ms, SharedMetrics};
use crate::metrics_server::{run_metrics_server, ServerError};
use crate::outputs::{CollectionError, OutputCollection};
use crate::startup::{run_startup_checks, StartupError};
use crate::tracker::JobStateTracker;
use ofm_corrector_config::format_duration;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

/// How often system metrics are refreshed
const METRICS_REFRESH: Duration = Duration::from_millis(500);

/// Error type for daemon operations
#[derive(Debug, Error)]
pub enum DaemonError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// Startup check failed
    #[error("Startup check failed: {0}")]
    Startup(#[from] StartupError),

    /// Output collection could not be opened
    #[error("Output collection error: {0}")]
    Collection(#[from] CollectionError),

    /// Server error
    #[error("Server error: {0}")]
    Server(#[from] ServerError),
}

/// Daemon state containing all runtime components
pub struct Daemon {
    /// Configuration loaded from file and environment
    pub config: Config,
    /// Derived concurrency plan
    pub concurrency_plan: ConcurrencyPlan,
    /// Shared metrics state
    pub metrics: SharedMetrics,
    /// Handled set shared by scan loop and workers
    pub tracker: Arc<JobStateTracker>,
    /// Persistent output collection
    pub outputs: Arc<OutputCollection>,
    /// Worker pool for correction jobs
    pub executor: Arc<JobExecutor>,
    /// Scan loop
    pub dispatcher: Arc<Dispatcher>,
}

impl Daemon {
    /// Initialize the daemon with configuration from file
    ///
    /// This performs the full startup sequence:
    /// 1. Load config from file
    /// 2. Apply environment overrides
    /// 3. Validate and run startup checks (root, launcher, script)
    /// 4. Derive concurrency plan
    /// 5. Open the output collection
    pub fn new<P: AsRef<Path>>(config_path: P) -> Result<Self, DaemonError> {
        let config = Config::load(config_path)?;
        Self::with_config(config)
    }

    /// Initialize the daemon with an existing configuration
    pub fn with_config(config: Config) -> Result<Self, DaemonError> {
        config.validate()?;
        run_startup_checks(&config)?;
        Self::new_without_checks(config)
    }

    /// Initialize the daemon without running startup checks
    ///
    /// Useful for testing when the correction tool is not installed. The
    /// configuration is still validated.
    pub fn new_without_checks(config: Config) -> Result<Self, DaemonError> {
        config.validate()?;

        let concurrency_plan = derive_plan(&config);
        let metrics = new_shared_metrics();
        let tracker = Arc::new(JobStateTracker::new(config.output.completion_check));

        let collection_path = config.collection_path()?;
        let outputs = Arc::new(OutputCollection::open(&collection_path)?);

        let executor = Arc::new(JobExecutor::new(
            concurrency_plan.clone(),
            metrics.clone(),
            tracker.clone(),
            OutputAggregator::new(outputs.clone()),
            CorrectionSettings::from(&config.correction),
        ));

        let settings = DispatchSettings::from_config(&config)?;
        let dispatcher = Arc::new(Dispatcher::new(
            settings,
            tracker.clone(),
            executor.clone(),
            metrics.clone(),
        ));

        info!(
            root = %dispatcher.settings().root.display(),
            collection = %collection_path.display(),
            records = outputs.len(),
            max_concurrent_jobs = concurrency_plan.max_concurrent_jobs,
            threads_per_job = concurrency_plan.threads_per_job,
            quiescence = %format_duration(dispatcher.settings().quiescence),
            scan_interval = %format_duration(dispatcher.settings().scan_interval),
            "Daemon initialized"
        );

        Ok(Self {
            config,
            concurrency_plan,
            metrics,
            tracker,
            outputs,
            executor,
            dispatcher,
        })
    }

    /// Get the shared metrics
    pub fn metrics(&self) -> SharedMetrics {
        self.metrics.clone()
    }

    /// Start the status HTTP server
    ///
    /// Spawns the HTTP server as a background task.
    pub fn start_metrics_server(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let bind = self.config.server.bind.clone();
        let metrics = self.metrics.clone();
        let outputs = self.outputs.clone();
        tokio::spawn(async move {
            if let Err(e) = run_metrics_server(&bind, metrics, outputs, cancel).await {
                error!(error = %e, "Status server error");
            }
        })
    }

    /// Start the metrics update task
    ///
    /// Periodically updates system metrics and the tracker and collection
    /// counters in the shared state.
    pub fn start_metrics_updater(&self, cancel: CancellationToken) -> JoinHandle<()> {
        let metrics = self.metrics.clone();
        let tracker = self.tracker.clone();
        let outputs = self.outputs.clone();
        tokio::spawn(async move {
            loop {
                let system_metrics = collect_system_metrics();
                {
                    let mut snapshot = metrics.write().await;
                    snapshot.system = system_metrics;
                    snapshot.timestamp_unix_ms = now_unix_ms();
                    snapshot.handled_files = tracker.len();
                    snapshot.output_records = outputs.len();
                }
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(METRICS_REFRESH) => {}
                }
            }
        })
    }

    /// Run the scan loop until `cancel` fires
    ///
    /// Jobs still running at that point are abandoned with the runtime.
    pub async fn run(&self, cancel: CancellationToken) -> Result<(), DaemonError> {
        self.dispatcher.clone().run(cancel).await;
        Ok(())
    }

    /// Run the daemon with all background tasks
    ///
    /// Starts the status server (when enabled), metrics updater, and scan loop.
    pub async fn run_with_server(&self, cancel: CancellationToken) -> Result<(), DaemonError> {
        let server_handle = self
            .config
            .server
            .enabled
            .then(|| self.start_metrics_server(cancel.clone()));
        let updater_handle = self.start_metrics_updater(cancel.clone());

        let result = self.run(cancel.clone()).await;

        // The loop only returns once cancelled, make sure helpers stop too
        cancel.cancel();
        let _ = updater_handle.await;
        if let Some(handle) = server_handle {
            let _ = handle.await;
        }

        info!("Daemon stopped");
        result
    }
}

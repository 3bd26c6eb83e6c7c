//! OFM correction watcher
//!
//! Background service that watches a directory tree for instrument output,
//! runs the correction tool on every new file next to a calibration file,
//! and collects the corrected series into a persistent output collection.

pub mod aggregate;
pub mod concurrency;
pub mod correct;
pub mod daemon;
pub mod dispatcher;
pub mod job_executor;
pub mod marker;
pub mod metrics;
pub mod metrics_server;
pub mod outputs;
pub mod scan;
pub mod stability;
pub mod startup;
pub mod tracker;

pub use ofm_corrector_config as config;
pub use ofm_corrector_config::Config;
pub use aggregate::{AggregateError, OutputAggregator};
pub use concurrency::{derive_plan, ConcurrencyPlan};
pub use correct::{
    build_correction_command, render_command_line, run_correction, CorrectionError,
    CorrectionParams, CorrectionSettings,
};
pub use daemon::{Daemon, DaemonError};
pub use dispatcher::{Decision, DispatchSettings, Dispatcher, SweepReport};
pub use job_executor::{Job, JobError, JobExecutor, JobState};
pub use marker::{completion_marker_path, has_completion_marker, write_completion_marker};
pub use metrics::{
    collect_system_metrics, new_shared_metrics, JobMetrics, MetricsSnapshot, SharedMetrics,
    SweepMetrics, SystemMetrics,
};
pub use metrics_server::{create_metrics_router, run_metrics_server, ServerError};
pub use outputs::{CollectionError, OutputCollection, OutputRecord};
pub use scan::{
    find_calibration_file, find_processing_folders, list_candidates, CandidateFile,
    ProcessingFolder,
};
pub use stability::{is_quiescent, readiness_at, Readiness};
pub use startup::{run_startup_checks, StartupError};
pub use tracker::{output_folder_for, JobStateTracker};

//! Output aggregation.
//!
//! After a successful correction run, the job's result folder holds one
//! subfolder per image series. Each series becomes one [`OutputRecord`]
//! appended to the shared [`OutputCollection`].

use crate::job_executor::Job;
use crate::marker::COMPLETION_MARKER;
use crate::outputs::{CollectionError, OutputCollection, OutputRecord};
use crate::tracker::output_folder_for;
use chrono::Utc;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::{debug, warn};

/// Error type for aggregation
#[derive(Debug, Error)]
pub enum AggregateError {
    #[error("result folder {0} does not exist")]
    MissingResultFolder(PathBuf),

    #[error("job has no calibration file")]
    NoCalibration,

    #[error("failed to list {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error(transparent)]
    Collection(#[from] CollectionError),
}

fn sorted_entries(dir: &Path) -> Result<Vec<PathBuf>, AggregateError> {
    let io_err = |source| AggregateError::Io {
        path: dir.to_path_buf(),
        source,
    };
    let mut entries = Vec::new();
    for entry in fs::read_dir(dir).map_err(io_err)? {
        entries.push(entry.map_err(io_err)?.path());
    }
    entries.sort();
    Ok(entries)
}

/// Registers job outputs into the collection.
#[derive(Debug, Clone)]
pub struct OutputAggregator {
    collection: Arc<OutputCollection>,
}

impl OutputAggregator {
    pub fn new(collection: Arc<OutputCollection>) -> Self {
        Self { collection }
    }

    pub fn collection(&self) -> &Arc<OutputCollection> {
        &self.collection
    }

    /// Build the records for a job's result folder without storing them.
    ///
    /// Series folders and the files inside them are taken in name order:
    /// the first file is the primary image, the next two fill the auxiliary
    /// slots. Anything else is logged and ignored.
    pub fn collect(&self, job: &Job) -> Result<Vec<OutputRecord>, AggregateError> {
        let calibration_path = job
            .calibration_path
            .clone()
            .ok_or(AggregateError::NoCalibration)?;
        let result_folder = output_folder_for(&job.input_path);
        if !result_folder.is_dir() {
            return Err(AggregateError::MissingResultFolder(result_folder));
        }

        let mut records = Vec::new();
        for series_dir in sorted_entries(&result_folder)? {
            if !series_dir.is_dir() {
                // The completion marker lives here too
                let is_marker =
                    series_dir.file_name().and_then(|n| n.to_str()) == Some(COMPLETION_MARKER);
                if !is_marker {
                    warn!(
                        job_id = %job.id,
                        path = %series_dir.display(),
                        "Unexpected file in result folder, skipping"
                    );
                }
                continue;
            }

            let files: Vec<PathBuf> = sorted_entries(&series_dir)?
                .into_iter()
                .filter(|p| p.is_file())
                .collect();
            let mut files = files.into_iter();

            let Some(primary) = files.next() else {
                warn!(
                    job_id = %job.id,
                    series = %series_dir.display(),
                    "Empty series folder, skipping"
                );
                continue;
            };
            let aux1 = files.next();
            let aux2 = files.next();
            let dropped: Vec<PathBuf> = files.collect();
            if !dropped.is_empty() {
                warn!(
                    job_id = %job.id,
                    series = %series_dir.display(),
                    dropped = dropped.len(),
                    "Series has more than three files, extra files ignored"
                );
            }

            let series = series_dir
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();

            records.push(OutputRecord {
                id: job.id,
                input_path: job.input_path.clone(),
                calibration_path: calibration_path.clone(),
                series,
                primary,
                aux1,
                aux2,
                registered_at: Utc::now(),
            });
        }

        Ok(records)
    }

    /// Collect a job's records and append them in one write.
    pub fn register(&self, job: &Job) -> Result<Vec<OutputRecord>, AggregateError> {
        let records = self.collect(job)?;
        if records.is_empty() {
            warn!(job_id = %job.id, input = %job.input_path.display(), "Job produced no series");
        }
        self.collection.append(&records)?;
        debug!(job_id = %job.id, records = records.len(), "Registered outputs");
        Ok(records)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs::File;
    use tempfile::TempDir;

    fn touch(path: &Path) {
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        File::create(path).unwrap();
    }

    fn setup() -> (TempDir, OutputAggregator, Job) {
        let temp_dir = TempDir::new().unwrap();
        let collection =
            Arc::new(OutputCollection::open(&temp_dir.path().join("state/outputs.jsonl")).unwrap());
        let run = temp_dir.path().join("run");
        touch(&run.join("Beads.lif"));
        touch(&run.join("sample.lif"));
        let job = Job::new(
            run.join("sample.lif"),
            Some(run.join("Beads.lif")),
            0,
            2,
        );
        (temp_dir, OutputAggregator::new(collection), job)
    }

    #[test]
    fn test_four_files_fill_three_slots() {
        let (temp_dir, aggregator, job) = setup();
        let series = temp_dir.path().join("run/sample/series_1");
        for name in ["d.tif", "a.tif", "c.tif", "b.tif"] {
            touch(&series.join(name));
        }

        let records = aggregator.register(&job).unwrap();
        assert_eq!(records.len(), 1);
        let record = &records[0];
        assert_eq!(record.id, job.id);
        assert_eq!(record.series, "series_1");
        assert_eq!(record.primary, series.join("a.tif"));
        assert_eq!(record.aux1, Some(series.join("b.tif")));
        assert_eq!(record.aux2, Some(series.join("c.tif")));
        assert_eq!(aggregator.collection().len(), 1);
    }

    #[test]
    fn test_series_in_name_order_and_shapes() {
        let (temp_dir, aggregator, job) = setup();
        let result = temp_dir.path().join("run/sample");
        touch(&result.join("series_2/x.tif"));
        touch(&result.join("series_1/x.tif"));
        touch(&result.join("series_1/y.tif"));
        fs::create_dir_all(result.join("series_3")).unwrap();
        touch(&result.join("stray.log"));

        let records = aggregator.register(&job).unwrap();
        let names: Vec<&str> = records.iter().map(|r| r.series.as_str()).collect();
        assert_eq!(names, vec!["series_1", "series_2"]);
        assert_eq!(records[0].aux1, Some(result.join("series_1/y.tif")));
        assert_eq!(records[0].aux2, None);
        assert_eq!(records[1].aux1, None);
    }

    #[test]
    fn test_missing_result_folder_is_error() {
        let (_temp_dir, aggregator, job) = setup();
        assert!(matches!(
            aggregator.register(&job),
            Err(AggregateError::MissingResultFolder(_))
        ));
        assert!(aggregator.collection().is_empty());
    }

    #[test]
    fn test_empty_result_folder_appends_nothing() {
        let (temp_dir, aggregator, job) = setup();
        fs::create_dir_all(temp_dir.path().join("run/sample")).unwrap();

        assert!(aggregator.register(&job).unwrap().is_empty());
        assert!(aggregator.collection().is_empty());
    }
}

//! Completion marker written into a job's result folder.
//!
//! The marker is an empty `.ofm-complete` file created after the job's
//! outputs have been registered. In `marker_file` completion mode a result
//! folder only counts as done when the marker is present, so folders left
//! behind by an interrupted run are corrected again.

use std::fs::File;
use std::io;
use std::path::{Path, PathBuf};

/// File name of the completion marker.
pub const COMPLETION_MARKER: &str = ".ofm-complete";

/// Constructs the marker path inside a result folder.
///
/// For example: `/data/run/sample` -> `/data/run/sample/.ofm-complete`
pub fn completion_marker_path(result_folder: &Path) -> PathBuf {
    result_folder.join(COMPLETION_MARKER)
}

/// Creates an empty completion marker inside `result_folder`.
///
/// Fails if the folder does not exist.
pub fn write_completion_marker(result_folder: &Path) -> io::Result<()> {
    let file = File::create(completion_marker_path(result_folder))?;
    file.sync_all()?;
    Ok(())
}

/// Checks if a result folder carries the completion marker.
pub fn has_completion_marker(result_folder: &Path) -> bool {
    completion_marker_path(result_folder).is_file()
}

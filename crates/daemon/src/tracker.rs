//! Job state tracking.
//!
//! The tracker owns the set of input paths that have been claimed during this
//! run and answers whether a path was already corrected by an earlier run by
//! looking at its result folder on disk.

use crate::marker::has_completion_marker;
use ofm_corrector_config::CompletionCheck;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Result folder of an input file: `<parent>/<file stem>`.
///
/// Only the last extension is removed, `a.ome.tif` maps to `a.ome`.
pub fn output_folder_for(input_path: &Path) -> PathBuf {
    let parent = input_path.parent().unwrap_or_else(|| Path::new(""));
    match input_path.file_stem() {
        Some(stem) => parent.join(stem),
        None => parent.to_path_buf(),
    }
}

/// Handled set plus durable completion check.
#[derive(Debug)]
pub struct JobStateTracker {
    handled: Mutex<HashSet<PathBuf>>,
    completion: CompletionCheck,
}

impl JobStateTracker {
    pub fn new(completion: CompletionCheck) -> Self {
        Self {
            handled: Mutex::new(HashSet::new()),
            completion,
        }
    }

    /// Whether `path` is in the handled set. No side effects.
    pub fn is_known(&self, path: &Path) -> bool {
        match self.handled.lock() {
            Ok(handled) => handled.contains(path),
            Err(poisoned) => poisoned.into_inner().contains(path),
        }
    }

    /// Claims `path` and reports whether it needs no correction.
    ///
    /// Returns true if the path was already claimed in this run. Otherwise
    /// the path is inserted and the result is whether its result folder
    /// already counts as complete on disk. Either way the path is claimed
    /// afterwards, so a second call always returns true.
    pub fn is_already_handled(&self, path: &Path) -> bool {
        {
            let mut handled = match self.handled.lock() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if !handled.insert(path.to_path_buf()) {
                return true;
            }
        }
        self.completed_on_disk(path)
    }

    /// Durable check, independent of the handled set.
    pub fn completed_on_disk(&self, path: &Path) -> bool {
        let folder = output_folder_for(path);
        match self.completion {
            CompletionCheck::OutputFolder => folder.is_dir(),
            CompletionCheck::MarkerFile => folder.is_dir() && has_completion_marker(&folder),
        }
    }

    /// Removes a claim so the path is reconsidered on a later sweep.
    ///
    /// Returns whether the path was claimed.
    pub fn release(&self, path: &Path) -> bool {
        match self.handled.lock() {
            Ok(mut handled) => handled.remove(path),
            Err(poisoned) => poisoned.into_inner().remove(path),
        }
    }

    /// Number of claimed paths.
    pub fn len(&self) -> usize {
        match self.handled.lock() {
            Ok(handled) => handled.len(),
            Err(poisoned) => poisoned.into_inner().len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

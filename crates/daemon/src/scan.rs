//! Scanner module for discovering processing folders in the watched tree.
//!
//! A processing folder is a directory that directly contains a calibration
//! file. Discovery is lazy and depth-first: once a folder's calibration file
//! is seen, nothing below that folder is visited.

use std::cmp::Ordering;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tracing::debug;
use walkdir::{DirEntry, WalkDir};

/// A directory containing a calibration file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessingFolder {
    /// The folder itself.
    pub path: PathBuf,
    /// First calibration file in file-name order.
    pub calibration_file: PathBuf,
}

/// A regular file inside a processing folder that may need correcting.
#[derive(Debug, Clone)]
pub struct CandidateFile {
    pub path: PathBuf,
    pub modified: SystemTime,
}

/// Checks if a file name identifies a calibration file (case-sensitive substring).
pub fn is_calibration_file(name: &str, pattern: &str) -> bool {
    name.contains(pattern)
}

fn is_hidden(name: &str) -> bool {
    name.starts_with('.')
}

// Files before directories, then by name, so a folder's own calibration
// file is seen before any of its subdirectories are entered.
fn files_first(a: &DirEntry, b: &DirEntry) -> Ordering {
    let a_dir = a.file_type().is_dir();
    let b_dir = b.file_type().is_dir();
    a_dir.cmp(&b_dir).then_with(|| a.file_name().cmp(b.file_name()))
}

/// Lazy iterator over processing folders, see [`find_processing_folders`].
pub struct ProcessingFolders {
    walker: walkdir::FilterEntry<walkdir::IntoIter, Box<dyn FnMut(&DirEntry) -> bool + Send>>,
    pattern: String,
}

impl Iterator for ProcessingFolders {
    type Item = ProcessingFolder;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            let entry = match self.walker.next()? {
                Ok(entry) => entry,
                Err(e) => {
                    debug!(error = %e, "Skipping unreadable entry");
                    continue;
                }
            };

            if entry.depth() == 0 || !entry.file_type().is_file() {
                continue;
            }

            let matches = entry
                .file_name()
                .to_str()
                .map(|name| is_calibration_file(name, &self.pattern))
                .unwrap_or(false);
            if !matches {
                continue;
            }

            let Some(folder) = entry.path().parent() else {
                continue;
            };
            let found = ProcessingFolder {
                path: folder.to_path_buf(),
                calibration_file: entry.path().to_path_buf(),
            };

            // Drop the remaining siblings and every subdirectory of this folder
            self.walker.skip_current_dir();
            return Some(found);
        }
    }
}

/// Walks `root` depth-first and yields every processing folder.
///
/// - Within a directory, files are visited before subdirectories, both in name order
/// - Descent stops at a folder once its calibration file is found
/// - Folders without a calibration file are descended into
/// - Hidden directories below the root are skipped when `skip_hidden` is set
///
/// The root itself can be a processing folder. Dropping the iterator stops the walk.
pub fn find_processing_folders(root: &Path, pattern: &str, skip_hidden: bool) -> ProcessingFolders {
    let filter: Box<dyn FnMut(&DirEntry) -> bool + Send> = Box::new(move |entry: &DirEntry| {
        if skip_hidden && entry.depth() > 0 && entry.file_type().is_dir() {
            if let Some(name) = entry.file_name().to_str() {
                return !is_hidden(name);
            }
        }
        true
    });

    let walker = WalkDir::new(root)
        .sort_by(files_first)
        .into_iter()
        .filter_entry(filter);

    ProcessingFolders {
        walker,
        pattern: pattern.to_string(),
    }
}

/// Re-resolves the calibration file of a folder.
///
/// Returns the first matching regular file in name order, or `None`.
pub fn find_calibration_file(folder: &Path, pattern: &str) -> io::Result<Option<PathBuf>> {
    let mut matches: Vec<PathBuf> = Vec::new();
    for entry in fs::read_dir(folder)? {
        let entry = entry?;
        if !entry.file_type()?.is_file() {
            continue;
        }
        if let Some(name) = entry.file_name().to_str() {
            if is_calibration_file(name, pattern) {
                matches.push(entry.path());
            }
        }
    }
    matches.sort();
    Ok(matches.into_iter().next())
}

/// Lists the candidate files directly inside a processing folder.
///
/// Regular files only, sorted by name. Hidden files and calibration files
/// are excluded.
pub fn list_candidates(folder: &Path, pattern: &str) -> io::Result<Vec<CandidateFile>> {
    let mut candidates = Vec::new();

    for entry in fs::read_dir(folder)? {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                debug!(folder = %folder.display(), error = %e, "Skipping unreadable entry");
                continue;
            }
        };

        let metadata = match entry.metadata() {
            Ok(metadata) => metadata,
            Err(e) => {
                debug!(path = %entry.path().display(), error = %e, "Cannot stat entry");
                continue;
            }
        };
        if !metadata.is_file() {
            continue;
        }

        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if is_hidden(name) || is_calibration_file(name, pattern) {
            continue;
        }

        candidates.push(CandidateFile {
            path: entry.path(),
            modified: metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH),
        });
    }

    candidates.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(candidates)
}

//! Persistent output collection.
//!
//! Every registered output series is stored as one JSON line in an
//! append-only file. The file is reopened on restart and its records are
//! loaded back into memory, so the collection keeps growing across runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard};
use thiserror::Error;
use tracing::{debug, warn};
use uuid::Uuid;

/// Error type for collection operations
#[derive(Debug, Error)]
pub enum CollectionError {
    #[error("collection IO error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("corrupt record at {path}:{line}: {source}")]
    Corrupt {
        path: PathBuf,
        line: usize,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to serialize record: {0}")]
    Serialize(#[from] serde_json::Error),
}

/// One corrected series produced by a job.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutputRecord {
    /// Id of the job that produced the series.
    pub id: Uuid,
    pub input_path: PathBuf,
    pub calibration_path: PathBuf,
    /// Name of the series folder inside the job's result folder.
    pub series: String,
    pub primary: PathBuf,
    pub aux1: Option<PathBuf>,
    pub aux2: Option<PathBuf>,
    pub registered_at: DateTime<Utc>,
}

#[derive(Debug)]
struct CollectionInner {
    file: File,
    records: Vec<OutputRecord>,
}

/// Append-only JSON-lines collection of [`OutputRecord`]s.
#[derive(Debug)]
pub struct OutputCollection {
    path: PathBuf,
    inner: Mutex<CollectionInner>,
}

impl OutputCollection {
    /// Open the collection at `path`, creating it on first use.
    ///
    /// Existing records are loaded. A trailing line without newline is the
    /// remains of an interrupted append; it is dropped and the file truncated
    /// to the last complete line. A complete line that does not parse is an error.
    pub fn open(path: &Path) -> Result<Self, CollectionError> {
        let io_err = |source| CollectionError::Io {
            path: path.to_path_buf(),
            source,
        };

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
        }

        let mut file = OpenOptions::new()
            .read(true)
            .append(true)
            .create(true)
            .open(path)
            .map_err(io_err)?;

        // Bytes, not a String: a torn tail may end inside a multi-byte character
        let mut content = Vec::new();
        file.read_to_end(&mut content).map_err(io_err)?;

        let complete_len = content
            .iter()
            .rposition(|&b| b == b'\n')
            .map(|i| i + 1)
            .unwrap_or(0);
        if complete_len < content.len() {
            warn!(
                path = %path.display(),
                dropped_bytes = content.len() - complete_len,
                "Truncating torn trailing record"
            );
            file.set_len(complete_len as u64).map_err(io_err)?;
            file.sync_data().map_err(io_err)?;
        }

        let mut records = Vec::new();
        for (index, line) in content[..complete_len].split(|&b| b == b'\n').enumerate() {
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }
            let record = serde_json::from_slice(line).map_err(|source| CollectionError::Corrupt {
                path: path.to_path_buf(),
                line: index + 1,
                source,
            })?;
            records.push(record);
        }

        debug!(path = %path.display(), records = records.len(), "Opened output collection");

        Ok(Self {
            path: path.to_path_buf(),
            inner: Mutex::new(CollectionInner { file, records }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, CollectionInner> {
        match self.inner.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    /// Append records with a single write followed by a flush to disk.
    ///
    /// The in-memory view is only extended once the data is durable.
    pub fn append(&self, records: &[OutputRecord]) -> Result<(), CollectionError> {
        if records.is_empty() {
            return Ok(());
        }

        let mut buf = Vec::new();
        for record in records {
            serde_json::to_writer(&mut buf, record)?;
            buf.push(b'\n');
        }

        let mut inner = self.lock();
        let io_err = |source| CollectionError::Io {
            path: self.path.clone(),
            source,
        };
        let start_len = inner.file.metadata().map_err(io_err)?.len();
        append_or_rollback(&mut inner.file, &buf, start_len).map_err(io_err)?;
        inner.records.extend_from_slice(records);
        Ok(())
    }

    /// Snapshot of all records in append order.
    pub fn records(&self) -> Vec<OutputRecord> {
        self.lock().records.clone()
    }

    pub fn len(&self) -> usize {
        self.lock().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Storage an append can be written to and cut back from.
trait AppendTarget: Write {
    fn sync(&mut self) -> io::Result<()>;
    fn truncate_to(&mut self, len: u64) -> io::Result<()>;
}

impl AppendTarget for File {
    fn sync(&mut self) -> io::Result<()> {
        self.sync_data()
    }

    fn truncate_to(&mut self, len: u64) -> io::Result<()> {
        self.set_len(len)
    }
}

/// Write `buf` and flush it to disk, or cut the target back to `start_len`.
///
/// A failed write may have left part of `buf` behind; the next append would
/// land right after it and form an unparseable line.
fn append_or_rollback<T: AppendTarget>(
    target: &mut T,
    buf: &[u8],
    start_len: u64,
) -> io::Result<()> {
    let result = target.write_all(buf).and_then(|()| target.sync());
    if let Err(e) = &result {
        match target.truncate_to(start_len) {
            Ok(()) => debug!(error = %e, start_len, "Rolled back failed append"),
            Err(rollback) => warn!(
                error = %e,
                rollback_error = %rollback,
                "Failed append could not be rolled back"
            ),
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use tempfile::TempDir;

    fn record(series: &str) -> OutputRecord {
        OutputRecord {
            id: Uuid::new_v4(),
            input_path: PathBuf::from("/data/run/sample.lif"),
            calibration_path: PathBuf::from("/data/run/Beads.lif"),
            series: series.to_string(),
            primary: PathBuf::from(format!("/data/run/sample/{}/a.tif", series)),
            aux1: Some(PathBuf::from(format!("/data/run/sample/{}/b.tif", series))),
            aux2: None,
            registered_at: Utc::now(),
        }
    }

    #[test]
    fn test_open_creates_parent_and_file() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join(".ofm-corrector/outputs.jsonl");

        let collection = OutputCollection::open(&path).unwrap();
        assert!(path.is_file());
        assert!(collection.is_empty());
        assert_eq!(collection.path(), path);
    }

    #[test]
    fn test_append_then_reopen_keeps_order() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("outputs.jsonl");
        let written: Vec<OutputRecord> = (0..5).map(|i| record(&format!("series_{}", i))).collect();

        {
            let collection = OutputCollection::open(&path).unwrap();
            collection.append(&written[..2]).unwrap();
            collection.append(&written[2..]).unwrap();
            collection.append(&[]).unwrap();
            assert_eq!(collection.len(), 5);
        }

        let reopened = OutputCollection::open(&path).unwrap();
        assert_eq!(reopened.records(), written);

        reopened.append(&[record("series_5")]).unwrap();
        let again = OutputCollection::open(&path).unwrap();
        assert_eq!(again.len(), 6);
        assert_eq!(again.records()[5].series, "series_5");
    }

    #[test]
    fn test_torn_trailing_line_is_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("outputs.jsonl");

        {
            let collection = OutputCollection::open(&path).unwrap();
            collection.append(&[record("series_1")]).unwrap();
        }
        let intact_len = fs::metadata(&path).unwrap().len();

        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(br#"{"id":"0000","input_pa"#).unwrap();
        drop(file);

        let reopened = OutputCollection::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);

        reopened.append(&[record("series_2")]).unwrap();
        let again = OutputCollection::open(&path).unwrap();
        assert_eq!(again.len(), 2);
    }

    #[test]
    fn test_torn_tail_inside_multibyte_char_is_dropped() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("outputs.jsonl");

        {
            let collection = OutputCollection::open(&path).unwrap();
            collection.append(&[record("series_1")]).unwrap();
        }
        let intact_len = fs::metadata(&path).unwrap().len();

        let mut accented = record("series_2");
        accented.input_path = PathBuf::from("/data/Gutiérrez/sample.lif");
        let line = serde_json::to_vec(&accented).unwrap();
        let cut = line.iter().position(|&b| b == 0xC3).unwrap() + 1;
        let mut file = OpenOptions::new().append(true).open(&path).unwrap();
        file.write_all(&line[..cut]).unwrap();
        drop(file);

        let reopened = OutputCollection::open(&path).unwrap();
        assert_eq!(reopened.len(), 1);
        assert_eq!(fs::metadata(&path).unwrap().len(), intact_len);

        reopened.append(&[accented.clone()]).unwrap();
        let again = OutputCollection::open(&path).unwrap();
        assert_eq!(again.records()[1], accented);
    }

    /// Accepts `accept` bytes, then fails every write.
    struct FailingTarget {
        data: Vec<u8>,
        accept: usize,
    }

    impl Write for FailingTarget {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            let room = self.accept.saturating_sub(self.data.len());
            if room == 0 {
                return Err(io::Error::new(io::ErrorKind::Other, "no space left"));
            }
            let n = room.min(buf.len());
            self.data.extend_from_slice(&buf[..n]);
            Ok(n)
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl AppendTarget for FailingTarget {
        fn sync(&mut self) -> io::Result<()> {
            Ok(())
        }

        fn truncate_to(&mut self, len: u64) -> io::Result<()> {
            self.data.truncate(len as usize);
            Ok(())
        }
    }

    #[test]
    fn test_failed_write_is_rolled_back() {
        let existing = b"{\"series\":\"series_1\"}\n".to_vec();
        let start_len = existing.len() as u64;
        let mut target = FailingTarget {
            accept: existing.len() + 10,
            data: existing.clone(),
        };

        let line = b"{\"series\":\"series_2\",\"primary\":\"/data/a.tif\"}\n";
        assert!(append_or_rollback(&mut target, line, start_len).is_err());
        assert_eq!(target.data, existing);

        target.accept = usize::MAX;
        let current_len = target.data.len() as u64;
        append_or_rollback(&mut target, line, current_len).unwrap();
        let mut expected = existing;
        expected.extend_from_slice(line);
        assert_eq!(target.data, expected);
    }

    #[test]
    fn test_append_after_rollback_stays_readable() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("outputs.jsonl");
        let collection = OutputCollection::open(&path).unwrap();
        collection.append(&[record("series_1")]).unwrap();

        {
            let mut inner = collection.lock();
            let start_len = inner.file.metadata().unwrap().len();
            inner.file.write_all(br#"{"id":"half-writ"#).unwrap();
            inner.file.truncate_to(start_len).unwrap();
        }
        collection.append(&[record("series_2")]).unwrap();

        let reopened = OutputCollection::open(&path).unwrap();
        assert_eq!(reopened.len(), 2);
        assert_eq!(reopened.records()[1].series, "series_2");
    }

    #[test]
    fn test_corrupt_complete_line_is_error() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("outputs.jsonl");
        fs::write(&path, "not json\n").unwrap();

        match OutputCollection::open(&path) {
            Err(CollectionError::Corrupt { line, .. }) => assert_eq!(line, 1),
            other => panic!("expected corrupt error, got {:?}", other.map(|c| c.len())),
        }
    }

    #[test]
    fn test_concurrent_appends_do_not_interleave() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("outputs.jsonl");
        let collection = Arc::new(OutputCollection::open(&path).unwrap());

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let collection = Arc::clone(&collection);
                std::thread::spawn(move || {
                    let batch = vec![record(&format!("t{}_a", i)), record(&format!("t{}_b", i))];
                    collection.append(&batch).unwrap();
                })
            })
            .collect();
        for handle in handles {
            handle.join().unwrap();
        }

        let reopened = OutputCollection::open(&path).unwrap();
        let records = reopened.records();
        assert_eq!(records.len(), 16);
        // Each batch lands contiguously
        for pair in records.chunks(2) {
            let a = pair[0].series.trim_end_matches("_a");
            let b = pair[1].series.trim_end_matches("_b");
            assert_eq!(a, b);
        }
    }
}

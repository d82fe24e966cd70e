//! Registry of every metric name that has carried data
//!
//! Dashboards are generated from this list, so it only grows. Names are
//! deduplicated in memory against everything already on disk and only new
//! ones are appended, under a single `metric_name` header column.

use std::{io, path::PathBuf};

use rustc_hash::FxHashSet;
use tokio::io::AsyncWriteExt;
use tracing::debug;

const HEADER: &str = "metric_name";

/// Errors produced by [`MetricNameTracker`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The tracker file could not be read.
    #[error("unable to read {path}: {source}")]
    Read {
        /// Tracker file location
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// The tracker file is not valid CSV.
    #[error("unable to parse {path}: {source}")]
    Parse {
        /// Tracker file location
        path: PathBuf,
        /// Underlying CSV error
        #[source]
        source: csv::Error,
    },
    /// The tracker file could not be appended to.
    #[error("unable to append to {path}: {source}")]
    Write {
        /// Tracker file location
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
}

/// Append-only set of observed metric names backed by a one-column CSV file.
#[derive(Debug)]
pub struct MetricNameTracker {
    path: PathBuf,
    seen: FxHashSet<String>,
    pending: Vec<String>,
}

impl MetricNameTracker {
    /// Load every name already recorded at `path`. A missing file is an empty
    /// tracker.
    ///
    /// # Errors
    ///
    /// Function will error if the file exists but cannot be read or parsed.
    pub async fn load(path: PathBuf) -> Result<Self, Error> {
        let mut seen = FxHashSet::default();
        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let mut reader = csv::ReaderBuilder::new()
                    .has_headers(false)
                    .flexible(true)
                    .from_reader(bytes.as_slice());
                for (row, record) in reader.records().enumerate() {
                    let record = match record {
                        Ok(record) => record,
                        Err(source) => return Err(Error::Parse { path, source }),
                    };
                    match record.get(0) {
                        Some(HEADER) if row == 0 => {}
                        Some(name) if !name.is_empty() => {
                            seen.insert(name.to_string());
                        }
                        _ => {}
                    }
                }
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(source) => return Err(Error::Read { path, source }),
        }
        debug!(count = seen.len(), path = %path.display(), "loaded metric name tracker");
        Ok(Self {
            path,
            seen,
            pending: Vec::new(),
        })
    }

    /// Record `metric`. Returns `true` if the name is new.
    pub fn observe(&mut self, metric: &str) -> bool {
        if self.seen.contains(metric) {
            return false;
        }
        self.seen.insert(metric.to_string());
        self.pending.push(metric.to_string());
        true
    }

    /// Whether `metric` has been observed.
    #[must_use]
    pub fn contains(&self, metric: &str) -> bool {
        self.seen.contains(metric)
    }

    /// Number of distinct names observed.
    #[must_use]
    pub fn len(&self) -> usize {
        self.seen.len()
    }

    /// Whether no name has been observed.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.seen.is_empty()
    }

    /// Append every name observed since the last call, writing the header
    /// first if the file is missing or empty. Returns the number of names
    /// appended.
    ///
    /// # Errors
    ///
    /// Function will error if the file cannot be opened or written. Pending
    /// names are kept and retried on the next call.
    pub async fn persist(&mut self) -> Result<usize, Error> {
        if self.pending.is_empty() {
            return Ok(0);
        }
        let write_err = |source| Error::Write {
            path: self.path.clone(),
            source,
        };

        let needs_header = match tokio::fs::metadata(&self.path).await {
            Ok(meta) => meta.len() == 0,
            Err(e) if e.kind() == io::ErrorKind::NotFound => true,
            Err(e) => return Err(write_err(e)),
        };

        let mut writer = csv::Writer::from_writer(Vec::new());
        let records = needs_header
            .then_some(HEADER)
            .into_iter()
            .chain(self.pending.iter().map(String::as_str));
        for name in records {
            writer
                .write_record([name])
                .map_err(|e| write_err(io::Error::other(e)))?;
        }
        let body = writer
            .into_inner()
            .map_err(|e| write_err(e.into_error()))?;

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(write_err)?;
        file.write_all(&body).await.map_err(write_err)?;
        file.flush().await.map_err(write_err)?;

        let appended = self.pending.len();
        self.pending.clear();
        debug!(appended, path = %self.path.display(), "persisted metric names");
        Ok(appended)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn new_file_gets_header_and_names() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics_labels.csv");
        let mut tracker = MetricNameTracker::load(path.clone()).await.expect("load");
        assert!(tracker.is_empty());

        assert!(tracker.observe("kernel.all.load"));
        assert!(tracker.observe("mem.freemem"));
        assert!(!tracker.observe("kernel.all.load"));
        assert_eq!(tracker.persist().await.expect("persist"), 2);

        let text = std::fs::read_to_string(&path).expect("read");
        assert_eq!(text, "metric_name\nkernel.all.load\nmem.freemem\n");
    }

    #[tokio::test]
    async fn reload_deduplicates_against_disk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics_labels.csv");
        std::fs::write(&path, "metric_name\nkernel.all.load\n\"odd,name\"\n").expect("seed");

        let mut tracker = MetricNameTracker::load(path.clone()).await.expect("load");
        assert_eq!(tracker.len(), 2);
        assert!(tracker.contains("odd,name"));
        assert!(!tracker.observe("kernel.all.load"));
        assert!(tracker.observe("swap.used"));
        assert!(tracker.observe("new,one"));
        tracker.persist().await.expect("persist");
        assert_eq!(tracker.persist().await.expect("nothing pending"), 0);

        let text = std::fs::read_to_string(&path).expect("read");
        assert_eq!(
            text,
            "metric_name\nkernel.all.load\n\"odd,name\"\nswap.used\n\"new,one\"\n"
        );
        let reloaded = MetricNameTracker::load(path).await.expect("load");
        assert_eq!(reloaded.len(), 4);
    }

    #[tokio::test]
    async fn names_needing_quotes_survive_a_reload() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics_labels.csv");
        let mut tracker = MetricNameTracker::load(path.clone()).await.expect("load");
        assert!(tracker.observe("disk.dev.read\nsda"));
        assert!(tracker.observe("\"quoted\""));
        assert!(tracker.observe("metric_name"));
        tracker.persist().await.expect("persist");

        let reloaded = MetricNameTracker::load(path).await.expect("load");
        assert_eq!(reloaded.len(), 3);
        assert!(reloaded.contains("disk.dev.read\nsda"));
        assert!(reloaded.contains("\"quoted\""));
        assert!(reloaded.contains("metric_name"), "only the first row is a header");
    }

    #[tokio::test]
    async fn empty_file_gets_header() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("metrics_labels.csv");
        std::fs::write(&path, "").expect("seed");
        let mut tracker = MetricNameTracker::load(path.clone()).await.expect("load");
        tracker.observe("disk.dev.read");
        tracker.persist().await.expect("persist");
        assert_eq!(
            std::fs::read_to_string(&path).expect("read"),
            "metric_name\ndisk.dev.read\n"
        );
    }
}

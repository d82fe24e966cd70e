//! Streaming conversion of sampler CSV into store points
//!
//! The sampler is started once per archive with every validated metric and
//! its stdout is consumed line by line while it runs. The first line is the
//! header: a timestamp column followed by one column per metric (instance
//! columns included). Every later row becomes at most one [`Point`] carrying
//! one field per column that holds a usable number. Anything unusable -- rows
//! of the wrong width, bad timestamps, absent or non-numeric values -- is
//! counted and dropped; none of it fails the export.
//!
//! Every line read is also copied verbatim into a debug CSV by a separate task
//! so a slow disk never holds up conversion. If that task falls too far
//! behind, the copy is abandoned and the file holds a prefix of the output.

use std::{
    collections::BTreeMap,
    fmt, io,
    path::{Path, PathBuf},
};

use archivist_influx::Point;
use serde::Deserialize;
use time::{PrimitiveDateTime, format_description::BorrowedFormatItem, macros::format_description};
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader, BufWriter},
    sync::mpsc::{self, error::TrySendError},
};
use tracing::{debug, info, warn};

use crate::{
    runner::{self, Invocation, ProcessRunner, Streaming},
    tracker::MetricNameTracker,
    writer::{self, PointSink},
};

/// Read buffer for the sampler's stdout. Rows carry one column per metric
/// instance and routinely run to megabytes.
pub const LINE_BUFFER_CAPACITY: usize = 10 * 1024 * 1024;

/// Lines the debug CSV copier may fall behind before the copy is abandoned.
const DEBUG_BACKLOG: usize = 256;

/// Values that mean "no sample" whatever the filter configuration.
const ABSENT: [&str; 4] = ["", "N/A", "null", "none"];

const TIMESTAMP: &[BorrowedFormatItem<'static>] =
    format_description!("[year]-[month]-[day] [hour]:[minute]:[second]");

/// Errors produced by [`export`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The sampler could not be started or waited on.
    #[error(transparent)]
    Runner(#[from] runner::Error),
    /// Reading the sampler's stdout failed.
    #[error("unable to read sampler output: {0}")]
    Read(#[source] io::Error),
    /// The sampler ended without producing a header line.
    #[error("sampler produced no header ({exit})")]
    NoHeader {
        /// How the sampler ended
        exit: runner::Exit,
    },
    /// Two columns sanitize to the same field name.
    #[error("{0}")]
    Collision(Collision),
    /// The point sink stopped accepting points.
    #[error(transparent)]
    Sink(#[from] writer::Error),
}

/// Extra value exclusions applied after a value has parsed as a number.
#[derive(Debug, Deserialize, Clone, Copy, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum ValueFilter {
    /// Skip literal `0` and `0.0`
    SkipZero,
    /// Skip empty values
    SkipEmpty,
    /// Skip `none`, `null` and `n/a` in any case
    SkipNone,
}

impl ValueFilter {
    /// Whether this filter excludes the trimmed, unquoted `value`.
    #[must_use]
    pub fn skips(self, value: &str) -> bool {
        match self {
            ValueFilter::SkipZero => value == "0" || value == "0.0",
            ValueFilter::SkipEmpty => value.is_empty(),
            ValueFilter::SkipNone => ["none", "null", "n/a"]
                .iter()
                .any(|absent| value.eq_ignore_ascii_case(absent)),
        }
    }
}

/// How to treat two metrics whose names sanitize to the same field.
#[derive(Debug, Deserialize, Clone, Copy, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CollisionPolicy {
    /// Refuse to export
    #[default]
    Reject,
    /// Export, the rightmost column's value wins
    LastWriteWins,
}

/// Two metric names that share a sanitized field name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Collision {
    /// The shared field name
    pub field: String,
    /// The earlier metric
    pub first: String,
    /// The later metric
    pub second: String,
}

impl fmt::Display for Collision {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "metrics {} and {} both map to field {}",
            self.first, self.second, self.field
        )
    }
}

/// Field name for `metric`: dots, dashes and spaces become underscores.
#[must_use]
pub fn sanitize(metric: &str) -> String {
    metric.replace(['.', '-', ' '], "_")
}

/// Every pair of distinct names in `metrics` that sanitize alike, in input
/// order. Repeats of the same name are not collisions.
#[must_use]
pub fn collisions<'a, I>(metrics: I) -> Vec<Collision>
where
    I: IntoIterator<Item = &'a str>,
{
    let mut owners: BTreeMap<String, &str> = BTreeMap::new();
    let mut found = Vec::new();
    for metric in metrics {
        let field = sanitize(metric);
        match owners.get(&field) {
            Some(first) if *first != metric => found.push(Collision {
                field: field.clone(),
                first: (*first).to_string(),
                second: metric.to_string(),
            }),
            Some(_) => {}
            None => {
                owners.insert(field, metric);
            }
        }
    }
    found
}

/// Strip surrounding whitespace and double quotes.
fn clean(raw: &str) -> &str {
    raw.trim().trim_matches('"').trim()
}

/// Column names from the header line. The first column is the timestamp.
#[must_use]
pub fn parse_header(line: &str) -> Vec<String> {
    line.split(',').map(|col| clean(col).to_string()).collect()
}

/// Seconds since the epoch for a `YYYY-MM-DD HH:MM:SS` timestamp read as UTC.
#[must_use]
pub fn parse_timestamp(raw: &str) -> Option<i64> {
    PrimitiveDateTime::parse(clean(raw), TIMESTAMP)
        .ok()
        .map(|t| t.assume_utc().unix_timestamp())
}

/// Counters for one export.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    /// Non-empty lines read, header included
    pub lines: u64,
    /// Data rows seen
    pub rows: u64,
    /// Rows whose width did not match the header
    pub malformed_rows: u64,
    /// Rows whose timestamp did not parse
    pub bad_timestamps: u64,
    /// Rows with no usable value
    pub empty_rows: u64,
    /// Values that were absent, non-numeric or filtered
    pub skipped_values: u64,
    /// Points handed to the sink
    pub points: u64,
    /// Fields across all points
    pub fields: u64,
}

#[derive(Debug, Clone, PartialEq, Eq)]
struct Column {
    metric: String,
    field: String,
}

/// Turns data rows into points once the header is known.
#[derive(Debug, Clone)]
pub struct RowConverter {
    measurement: String,
    tags: Vec<(String, String)>,
    filters: Vec<ValueFilter>,
    columns: Vec<Column>,
}

impl RowConverter {
    /// Build a converter for the header `line`.
    ///
    /// # Errors
    ///
    /// Function will error if two header columns sanitize to the same field
    /// and `policy` is [`CollisionPolicy::Reject`].
    pub fn from_header(
        line: &str,
        measurement: &str,
        tags: &[(String, String)],
        filters: &[ValueFilter],
        policy: CollisionPolicy,
    ) -> Result<Self, Collision> {
        let names = parse_header(line);
        let metrics = names.get(1..).unwrap_or_default();
        if let Some(collision) = collisions(metrics.iter().map(String::as_str)).into_iter().next() {
            match policy {
                CollisionPolicy::Reject => return Err(collision),
                CollisionPolicy::LastWriteWins => warn!(%collision, "field collision, last column wins"),
            }
        }
        Ok(Self {
            measurement: measurement.to_string(),
            tags: tags.to_vec(),
            filters: filters.to_vec(),
            columns: metrics
                .iter()
                .map(|metric| Column {
                    metric: metric.clone(),
                    field: sanitize(metric),
                })
                .collect(),
        })
    }

    /// Expected number of comma-separated values per row.
    #[must_use]
    pub fn width(&self) -> usize {
        self.columns.len() + 1
    }

    fn value(&self, raw: &str) -> Option<f64> {
        let value = clean(raw);
        if ABSENT.contains(&value) {
            return None;
        }
        let parsed = value.parse::<f64>().ok().filter(|v| v.is_finite())?;
        if self.filters.iter().any(|f| f.skips(value)) {
            return None;
        }
        Some(parsed)
    }

    /// Convert one data row. `observe` is called with the original metric
    /// name of every value kept. Returns `None` for a row that is malformed
    /// or has no usable value.
    pub fn convert<F>(&self, line: &str, stats: &mut Stats, mut observe: F) -> Option<Point>
    where
        F: FnMut(&str),
    {
        stats.rows += 1;
        let values: Vec<&str> = line.split(',').collect();
        if values.len() != self.width() {
            stats.malformed_rows += 1;
            return None;
        }
        let Some(timestamp) = parse_timestamp(values[0]) else {
            stats.bad_timestamps += 1;
            return None;
        };

        let mut point = Point::new(self.measurement.clone(), timestamp);
        for (key, value) in &self.tags {
            point = point.tag(key.clone(), value.clone());
        }
        for (column, raw) in self.columns.iter().zip(&values[1..]) {
            match self.value(raw) {
                Some(value) => {
                    point.add_field(column.field.clone(), value);
                    observe(&column.metric);
                }
                None => stats.skipped_values += 1,
            }
        }

        if point.has_fields() {
            stats.points += 1;
            stats.fields += point.fields().len() as u64;
            Some(point)
        } else {
            stats.empty_rows += 1;
            None
        }
    }
}

/// The export invocation for `metrics` in the archive at `base`.
#[must_use]
pub fn export_invocation(sampler: &Path, base: &Path, metrics: &[String]) -> Invocation {
    Invocation::new(sampler)
        .arg("-a")
        .arg(base)
        .args(["-t", "1sec", "-o", "csv", "-U", "--ignore-unknown"])
        .args(metrics)
}

/// Everything [`export`] needs to know about one archive.
#[derive(Debug, Clone, Copy)]
pub struct Export<'a> {
    /// Archive base path
    pub base: &'a Path,
    /// Metrics to sample
    pub metrics: &'a [String],
    /// Measurement every point is written to
    pub measurement: &'a str,
    /// Tags attached to every point
    pub tags: &'a [(String, String)],
    /// Value exclusions
    pub filters: &'a [ValueFilter],
    /// What to do when header columns collide
    pub collisions: CollisionPolicy,
    /// Where the raw sampler output is copied, if anywhere
    pub debug_csv: Option<&'a Path>,
}

/// Run `sampler` over the archive described by `export`, converting its output
/// into points for `sink` and recording observed names in `tracker`.
///
/// A sampler that exits unsuccessfully after producing a header is only
/// warned about; whatever it produced has already been converted.
///
/// # Errors
///
/// Function will error if the sampler cannot be started, its output cannot be
/// read, it produces no header, the header has a rejected collision, or the
/// sink stops accepting points.
pub async fn export<R, S>(
    runner: &R,
    sampler: &Path,
    export: &Export<'_>,
    tracker: &mut MetricNameTracker,
    sink: &mut S,
) -> Result<Stats, Error>
where
    R: ProcessRunner,
    S: PointSink,
{
    let invocation = export_invocation(sampler, export.base, export.metrics);
    info!(
        metrics = export.metrics.len(),
        filters = ?export.filters,
        "starting export: {invocation}"
    );
    let Streaming { stdout, exit } = runner.spawn(&invocation)?;

    let (mut copy, copier) = match export.debug_csv {
        Some(path) => {
            let (snd, rcv) = mpsc::channel(DEBUG_BACKLOG);
            (
                DebugCopy(Some(snd)),
                Some(tokio::spawn(copy_lines(path.to_path_buf(), rcv))),
            )
        }
        None => (DebugCopy(None), None),
    };

    let mut reader = BufReader::with_capacity(LINE_BUFFER_CAPACITY, stdout);
    let mut buf = Vec::new();
    let mut stats = Stats::default();
    let mut converter: Option<RowConverter> = None;

    let streamed: Result<(), Error> = async {
        loop {
            buf.clear();
            let read = reader.read_until(b'\n', &mut buf).await.map_err(Error::Read)?;
            if read == 0 {
                return Ok(());
            }
            copy.offer(&buf);
            let text = String::from_utf8_lossy(&buf);
            let line = text.trim_end_matches(['\n', '\r']);
            if line.is_empty() {
                continue;
            }
            stats.lines += 1;

            match &converter {
                Some(rows) => {
                    if let Some(point) = rows.convert(line, &mut stats, |metric| {
                        tracker.observe(metric);
                    }) {
                        sink.write_point(point).await?;
                    }
                }
                None => {
                    let header = RowConverter::from_header(
                        line,
                        export.measurement,
                        export.tags,
                        export.filters,
                        export.collisions,
                    )
                    .map_err(Error::Collision)?;
                    info!(columns = header.width(), "read sampler header");
                    converter = Some(header);
                }
            }
        }
    }
    .await;

    drop(copy);
    if let Some(copier) = copier
        && let Err(e) = copier.await
    {
        warn!("debug CSV copy task failed: {e}");
    }
    streamed?;

    // Only now is stdout fully drained.
    let exit = exit.await?;
    if !exit.success() {
        warn!(%exit, "sampler exited unsuccessfully after streaming");
    }
    if converter.is_none() {
        return Err(Error::NoHeader { exit });
    }

    if let Err(e) = tracker.persist().await {
        warn!("unable to persist metric names: {e}");
    }

    metrics::counter!("points_emitted").increment(stats.points);
    metrics::counter!("rows_skipped", "reason" => "width").increment(stats.malformed_rows);
    metrics::counter!("rows_skipped", "reason" => "timestamp").increment(stats.bad_timestamps);
    metrics::counter!("rows_skipped", "reason" => "empty").increment(stats.empty_rows);
    metrics::counter!("values_skipped").increment(stats.skipped_values);
    info!(
        lines = stats.lines,
        points = stats.points,
        fields = stats.fields,
        malformed_rows = stats.malformed_rows,
        bad_timestamps = stats.bad_timestamps,
        skipped_values = stats.skipped_values,
        "export complete"
    );
    Ok(stats)
}

/// Feeds [`copy_lines`] without ever waiting on it.
struct DebugCopy(Option<mpsc::Sender<Vec<u8>>>);

impl DebugCopy {
    fn offer(&mut self, line: &[u8]) {
        let Some(lines) = &self.0 else {
            return;
        };
        match lines.try_send(line.to_vec()) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => {
                warn!("debug CSV copy fell {DEBUG_BACKLOG} lines behind, abandoning it");
                self.0 = None;
            }
            // The copier only goes away if it panicked.
            Err(TrySendError::Closed(_)) => self.0 = None,
        }
    }
}

/// Write every received chunk to `path` verbatim. Best effort: the first
/// failure is logged and the rest of the stream is discarded.
async fn copy_lines(path: PathBuf, mut lines: mpsc::Receiver<Vec<u8>>) {
    let file = match tokio::fs::File::create(&path).await {
        Ok(file) => file,
        Err(e) => {
            warn!(path = %path.display(), "unable to create debug CSV: {e}");
            while lines.recv().await.is_some() {}
            return;
        }
    };
    let mut out = BufWriter::new(file);
    let mut healthy = true;
    while let Some(chunk) = lines.recv().await {
        if healthy && let Err(e) = out.write_all(&chunk).await {
            warn!(path = %path.display(), "debug CSV write failed: {e}");
            healthy = false;
        }
    }
    if healthy {
        match out.flush().await {
            Ok(()) => debug!(path = %path.display(), "debug CSV saved"),
            Err(e) => warn!(path = %path.display(), "debug CSV flush failed: {e}"),
        }
    }
}

//! One archive, start to finish
//!
//! [`ArchiveLifecycleManager::process_one`] drives an archive through
//! extraction, location of its base, metric resolution and export, then moves
//! the archive file into the processed or failed directory. Nothing is
//! retried. On failure the extraction directory is left in place for
//! inspection; on success it is removed.

use std::{
    fmt, io,
    path::{Path, PathBuf},
    time::{Duration, Instant},
};

use archivist_influx::{Client, client};
use tracing::{debug, error, info, warn};

use crate::{
    catalog::{self, MetricCatalog},
    config::Config,
    convert::{self, Collision, CollisionPolicy, Export},
    extract, locator,
    runner::ProcessRunner,
    tracker::{self, MetricNameTracker},
    writer::{self, BatchedWriter},
};

/// Pipeline stage, for reporting where an archive failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
    /// Preparing directories and state before any archive
    Setup,
    /// Unpacking the bundle
    Extract,
    /// Finding the archive base
    Locate,
    /// Resolving the metrics to export
    Validate,
    /// Streaming points to the store
    Export,
    /// Moving the archive file
    Relocate,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::Setup => "setup",
            Stage::Extract => "extract",
            Stage::Locate => "locate",
            Stage::Validate => "validate",
            Stage::Export => "export",
            Stage::Relocate => "relocate",
        };
        f.write_str(name)
    }
}

/// Errors produced by [`ArchiveLifecycleManager`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// A working directory could not be created.
    #[error("unable to create {path}: {source}")]
    Setup {
        /// Directory being created
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// The name registry could not be loaded.
    #[error(transparent)]
    Tracker(#[from] tracker::Error),
    /// The store client could not be built.
    #[error(transparent)]
    Client(#[from] client::Error),
    /// The archive file name has no recognized suffix.
    #[error("{0} does not look like an archive")]
    Name(PathBuf),
    /// Wrapper around [`extract::Error`].
    #[error(transparent)]
    Extract(#[from] extract::Error),
    /// Wrapper around [`locator::Error`].
    #[error(transparent)]
    Locate(#[from] locator::Error),
    /// Wrapper around [`catalog::Error`].
    #[error(transparent)]
    Catalog(#[from] catalog::Error),
    /// Validated metrics collide after sanitization.
    #[error("{0}")]
    Collision(Collision),
    /// Wrapper around [`convert::Error`].
    #[error(transparent)]
    Export(#[from] convert::Error),
    /// Wrapper around [`writer::Error`].
    #[error(transparent)]
    Store(#[from] writer::Error),
    /// The archive file could not be moved.
    #[error("unable to move {from} to {to}: {source}")]
    Relocate {
        /// Current location
        from: PathBuf,
        /// Intended directory
        to: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
}

impl Error {
    /// The stage this error belongs to.
    #[must_use]
    pub fn stage(&self) -> Stage {
        match self {
            Error::Setup { .. } | Error::Tracker(_) | Error::Client(_) => Stage::Setup,
            Error::Name(_) | Error::Extract(_) => Stage::Extract,
            Error::Locate(_) => Stage::Locate,
            Error::Catalog(_) | Error::Collision(_) => Stage::Validate,
            Error::Export(_) | Error::Store(_) => Stage::Export,
            Error::Relocate { .. } => Stage::Relocate,
        }
    }
}

/// What happened to a successfully processed archive.
#[derive(Debug, Clone, PartialEq)]
pub struct Report {
    /// Where the archive file now lives
    pub archive: PathBuf,
    /// Metrics exported
    pub metrics: usize,
    /// Conversion counters
    pub stats: convert::Stats,
    /// Batches the store client gave up on
    pub failed_batches: u64,
    /// Time spent unpacking
    pub extract: Duration,
    /// Time spent resolving metrics
    pub validate: Duration,
    /// Time spent exporting
    pub export: Duration,
    /// Wall time for the whole archive
    pub total: Duration,
}

/// Processes archives one at a time.
#[derive(Debug)]
pub struct ArchiveLifecycleManager<R> {
    config: Config,
    runner: R,
    client: Client,
    tracker: MetricNameTracker,
    force_revalidate: bool,
}

impl<R> ArchiveLifecycleManager<R>
where
    R: ProcessRunner + Sync,
{
    /// Create every configured directory, load the name registry and build
    /// the store client. `force_revalidate` adds to the configured flag.
    ///
    /// # Errors
    ///
    /// Function will error if a directory cannot be created, the registry
    /// cannot be read or the client cannot be built.
    pub async fn new(config: Config, runner: R, force_revalidate: bool) -> Result<Self, Error> {
        for dir in config.directories.all() {
            tokio::fs::create_dir_all(dir)
                .await
                .map_err(|source| Error::Setup {
                    path: dir.to_path_buf(),
                    source,
                })?;
        }
        let tracker = MetricNameTracker::load(config.tracker_file()).await?;
        info!(known = tracker.len(), "loaded metric name registry");
        let client = Client::new(config.store.client_config())?;
        let force_revalidate = force_revalidate || config.validation.force_revalidate;
        Ok(Self {
            config,
            runner,
            client,
            tracker,
            force_revalidate,
        })
    }

    /// The store client, for readiness checks.
    #[must_use]
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Run the pipeline for `archive` and move the file to the processed or
    /// failed directory accordingly.
    ///
    /// # Errors
    ///
    /// Function will error if any stage fails. The archive file is then in
    /// the failed directory, unless moving it there failed as well.
    pub async fn process_one(&mut self, archive: &Path) -> Result<Report, Error> {
        let started = Instant::now();
        info!(archive = %archive.display(), "processing archive");

        let (mut report, workdir) = match self.pipeline(archive).await {
            Ok(done) => done,
            Err(e) => return Err(self.fail(archive, e).await),
        };

        report.archive = match relocate(archive, &self.config.directories.processed).await {
            Ok(to) => to,
            Err(e) => return Err(self.fail(archive, e).await),
        };
        info!(to = %report.archive.display(), "moved archive to processed");
        match tokio::fs::remove_dir_all(&workdir).await {
            Ok(()) => debug!(path = %workdir.display(), "removed extraction directory"),
            Err(e) => warn!(path = %workdir.display(), "unable to remove extraction directory: {e}"),
        }

        report.total = started.elapsed();
        metrics::counter!("archives_processed").increment(1);
        info!(
            total_secs = report.total.as_secs_f64(),
            extract_secs = report.extract.as_secs_f64(),
            validate_secs = report.validate.as_secs_f64(),
            export_secs = report.export.as_secs_f64(),
            points = report.stats.points,
            "archive complete"
        );
        Ok(report)
    }

    /// Record the failure of `archive` and move it to the failed directory.
    /// The extraction directory is left alone.
    async fn fail(&self, archive: &Path, e: Error) -> Error {
        let stage = e.stage();
        error!(archive = %archive.display(), %stage, "archive failed: {e}");
        metrics::counter!("archives_failed", "stage" => stage.to_string()).increment(1);
        match relocate(archive, &self.config.directories.failed).await {
            Ok(to) => info!(to = %to.display(), "moved archive to failed"),
            Err(e) => warn!("{e}"),
        }
        e
    }

    async fn pipeline(&mut self, archive: &Path) -> Result<(Report, PathBuf), Error> {
        let suffixes = &self.config.tools.archive_suffixes;
        let stem = archive
            .file_name()
            .and_then(|name| name.to_str())
            .and_then(|name| extract::archive_stem(name, suffixes))
            .ok_or_else(|| Error::Name(archive.to_path_buf()))?
            .to_string();

        let clock = Instant::now();
        let workdir = extract::extract(
            &self.runner,
            &self.config.tools.extractor,
            archive,
            &self.config.directories.extract,
            &stem,
        )
        .await?;
        let extract_time = clock.elapsed();
        info!(path = %workdir.display(), secs = extract_time.as_secs_f64(), "extracted");

        let base = locator::locate(&workdir, &self.config.tools.sidecar_extension).await?;
        info!(base = %base.display(), "found archive base");

        let clock = Instant::now();
        let metrics = MetricCatalog::new(&self.runner, self.config.catalog_settings())
            .resolve(&base, &self.config.categories, self.force_revalidate)
            .await?;
        if let Some(collision) = convert::collisions(metrics.iter().map(String::as_str))
            .into_iter()
            .next()
        {
            match self.config.field_collisions {
                CollisionPolicy::Reject => return Err(Error::Collision(collision)),
                CollisionPolicy::LastWriteWins => warn!(%collision, "field collision, last column wins"),
            }
        }
        let validate_time = clock.elapsed();
        info!(count = metrics.len(), secs = validate_time.as_secs_f64(), "metrics resolved");

        let clock = Instant::now();
        let tags = self.config.tags.pairs();
        let debug_csv = self.config.debug_csv(&stem);
        let export = Export {
            base: &base,
            metrics: &metrics,
            measurement: &self.config.store.measurement,
            tags: &tags,
            filters: &self.config.value_filters,
            collisions: self.config.field_collisions,
            debug_csv: Some(&debug_csv),
        };
        let mut sink = BatchedWriter::new(self.client.clone(), self.config.store.write_options());
        let exported = convert::export(
            &self.runner,
            &self.config.tools.sampler,
            &export,
            &mut self.tracker,
            &mut sink,
        )
        .await;
        // Pending points are delivered whether or not the export completed.
        let delivered = sink.finish().await;
        let stats = exported?;
        let summary = delivered?;
        let export_time = clock.elapsed();

        Ok((
            Report {
                archive: archive.to_path_buf(),
                metrics: metrics.len(),
                stats,
                failed_batches: summary.failed_batches,
                extract: extract_time,
                validate: validate_time,
                export: export_time,
                total: Duration::ZERO,
            },
            workdir,
        ))
    }
}

/// Move `file` into `dir`, keeping its name. Falls back to copy and remove
/// when a rename is not possible, for instance across filesystems.
///
/// # Errors
///
/// Function will error if the file can be neither renamed nor copied and
/// removed.
pub async fn relocate(file: &Path, dir: &Path) -> Result<PathBuf, Error> {
    let relocate_err = |source| Error::Relocate {
        from: file.to_path_buf(),
        to: dir.to_path_buf(),
        source,
    };
    let name = file.file_name().ok_or_else(|| {
        relocate_err(io::Error::new(io::ErrorKind::InvalidInput, "no file name"))
    })?;
    let dest = dir.join(name);
    if let Err(e) = tokio::fs::rename(file, &dest).await {
        debug!("rename failed ({e}), copying instead");
        tokio::fs::copy(file, &dest).await.map_err(relocate_err)?;
        tokio::fs::remove_file(file).await.map_err(relocate_err)?;
    }
    Ok(dest)
}

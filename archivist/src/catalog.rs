//! Discovery, validation and caching of exportable metric names
//!
//! Archives define many metrics that the sampler cannot turn into a numeric
//! series: derived metrics, string-typed metrics, metrics with no instances in
//! this particular archive. [`MetricCatalog::resolve`] lists every metric the
//! archive defines, probes them against the sampler in batches, falls back to
//! one probe per metric for a batch that fails, filters the survivors by
//! [`Policy`] and caches the result so later archives of the same shape skip
//! all of that.

use std::{
    io,
    num::NonZeroUsize,
    path::{Path, PathBuf},
};

use tracing::{debug, info, warn};

use crate::runner::{self, Exit, Invocation, ProcessRunner};

pub mod category;

pub use category::{Category, Policy, Report};

/// Number of validated names shown in the resolution log line.
const LOGGED_SAMPLE: usize = 10;

/// Errors produced by [`MetricCatalog`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The lister ran but exited unsuccessfully.
    #[error("metric lister failed with {exit}: {stderr}")]
    Lister {
        /// How the lister ended
        exit: Exit,
        /// What the lister wrote to stderr
        stderr: String,
    },
    /// An external tool could not be run at all.
    #[error(transparent)]
    Runner(#[from] runner::Error),
    /// The cache file exists but could not be read.
    #[error("unable to read metric cache {path}: {source}")]
    Cache {
        /// Cache file location
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// Nothing is left to export.
    #[error("no exportable metrics: {listed} listed, {valid} valid, {filtered} after category filter")]
    Empty {
        /// Names the lister produced
        listed: usize,
        /// Names that survived validation
        valid: usize,
        /// Names that survived the category filter
        filtered: usize,
    },
}

/// Knobs for [`MetricCatalog`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    /// Program that lists an archive's metrics
    pub lister: PathBuf,
    /// Program that samples metric values out of an archive
    pub sampler: PathBuf,
    /// Where the validated set is cached
    pub cache_path: PathBuf,
    /// Metrics probed per sampler invocation
    pub batch_size: NonZeroUsize,
    /// Log progress every this many probed metrics
    pub progress_interval: NonZeroUsize,
    /// Use the lister's output without probing it
    pub skip_validation: bool,
}

/// Result of probing a list of metrics.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Validation {
    /// Metrics that produced output, in input order
    pub valid: Vec<String>,
    /// Number of metrics that did not
    pub invalid: usize,
}

/// Resolves the set of metrics to export for an archive.
#[derive(Debug)]
pub struct MetricCatalog<'a, R> {
    runner: &'a R,
    settings: Settings,
}

/// The lister invocation for `base`.
#[must_use]
pub fn list_invocation(lister: &Path, base: &Path) -> Invocation {
    Invocation::new(lister).arg("-a").arg(base)
}

/// The one-sample probe of `metrics` against `base`.
#[must_use]
pub fn validation_invocation(sampler: &Path, base: &Path, metrics: &[String]) -> Invocation {
    Invocation::new(sampler)
        .arg("-a")
        .arg(base)
        .args(["-s", "1", "-o", "csv", "--ignore-unknown"])
        .args(metrics)
}

impl<'a, R> MetricCatalog<'a, R>
where
    R: ProcessRunner + Sync,
{
    /// Create a new [`MetricCatalog`]
    #[must_use]
    pub fn new(runner: &'a R, settings: Settings) -> Self {
        Self { runner, settings }
    }

    /// Metrics to export for the archive at `base`.
    ///
    /// A non-empty cache is returned as-is unless `force_revalidate` is set.
    /// Otherwise the archive's metrics are discovered, validated and filtered
    /// through `policy`, and the cache is overwritten with the result.
    ///
    /// # Errors
    ///
    /// Function will error if the cache cannot be read, the lister cannot be
    /// run or fails, a probe cannot be started, or no metric survives.
    pub async fn resolve(
        &self,
        base: &Path,
        policy: &Policy,
        force_revalidate: bool,
    ) -> Result<Vec<String>, Error> {
        if force_revalidate {
            info!("forced revalidation, ignoring metric cache");
        } else if let Some(cached) = load_cache(&self.settings.cache_path).await? {
            info!(
                count = cached.len(),
                path = %self.settings.cache_path.display(),
                "using cached validated metrics"
            );
            return Ok(cached);
        }

        let listed = self.discover(base).await?;
        let listed_count = listed.len();

        let valid = if self.settings.skip_validation {
            warn!(
                count = listed_count,
                "validation disabled, exporting every listed metric unprobed"
            );
            listed
        } else {
            info!(count = listed_count, "validating metrics");
            let Validation { valid, invalid } = self.validate(base, &listed).await?;
            info!(
                valid = valid.len(),
                invalid, "validation complete, invalid or derived metrics dropped"
            );
            valid
        };
        let valid_count = valid.len();

        let (filtered, report) = policy.apply(valid);
        for (category, dropped) in &report.dropped {
            info!(%category, dropped, "category disabled, metrics filtered");
            metrics::counter!("metrics_filtered", "category" => category.as_str())
                .increment(*dropped as u64);
        }
        info!(
            kept = report.kept,
            dropped = report.total_dropped(),
            "category filter applied"
        );
        if report.kept == 0 {
            return Err(Error::Empty {
                listed: listed_count,
                valid: valid_count,
                filtered: report.kept,
            });
        }
        log_sample(&filtered);

        save_cache(&self.settings.cache_path, &filtered).await;
        Ok(filtered)
    }

    /// Every metric the archive at `base` defines, trimmed, blank lines
    /// removed.
    ///
    /// # Errors
    ///
    /// Function will error if the lister cannot be run or exits unsuccessfully.
    pub async fn discover(&self, base: &Path) -> Result<Vec<String>, Error> {
        let done = self
            .runner
            .run(&list_invocation(&self.settings.lister, base))
            .await?;
        if !done.exit.success() {
            return Err(Error::Lister {
                exit: done.exit,
                stderr: done.stderr_text(),
            });
        }
        Ok(String::from_utf8_lossy(&done.stdout)
            .lines()
            .map(str::trim)
            .filter(|line| !line.is_empty())
            .map(str::to_string)
            .collect())
    }

    /// Probe `metrics` in batches. A batch that produces output accepts all
    /// of its members; otherwise each member is probed on its own.
    ///
    /// # Errors
    ///
    /// Function will error if the sampler cannot be started.
    pub async fn validate(&self, base: &Path, metrics: &[String]) -> Result<Validation, Error> {
        let interval = self.settings.progress_interval.get();
        let total = metrics.len();
        let mut validation = Validation::default();
        let mut checked = 0;

        for batch in metrics.chunks(self.settings.batch_size.get()) {
            if self.probe(base, batch).await? {
                validation.valid.extend_from_slice(batch);
            } else {
                debug!(size = batch.len(), "batch rejected, probing individually");
                for metric in batch {
                    if self.probe(base, std::slice::from_ref(metric)).await? {
                        validation.valid.push(metric.clone());
                    } else {
                        validation.invalid += 1;
                    }
                }
            }

            let before = checked;
            checked += batch.len();
            if checked / interval > before / interval {
                info!("validated {checked}/{total} metrics");
            }
        }

        metrics::counter!("metrics_validated").increment(validation.valid.len() as u64);
        metrics::counter!("metrics_invalid").increment(validation.invalid as u64);
        Ok(validation)
    }

    /// Whether the sampler produces output for `metrics`. A probe that runs
    /// past the command deadline counts as no output.
    ///
    /// # Errors
    ///
    /// Function will error if the sampler cannot be started.
    pub async fn probe(&self, base: &Path, metrics: &[String]) -> Result<bool, Error> {
        let invocation = validation_invocation(&self.settings.sampler, base, metrics);
        match self.runner.run(&invocation).await {
            Ok(done) => Ok(done.succeeded_with_output()),
            Err(runner::Error::Timeout { timeout, .. }) => {
                warn!(?timeout, count = metrics.len(), "probe timed out");
                Ok(false)
            }
            Err(e) => Err(e.into()),
        }
    }
}

fn log_sample(metrics: &[String]) {
    let shown = metrics
        .iter()
        .take(LOGGED_SAMPLE)
        .map(String::as_str)
        .collect::<Vec<_>>()
        .join(", ");
    if metrics.len() > LOGGED_SAMPLE {
        info!(
            count = metrics.len(),
            "exporting {shown} ... and {} more",
            metrics.len() - LOGGED_SAMPLE
        );
    } else {
        info!(count = metrics.len(), "exporting {shown}");
    }
}

/// Read the validated set cached at `path`. A missing or empty cache is
/// `None`.
///
/// # Errors
///
/// Function will error if the file exists but cannot be read.
pub async fn load_cache(path: &Path) -> Result<Option<Vec<String>>, Error> {
    let text = match tokio::fs::read_to_string(path).await {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(None),
        Err(source) => {
            return Err(Error::Cache {
                path: path.to_path_buf(),
                source,
            });
        }
    };
    let metrics: Vec<String> = text
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect();
    Ok((!metrics.is_empty()).then_some(metrics))
}

/// Overwrite the cache at `path` with `metrics`, one per line. Failure only
/// costs the next archive a revalidation, so it is logged and swallowed.
pub async fn save_cache(path: &Path, metrics: &[String]) {
    let mut body = String::with_capacity(metrics.iter().map(|m| m.len() + 1).sum());
    for metric in metrics {
        body.push_str(metric);
        body.push('\n');
    }
    match tokio::fs::write(path, body).await {
        Ok(()) => info!(count = metrics.len(), path = %path.display(), "saved metric cache"),
        Err(e) => warn!(path = %path.display(), "unable to save metric cache: {e}"),
    }
}

#[cfg(test)]
mod tests {
    use std::collections::BTreeSet;

    use super::*;
    use crate::runner::fake::{Canned, FakeRunner};

    const BAD: &str = "hinv.map.cpu_name";

    fn settings(dir: &Path, batch_size: usize) -> Settings {
        Settings {
            lister: PathBuf::from("pminfo"),
            sampler: PathBuf::from("pmrep"),
            cache_path: dir.join("validated_metrics.txt"),
            batch_size: NonZeroUsize::new(batch_size).expect("non-zero"),
            progress_interval: NonZeroUsize::new(2).expect("non-zero"),
            skip_validation: false,
        }
    }

    /// Lists `listed`; the sampler produces output unless asked for [`BAD`].
    fn archive(listed: &'static [&'static str]) -> FakeRunner {
        FakeRunner::new(move |program, args| match program {
            "pminfo" => Canned::ok(&listed.join("\n")),
            "pmrep" if args.iter().any(|a| a == BAD) => Canned::exit(1, ""),
            "pmrep" => Canned::ok("Time,x\n2025-01-14 10:00:00,1\n"),
            _ => Canned::SpawnFailure,
        })
    }

    fn names(metrics: &[&str]) -> Vec<String> {
        metrics.iter().map(|m| (*m).to_string()).collect()
    }

    #[tokio::test]
    async fn batch_fallback_matches_individual_probing() {
        let dir = tempfile::tempdir().expect("tempdir");
        let listed = [
            "kernel.all.load",
            BAD,
            "mem.freemem",
            "disk.dev.read",
            "swap.used",
        ];
        let runner = archive(&[]);
        let metrics = names(&listed);
        let base = Path::new("/archives/host");

        let batched = MetricCatalog::new(&runner, settings(dir.path(), 3))
            .validate(base, &metrics)
            .await
            .expect("validate");
        let single = MetricCatalog::new(&runner, settings(dir.path(), 1))
            .validate(base, &metrics)
            .await
            .expect("validate");

        assert_eq!(batched, single);
        assert_eq!(batched.invalid, 1);
        assert!(!batched.valid.iter().any(|m| m == BAD));
        assert_eq!(batched.valid.len(), 4);
    }

    #[tokio::test]
    async fn probes_use_the_validation_arguments() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = archive(&[]);
        MetricCatalog::new(&runner, settings(dir.path(), 10))
            .probe(Path::new("/a/b"), &names(&["mem.freemem"]))
            .await
            .expect("probe");
        assert_eq!(
            runner.calls(),
            vec![names(&[
                "pmrep",
                "-a",
                "/a/b",
                "-s",
                "1",
                "-o",
                "csv",
                "--ignore-unknown",
                "mem.freemem"
            ])]
        );
    }

    #[tokio::test]
    async fn resolve_writes_then_reuses_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = archive(&["proc.nprocs", "kernel.all.load", BAD, "mem.freemem"]);
        let catalog = MetricCatalog::new(&runner, settings(dir.path(), 100));
        let base = Path::new("/archives/host");

        let first = catalog
            .resolve(base, &Policy::default(), false)
            .await
            .expect("resolve");
        assert_eq!(first, names(&["kernel.all.load", "mem.freemem"]));
        let calls = runner.calls().len();

        let second = catalog
            .resolve(base, &Policy::default(), false)
            .await
            .expect("resolve");
        assert_eq!(first, second);
        assert_eq!(runner.calls().len(), calls, "cache hit runs nothing");

        catalog
            .resolve(base, &Policy::default(), true)
            .await
            .expect("resolve");
        assert!(runner.calls().len() > calls, "forced revalidation reruns");
    }

    #[tokio::test]
    async fn cache_reload_is_idempotent() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("validated_metrics.txt");
        std::fs::write(&path, "kernel.all.load\n  mem.freemem \n\ndisk.dev.read\n")
            .expect("seed cache");

        let loaded = load_cache(&path).await.expect("load").expect("non-empty");
        save_cache(&path, &loaded).await;
        let saved = std::fs::read(&path).expect("read back");
        save_cache(&path, &load_cache(&path).await.expect("load").expect("non-empty")).await;
        assert_eq!(saved, std::fs::read(&path).expect("read back"));

        let set: BTreeSet<_> = loaded.into_iter().collect();
        assert_eq!(
            set,
            names(&["disk.dev.read", "kernel.all.load", "mem.freemem"])
                .into_iter()
                .collect()
        );
    }

    #[tokio::test]
    async fn missing_or_blank_cache_is_a_miss() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("validated_metrics.txt");
        assert_eq!(load_cache(&path).await.expect("load"), None);
        std::fs::write(&path, "\n \n").expect("seed cache");
        assert_eq!(load_cache(&path).await.expect("load"), None);
    }

    #[tokio::test]
    async fn lister_failure_is_fatal_and_writes_no_cache() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = FakeRunner::new(|_, _| Canned::exit(2, ""));
        let s = settings(dir.path(), 100);
        let cache = s.cache_path.clone();
        let err = MetricCatalog::new(&runner, s)
            .resolve(Path::new("/a"), &Policy::default(), false)
            .await
            .expect_err("lister fails");
        assert!(matches!(err, Error::Lister { .. }));
        assert!(!cache.exists());
    }

    #[tokio::test]
    async fn nothing_valid_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = archive(&["proc.nprocs", BAD]);
        let err = MetricCatalog::new(&runner, settings(dir.path(), 100))
            .resolve(Path::new("/a"), &Policy::default(), false)
            .await
            .expect_err("nothing exportable");
        assert!(matches!(
            err,
            Error::Empty {
                listed: 2,
                valid: 1,
                filtered: 0
            }
        ));
    }

    #[tokio::test]
    async fn skip_validation_only_filters() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = archive(&["proc.nprocs", BAD, "kernel.all.load"]);
        let mut s = settings(dir.path(), 100);
        s.skip_validation = true;
        let metrics = MetricCatalog::new(&runner, s)
            .resolve(Path::new("/a"), &Policy::default(), true)
            .await
            .expect("resolve");
        assert_eq!(metrics, names(&[BAD, "kernel.all.load"]));
        assert_eq!(runner.calls().len(), 1, "only the lister runs");
    }

    #[tokio::test]
    async fn sampler_spawn_failure_is_fatal() {
        let dir = tempfile::tempdir().expect("tempdir");
        let runner = FakeRunner::new(|program, _| match program {
            "pminfo" => Canned::ok("kernel.all.load\n"),
            _ => Canned::SpawnFailure,
        });
        let err = MetricCatalog::new(&runner, settings(dir.path(), 100))
            .resolve(Path::new("/a"), &Policy::default(), false)
            .await
            .expect_err("sampler missing");
        assert!(matches!(err, Error::Runner(runner::Error::Spawn { .. })));
    }
}

//! Feeding archives to the lifecycle manager
//!
//! Archives are processed strictly one after another. A failed archive does
//! not stop the rest.

use std::{
    io,
    path::{Path, PathBuf},
};

use tracing::info;

use crate::{lifecycle::ArchiveLifecycleManager, runner::ProcessRunner};

/// Errors produced while scanning for archives
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The watch directory could not be read.
    #[error("unable to scan {path}: {source}")]
    Scan {
        /// Directory being scanned
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
}

/// Outcome of a pass over a set of archives.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    /// Archives that ended in the processed directory
    pub succeeded: usize,
    /// Archives that did not
    pub failed: usize,
}

/// Regular files directly inside `dir` whose name ends with one of
/// `suffixes`, sorted by path.
///
/// # Errors
///
/// Function will error if the directory cannot be read.
pub async fn pending_archives<S>(dir: &Path, suffixes: &[S]) -> Result<Vec<PathBuf>, Error>
where
    S: AsRef<str>,
{
    let scan_err = |source| Error::Scan {
        path: dir.to_path_buf(),
        source,
    };
    let mut archives = Vec::new();
    let mut read = tokio::fs::read_dir(dir).await.map_err(scan_err)?;
    while let Some(entry) = read.next_entry().await.map_err(scan_err)? {
        if !entry.file_type().await.map_err(scan_err)?.is_file() {
            continue;
        }
        let name = entry.file_name();
        let Some(name) = name.to_str() else {
            continue;
        };
        if suffixes.iter().any(|suffix| name.ends_with(suffix.as_ref())) {
            archives.push(entry.path());
        }
    }
    archives.sort();
    Ok(archives)
}

/// Process `archives` in order. `stop` is checked before each archive; once
/// it returns `true` the remaining archives are left for a later pass.
pub async fn process_all<R, F>(
    manager: &mut ArchiveLifecycleManager<R>,
    archives: &[PathBuf],
    stop: F,
) -> Summary
where
    R: ProcessRunner + Sync,
    F: Fn() -> bool,
{
    let mut summary = Summary::default();
    if archives.is_empty() {
        info!("no archives to process");
        return summary;
    }
    info!(count = archives.len(), "found archives to process");
    for archive in archives {
        if stop() {
            info!(
                remaining = archives.len() - summary.succeeded - summary.failed,
                "stopping before remaining archives"
            );
            break;
        }
        // Failures are logged by the manager.
        match manager.process_one(archive).await {
            Ok(_) => summary.succeeded += 1,
            Err(_) => summary.failed += 1,
        }
    }
    info!(
        succeeded = summary.succeeded,
        failed = summary.failed,
        "processing complete"
    );
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config,
        runner::fake::{Canned, FakeRunner},
    };

    #[tokio::test]
    async fn only_matching_files_in_sorted_order() {
        let dir = tempfile::tempdir().expect("tempdir");
        for name in ["b.tar.xz", "a.tar.xz", "c.tar.gz", "notes.txt", "d.tar.xz.part"] {
            std::fs::write(dir.path().join(name), b"").expect("file");
        }
        std::fs::create_dir(dir.path().join("e.tar.xz")).expect("mkdir");

        let found = pending_archives(dir.path(), &[".tar.xz"]).await.expect("scan");
        assert_eq!(
            found,
            vec![dir.path().join("a.tar.xz"), dir.path().join("b.tar.xz")]
        );

        let found = pending_archives(dir.path(), &[".tar.xz", ".tar.gz"])
            .await
            .expect("scan");
        assert_eq!(found.len(), 3);
    }

    #[tokio::test]
    async fn missing_watch_directory_is_an_error() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = pending_archives(&dir.path().join("gone"), &[".tar.xz"])
            .await
            .expect_err("missing");
        assert!(matches!(err, Error::Scan { .. }));
    }

    #[tokio::test]
    async fn failures_do_not_stop_the_pass() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = |name: &str| root.path().join(name).display().to_string();
        let config = config::parse(&format!(
            "directories:\n  watch: {}\n  extract: {}\n  processed: {}\n  failed: {}\n  log: {}\n",
            dir("watch"),
            dir("extract"),
            dir("processed"),
            dir("failed"),
            dir("log"),
        ))
        .expect("valid config");
        // Every extraction fails.
        let runner = FakeRunner::new(|_, _| Canned::exit(2, ""));
        let mut manager = ArchiveLifecycleManager::new(config, runner.clone(), false)
            .await
            .expect("manager");
        let watch = root.path().join("watch");
        for name in ["one.tar.xz", "two.tar.xz"] {
            std::fs::write(watch.join(name), b"").expect("archive");
        }

        let archives = pending_archives(&watch, &[".tar.xz"]).await.expect("scan");
        let summary = process_all(&mut manager, &archives, || false).await;
        assert_eq!(
            summary,
            Summary {
                succeeded: 0,
                failed: 2
            }
        );
        assert_eq!(runner.calls().len(), 2);
        assert!(pending_archives(&watch, &[".tar.xz"]).await.expect("scan").is_empty());
    }

    #[tokio::test]
    async fn stop_leaves_archives_in_place() {
        let root = tempfile::tempdir().expect("tempdir");
        let dir = |name: &str| root.path().join(name).display().to_string();
        let config = config::parse(&format!(
            "directories:\n  watch: {}\n  extract: {}\n  processed: {}\n  failed: {}\n  log: {}\n",
            dir("watch"),
            dir("extract"),
            dir("processed"),
            dir("failed"),
            dir("log"),
        ))
        .expect("valid config");
        let runner = FakeRunner::new(|_, _| Canned::exit(2, ""));
        let mut manager = ArchiveLifecycleManager::new(config, runner.clone(), false)
            .await
            .expect("manager");
        let watch = root.path().join("watch");
        std::fs::write(watch.join("one.tar.xz"), b"").expect("archive");

        let archives = pending_archives(&watch, &[".tar.xz"]).await.expect("scan");
        let summary = process_all(&mut manager, &archives, || true).await;
        assert_eq!(summary, Summary::default());
        assert!(runner.calls().is_empty());
        assert_eq!(archives, pending_archives(&watch, &[".tar.xz"]).await.expect("scan"));
    }
}

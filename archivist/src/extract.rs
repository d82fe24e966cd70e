//! Unpacking archive bundles

use std::{
    io,
    path::{Path, PathBuf},
};

use tracing::info;

use crate::runner::{self, Exit, Invocation, ProcessRunner};

/// Errors produced by [`extract`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The target directory could not be cleared or created.
    #[error("unable to prepare {path}: {source}")]
    Prepare {
        /// Target directory
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
    /// The extractor could not be run.
    #[error(transparent)]
    Runner(#[from] runner::Error),
    /// The extractor ran but exited unsuccessfully.
    #[error("extraction failed with {exit}: {stderr}")]
    Failed {
        /// How the extractor ended
        exit: Exit,
        /// What the extractor wrote to stderr
        stderr: String,
    },
}

/// `file_name` with the first of `suffixes` it ends with removed, or `None`
/// if it ends with none of them or nothing would be left.
#[must_use]
pub fn archive_stem<'a, S>(file_name: &'a str, suffixes: &[S]) -> Option<&'a str>
where
    S: AsRef<str>,
{
    suffixes
        .iter()
        .find_map(|suffix| file_name.strip_suffix(suffix.as_ref()))
        .filter(|stem| !stem.is_empty())
}

/// The extraction invocation for `archive` into `dir`.
#[must_use]
pub fn extract_invocation(extractor: &Path, archive: &Path, dir: &Path) -> Invocation {
    Invocation::new(extractor)
        .arg("-xf")
        .arg(archive)
        .arg("-C")
        .arg(dir)
}

/// Unpack `archive` into `root/stem`, replacing anything already there, and
/// return that directory.
///
/// # Errors
///
/// Function will error if the directory cannot be prepared or the extractor
/// cannot be run or fails.
pub async fn extract<R>(
    runner: &R,
    extractor: &Path,
    archive: &Path,
    root: &Path,
    stem: &str,
) -> Result<PathBuf, Error>
where
    R: ProcessRunner,
{
    let dir = root.join(stem);
    let prepare_err = |source| Error::Prepare {
        path: dir.clone(),
        source,
    };
    match tokio::fs::remove_dir_all(&dir).await {
        Ok(()) => info!(path = %dir.display(), "removed stale extraction directory"),
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => return Err(prepare_err(e)),
    }
    tokio::fs::create_dir_all(&dir).await.map_err(prepare_err)?;

    let done = runner
        .run(&extract_invocation(extractor, archive, &dir))
        .await?;
    if !done.exit.success() {
        return Err(Error::Failed {
            exit: done.exit,
            stderr: done.stderr_text(),
        });
    }
    Ok(dir)
}

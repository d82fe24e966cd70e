//! Finding the archive base inside an extraction directory
//!
//! An archive is a family of files sharing one base name. Tools address the
//! archive by that base, which is recovered from the metadata sidecar file.

use std::{
    collections::VecDeque,
    io,
    path::{Path, PathBuf},
};

/// Errors produced by [`locate`]
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// No sidecar file anywhere under the directory.
    #[error("no archive found under {dir} (no .{extension} file)")]
    NotFound {
        /// Directory searched
        dir: PathBuf,
        /// Sidecar extension looked for
        extension: String,
    },
    /// A directory could not be read.
    #[error("unable to walk {path}: {source}")]
    Walk {
        /// Directory being read
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: io::Error,
    },
}

/// Archive base under `dir`: the path of the first file with extension
/// `sidecar`, extension removed.
///
/// Directories are visited breadth-first in name order and a directory's files
/// are checked before any of its subdirectories, so the result does not depend
/// on the order the filesystem lists entries.
///
/// # Errors
///
/// Function will error if a directory cannot be read or no sidecar exists.
pub async fn locate(dir: &Path, sidecar: &str) -> Result<PathBuf, Error> {
    let mut pending = VecDeque::from([dir.to_path_buf()]);
    while let Some(current) = pending.pop_front() {
        let walk_err = |source| Error::Walk {
            path: current.clone(),
            source,
        };
        let mut entries = Vec::new();
        let mut read = tokio::fs::read_dir(&current).await.map_err(walk_err)?;
        while let Some(entry) = read.next_entry().await.map_err(walk_err)? {
            let kind = entry.file_type().await.map_err(walk_err)?;
            entries.push((entry.path(), kind));
        }
        entries.sort_by(|a, b| a.0.cmp(&b.0));

        for (path, kind) in &entries {
            if kind.is_file() && path.extension().is_some_and(|ext| ext == sidecar) {
                return Ok(path.with_extension(""));
            }
        }
        pending.extend(
            entries
                .into_iter()
                .filter(|(_, kind)| kind.is_dir())
                .map(|(path, _)| path),
        );
    }
    Err(Error::NotFound {
        dir: dir.to_path_buf(),
        extension: sidecar.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use std::fs;

    use super::*;

    #[tokio::test]
    async fn finds_nested_sidecar() {
        let dir = tempfile::tempdir().expect("tempdir");
        let nested = dir.path().join("var/log/pcp/pmlogger/host");
        fs::create_dir_all(&nested).expect("mkdir");
        fs::write(nested.join("20250114.0"), b"").expect("volume");
        fs::write(nested.join("20250114.index"), b"").expect("index");
        fs::write(nested.join("20250114.meta"), b"").expect("meta");

        let base = locate(dir.path(), "meta").await.expect("found");
        assert_eq!(base, nested.join("20250114"));
    }

    #[tokio::test]
    async fn shallowest_then_first_by_name_wins() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("a/deeper")).expect("mkdir");
        fs::create_dir_all(dir.path().join("b")).expect("mkdir");
        fs::write(dir.path().join("a/deeper/x.meta"), b"").expect("meta");
        fs::write(dir.path().join("b/z.meta"), b"").expect("meta");
        fs::write(dir.path().join("b/y.meta"), b"").expect("meta");

        let base = locate(dir.path(), "meta").await.expect("found");
        assert_eq!(base, dir.path().join("b/y"));
    }

    #[tokio::test]
    async fn directory_named_like_sidecar_is_ignored() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("odd.meta")).expect("mkdir");
        let err = locate(dir.path(), "meta").await.expect_err("nothing");
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[tokio::test]
    async fn missing_directory_aborts_walk() {
        let dir = tempfile::tempdir().expect("tempdir");
        let err = locate(&dir.path().join("gone"), "meta")
            .await
            .expect_err("unreadable");
        assert!(matches!(err, Error::Walk { .. }));
    }
}

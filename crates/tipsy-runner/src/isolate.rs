//! Copy-on-write isolation of project and workspace bundles.
//!
//! Every run works on `<name>-temp.<ext>` siblings of the user's files so the
//! originals are never written. Bundles (`.xcodeproj`, `.xcworkspace`) are
//! directories and are copied recursively.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::{debug, warn};

const TEMP_SUFFIX: &str = "-temp";

#[derive(Debug, Error)]
pub enum IsolateError {
    #[error("unsupported name for isolation: {path} (expected exactly one '.' in the file name)")]
    UnsupportedTempName { path: PathBuf },
    #[error("failed to copy {from} to {to}: {source}")]
    TempCopyFailure {
        from: PathBuf,
        to: PathBuf,
        #[source]
        source: io::Error,
    },
}

/// An original path and its temporary counterpart.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IsolatedPath {
    pub original: PathBuf,
    pub temporary: PathBuf,
}

/// Derives `name-temp.ext` from `name.ext`.
///
/// Only the final component is rewritten; the parent directory is kept as is.
/// File names with zero or several dots, or with an empty stem or extension,
/// are rejected rather than guessed at.
pub fn temp_path_from(path: &Path) -> Result<PathBuf, IsolateError> {
    let unsupported = || IsolateError::UnsupportedTempName {
        path: path.to_path_buf(),
    };
    let file_name = path
        .file_name()
        .and_then(|s| s.to_str())
        .ok_or_else(unsupported)?;
    let parts: Vec<&str> = file_name.split('.').collect();
    if parts.len() != 2 || parts[0].is_empty() || parts[1].is_empty() {
        return Err(unsupported());
    }
    let temp_name = format!("{}{}.{}", parts[0], TEMP_SUFFIX, parts[1]);
    Ok(path.with_file_name(temp_name))
}

/// Copies `path` to its temporary counterpart, replacing any stale copy.
pub fn isolate(path: &Path) -> Result<IsolatedPath, IsolateError> {
    let temporary = temp_path_from(path)?;
    remove_path(&temporary).map_err(|source| IsolateError::TempCopyFailure {
        from: path.to_path_buf(),
        to: temporary.clone(),
        source,
    })?;
    copy_path(path, &temporary).map_err(|source| IsolateError::TempCopyFailure {
        from: path.to_path_buf(),
        to: temporary.clone(),
        source,
    })?;
    debug!(original = %path.display(), temporary = %temporary.display(), "isolated");
    Ok(IsolatedPath {
        original: path.to_path_buf(),
        temporary,
    })
}

/// Best-effort removal of an isolated copy. Returns whether the path is gone.
pub fn release(isolated: &IsolatedPath) -> bool {
    release_path(&isolated.temporary)
}

/// Best-effort removal of a single path. Failures are logged, never raised.
pub fn release_path(path: &Path) -> bool {
    match remove_path(path) {
        Ok(()) => true,
        Err(err) => {
            warn!(path = %path.display(), error = %err, "cleanup failed");
            false
        }
    }
}

fn remove_path(path: &Path) -> io::Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path),
        Ok(_) => fs::remove_file(path),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

fn copy_path(src: &Path, dst: &Path) -> io::Result<()> {
    let meta = fs::metadata(src)?;
    if meta.is_dir() {
        copy_dir(src, dst)
    } else {
        fs::copy(src, dst).map(|_| ())
    }
}

fn copy_dir(src: &Path, dst: &Path) -> io::Result<()> {
    fs::create_dir_all(dst)?;
    for entry in walkdir::WalkDir::new(src).follow_links(true) {
        let entry = entry.map_err(io::Error::from)?;
        let rel = match entry.path().strip_prefix(src) {
            Ok(rel) if !rel.as_os_str().is_empty() => rel,
            _ => continue,
        };
        let target = dst.join(rel);
        if entry.file_type().is_dir() {
            fs::create_dir_all(&target)?;
        } else {
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::copy(entry.path(), &target)?;
        }
    }
    Ok(())
}

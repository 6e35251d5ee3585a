//! Release of temporary artifacts and the per-directory run lock.
//!
//! A run holds a [`RunLock`] (`.tipsy-run.json`, created exclusively) that
//! doubles as a manifest of every temporary path the run may create. The
//! [`ArtifactGuard`] removes those paths exactly once, on the normal path or
//! when dropped during unwinding. If the process dies before that, the next
//! run (or `tipsy clean`) finds the manifest, sees its owner is gone and
//! releases what it lists.

use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

use chrono::Utc;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{info, warn};

use crate::isolate;

pub const RUN_LOCK_FILE: &str = ".tipsy-run.json";
const MANIFEST_SCHEMA: &str = "tipsy_run_v1";

#[derive(Debug, Error)]
pub enum CleanupError {
    #[error("run_in_progress: another tipsy run (pid {pid}) owns {path}")]
    RunInProgress { pid: u32, path: PathBuf },
    #[error("failed to access run lock {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("unreadable run lock {path}: {message}")]
    Manifest { path: PathBuf, message: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunManifest {
    pub schema_version: String,
    pub pid: u32,
    pub acquired_at: String,
    #[serde(default)]
    pub artifacts: Vec<PathBuf>,
}

/// Paths removed and paths that could not be removed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CleanupReport {
    pub removed: Vec<PathBuf>,
    pub failed: Vec<PathBuf>,
}

impl CleanupReport {
    pub fn is_clean(&self) -> bool {
        self.failed.is_empty()
    }
}

pub fn lock_path(working_dir: &Path) -> PathBuf {
    working_dir.join(RUN_LOCK_FILE)
}

#[derive(Debug)]
pub struct RunLock {
    path: PathBuf,
    manifest: RunManifest,
    armed: bool,
}

impl RunLock {
    /// Takes the lock for `working_dir`, first recovering a lock left by a
    /// process that no longer exists.
    pub fn acquire(working_dir: &Path) -> Result<Self, CleanupError> {
        let path = lock_path(working_dir);
        match Self::create(&path) {
            Err(CleanupError::Io { source, .. }) if source.kind() == io::ErrorKind::AlreadyExists => {
                let report = recover(working_dir)?;
                if !report.is_clean() {
                    warn!(failed = report.failed.len(), "stale artifacts could not all be removed");
                }
                Self::create(&path)
            }
            other => other,
        }
    }

    fn create(path: &Path) -> Result<Self, CleanupError> {
        let io_err = |source| CleanupError::Io {
            path: path.to_path_buf(),
            source,
        };
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(io_err)?;
        let manifest = RunManifest {
            schema_version: MANIFEST_SCHEMA.to_string(),
            pid: std::process::id(),
            acquired_at: Utc::now().to_rfc3339(),
            artifacts: Vec::new(),
        };
        let bytes = manifest_bytes(path, &manifest)?;
        if let Err(source) = file.write_all(&bytes).and_then(|_| file.sync_all()) {
            // An empty or partial lock would block the next run.
            let _ = fs::remove_file(path);
            return Err(io_err(source));
        }
        Ok(Self {
            path: path.to_path_buf(),
            manifest,
            armed: true,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn manifest(&self) -> &RunManifest {
        &self.manifest
    }

    /// Adds `artifact` to the manifest on disk. Call before creating it.
    pub fn record(&mut self, artifact: &Path) -> Result<(), CleanupError> {
        if !self.manifest.artifacts.iter().any(|a| a == artifact) {
            self.manifest.artifacts.push(artifact.to_path_buf());
            self.persist()?;
        }
        Ok(())
    }

    /// Leaves the lock file on disk listing only `remaining`, for a later
    /// recovery to retry.
    fn retain(mut self, remaining: Vec<PathBuf>) {
        self.manifest.artifacts = remaining;
        if let Err(e) = self.persist() {
            warn!(path = %self.path.display(), error = %e, "failed to update run lock");
        }
        self.armed = false;
    }

    fn persist(&self) -> Result<(), CleanupError> {
        let bytes = manifest_bytes(&self.path, &self.manifest)?;
        atomic_write_bytes(&self.path, &bytes).map_err(|source| CleanupError::Io {
            path: self.path.clone(),
            source,
        })
    }
}

impl Drop for RunLock {
    fn drop(&mut self) {
        if self.armed {
            let _ = fs::remove_file(&self.path);
        }
    }
}

fn manifest_bytes(path: &Path, manifest: &RunManifest) -> Result<Vec<u8>, CleanupError> {
    let mut bytes = serde_json::to_vec_pretty(manifest).map_err(|e| CleanupError::Manifest {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    bytes.push(b'\n');
    Ok(bytes)
}

fn atomic_write_bytes(path: &Path, bytes: &[u8]) -> io::Result<()> {
    let name = path
        .file_name()
        .and_then(|s| s.to_str())
        .unwrap_or("tipsy-run");
    let tmp = path.with_file_name(format!(
        ".{}.tmp.{}.{}",
        name,
        std::process::id(),
        Utc::now().timestamp_micros()
    ));
    let mut file = fs::File::create(&tmp)?;
    file.write_all(bytes)?;
    file.sync_all()?;
    fs::rename(&tmp, path)
}

fn read_manifest(path: &Path) -> Result<RunManifest, CleanupError> {
    let raw = fs::read_to_string(path).map_err(|source| CleanupError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    serde_json::from_str(&raw).map_err(|e| CleanupError::Manifest {
        path: path.to_path_buf(),
        message: e.to_string(),
    })
}

pub fn process_alive(pid: u32) -> bool {
    if pid == std::process::id() {
        return true;
    }
    Command::new("kill")
        .arg("-0")
        .arg(pid.to_string())
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|s| s.success())
        .unwrap_or(false)
}

/// Releases artifacts listed by an abandoned run lock in `working_dir`.
///
/// Returns an empty report when there is no lock. A lock whose owner is
/// still running is left alone.
pub fn recover(working_dir: &Path) -> Result<CleanupReport, CleanupError> {
    let path = lock_path(working_dir);
    if !path.exists() {
        return Ok(CleanupReport::default());
    }
    let manifest = match read_manifest(&path) {
        Ok(manifest) => manifest,
        // A lock truncated by a crash mid-write lists nothing worth keeping.
        Err(CleanupError::Manifest { message, .. }) => {
            warn!(path = %path.display(), %message, "discarding unreadable run lock");
            RunManifest {
                schema_version: MANIFEST_SCHEMA.to_string(),
                pid: 0,
                acquired_at: String::new(),
                artifacts: Vec::new(),
            }
        }
        Err(e) => return Err(e),
    };
    if manifest.pid != 0 && process_alive(manifest.pid) {
        return Err(CleanupError::RunInProgress {
            pid: manifest.pid,
            path,
        });
    }
    info!(
        pid = manifest.pid,
        artifacts = manifest.artifacts.len(),
        "recovering abandoned run"
    );
    let report = release_all(&manifest.artifacts);
    if report.is_clean() {
        fs::remove_file(&path).map_err(|source| CleanupError::Io {
            path: path.clone(),
            source,
        })?;
    }
    Ok(report)
}

fn release_all(paths: &[PathBuf]) -> CleanupReport {
    let mut report = CleanupReport::default();
    for path in paths {
        if isolate::release_path(path) {
            report.removed.push(path.clone());
        } else {
            report.failed.push(path.clone());
        }
    }
    report
}

/// Owns the temporary paths of one run and removes them exactly once.
#[derive(Debug, Default)]
pub struct ArtifactGuard {
    artifacts: Vec<PathBuf>,
    lock: Option<RunLock>,
    released: bool,
}

impl ArtifactGuard {
    pub fn new() -> Self {
        Self::default()
    }

    /// A guard that records every tracked path in `lock` and gives the lock
    /// up once everything is released.
    pub fn with_lock(lock: RunLock) -> Self {
        Self {
            artifacts: Vec::new(),
            lock: Some(lock),
            released: false,
        }
    }

    /// Registers `path` for release. Call before the path is created.
    pub fn track(&mut self, path: &Path) -> Result<(), CleanupError> {
        if let Some(lock) = self.lock.as_mut() {
            lock.record(path)?;
        }
        if !self.artifacts.iter().any(|a| a == path) {
            self.artifacts.push(path.to_path_buf());
        }
        Ok(())
    }

    pub fn artifacts(&self) -> &[PathBuf] {
        &self.artifacts
    }

    /// Removes every tracked path. Later calls return an empty report.
    pub fn release(&mut self) -> CleanupReport {
        if self.released {
            return CleanupReport::default();
        }
        self.released = true;
        let report = release_all(&self.artifacts);
        if let Some(lock) = self.lock.take() {
            if !report.is_clean() {
                lock.retain(report.failed.clone());
            }
        }
        info!(
            removed = report.removed.len(),
            failed = report.failed.len(),
            "artifacts released"
        );
        report
    }
}

impl Drop for ArtifactGuard {
    fn drop(&mut self) {
        if !self.released {
            let _ = self.release();
        }
    }
}

//! Inter-process advisory locks backed by marker files.
//!
//! A lock is held by whoever manages to create the marker file. Creation uses
//! `create_new` (O_CREAT | O_EXCL), so exactly one process wins a race. Holders
//! that crash leave the marker behind; those markers are reclaimed once their
//! modification time is older than the stale age.
//!
//! # Marker Layout
//!
//! Location: `{guarded path}.lock`, next to the file it protects.
//!
//! ```text
//! pid=48213
//! acquired=2026-10-19T09:14:03.118Z
//! ```
//!
//! The content is diagnostic only. Readers never parse it; staleness is decided
//! from the file's mtime alone. Waiters reclaim a stale marker one at a time,
//! under a short-lived `{marker}.reclaim` guard created the same way.

use std::ffi::OsString;
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant, SystemTime};

use chrono::{SecondsFormat, Utc};
use fs_err as fs;
use tracing::debug;

use crate::error::{GateError, Result};

/// Suffix appended to a guarded path to form its marker path.
pub const LOCK_SUFFIX: &str = ".lock";

/// Suffix appended to a marker path while a waiter reclaims it.
const RECLAIM_SUFFIX: &str = ".reclaim";

pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(10);
pub const DEFAULT_STALE_AGE: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LockOptions {
    /// Total time to keep polling before giving up.
    pub timeout: Duration,
    pub poll_interval: Duration,
    /// Markers older than this are presumed abandoned.
    pub stale_age: Duration,
}

impl Default for LockOptions {
    fn default() -> Self {
        Self {
            timeout: DEFAULT_TIMEOUT,
            poll_interval: DEFAULT_POLL_INTERVAL,
            stale_age: DEFAULT_STALE_AGE,
        }
    }
}

/// Returns the marker path guarding `path` (the path with [`LOCK_SUFFIX`] appended).
pub fn lock_path_for(path: &Path) -> PathBuf {
    let mut marker = OsString::from(path.as_os_str());
    marker.push(LOCK_SUFFIX);
    PathBuf::from(marker)
}

/// A held lock. The marker is removed on [`LockGuard::release`] or drop.
#[derive(Debug)]
pub struct LockGuard {
    path: PathBuf,
    held: bool,
}

impl LockGuard {
    /// Acquires the marker at `path`, polling until `options.timeout` elapses.
    ///
    /// Returns [`GateError::LockTimeout`] when another live holder keeps the
    /// marker for the whole window. Any other I/O failure while creating the
    /// marker (permission denied, missing volume) is returned as-is.
    pub fn acquire(path: &Path, options: &LockOptions) -> Result<LockGuard> {
        let started = Instant::now();

        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent)
                .map_err(|e| GateError::io("create lock directory", e))?;
        }

        loop {
            match create_marker(path) {
                Ok(()) => {
                    return Ok(LockGuard {
                        path: path.to_path_buf(),
                        held: true,
                    })
                }
                Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                    if reclaim_if_stale(path, options.stale_age) {
                        continue;
                    }
                }
                Err(err) => {
                    return Err(GateError::io(
                        format!("create lock marker {}", path.display()),
                        err,
                    ))
                }
            }

            let waited = started.elapsed();
            if waited >= options.timeout {
                return Err(GateError::LockTimeout {
                    path: path.to_path_buf(),
                    waited_ms: waited.as_millis() as u64,
                });
            }
            thread::sleep(options.poll_interval.min(options.timeout - waited));
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Removes the marker. A marker that is already gone is not an error.
    pub fn release(mut self) {
        self.release_marker();
    }

    fn release_marker(&mut self) {
        if !self.held {
            return;
        }
        self.held = false;
        if let Err(err) = fs::remove_file(&self.path) {
            if err.kind() != ErrorKind::NotFound {
                debug!(path = %self.path.display(), error = %err, "Failed to remove lock marker");
            }
        }
    }
}

impl Drop for LockGuard {
    fn drop(&mut self) {
        self.release_marker();
    }
}

/// How a scoped critical section ended up running.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockOutcome {
    Held,
    /// Acquisition timed out and the section ran without the lock.
    FailedOpen,
}

/// Runs `f` while holding the marker at `path`.
///
/// With `fail_open`, a timeout runs `f` anyway with [`LockOutcome::FailedOpen`]
/// so the caller can skip work that is unsafe without exclusion. Without it the
/// timeout is returned. Errors other than a timeout are always returned.
pub fn with_lock<T>(
    path: &Path,
    options: &LockOptions,
    fail_open: bool,
    f: impl FnOnce(LockOutcome) -> Result<T>,
) -> Result<T> {
    match LockGuard::acquire(path, options) {
        Ok(guard) => {
            let result = f(LockOutcome::Held);
            guard.release();
            result
        }
        Err(GateError::LockTimeout { path, waited_ms }) if fail_open => {
            debug!(
                path = %path.display(),
                waited_ms,
                "Lock acquisition timed out; proceeding without lock"
            );
            f(LockOutcome::FailedOpen)
        }
        Err(err) => Err(err),
    }
}

fn create_marker(path: &Path) -> std::io::Result<()> {
    let mut file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(path)?;

    let content = format!(
        "pid={}\nacquired={}\n",
        std::process::id(),
        Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
    );
    if let Err(err) = file.write_all(content.as_bytes()) {
        // The marker is ours even with no content; drop it so nobody waits on it.
        let _ = fs::remove_file(path);
        return Err(err);
    }
    Ok(())
}

/// Deletes the marker if it is older than `stale_age`.
///
/// Returns true when the caller should retry creation immediately: either the
/// stale marker was removed, or the marker vanished between the failed create
/// and this check.
///
/// Removal happens only while holding `{marker}.reclaim` and after a second
/// stat under it, so only a marker that is still stale is ever deleted.
fn reclaim_if_stale(path: &Path, stale_age: Duration) -> bool {
    match marker_age(path) {
        Ok(age) if age > stale_age => {}
        Ok(_) => return false,
        Err(err) => return err.kind() == ErrorKind::NotFound,
    }

    let guard = reclaim_path_for(path);
    if let Err(err) = create_marker(&guard) {
        if err.kind() == ErrorKind::AlreadyExists {
            clear_abandoned_guard(&guard, stale_age);
        }
        return false;
    }

    let reclaimed = match marker_age(path) {
        Ok(age) if age > stale_age => match fs::remove_file(path) {
            Ok(()) => {
                debug!(
                    path = %path.display(),
                    age_ms = age.as_millis() as u64,
                    "Reclaimed stale lock marker"
                );
                true
            }
            Err(err) => err.kind() == ErrorKind::NotFound,
        },
        Ok(_) => false,
        Err(err) => err.kind() == ErrorKind::NotFound,
    };

    if let Err(err) = fs::remove_file(&guard) {
        if err.kind() != ErrorKind::NotFound {
            debug!(path = %guard.display(), error = %err, "Failed to remove reclaim guard");
        }
    }
    reclaimed
}

fn reclaim_path_for(path: &Path) -> PathBuf {
    let mut guard = OsString::from(path.as_os_str());
    guard.push(RECLAIM_SUFFIX);
    PathBuf::from(guard)
}

/// A reclaim guard is held for a few syscalls. One older than `stale_age`
/// belongs to a reclaimer that died mid-way.
fn clear_abandoned_guard(guard: &Path, stale_age: Duration) {
    if matches!(marker_age(guard), Ok(age) if age > stale_age) {
        let _ = fs::remove_file(guard);
    }
}

/// Time since the marker was last modified. An mtime in the future (clock
/// skew) counts as fresh.
fn marker_age(path: &Path) -> std::io::Result<Duration> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(SystemTime::now()
        .duration_since(modified)
        .unwrap_or_default())
}

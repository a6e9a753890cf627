//! Detection of the system clock being set backwards between runs.
//!
//! A small JSON record (`{"last_run": <timestamp>}`) remembers the latest
//! time any verification observed. A later run whose clock is behind that
//! mark by more than the tolerance is refused.
//!
//! The read-check-write sequence holds an exclusive lock on a sidecar
//! `<record>.lock` file, so concurrent verifications (threads or processes)
//! are serialized and cannot both act on a stale mark. The record itself
//! is replaced atomically.

use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeDelta, Utc};
use serde_derive::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::error::{LicenseError, LicenseResult};
use crate::persist;

/// Allowed backwards clock drift (NTP corrections and the like).
pub const DEFAULT_ROLLBACK_TOLERANCE_SECS: i64 = 10 * 60;

/// The persisted last-observed time.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Deserialize, Serialize)]
pub struct ClockGuardRecord {
    pub last_run: DateTime<Utc>,
}

/// Anti-rollback guard backed by a record on disk. One per installation.
#[derive(Debug, Clone)]
pub struct ClockGuard {
    path: PathBuf,
    tolerance: TimeDelta,
}

impl ClockGuard {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            tolerance: TimeDelta::seconds(DEFAULT_ROLLBACK_TOLERANCE_SECS),
        }
    }

    pub fn with_tolerance(mut self, tolerance: TimeDelta) -> Self {
        self.tolerance = tolerance;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn tolerance(&self) -> TimeDelta {
        self.tolerance
    }

    /// Verifies the clock has not been rolled back and advances the mark.
    ///
    /// Without a record this is a first run: `now` is stored and the check
    /// passes. With one, fails if `now + tolerance < last_run`; otherwise the
    /// mark becomes `max(last_run, now)`, so small backwards steps cannot be
    /// chained to walk it back.
    ///
    /// A record that exists but cannot be parsed is an error and is left in
    /// place, as is the record when `now + tolerance` is not representable.
    pub fn check_and_advance(&self, clock: &dyn Clock) -> LicenseResult<()> {
        let _lock = self.lock()?;
        let now = clock.now();

        let next = match self.read_record()? {
            None => {
                debug!(guard_path = %self.path.display(), "no clock guard record, first run");
                now
            }
            Some(record) => {
                let earliest_allowed = now.checked_add_signed(self.tolerance).ok_or_else(|| {
                    LicenseError::InvalidInput(format!(
                        "rollback tolerance {} is out of range",
                        self.tolerance
                    ))
                })?;
                if earliest_allowed < record.last_run {
                    warn!(
                        guard_path = %self.path.display(),
                        last_observed = %record.last_run,
                        now = %now,
                        "system clock moved backwards beyond tolerance"
                    );
                    return Err(LicenseError::ClockRollbackDetected {
                        last_observed: record.last_run,
                        now,
                    });
                }
                record.last_run.max(now)
            }
        };

        self.write_record(&ClockGuardRecord { last_run: next })
    }

    /// The stored mark, if any. Does not take the lock.
    pub fn last_observed(&self) -> LicenseResult<Option<DateTime<Utc>>> {
        Ok(self.read_record()?.map(|record| record.last_run))
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self
            .path
            .file_name()
            .map(OsString::from)
            .unwrap_or_else(|| OsString::from("clock-guard"));
        name.push(".lock");
        self.path.with_file_name(name)
    }

    /// Exclusive lock held until the returned file is dropped.
    fn lock(&self) -> LicenseResult<File> {
        let lock_path = self.lock_path();
        if let Some(dir) = lock_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(dir).map_err(|e| LicenseError::io(dir, e))?;
        }
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| LicenseError::io(&lock_path, e))?;
        file.lock().map_err(|e| LicenseError::io(&lock_path, e))?;
        Ok(file)
    }

    fn read_record(&self) -> LicenseResult<Option<ClockGuardRecord>> {
        let bytes = match fs::read(&self.path) {
            Ok(bytes) => bytes,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(LicenseError::io(&self.path, e)),
        };
        serde_json::from_slice(&bytes)
            .map(Some)
            .map_err(|e| LicenseError::MalformedClockGuard(e.to_string()))
    }

    fn write_record(&self, record: &ClockGuardRecord) -> LicenseResult<()> {
        let bytes = serde_json::to_vec(record)
            .map_err(|e| LicenseError::MalformedClockGuard(e.to_string()))?;
        persist::write_atomic(&self.path, &bytes)
    }
}

//! Coverage dump policy: snapshot isolation, locking, and telemetry.

use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use crate::data::{self, CoverageData};
use crate::lock::FileLock;
use crate::Result;

/// Serializes dumps from every runtime in this process.
static DUMP_SERIAL: Mutex<()> = Mutex::new(());

/// Outcome of a successful dump.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DumpReport {
    /// Absolute output path.
    pub path: PathBuf,
    /// Whether data was merged into an existing file.
    pub merged: bool,
    /// Number of classes written.
    pub classes: usize,
    /// Wall time spent locking and writing.
    pub elapsed: Duration,
}

impl fmt::Display for DumpReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "runtime coverage data {} [{}] {{in {} ms}}",
            if self.merged { "merged into" } else { "written to" },
            self.path.display(),
            self.elapsed.as_millis()
        )
    }
}

/// Releases the wrapped lock when dropped.
struct Held<'a>(&'a mut dyn FileLock);

impl Drop for Held<'_> {
    fn drop(&mut self) {
        self.0.release();
        debug!("coverage output file unlocked");
    }
}

/// Writes `data` to `out_file`, optionally under `lock`.
///
/// Returns `Ok(None)` without touching the lock when `data` is absent.
/// With `use_snapshot`, the store is shallow-copied before waiting on the
/// serial or file lock, so classes registered after the call starts are
/// not part of the dump; otherwise the store stays locked until the
/// write completes. A lock that cannot be acquired
/// aborts the dump before anything is written.
pub fn dump_coverage(
    data: Option<&CoverageData>,
    use_snapshot: bool,
    out_file: &Path,
    merge: bool,
    lock: Option<&mut dyn FileLock>,
) -> Result<Option<DumpReport>> {
    let Some(data) = data else {
        return Ok(None);
    };
    let path = std::path::absolute(out_file).unwrap_or_else(|_| out_file.to_path_buf());
    let start = Instant::now();

    let copy = use_snapshot.then(|| data.shallow_copy());

    let _serial = DUMP_SERIAL.lock().unwrap_or_else(PoisonError::into_inner);
    let held = match lock {
        Some(lock) => {
            info!(path = %path.display(), ?lock, "locking coverage output file");
            let mut held = Held(lock);
            if let Err(e) = held.0.acquire() {
                error!(path = %path.display(), error = %e, "lock for coverage data file could not be acquired");
                error!("coverage data dump aborted");
                return Err(e.into());
            }
            Some(held)
        }
        None => None,
    };

    let classes = match copy {
        Some(copy) => {
            let snapshot = copy.snapshot();
            data::persist(&snapshot, out_file, merge)?;
            snapshot.len()
        }
        None => {
            let guard = data.lock();
            let snapshot = guard.snapshot();
            data::persist(&snapshot, out_file, merge)?;
            snapshot.len()
        }
    };
    drop(held);

    let report = DumpReport {
        path,
        merged: merge,
        classes,
        elapsed: start.elapsed(),
    };
    info!("{report}");
    Ok(Some(report))
}

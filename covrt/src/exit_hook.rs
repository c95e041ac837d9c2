//! End-of-life coverage dump.
//!
//! An [`ExitHook`] captures the store and output settings when armed and
//! writes the data once, either when the host calls
//! [`Runtime::terminate`](crate::Runtime::terminate) or when SIGINT/SIGTERM
//! arrives (see [`watch_signals`]).

use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::debug;

use crate::data::CoverageData;
use crate::lock::{FileLock, SocketMutex};
use crate::persist::{self, DumpReport};
use crate::Result;

/// What the hook writes, and where.
#[derive(Debug)]
struct Armed {
    data: Option<Arc<CoverageData>>,
    out_file: PathBuf,
    merge: bool,
    lock: Option<SocketMutex>,
}

/// A one-shot coverage dump.
#[derive(Debug)]
pub struct ExitHook {
    armed: Mutex<Option<Armed>>,
}

impl ExitHook {
    /// Arms a hook that will dump `data` to `out_file`.
    pub fn new(
        data: Option<Arc<CoverageData>>,
        out_file: PathBuf,
        merge: bool,
        lock: Option<SocketMutex>,
    ) -> Self {
        Self {
            armed: Mutex::new(Some(Armed {
                data,
                out_file,
                merge,
                lock,
            })),
        }
    }

    fn armed(&self) -> MutexGuard<'_, Option<Armed>> {
        self.armed.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` until the hook has run or been disarmed.
    pub fn is_armed(&self) -> bool {
        self.armed().is_some()
    }

    /// Prevents any future run. Returns `true` if the hook was armed.
    pub fn disarm(&self) -> bool {
        let was_armed = self.armed().take().is_some();
        if was_armed {
            debug!("coverage exit hook disarmed");
        }
        was_armed
    }

    /// Dumps the captured data unless already run or disarmed.
    ///
    /// Holds the hook's state for the duration, so a concurrent
    /// [`disarm`](Self::disarm) waits for the dump to finish.
    pub fn run(&self) -> Result<Option<DumpReport>> {
        let mut armed = self.armed();
        let Some(mut hook) = armed.take() else {
            return Ok(None);
        };
        persist::dump_coverage(
            hook.data.as_deref(),
            true,
            &hook.out_file,
            hook.merge,
            hook.lock.as_mut().map(|l| l as &mut dyn FileLock),
        )
    }
}

/// Runs `on_signal` on the first SIGINT or SIGTERM, then lets the signal's
/// default action proceed.
///
/// Returns a handle that stops watching when [`close`d].
///
/// [`close`d]: signal_hook::iterator::Handle::close
#[cfg(unix)]
pub fn watch_signals(
    on_signal: impl FnOnce() + Send + 'static,
) -> std::io::Result<signal_hook::iterator::Handle> {
    use signal_hook::consts::{SIGINT, SIGTERM};
    use signal_hook::iterator::Signals;

    let mut signals = Signals::new([SIGINT, SIGTERM])?;
    let handle = signals.handle();
    std::thread::Builder::new()
        .name("covrt-signals".to_owned())
        .spawn(move || {
            if let Some(sig) = signals.forever().next() {
                debug!(signal = sig, "termination signal received");
                on_signal();
                if let Err(e) = signal_hook::low_level::emulate_default_handler(sig) {
                    tracing::error!(error = %e, "failed to re-raise signal");
                }
            }
        })?;
    Ok(handle)
}

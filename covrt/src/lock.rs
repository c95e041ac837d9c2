//! Machine-wide mutual exclusion for coverage output files.
//!
//! Holding the lock means holding an exclusive UDP port derived from the
//! file's canonical path. Every process that computes the lock for the
//! same file lands on the same port, and the OS frees the port when the
//! holder dies, so a crashed process never leaves a stale lock behind.

use std::fmt;
use std::io;
use std::net::{Ipv4Addr, UdpSocket};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use rand::Rng;
use sha2::{Digest, Sha256};
use tracing::{debug, trace};

/// Default first port of the lock range.
pub const DEFAULT_PORT_BASE: u16 = 59141;

/// Highest usable port base; the range spans 255 ports above it.
pub const MAX_PORT_BASE: u16 = u16::MAX - PORT_SPAN;

/// Default acquisition timeout in milliseconds.
pub const DEFAULT_TIMEOUT_MS: u64 = 120_000;

/// Default retry budget.
pub const DEFAULT_RETRIES: u32 = 11;

/// Number of ports a path can map to above the base.
const PORT_SPAN: u16 = 255;

/// Retry budgets above this are clamped.
const MAX_RETRIES: u32 = 32;

/// Reasons a lock attempt fails.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum LockError {
    /// This instance already holds the lock.
    #[error("file lock already acquired by this instance")]
    AlreadyHeld,

    /// The OS refused access to the lock port.
    #[error("permission denied binding file lock port {port}")]
    Denied {
        /// Lock port.
        port: u16,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// The port is busy, most likely held by another process.
    #[error("file lock port {port} unavailable")]
    Failure {
        /// Lock port.
        port: u16,
        /// Underlying socket error.
        #[source]
        source: io::Error,
    },

    /// The retry budget or timeout ran out.
    #[error("file lock not acquired within {0:?}")]
    Timeout(Duration),

    /// The configured port base leaves no room for the port range.
    #[error("file lock port base {0} outside [0, {MAX_PORT_BASE}]")]
    InvalidPortBase(u16),
}

impl LockError {
    /// Errors that retrying cannot fix.
    const fn is_fatal(&self) -> bool {
        matches!(self, Self::AlreadyHeld | Self::Denied { .. })
    }
}

/// A lock on an output file shared between processes.
///
/// Implementors provide a single attempt in [`try_acquire`](Self::try_acquire);
/// [`acquire`](Self::acquire) layers the retry policy on top.
pub trait FileLock: fmt::Debug + Send {
    /// Makes one acquisition attempt.
    fn try_acquire(&mut self) -> Result<(), LockError>;

    /// Releases the lock. Calling this when not held is a no-op.
    fn release(&mut self);

    /// Overall time budget for [`acquire`](Self::acquire).
    fn timeout(&self) -> Duration;

    /// Number of retries after the first failed attempt.
    fn retries(&self) -> u32;

    /// Acquires the lock, retrying with exponential backoff.
    ///
    /// [`LockError::AlreadyHeld`] and [`LockError::Denied`] fail at once.
    /// Other failures are retried `retries()` times, the k-th retry waiting
    /// about `timeout * 2^k / (2^retries - 1)` plus a few milliseconds of
    /// jitter, until the timeout elapses.
    fn acquire(&mut self) -> Result<(), LockError> {
        let first = match self.try_acquire() {
            Ok(()) => return Ok(()),
            Err(e) => e,
        };
        let timeout = self.timeout();
        let retries = self.retries().min(MAX_RETRIES);
        if first.is_fatal() || timeout.as_millis() < 1 || retries < 1 {
            return Err(first);
        }

        let start = Instant::now();
        for k in 0..retries {
            let delay = backoff(timeout, retries, k, jitter());
            trace!(attempt = k + 1, ?delay, "file lock busy, backing off");
            std::thread::sleep(delay);
            match self.try_acquire() {
                Ok(()) => return Ok(()),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => debug!(attempt = k + 1, error = %e, "file lock retry failed"),
            }
            if start.elapsed() >= timeout {
                break;
            }
        }
        Err(LockError::Timeout(timeout))
    }
}

/// Delay before retry `k` (zero-based) out of `retries`.
fn backoff(timeout: Duration, retries: u32, k: u32, jitter: i64) -> Duration {
    let denom = (1u128 << retries) - 1;
    let base = timeout.as_millis().saturating_mul(1u128 << k) / denom;
    let ms = i64::try_from(base).unwrap_or(i64::MAX).saturating_add(jitter);
    Duration::from_millis(u64::try_from(ms.max(1)).unwrap_or(1))
}

/// Random offset in `-5..5` milliseconds added to each backoff delay.
fn jitter() -> i64 {
    rand::rng().random_range(-5..5)
}

/// File lock backed by an exclusively bound UDP port.
pub struct SocketMutex {
    /// Port derived from the locked file.
    port: u16,
    /// Acquisition time budget.
    timeout: Duration,
    /// Retry budget.
    retries: u32,
    /// Bound socket while held.
    socket: Option<UdpSocket>,
}

impl SocketMutex {
    /// Creates a mutex on an explicit port.
    pub const fn new(port: u16, timeout: Duration, retries: u32) -> Self {
        Self {
            port,
            timeout,
            retries,
            socket: None,
        }
    }

    /// Creates the mutex guarding `file`, on a port derived from its
    /// canonical path.
    pub fn for_file(
        file: &Path,
        port_base: u16,
        timeout: Duration,
        retries: u32,
    ) -> Result<Self, LockError> {
        Ok(Self::new(lock_port(file, port_base)?, timeout, retries))
    }

    /// The lock port.
    pub const fn port(&self) -> u16 {
        self.port
    }

    /// Returns `true` while this instance holds the lock.
    pub const fn is_held(&self) -> bool {
        self.socket.is_some()
    }
}

impl fmt::Debug for SocketMutex {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SocketMutex")
            .field("port", &self.port)
            .field("timeout", &self.timeout)
            .field("retries", &self.retries)
            .field("held", &self.is_held())
            .finish()
    }
}

impl FileLock for SocketMutex {
    fn try_acquire(&mut self) -> Result<(), LockError> {
        if self.socket.is_some() {
            return Err(LockError::AlreadyHeld);
        }
        let port = self.port;
        let socket = UdpSocket::bind((Ipv4Addr::UNSPECIFIED, port)).map_err(|source| {
            if source.kind() == io::ErrorKind::PermissionDenied {
                LockError::Denied { port, source }
            } else {
                LockError::Failure { port, source }
            }
        })?;
        self.socket = Some(socket);
        Ok(())
    }

    fn release(&mut self) {
        self.socket = None;
    }

    fn timeout(&self) -> Duration {
        self.timeout
    }

    fn retries(&self) -> u32 {
        self.retries
    }
}

impl Drop for SocketMutex {
    fn drop(&mut self) {
        self.release();
    }
}

/// Maps `file` to its lock port: `port_base + hash(canonical path) % 255`.
///
/// Distinct paths may collide on a port; they then merely serialize
/// against each other.
pub fn lock_port(file: &Path, port_base: u16) -> Result<u16, LockError> {
    if port_base > MAX_PORT_BASE {
        return Err(LockError::InvalidPortBase(port_base));
    }
    let canonical = canonical_path(file);
    let digest = Sha256::digest(canonical.as_os_str().as_encoded_bytes());
    let head = u32::from_be_bytes([digest[0], digest[1], digest[2], digest[3]]);
    // Remainder is below PORT_SPAN.
    #[allow(clippy::cast_possible_truncation)]
    let offset = (head % u32::from(PORT_SPAN)) as u16;
    Ok(port_base + offset)
}

/// Best-effort canonical form of a path that may not exist yet.
pub fn canonical_path(file: &Path) -> PathBuf {
    if let Ok(p) = file.canonicalize() {
        return p;
    }
    if let (Some(parent), Some(name)) = (file.parent(), file.file_name()) {
        let parent = if parent.as_os_str().is_empty() {
            Path::new(".")
        } else {
            parent
        };
        if let Ok(dir) = parent.canonicalize() {
            return dir.join(name);
        }
    }
    std::path::absolute(file).unwrap_or_else(|_| file.to_path_buf())
}

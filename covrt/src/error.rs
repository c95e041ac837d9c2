//! Error types for covrt operations.

use covrt_proto::ErrorValue;

use crate::lock::LockError;

/// Alias for `Result<T, covrt::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors returned by the control service, client, and persistence layer.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// Malformed message or command usage error.
    #[error(transparent)]
    Proto(#[from] covrt_proto::Error),

    /// The control port could not be bound.
    #[error("cannot bind runtime control port {port}")]
    Bind {
        /// Requested port.
        port: u16,
        /// Underlying socket error.
        #[source]
        source: std::io::Error,
    },

    /// `start()` was called on a controller that is already running.
    #[error("runtime controller already started")]
    AlreadyStarted,

    /// The cross-process output lock could not be obtained.
    #[error(transparent)]
    Lock(#[from] LockError),

    /// The server reported a failure while executing a request.
    #[error("server-side failure: {0}")]
    Remote(#[source] ErrorValue),

    /// The properties file is not valid JSON.
    #[error("malformed properties file: {0}")]
    Properties(#[from] serde_json::Error),

    /// A request argument could not be interpreted.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// The runtime that owns the controller has been dropped.
    #[error("runtime no longer available")]
    RuntimeUnavailable,

    /// Coverage file has an unexpected header.
    #[error("{path}: not a coverage data file")]
    BadDataFile {
        /// Offending file.
        path: std::path::PathBuf,
    },

    /// An I/O error from sockets or coverage files.
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

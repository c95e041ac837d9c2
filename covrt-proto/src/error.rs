//! Error types for the control protocol.

use std::io;
use std::string::FromUtf8Error;

/// Alias for `Result<T, covrt_proto::Error>`.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors raised while building, encoding, or decoding control messages.
///
/// Usage errors ([`Error::is_usage`]) are detected before anything reaches
/// the wire. Everything else is a protocol error seen by the side that
/// reads or writes malformed bytes.
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum Error {
    /// No command is registered under this name.
    #[error("unknown control command [{0}]")]
    UnknownCommand(String),

    /// More arguments were supplied than the command accepts.
    #[error("too many arguments for [{name}], usage: {usage}")]
    TooManyArguments {
        /// Command name.
        name: &'static str,
        /// Number of arguments supplied.
        given: usize,
        /// Usage line for the command.
        usage: &'static str,
    },

    /// A response carried a payload tag this decoder does not know.
    #[error("unknown response payload tag {0}")]
    UnknownPayloadTag(u8),

    /// A request header declared a negative or oversized argument count.
    #[error("invalid request argument count {0}")]
    InvalidArgCount(i32),

    /// An argument slot presence byte was neither 0 nor 1.
    #[error("invalid argument presence flag {0}")]
    InvalidPresenceFlag(u8),

    /// A string or byte field exceeds the encodable limit.
    #[error("field of {len} bytes exceeds the {max} byte limit")]
    TooLong {
        /// Actual length.
        len: usize,
        /// Maximum allowed length.
        max: usize,
    },

    /// A string field was not valid UTF-8.
    #[error("invalid UTF-8 in string field")]
    InvalidUtf8(#[from] FromUtf8Error),

    /// The snapshot body failed to (de)serialize.
    #[error("coverage snapshot encoding: {0}")]
    Snapshot(#[from] postcard::Error),

    /// The snapshot carries a version byte this build cannot read.
    #[error("unsupported coverage snapshot version {0}")]
    UnsupportedSnapshotVersion(u8),

    /// The snapshot body was empty.
    #[error("empty coverage snapshot")]
    EmptySnapshot,

    /// An error payload nests causes deeper than allowed.
    #[error("error cause chain deeper than {0} levels")]
    CauseTooDeep(usize),

    /// Transport failure, including a peer closing mid-message.
    #[error(transparent)]
    Io(#[from] io::Error),
}

impl Error {
    /// Returns `true` for caller mistakes detected before any I/O.
    pub const fn is_usage(&self) -> bool {
        matches!(self, Self::UnknownCommand(_) | Self::TooManyArguments { .. })
    }

    /// Returns `true` if the peer closed the stream before a full message.
    pub fn is_eof(&self) -> bool {
        matches!(self, Self::Io(e) if e.kind() == io::ErrorKind::UnexpectedEof)
    }
}

//! Request and response types exchanged over a control connection.

use std::fmt;

use crate::CoverageSnapshot;

/// Default TCP port of the runtime control service.
pub const DEFAULT_PORT: u16 = 47653;

/// Default host the control client connects to.
pub const DEFAULT_HOST: &str = "localhost";

/// A control command with its positional arguments.
///
/// An absent (`None`) slot asks the receiving side to substitute its own
/// default for that argument.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Request {
    /// Numeric command code.
    id: u8,
    /// Argument slots; length is the command's arity.
    args: Vec<Option<String>>,
}

impl Request {
    /// Creates a request from a raw command code and argument slots.
    ///
    /// No arity check happens here; use [`CommandDescriptor::request`]
    /// to build validated requests by command name.
    ///
    /// [`CommandDescriptor::request`]: crate::CommandDescriptor::request
    pub const fn new(id: u8, args: Vec<Option<String>>) -> Self {
        Self { id, args }
    }

    /// Numeric command code.
    pub const fn id(&self) -> u8 {
        self.id
    }

    /// All argument slots in order.
    pub fn args(&self) -> &[Option<String>] {
        &self.args
    }

    /// Returns the argument at `index` if that slot exists and is set.
    pub fn arg(&self, index: usize) -> Option<&str> {
        self.args.get(index).and_then(Option::as_deref)
    }

    /// Mutable access for default population.
    pub(crate) fn args_mut(&mut self) -> &mut [Option<String>] {
        &mut self.args
    }
}

impl fmt::Display for Request {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = crate::CommandId::from_code(self.id)
            .map_or("?", |c| c.descriptor().name);
        write!(f, "{name} (")?;
        for (i, arg) in self.args.iter().enumerate() {
            if i != 0 {
                f.write_str(",")?;
            }
            if let Some(a) = arg {
                f.write_str(a)?;
            }
        }
        f.write_str(")")
    }
}

/// Reply to a [`Request`]; `id` echoes the request's command code.
#[derive(Debug, Clone, PartialEq)]
pub struct Response {
    /// Command code of the request this answers.
    pub id: u8,
    /// Result value.
    pub payload: Payload,
}

impl Response {
    /// Creates a response for command `id`.
    pub const fn new(id: u8, payload: Payload) -> Self {
        Self { id, payload }
    }

    /// Splits the payload into data or a server-side failure.
    ///
    /// An [`Payload::Error`] must never be treated as data, so callers
    /// should go through this rather than matching on `payload` directly.
    pub fn into_result(self) -> Result<Payload, ErrorValue> {
        match self.payload {
            Payload::Error(e) => Err(e),
            other => Ok(other),
        }
    }
}

/// The value carried by a [`Response`].
#[derive(Debug, Clone, PartialEq)]
#[non_exhaustive]
pub enum Payload {
    /// No value.
    None,
    /// A 32-bit integer.
    Int(i32),
    /// A human-readable string.
    Str(String),
    /// A coverage data snapshot.
    Coverage(CoverageSnapshot),
    /// A failure raised while executing the request.
    Error(ErrorValue),
}

/// A marshalled server-side error, optionally chained to its cause.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ErrorValue {
    /// Short classifier, e.g. the failing subsystem.
    pub kind: String,
    /// Human-readable message.
    pub message: String,
    /// Underlying cause.
    pub cause: Option<Box<ErrorValue>>,
}

impl ErrorValue {
    /// Creates an error value without a cause.
    pub fn new(kind: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            kind: kind.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// Attaches `cause`.
    #[must_use]
    pub fn with_cause(mut self, cause: Self) -> Self {
        self.cause = Some(Box::new(cause));
        self
    }

    /// Captures `err` and its whole `source()` chain.
    pub fn from_error(kind: impl Into<String>, err: &(dyn std::error::Error + 'static)) -> Self {
        let mut chain = Vec::new();
        let mut next = err.source();
        while let Some(e) = next {
            chain.push(e.to_string());
            next = e.source();
        }
        let cause = chain.into_iter().rev().fold(None, |cause, msg| {
            Some(Box::new(Self {
                kind: "cause".to_owned(),
                message: msg,
                cause,
            }))
        });
        Self {
            kind: kind.into(),
            message: err.to_string(),
            cause,
        }
    }

    /// Number of values in the chain, including `self`.
    pub fn depth(&self) -> usize {
        1 + self.cause.as_ref().map_or(0, |c| c.depth())
    }
}

impl fmt::Display for ErrorValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl std::error::Error for ErrorValue {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        self.cause
            .as_deref()
            .map(|c| c as &(dyn std::error::Error + 'static))
    }
}

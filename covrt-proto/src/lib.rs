//! Wire protocol for covrt runtime control.
//!
//! A controller process talks to an instrumented process over TCP. Each
//! connection carries exactly one [`Request`] followed by exactly one
//! [`Response`], both encoded in a compact big-endian layout (see
//! [`encode_request`] and [`encode_response`]). Coverage snapshots travel inside a
//! response as a versioned [`postcard`] body owned by [`CoverageSnapshot`].

mod codec;
mod command;
mod error;
mod message;
mod snapshot;

pub use codec::{
    MAX_ARGS, MAX_CAUSE_DEPTH, MAX_PAYLOAD, decode_request, decode_response, encode_request,
    encode_response, request_to_vec, response_to_vec,
};
pub use command::{COMMANDS, ClientDefaults, CommandDescriptor, CommandId, parse_bool};
pub use error::{Error, Result};
pub use message::{DEFAULT_HOST, DEFAULT_PORT, ErrorValue, Payload, Request, Response};
pub use snapshot::{ClassRecord, CoverageSnapshot, SNAPSHOT_VERSION};

//! Runtime control and coverage data handoff for instrumented processes.
//!
//! An instrumented process hosts a [`Runtime`]: a live [`CoverageData`]
//! store that classes register with, an [`ExitHook`] that writes the data
//! once when the process ends, and optionally a [`Controller`] that serves
//! control requests over TCP. A [`ClientProxy`] in another process sends
//! those requests: ping, fetch coverage, dump coverage remotely, or reset
//! the hit flags.
//!
//! Concurrent writers of the same output file coordinate through a
//! [`SocketMutex`], a cross-process lock held by binding a UDP port
//! derived from the file path.
//!
//! # Quick start
//!
//! ```no_run
//! use covrt::{ClassCoverage, ResetActions, Runtime, Settings};
//!
//! let rt = Runtime::with_settings(Settings {
//!     control: true,
//!     ..Settings::default()
//! });
//! rt.reset(ResetActions::default()).expect("runtime failed to start");
//!
//! let class = rt
//!     .register_class(ClassCoverage::new("app.Main", 0x5eed, &[3, 1]))
//!     .expect("coverage store is armed");
//! class.hit(0, 2);
//!
//! // Stops the controller and writes coverage.ec.
//! rt.terminate().expect("coverage dump failed");
//! ```

mod client;
pub mod config;
mod controller;
pub mod data;
mod error;
mod exit_hook;
pub mod lock;
mod persist;
mod runtime;

pub use client::{ClientProxy, parse_connection_string};
pub use config::{Properties, Settings};
pub use controller::{ControlHost, Controller, DEFAULT_GRACE};
pub use covrt_proto::{
    COMMANDS, ClassRecord, ClientDefaults, CommandDescriptor, CommandId, CoverageSnapshot,
    ErrorValue, Payload, Request, Response,
};
pub use data::{ClassCoverage, CoverageData, CoverageGuard};
pub use error::{Error, Result};
#[cfg(unix)]
pub use exit_hook::watch_signals;
pub use exit_hook::ExitHook;
pub use lock::{FileLock, LockError, SocketMutex};
pub use persist::{DumpReport, dump_coverage};
pub use runtime::{ResetActions, Runtime, SetAction};

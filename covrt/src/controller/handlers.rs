//! Command execution on the executor thread.

use std::panic::{self, AssertUnwindSafe};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use covrt_proto::{CommandId, ErrorValue, Payload, Request, Response, parse_bool};
use tracing::debug;

use super::{ControlHost, Inner};
use crate::lock::FileLock;
use crate::{Error, Result, persist};

/// Error kind reported for failures of command `id`.
pub(super) fn error_kind(id: u8) -> &'static str {
    CommandId::from_code(id).map_or("control", |c| c.descriptor().name)
}

impl Inner {
    /// Runs `req`, turning failures and panics into an error payload.
    pub(super) fn execute(&self, req: &Request) -> Response {
        let id = req.id();
        let kind = error_kind(id);
        let payload = match panic::catch_unwind(AssertUnwindSafe(|| self.dispatch(req))) {
            Ok(Ok(payload)) => payload,
            Ok(Err(e)) => {
                debug!(request = %req, error = %e, "control request failed");
                Payload::Error(ErrorValue::from_error(kind, &e))
            }
            Err(panic) => {
                let message = panic
                    .downcast_ref::<&str>()
                    .map(|s| (*s).to_owned())
                    .or_else(|| panic.downcast_ref::<String>().cloned())
                    .unwrap_or_else(|| "handler panicked".to_owned());
                Payload::Error(ErrorValue::new(kind, message))
            }
        };
        Response::new(id, payload)
    }

    fn dispatch(&self, req: &Request) -> Result<Payload> {
        match CommandId::from_code(req.id()) {
            Some(CommandId::Ping) => self.ping(req),
            Some(CommandId::GetCoverage) => self.get_coverage(req),
            Some(CommandId::DumpCoverage) => self.dump_coverage(req),
            Some(CommandId::ResetCoverage) => self.reset_coverage(),
            _ => Err(Error::InvalidArgument(format!(
                "invalid request ID {}",
                req.id()
            ))),
        }
    }

    fn host(&self) -> Result<Arc<dyn ControlHost>> {
        self.host.upgrade().ok_or(Error::RuntimeUnavailable)
    }

    /// Sleeps `delay` ms, cut short by shutdown, then echoes it.
    fn ping(&self, req: &Request) -> Result<Payload> {
        let raw = req
            .arg(0)
            .ok_or_else(|| Error::InvalidArgument("ping delay missing".into()))?;
        let delay: i32 = raw
            .trim()
            .parse()
            .map_err(|_| Error::InvalidArgument(format!("bad ping delay [{raw}]")))?;
        let ms = u64::try_from(delay)
            .map_err(|_| Error::InvalidArgument(format!("negative ping delay [{delay}]")))?;
        if !self.stop.sleep(Duration::from_millis(ms)) {
            debug!(delay, "ping interrupted by shutdown");
        }
        Ok(Payload::Int(delay))
    }

    fn get_coverage(&self, req: &Request) -> Result<Payload> {
        let host = self.host()?;
        let Some(data) = host.coverage() else {
            return Ok(Payload::None);
        };
        // Copy first: marshalling may block on a slow client.
        let view = data.shallow_copy();
        if req.arg(2).is_some_and(parse_bool) {
            host.disable_auto_dump();
        }
        Ok(Payload::Coverage(view.snapshot()))
    }

    /// Dumps on this side, using local settings for absent arguments.
    fn dump_coverage(&self, req: &Request) -> Result<Payload> {
        let host = self.host()?;
        let Some(data) = host.coverage() else {
            return Ok(Payload::None);
        };
        let settings = host.settings();
        let out_file = req
            .arg(0)
            .map_or_else(|| settings.out_file.clone(), PathBuf::from);
        let merge = req.arg(1).map_or(settings.out_merge, parse_bool);
        let disable_auto_dump = req.arg(2).is_none_or(parse_bool);

        let mut lock = settings.file_lock_for(&out_file)?;
        let report = persist::dump_coverage(
            Some(&data),
            true,
            &out_file,
            merge,
            lock.as_mut().map(|l| l as &mut dyn FileLock),
        )?;
        if disable_auto_dump {
            host.disable_auto_dump();
        }
        Ok(report.map_or(Payload::None, |r| {
            Payload::Str(format!(
                "runtime coverage data remotely {} [{}] {{in {} ms}}",
                if r.merged { "merged into" } else { "written to" },
                r.path.display(),
                r.elapsed.as_millis()
            ))
        }))
    }

    /// Zeroes hit flags in place under the store lock.
    fn reset_coverage(&self) -> Result<Payload> {
        let host = self.host()?;
        let start = Instant::now();
        let size = host.coverage().map_or(0, |data| {
            let guard = data.lock();
            let size = guard.size();
            if size > 0 {
                guard.reset();
            }
            size
        });
        let message = if size > 0 {
            format!(
                "coverage reset for {size} classes {{in {} ms}}",
                start.elapsed().as_millis()
            )
        } else {
            format!("coverage reset for {size} classes")
        };
        Ok(Payload::Str(message))
    }
}

//! Runtime control service.
//!
//! A [`Controller`] owns two threads. The listener accepts TCP
//! connections, reads exactly one request from each, and queues it. The
//! executor takes queued requests one at a time, runs them, and writes the
//! response back on the same connection. Commands never run concurrently.
//!
//! ```no_run
//! # use std::sync::Weak;
//! # fn host() -> Weak<dyn covrt::ControlHost> { unimplemented!() }
//! let controller = covrt::Controller::new(host(), 47653);
//! controller.start()?;
//! // ...
//! controller.shutdown();
//! # Ok::<(), covrt::Error>(())
//! ```

mod handlers;
mod queue;

use std::io::{self, BufReader, Write};
use std::net::{Ipv4Addr, Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::mpsc::{self, RecvTimeoutError};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use covrt_proto::{ErrorValue, Payload, Request, Response};
use tracing::{debug, info, trace, warn};

use crate::config::Settings;
use crate::data::CoverageData;
use crate::{Error, Result};
use queue::{QueueEntry, RequestQueue, StopSignal};

/// Default time `shutdown` waits for each service thread.
pub const DEFAULT_GRACE: Duration = Duration::from_secs(30);

/// Process state the command handlers act on.
pub trait ControlHost: Send + Sync {
    /// The live coverage store, if one is armed.
    fn coverage(&self) -> Option<Arc<CoverageData>>;

    /// Current settings, used for server-side argument defaults.
    fn settings(&self) -> Settings;

    /// Disarms the automatic end-of-life coverage dump.
    fn disable_auto_dump(&self);
}

/// Lifecycle phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
enum Phase {
    /// Not started, or fully shut down.
    Stopped = 0,
    /// Binding and spawning threads.
    Starting = 1,
    /// Serving requests.
    Running = 2,
    /// Tearing down threads.
    ShuttingDown = 3,
}

/// State shared with the service threads of one run.
///
/// Every `start` builds a fresh one, so a thread left behind by a slow
/// shutdown never sees the next run's queue.
struct Inner {
    /// Where handlers find coverage data and settings.
    host: Weak<dyn ControlHost>,
    /// Pending requests.
    queue: RequestQueue,
    /// Executor stop latch.
    stop: StopSignal,
    /// Listener stop flag.
    listener_stop: AtomicBool,
    /// Connection the listener is currently reading from.
    reading: Mutex<Option<TcpStream>>,
    /// Connection the executor is currently serving.
    serving: Mutex<Option<TcpStream>>,
}

impl Inner {
    fn new(host: Weak<dyn ControlHost>) -> Self {
        Self {
            host,
            queue: RequestQueue::default(),
            stop: StopSignal::default(),
            listener_stop: AtomicBool::new(false),
            reading: Mutex::new(None),
            serving: Mutex::new(None),
        }
    }
}

/// A service thread plus a channel that closes when it exits.
struct Worker {
    /// Thread handle, joined once `done` fires.
    handle: JoinHandle<()>,
    /// Disconnects or receives when the thread body exits.
    done: mpsc::Receiver<()>,
}

/// Signals the owning [`Worker`] on drop, including during unwinding.
struct DoneGuard(mpsc::Sender<()>);

impl Drop for DoneGuard {
    fn drop(&mut self) {
        let _ = self.0.send(());
    }
}

impl Worker {
    fn spawn(name: &str, body: impl FnOnce() + Send + 'static) -> io::Result<Self> {
        let (tx, done) = mpsc::channel();
        let handle = thread::Builder::new()
            .name(name.to_owned())
            .spawn(move || {
                let _done = DoneGuard(tx);
                body();
            })?;
        Ok(Self { handle, done })
    }

    /// Waits up to `grace` for the thread to exit. A thread still running
    /// after that is detached.
    fn join_within(self, grace: Duration) -> bool {
        match self.done.recv_timeout(grace) {
            Ok(()) | Err(RecvTimeoutError::Disconnected) => {
                let _ = self.handle.join();
                true
            }
            Err(RecvTimeoutError::Timeout) => false,
        }
    }
}

/// Running threads, their shared state, and the bound address.
struct Threads {
    /// Bound listen address.
    addr: SocketAddr,
    /// State owned by this run.
    inner: Arc<Inner>,
    listener: Worker,
    executor: Worker,
}

/// The runtime control service.
pub struct Controller {
    host: Weak<dyn ControlHost>,
    port: u16,
    grace: Duration,
    phase: AtomicU8,
    threads: Mutex<Option<Threads>>,
}

impl std::fmt::Debug for Controller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Controller")
            .field("port", &self.port)
            .field("addr", &self.local_addr())
            .field("phase", &self.phase())
            .finish_non_exhaustive()
    }
}

impl Controller {
    /// Creates a stopped controller that will listen on `port` (`0` picks
    /// an ephemeral port).
    pub fn new(host: Weak<dyn ControlHost>, port: u16) -> Self {
        Self {
            host,
            port,
            grace: DEFAULT_GRACE,
            phase: AtomicU8::new(Phase::Stopped as u8),
            threads: Mutex::new(None),
        }
    }

    /// Sets how long [`shutdown`](Self::shutdown) waits for each thread.
    #[must_use]
    pub const fn with_grace(mut self, grace: Duration) -> Self {
        self.grace = grace;
        self
    }

    fn phase(&self) -> Phase {
        match self.phase.load(Ordering::Acquire) {
            1 => Phase::Starting,
            2 => Phase::Running,
            3 => Phase::ShuttingDown,
            _ => Phase::Stopped,
        }
    }

    fn transition(&self, from: Phase, to: Phase) -> bool {
        self.phase
            .compare_exchange(from as u8, to as u8, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn threads(&self) -> MutexGuard<'_, Option<Threads>> {
        self.threads.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Returns `true` between a successful `start` and `shutdown`.
    pub fn is_running(&self) -> bool {
        self.phase() == Phase::Running
    }

    /// The bound address while running.
    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.threads().as_ref().map(|t| t.addr)
    }

    /// Binds the control port and starts the executor and listener.
    pub fn start(&self) -> Result<()> {
        if !self.transition(Phase::Stopped, Phase::Starting) {
            return Err(Error::AlreadyStarted);
        }
        match self.spawn_threads() {
            Ok(threads) => {
                info!(addr = %threads.addr, "runtime controller started");
                *self.threads() = Some(threads);
                self.phase.store(Phase::Running as u8, Ordering::Release);
                Ok(())
            }
            Err(e) => {
                self.phase.store(Phase::Stopped as u8, Ordering::Release);
                Err(e)
            }
        }
    }

    fn spawn_threads(&self) -> Result<Threads> {
        debug!(port = self.port, "starting runtime controller");
        let socket = TcpListener::bind((Ipv4Addr::UNSPECIFIED, self.port)).map_err(|source| {
            Error::Bind {
                port: self.port,
                source,
            }
        })?;
        let addr = socket.local_addr()?;
        let inner = Arc::new(Inner::new(self.host.clone()));

        let run = Arc::clone(&inner);
        let executor = Worker::spawn("covrt-executor", move || run.run_executor())?;
        let run = Arc::clone(&inner);
        let listener = match Worker::spawn("covrt-listener", move || run.run_listener(&socket)) {
            Ok(w) => w,
            Err(e) => {
                inner.stop.raise();
                inner.queue.close();
                executor.join_within(self.grace);
                return Err(e.into());
            }
        };
        Ok(Threads {
            addr,
            inner,
            listener,
            executor,
        })
    }

    /// Stops both threads and drops queued requests without replying.
    ///
    /// Idempotent, and a no-op before `start`. Each thread gets the grace
    /// period to exit; one that does not is left behind.
    pub fn shutdown(&self) {
        if !self.transition(Phase::Running, Phase::ShuttingDown) {
            return;
        }
        debug!("shutting down runtime controller");
        let Some(threads) = self.threads().take() else {
            self.phase.store(Phase::Stopped as u8, Ordering::Release);
            return;
        };
        let inner = &threads.inner;

        inner.listener_stop.store(true, Ordering::SeqCst);
        close_slot(&inner.reading);
        wake_accept(threads.addr);
        if threads.listener.join_within(self.grace) {
            trace!("listener thread terminated");
        } else {
            warn!(grace = ?self.grace, "listener thread did not stop in time");
        }

        inner.stop.raise();
        inner.queue.close();
        close_slot(&inner.serving);
        if threads.executor.join_within(self.grace) {
            trace!("executor thread terminated");
        } else {
            warn!(grace = ?self.grace, "executor thread did not stop in time");
        }

        let pending = inner.queue.drain();
        if !pending.is_empty() {
            debug!(count = pending.len(), "dropping unanswered control requests");
        }
        for entry in pending {
            let _ = entry.stream.shutdown(Shutdown::Both);
        }

        self.phase.store(Phase::Stopped as u8, Ordering::Release);
        info!("runtime controller shut down");
    }

    /// Runs `request` on the calling thread.
    ///
    /// Commands run this way are not serialized with queued ones.
    pub fn execute(&self, request: &Request) -> Response {
        let inner = self
            .threads()
            .as_ref()
            .map(|t| Arc::clone(&t.inner));
        inner
            .unwrap_or_else(|| Arc::new(Inner::new(self.host.clone())))
            .execute(request)
    }
}

impl Drop for Controller {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl Inner {
    fn stopping(&self) -> bool {
        self.listener_stop.load(Ordering::SeqCst)
    }

    fn run_listener(&self, listener: &TcpListener) {
        for conn in listener.incoming() {
            if self.stopping() {
                break;
            }
            match conn {
                Ok(stream) => {
                    if let Err(e) = self.receive(stream) {
                        if self.stopping() {
                            debug!(error = %e, "control connection dropped during shutdown");
                        } else {
                            warn!(error = %e, "exception while accepting a controller request");
                        }
                    }
                }
                Err(e) if self.stopping() => {
                    debug!(error = %e, "accept failed during shutdown");
                    break;
                }
                Err(e) => warn!(error = %e, "accept failed on runtime control port"),
            }
        }
        trace!("listener loop exited");
    }

    /// Reads one request from `stream` and queues it.
    fn receive(&self, stream: TcpStream) -> Result<()> {
        *lock_slot(&self.reading) = Some(stream.try_clone()?);
        if self.stopping() {
            close_slot(&self.reading);
            return Ok(());
        }
        let request = covrt_proto::decode_request(&mut BufReader::new(&stream));
        lock_slot(&self.reading).take();
        let request = request?;
        trace!(request = %request, "received control request");

        let entry = QueueEntry {
            arrival: Instant::now(),
            stream,
            request,
        };
        if let Err(entry) = self.queue.push(entry) {
            let _ = entry.stream.shutdown(Shutdown::Both);
        }
        Ok(())
    }

    fn run_executor(&self) {
        while let Some(entry) = self.queue.pop() {
            if self.stop.is_raised() {
                let _ = entry.stream.shutdown(Shutdown::Both);
                break;
            }
            trace!(
                id = entry.request.id(),
                waited = ?entry.arrival.elapsed(),
                "dequeued control request"
            );
            if let Err(e) = self.serve(&entry) {
                if self.stop.is_raised() {
                    debug!(error = %e, "response abandoned during shutdown");
                } else {
                    warn!(error = %e, "exception while processing a controller request");
                }
            }
            lock_slot(&self.serving).take();
            let _ = entry.stream.shutdown(Shutdown::Both);
        }
        trace!("executor loop exited");
    }

    /// Runs the request and answers it. A response that cannot be
    /// encoded is replaced by an error response.
    fn serve(&self, entry: &QueueEntry) -> Result<()> {
        *lock_slot(&self.serving) = Some(entry.stream.try_clone()?);
        let response = self.execute(&entry.request);
        let bytes = match covrt_proto::response_to_vec(&response) {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(request = %entry.request, error = %e, "response could not be encoded");
                let payload = Payload::Error(ErrorValue::from_error(
                    handlers::error_kind(response.id),
                    &e,
                ));
                covrt_proto::response_to_vec(&Response::new(response.id, payload))?
            }
        };
        let mut stream = &entry.stream;
        stream.write_all(&bytes)?;
        stream.flush()?;
        Ok(())
    }
}

fn lock_slot(slot: &Mutex<Option<TcpStream>>) -> MutexGuard<'_, Option<TcpStream>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Shuts down whatever connection sits in `slot`.
fn close_slot(slot: &Mutex<Option<TcpStream>>) {
    if let Some(stream) = lock_slot(slot).take() {
        let _ = stream.shutdown(Shutdown::Both);
    }
}

/// Unblocks a pending `accept` with a throwaway connection.
fn wake_accept(addr: SocketAddr) {
    let mut target = addr;
    if target.ip().is_unspecified() {
        target.set_ip(Ipv4Addr::LOCALHOST.into());
    }
    if let Err(e) = TcpStream::connect_timeout(&target, Duration::from_secs(1)) {
        debug!(error = %e, "could not wake listener");
    }
}

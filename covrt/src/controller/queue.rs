//! Hand-off between the listener and executor threads.

use std::collections::VecDeque;
use std::net::TcpStream;
use std::sync::{Condvar, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use covrt_proto::Request;

/// A fully received request waiting for the executor.
#[derive(Debug)]
pub(super) struct QueueEntry {
    /// When the request finished arriving.
    pub arrival: Instant,
    /// Connection the response goes back on.
    pub stream: TcpStream,
    /// Decoded request.
    pub request: Request,
}

#[derive(Debug, Default)]
struct QueueState {
    items: VecDeque<QueueEntry>,
    closed: bool,
}

/// Unbounded FIFO that can be closed to wake a blocked consumer.
#[derive(Debug, Default)]
pub(super) struct RequestQueue {
    state: Mutex<QueueState>,
    ready: Condvar,
}

impl RequestQueue {
    fn state(&self) -> MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Appends `entry`; hands it back if the queue is closed.
    pub fn push(&self, entry: QueueEntry) -> Result<(), QueueEntry> {
        let mut state = self.state();
        if state.closed {
            return Err(entry);
        }
        state.items.push_back(entry);
        drop(state);
        self.ready.notify_one();
        Ok(())
    }

    /// Blocks for the next entry. Returns `None` once closed.
    pub fn pop(&self) -> Option<QueueEntry> {
        let mut state = self.state();
        loop {
            if state.closed {
                return None;
            }
            if let Some(entry) = state.items.pop_front() {
                return Some(entry);
            }
            state = self
                .ready
                .wait(state)
                .unwrap_or_else(PoisonError::into_inner);
        }
    }

    /// Rejects further pushes and wakes every waiter.
    pub fn close(&self) {
        self.state().closed = true;
        self.ready.notify_all();
    }

    /// Removes every pending entry.
    pub fn drain(&self) -> Vec<QueueEntry> {
        self.state().items.drain(..).collect()
    }
}

/// A latch the executor waits on; also bounds interruptible sleeps.
#[derive(Debug, Default)]
pub(super) struct StopSignal {
    stopped: Mutex<bool>,
    changed: Condvar,
}

impl StopSignal {
    fn flag(&self) -> MutexGuard<'_, bool> {
        self.stopped.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Raises the signal and wakes sleepers.
    pub fn raise(&self) {
        *self.flag() = true;
        self.changed.notify_all();
    }

    /// Returns `true` once raised.
    pub fn is_raised(&self) -> bool {
        *self.flag()
    }

    /// Sleeps for `duration` or until raised. Returns `true` if the full
    /// duration elapsed.
    pub fn sleep(&self, duration: Duration) -> bool {
        let deadline = Instant::now() + duration;
        let mut stopped = self.flag();
        while !*stopped {
            let now = Instant::now();
            if now >= deadline {
                return true;
            }
            stopped = self
                .changed
                .wait_timeout(stopped, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }
        false
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use std::net::TcpListener;
    use std::sync::Arc;
    use std::thread;

    use super::*;

    fn entry(id: u8) -> (QueueEntry, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let stream = TcpStream::connect(listener.local_addr().unwrap()).unwrap();
        let entry = QueueEntry {
            arrival: Instant::now(),
            stream,
            request: Request::new(id, Vec::new()),
        };
        (entry, listener)
    }

    #[test]
    fn pops_in_fifo_order() {
        let q = RequestQueue::default();
        let (a, _la) = entry(1);
        let (b, _lb) = entry(2);
        q.push(a).unwrap();
        q.push(b).unwrap();
        assert_eq!(q.pop().unwrap().request.id(), 1);
        assert_eq!(q.pop().unwrap().request.id(), 2);
    }

    #[test]
    fn close_wakes_blocked_pop_and_rejects_push() {
        let q = Arc::new(RequestQueue::default());
        let waiter = {
            let q = Arc::clone(&q);
            thread::spawn(move || q.pop().is_none())
        };
        thread::sleep(Duration::from_millis(50));
        q.close();
        assert!(waiter.join().unwrap());

        let (e, _l) = entry(0);
        assert!(q.push(e).is_err());
    }

    #[test]
    fn drain_returns_pending_entries() {
        let q = RequestQueue::default();
        let (a, _l) = entry(3);
        q.push(a).unwrap();
        q.close();
        assert!(q.pop().is_none());
        assert_eq!(q.drain().len(), 1);
    }

    #[test]
    fn raised_signal_cuts_sleep_short() {
        let stop = Arc::new(StopSignal::default());
        let sleeper = {
            let stop = Arc::clone(&stop);
            thread::spawn(move || {
                let t = Instant::now();
                (stop.sleep(Duration::from_secs(10)), t.elapsed())
            })
        };
        thread::sleep(Duration::from_millis(50));
        stop.raise();
        let (completed, elapsed) = sleeper.join().unwrap();
        assert!(!completed);
        assert!(elapsed < Duration::from_secs(5));
        assert!(!stop.sleep(Duration::ZERO));
        assert!(StopSignal::default().sleep(Duration::from_millis(1)));
    }
}

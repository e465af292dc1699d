// src/cancel.rs

//! Cancellation signal shared between the lifecycle and a channel worker.
//!
//! The worker runs on a blocking thread, so the signal is a crossbeam channel
//! nobody ever sends on: dropping the sender disconnects every receiver, which
//! both `is_cancelled` and the interruptible `wait` observe immediately.

use crossbeam::channel::{self, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::{
    sync::{Arc, Mutex},
    time::Duration,
};

/// Owner side, held by the receiver lifecycle.
pub struct CancelHandle {
    tx: Mutex<Option<Sender<()>>>,
}

/// Observer side, cloned into the worker and the delivery pipeline.
#[derive(Clone)]
pub struct Cancellation {
    rx: Receiver<()>,
    // Keeps the channel connected for observers created by `never()`.
    _anchor: Option<Arc<Sender<()>>>,
}

/// Create a connected handle/observer pair.
pub fn cancellation() -> (CancelHandle, Cancellation) {
    let (tx, rx) = channel::bounded(0);
    (
        CancelHandle { tx: Mutex::new(Some(tx)) },
        Cancellation { rx, _anchor: None },
    )
}

impl CancelHandle {
    /// Signal cancellation. Idempotent.
    pub fn cancel(&self) {
        if let Ok(mut tx) = self.tx.lock() {
            tx.take();
        }
    }
}

impl Cancellation {
    /// An observer that is never cancelled, for driving components by hand.
    pub fn never() -> Self {
        let (tx, rx) = channel::bounded(0);
        Cancellation { rx, _anchor: Some(Arc::new(tx)) }
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self.rx.try_recv(), Err(TryRecvError::Disconnected))
    }

    /// Sleep for `timeout` unless cancelled first. Returns `true` when cancelled.
    pub fn wait(&self, timeout: Duration) -> bool {
        matches!(self.rx.recv_timeout(timeout), Err(RecvTimeoutError::Disconnected))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{thread, time::Instant};

    #[test]
    fn wait_times_out_while_not_cancelled() {
        let (_handle, cancel) = cancellation();
        assert!(!cancel.wait(Duration::from_millis(20)));
        assert!(!cancel.is_cancelled());
    }

    #[test]
    fn cancel_wakes_a_sleeping_waiter() {
        let (handle, cancel) = cancellation();
        let waiter = thread::spawn(move || {
            let started = Instant::now();
            let cancelled = cancel.wait(Duration::from_secs(30));
            (cancelled, started.elapsed())
        });
        thread::sleep(Duration::from_millis(20));
        handle.cancel();

        let (cancelled, elapsed) = waiter.join().unwrap();
        assert!(cancelled);
        assert!(elapsed < Duration::from_secs(5));
    }

    #[test]
    fn never_is_not_cancelled() {
        let cancel = Cancellation::never();
        assert!(!cancel.is_cancelled());
    }
}

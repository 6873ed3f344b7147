//! Bounded stage-to-stage channels and one-shot reply slots.
//!
//! A channel whose peers are gone yields [`Retired`]. It is a shutdown signal,
//! not an error, and deliberately has no conversion into `DupError`.

use std::fmt;
use std::time::Duration;

use crossbeam_channel::{RecvTimeoutError, TryRecvError};

use dupvault_types::error::{DupError, Result};

/// The other side of a channel has shut down.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Retired;

impl fmt::Display for Retired {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("channel retired")
    }
}

pub struct Sender<T>(crossbeam_channel::Sender<T>);

pub struct Receiver<T>(crossbeam_channel::Receiver<T>);

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Sender(self.0.clone())
    }
}

impl<T> Clone for Receiver<T> {
    fn clone(&self) -> Self {
        Receiver(self.0.clone())
    }
}

/// Bounded channel; `send` blocks while `capacity` messages are queued.
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = crossbeam_channel::bounded(capacity);
    (Sender(tx), Receiver(rx))
}

impl<T> Sender<T> {
    pub fn send(&self, msg: T) -> std::result::Result<(), Retired> {
        self.0.send(msg).map_err(|_| Retired)
    }
}

impl<T> Receiver<T> {
    /// Block until a message arrives or every sender is dropped.
    pub fn recv(&self) -> std::result::Result<T, Retired> {
        self.0.recv().map_err(|_| Retired)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Create a one-shot reply slot. The producer keeps the [`Pending`] and
/// attaches the [`Reply`] to a message.
pub fn reply<T>() -> (Reply<T>, Pending<T>) {
    let (tx, rx) = crossbeam_channel::bounded(1);
    (Reply(tx), Pending(rx))
}

/// Write half of a reply slot. Dropping it unresolved cancels the waiter.
pub struct Reply<T>(crossbeam_channel::Sender<Result<T>>);

impl<T> Reply<T> {
    pub fn send(self, value: Result<T>) {
        // The waiter may have given up; nothing to do then.
        let _ = self.0.send(value);
    }

    pub fn ok(self, value: T) {
        self.send(Ok(value));
    }

    pub fn fail(self, err: DupError) {
        self.send(Err(err));
    }
}

impl<T> fmt::Debug for Reply<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Reply")
    }
}

/// Read half of a reply slot.
pub struct Pending<T>(crossbeam_channel::Receiver<Result<T>>);

impl<T> Pending<T> {
    /// Wait for the result. A dropped [`Reply`] reads as `Canceled`.
    pub fn wait(self) -> Result<T> {
        self.0.recv().unwrap_or(Err(DupError::Canceled))
    }

    /// `None` while the reply is still outstanding.
    pub fn try_wait(&self) -> Option<Result<T>> {
        match self.0.try_recv() {
            Ok(v) => Some(v),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(DupError::Canceled)),
        }
    }

    /// Wait at most `timeout`; `None` if still outstanding.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T>> {
        match self.0.recv_timeout(timeout) {
            Ok(v) => Some(v),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(DupError::Canceled)),
        }
    }
}

impl<T> fmt::Debug for Pending<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Pending")
    }
}

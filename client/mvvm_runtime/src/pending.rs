//! Blocking completions for callback-style operations.
//!
//! Every callback operation in the crate has a counterpart that returns one
//! of these handles instead, so a caller on another thread can wait for the
//! I/O thread to deliver the result.

use crate::error::{Error, Result};
use std::sync::mpsc;
use std::time::Duration;

/// A single result that will be delivered later.
#[derive(Debug)]
pub struct Pending<T> {
    rx: mpsc::Receiver<Result<T>>,
}

pub(crate) struct Resolver<T> {
    tx: mpsc::SyncSender<Result<T>>,
}

pub(crate) fn channel<T>() -> (Resolver<T>, Pending<T>) {
    let (tx, rx) = mpsc::sync_channel(1);
    (Resolver { tx }, Pending { rx })
}

impl<T> Resolver<T> {
    pub fn resolve(self, value: Result<T>) {
        // The waiting side may have given up; nothing to do then.
        let _ = self.tx.try_send(value);
    }
}

impl<T> Pending<T> {
    pub(crate) fn ready(value: Result<T>) -> Self {
        let (resolver, pending) = channel();
        resolver.resolve(value);
        pending
    }

    pub fn wait(self) -> Result<T> {
        self.rx.recv().unwrap_or(Err(Error::Disconnected))
    }

    pub fn wait_timeout(self, timeout: Duration) -> Result<T> {
        match self.rx.recv_timeout(timeout) {
            Ok(value) => value,
            Err(mpsc::RecvTimeoutError::Timeout) => Err(Error::Timeout),
            Err(mpsc::RecvTimeoutError::Disconnected) => Err(Error::Disconnected),
        }
    }

    /// Non-blocking poll. `None` while the result has not arrived yet.
    pub fn try_take(&self) -> Option<Result<T>> {
        match self.rx.try_recv() {
            Ok(value) => Some(value),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(Error::Disconnected)),
        }
    }
}

/// An unbounded stream of values, e.g. every push of one property.
#[derive(Debug)]
pub struct Subscription<T> {
    rx: mpsc::Receiver<T>,
}

pub(crate) fn stream<T>() -> (mpsc::Sender<T>, Subscription<T>) {
    let (tx, rx) = mpsc::channel();
    (tx, Subscription { rx })
}

impl<T> Subscription<T> {
    pub fn recv(&self) -> Result<T> {
        self.rx.recv().map_err(|_| Error::Disconnected)
    }

    pub fn recv_timeout(&self, timeout: Duration) -> Result<T> {
        self.rx.recv_timeout(timeout).map_err(|err| match err {
            mpsc::RecvTimeoutError::Timeout => Error::Timeout,
            mpsc::RecvTimeoutError::Disconnected => Error::Disconnected,
        })
    }

    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }
}

impl<T> Iterator for Subscription<T> {
    type Item = T;

    fn next(&mut self) -> Option<T> {
        self.rx.recv().ok()
    }
}

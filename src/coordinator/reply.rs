//! One-shot replies from the coordinator to a caller.
//!
//! Every request creates a [`JobHandle`] plus a oneshot channel. The caller
//! keeps a [`Pending`]; the coordinator and its workers keep the matching
//! [`Responder`], which delivers at most one result and never delivers a
//! success to an aborted request. Dropping a `Pending` before its result
//! arrives aborts the request.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

use crate::error::ResourceError;
use crate::job::JobHandle;

/// Result of an outstanding request.
///
/// Await it from async code, or call [`blocking_recv`](Self::blocking_recv)
/// from a plain thread.
#[derive(Debug)]
pub struct Pending<T> {
    handle: JobHandle,
    /// Taken once the result has been received
    rx: Option<oneshot::Receiver<Result<T, ResourceError>>>,
}

impl<T> Pending<T> {
    /// A request paired with the responder that completes it.
    pub(crate) fn channel() -> (Responder<T>, Pending<T>) {
        let handle = JobHandle::new();
        let (tx, rx) = oneshot::channel();
        (
            Responder {
                handle: handle.clone(),
                tx,
            },
            Pending {
                handle,
                rx: Some(rx),
            },
        )
    }

    /// A request that completed before it was submitted.
    pub fn ready(result: Result<T, ResourceError>) -> Self {
        let (responder, pending) = Self::channel();
        responder.send(result);
        pending
    }

    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    /// Cancel the request. Returns false if it already completed.
    pub fn abort(&self) -> bool {
        self.handle.abort()
    }

    /// Block the current thread until the result arrives.
    ///
    /// Must not be called from async code or from the coordinator thread.
    pub fn blocking_recv(mut self) -> Result<T, ResourceError> {
        let Some(rx) = self.rx.take() else {
            return Err(dropped_error(&self.handle));
        };
        rx.blocking_recv()
            .unwrap_or_else(|_| Err(dropped_error(&self.handle)))
    }
}

impl<T> Drop for Pending<T> {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.handle.abort();
        }
    }
}

impl<T> Future for Pending<T> {
    type Output = Result<T, ResourceError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        let Some(rx) = this.rx.as_mut() else {
            return Poll::Ready(Err(dropped_error(&this.handle)));
        };
        let received = std::task::ready!(Pin::new(rx).poll(cx));
        this.rx = None;
        Poll::Ready(received.unwrap_or_else(|_| Err(dropped_error(&this.handle))))
    }
}

/// Error reported when the responder went away without answering.
fn dropped_error(handle: &JobHandle) -> ResourceError {
    if handle.is_aborted() {
        ResourceError::Aborted
    } else {
        ResourceError::Shutdown
    }
}

/// Sending half of a [`Pending`].
#[derive(Debug)]
pub(crate) struct Responder<T> {
    handle: JobHandle,
    tx: oneshot::Sender<Result<T, ResourceError>>,
}

impl<T> Responder<T> {
    pub fn handle(&self) -> &JobHandle {
        &self.handle
    }

    /// Mark the request as being served. False if it was already aborted.
    pub fn start(&self) -> bool {
        self.handle.start()
    }

    /// Whether the caller has cancelled or stopped listening.
    pub fn is_aborted(&self) -> bool {
        self.handle.is_aborted() || self.tx.is_closed()
    }

    pub fn send(self, result: Result<T, ResourceError>) {
        match result {
            Ok(value) => self.send_ok(value),
            Err(err) => self.send_err(err),
        }
    }

    /// Deliver a value and finish the handle. Dropped if the request was
    /// aborted first.
    pub fn send_ok(self, value: T) {
        if self.handle.finish() {
            let _ = self.tx.send(Ok(value));
        }
    }

    /// Deliver a failure and fail the handle.
    pub fn send_err(self, err: ResourceError) {
        if self.handle.fail() {
            let _ = self.tx.send(Err(err));
        }
    }
}

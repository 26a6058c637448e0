//! Single-fire completion for one request.
//!
//! A request in flight can be settled by two independent signals: the query
//! task finishing (successfully, with an error, or past its deadline) and a
//! transport fault on the leased connection. Both fire into the same
//! [`Completion`]; the first one is delivered to the waiting handler and every
//! later signal is dropped.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use tokio::sync::oneshot;
use tracing::debug;

use crate::pool::ConnectionFault;
use crate::query::{QueryError, QueryRow};

#[derive(Debug)]
pub enum Signal {
    Query(Result<Vec<QueryRow>, QueryError>),
    Fault(ConnectionFault),
}

impl Signal {
    fn kind(&self) -> &'static str {
        match self {
            Signal::Query(Ok(_)) => "query_succeeded",
            Signal::Query(Err(_)) => "query_failed",
            Signal::Fault(_) => "connection_fault",
        }
    }
}

struct Inner {
    fired: AtomicBool,
    tx: Mutex<Option<oneshot::Sender<Signal>>>,
}

#[derive(Clone)]
pub struct Completion {
    inner: Arc<Inner>,
}

impl Completion {
    /// Create a completion and the receiver that gets its first signal.
    pub fn new() -> (Self, oneshot::Receiver<Signal>) {
        let (tx, rx) = oneshot::channel();
        let completion = Self {
            inner: Arc::new(Inner {
                fired: AtomicBool::new(false),
                tx: Mutex::new(Some(tx)),
            }),
        };
        (completion, rx)
    }

    /// Deliver `signal` if nothing has fired yet.
    ///
    /// Returns `true` only for the first call; later calls are no-ops.
    pub fn fire(&self, signal: Signal) -> bool {
        if self.inner.fired.swap(true, Ordering::AcqRel) {
            debug!(signal = signal.kind(), "Ignoring signal for settled request");
            return false;
        }

        let tx = self
            .inner
            .tx
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(tx) = tx
            && tx.send(signal).is_err()
        {
            debug!("Request handler went away before its completion fired");
        }
        true
    }

    pub fn has_fired(&self) -> bool {
        self.inner.fired.load(Ordering::Acquire)
    }

    pub fn fault_reporter(&self) -> FaultReporter {
        FaultReporter {
            completion: self.clone(),
        }
    }
}

/// Reports transport faults on a leased connection into its request's completion
#[derive(Clone)]
pub struct FaultReporter {
    completion: Completion,
}

impl FaultReporter {
    /// Returns `true` if the fault settled the request.
    pub fn report(&self, fault: ConnectionFault) -> bool {
        self.completion.fire(Signal::Fault(fault))
    }
}

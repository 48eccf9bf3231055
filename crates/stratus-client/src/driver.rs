//! The async driver, completion events, and the wait-many primitive.
//!
//! Pended operations are spawned onto the driver's pump threads and signal a
//! per-connection [`CompletionEvent`] when they finish. [`wait_any`] scans a
//! set of connections in rotated order so repeated calls with an advancing
//! `start_from` visit every completed connection instead of starving the
//! high indexes.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use stratus_core::error::{StorError, StorResult};
use stratus_core::response::ResponseDetails;
use stratus_transport::TransportHandle;
use tokio::sync::Notify;
use tracing::debug;

use crate::connection::Connection;

/// Pump threads a driver starts by default.
pub const DEFAULT_PUMP_COUNT: usize = 4;

/// Most connections one `wait_any` call can watch.
///
/// Inherited from the event-wait primitive this API was modeled on; the
/// bound keeps the per-call bookkeeping fixed-size.
pub const MAX_WAIT_ANY: usize = 64;

/// Drives pended operations on a pool of pump threads.
///
/// [`AsyncDriver::new`] starts a dedicated runtime (create it outside any
/// async context); [`AsyncDriver::current`] borrows the ambient runtime
/// instead.
#[derive(Debug)]
pub struct AsyncDriver {
    handle: tokio::runtime::Handle,
    runtime: Option<tokio::runtime::Runtime>,
}

impl AsyncDriver {
    /// Start a driver with the given number of pump threads.
    ///
    /// # Errors
    ///
    /// Returns [`StorError::Transport`] when the pump threads cannot be
    /// started.
    pub fn new(pump_count: usize) -> StorResult<Self> {
        let runtime = tokio::runtime::Builder::new_multi_thread()
            .worker_threads(pump_count.max(1))
            .thread_name("stratus-pump")
            .enable_all()
            .build()
            .map_err(|err| StorError::Transport(format!("cannot start async driver: {err}")))?;

        debug!(pump_count, "async driver started");

        Ok(Self {
            handle: runtime.handle().clone(),
            runtime: Some(runtime),
        })
    }

    /// A driver that spawns onto the current tokio runtime.
    ///
    /// # Panics
    ///
    /// Panics outside a tokio runtime context.
    #[must_use]
    pub fn current() -> Self {
        Self {
            handle: tokio::runtime::Handle::current(),
            runtime: None,
        }
    }

    pub(crate) fn spawn<F>(&self, future: F) -> tokio::task::JoinHandle<F::Output>
    where
        F: Future + Send + 'static,
        F::Output: Send + 'static,
    {
        self.handle.spawn(future)
    }
}

impl Drop for AsyncDriver {
    fn drop(&mut self) {
        // Background shutdown keeps dropping the driver legal from inside
        // another runtime.
        if let Some(runtime) = self.runtime.take() {
            runtime.shutdown_background();
        }
    }
}

#[derive(Debug, Default)]
struct EventInner {
    done: AtomicBool,
    notify: Notify,
}

/// One-shot completion flag observable by many waiters.
#[derive(Debug, Clone, Default)]
pub(crate) struct CompletionEvent(Arc<EventInner>);

impl CompletionEvent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.done.store(true, Ordering::Release);
        self.0.notify.notify_waiters();
    }

    pub fn is_set(&self) -> bool {
        self.0.done.load(Ordering::Acquire)
    }

    /// Wait until the event is set.
    pub async fn wait(&self) {
        loop {
            if self.is_set() {
                return;
            }
            let notified = self.0.notify.notified();
            tokio::pin!(notified);
            // Register before the re-check so a set() in between cannot be
            // missed.
            notified.as_mut().enable();
            if self.is_set() {
                return;
            }
            notified.await;
        }
    }
}

/// What kind of operation a connection has in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum OpKind {
    Put,
    Get,
    Del,
}

/// Payload handed back by a finished pended operation.
#[derive(Debug)]
pub(crate) enum FinishedPayload {
    None,
    Buffer(Vec<u8>),
}

/// Everything a pended task returns at join time.
#[derive(Debug)]
pub(crate) struct FinishedOp {
    pub transport: TransportHandle,
    pub outcome: StorResult<ResponseDetails>,
    pub payload: FinishedPayload,
}

/// One in-flight pended operation.
#[derive(Debug)]
pub(crate) struct PendingOp {
    pub kind: OpKind,
    pub name: String,
    pub event: CompletionEvent,
    pub task: tokio::task::JoinHandle<FinishedOp>,
}

/// Wait until any of the connections completes its pended operation.
///
/// Returns the lowest completed index in the rotation starting at
/// `start_from`, or `None` when the timeout elapses first. Connections with
/// nothing pending are skipped.
///
/// # Errors
///
/// Returns [`StorError::TooManyConnections`] when more than
/// [`MAX_WAIT_ANY`] connections are passed.
pub async fn wait_any(
    connections: &[&Connection],
    start_from: usize,
    timeout: Duration,
) -> StorResult<Option<usize>> {
    if connections.len() > MAX_WAIT_ANY {
        return Err(StorError::TooManyConnections);
    }
    if connections.is_empty() {
        return Ok(None);
    }

    let count = connections.len();
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        for i in 0..count {
            let index = (i + start_from) % count;
            if connections[index].is_async_completed() {
                return Ok(Some(index));
            }
        }

        let events: Vec<CompletionEvent> = connections
            .iter()
            .filter_map(|connection| connection.completion_event())
            .collect();
        if events.is_empty() {
            return Ok(None);
        }

        let waiters: Vec<_> = events.iter().map(|event| Box::pin(event.wait())).collect();
        let outcome = tokio::time::timeout_at(deadline, futures::future::select_all(waiters)).await;
        match outcome {
            // Something completed; rescan in rotation order for fairness.
            Ok(_) => {}
            Err(_) => return Ok(None),
        }
    }
}

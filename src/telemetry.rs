//! Telemetry for throttled streams.
//!
//! Copiers emit [`ThrottleEvent`]s describing grants, backpressure and stream
//! lifecycle. Events flow into a [`TelemetrySink`], which is a
//! `tower::Service<ThrottleEvent>`, so sinks compose with standard tower tooling.
//!
//! ```rust
//! use limit_rate::telemetry::{MemorySink, ThrottleEvent};
//! use tower::Service;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let mut sink = MemorySink::new();
//! sink.call(ThrottleEvent::Completed { bytes: 512 }).await.unwrap();
//! assert_eq!(sink.events(), vec![ThrottleEvent::Completed { bytes: 512 }]);
//! # }
//! ```

use futures::FutureExt;
use std::convert::Infallible;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::task::{Context, Poll};
use std::time::Duration;
use tower::Service;

/// A telemetry sink that consumes throttle events.
pub trait TelemetrySink:
    tower::Service<ThrottleEvent, Response = (), Error = Self::SinkError> + Clone + Send + 'static
{
    /// The error type for this sink.
    type SinkError: std::error::Error + Send + 'static;
}

/// Events emitted by a throttled copier.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ThrottleEvent {
    /// Bytes were forwarded downstream.
    Granted {
        /// Bytes the copier could have moved.
        requested: u64,
        /// Bytes the limiter allowed.
        granted: u64,
    },
    /// The limiter granted nothing; the copier will retry after `retry_in`.
    Throttled { requested: u64, retry_in: Duration },
    /// All bytes were forwarded.
    Completed { bytes: u64 },
    /// Upstream reported an error; forwarding stopped.
    Failed { bytes_done: u64 },
    /// The stream was torn down.
    Closed { bytes_done: u64 },
}

impl fmt::Display for ThrottleEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ThrottleEvent::Granted { requested, granted } => {
                write!(f, "Granted({}/{})", granted, requested)
            }
            ThrottleEvent::Throttled { requested, retry_in } => {
                write!(f, "Throttled(requested={}, retry_in={:?})", requested, retry_in)
            }
            ThrottleEvent::Completed { bytes } => write!(f, "Completed(bytes={})", bytes),
            ThrottleEvent::Failed { bytes_done } => write!(f, "Failed(bytes_done={})", bytes_done),
            ThrottleEvent::Closed { bytes_done } => write!(f, "Closed(bytes_done={})", bytes_done),
        }
    }
}

/// Best-effort emit helper that honors `poll_ready` and swallows errors.
pub async fn emit_best_effort<S>(sink: S, event: ThrottleEvent)
where
    S: tower::Service<ThrottleEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    use tower::ServiceExt;

    if let Ok(mut ready_sink) = sink.ready_oneshot().await {
        let _ = ready_sink.call(event).await;
    }
}

/// Emit from synchronous code. Sinks that finish on the first poll are served
/// inline; anything still pending is handed to the current tokio runtime, or
/// dropped when there is none.
pub fn emit_detached<S>(sink: S, event: ThrottleEvent)
where
    S: tower::Service<ThrottleEvent, Response = ()> + Send + Clone + 'static,
    S::Error: std::error::Error + Send + 'static,
    S::Future: Send + 'static,
{
    let mut fut = Box::pin(emit_best_effort(sink, event));
    if (&mut fut).now_or_never().is_none() {
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            handle.spawn(fut);
        }
    }
}

type SinkFuture = Pin<Box<dyn Future<Output = Result<(), Infallible>> + Send>>;

/// A no-op telemetry sink that discards all events.
#[derive(Clone, Debug, Default)]
pub struct NullSink;

impl Service<ThrottleEvent> for NullSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, _event: ThrottleEvent) -> Self::Future {
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for NullSink {
    type SinkError = Infallible;
}

/// A telemetry sink that logs events using the `tracing` crate.
#[derive(Clone, Debug, Default)]
pub struct LogSink;

impl Service<ThrottleEvent> for LogSink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ThrottleEvent) -> Self::Future {
        match event {
            ThrottleEvent::Failed { .. } => tracing::warn!(event = %event, "throttle_event"),
            ThrottleEvent::Granted { .. } | ThrottleEvent::Throttled { .. } => {
                tracing::trace!(event = %event, "throttle_event")
            }
            _ => tracing::info!(event = %event, "throttle_event"),
        }
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for LogSink {
    type SinkError = Infallible;
}

/// A telemetry sink that stores events in memory, evicting the oldest past `capacity`.
#[derive(Clone, Debug)]
pub struct MemorySink {
    events: Arc<Mutex<Vec<ThrottleEvent>>>,
    capacity: usize,
    evicted: Arc<AtomicU64>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::with_capacity(10_000)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Arc::new(Mutex::new(Vec::new())),
            capacity: capacity.max(1),
            evicted: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn events(&self) -> Vec<ThrottleEvent> {
        self.lock().clone()
    }

    pub fn clear(&self) {
        self.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    pub fn evicted(&self) -> u64 {
        self.evicted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<ThrottleEvent>> {
        self.events.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Default for MemorySink {
    fn default() -> Self {
        Self::new()
    }
}

impl Service<ThrottleEvent> for MemorySink {
    type Response = ();
    type Error = Infallible;
    type Future = SinkFuture;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, event: ThrottleEvent) -> Self::Future {
        let mut guard = self.lock();
        if guard.len() >= self.capacity {
            guard.remove(0);
            self.evicted.fetch_add(1, Ordering::Relaxed);
        }
        guard.push(event);
        Box::pin(async { Ok(()) })
    }
}

impl TelemetrySink for MemorySink {
    type SinkError = Infallible;
}

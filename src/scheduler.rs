//! Deferred re-invocation for backpressured streams
//!
//! A throttled copier never sleeps: it hands a callback to a [`Scheduler`] and
//! returns. Tests swap in [`ManualScheduler`] to run callbacks on demand.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

/// Callback queued for later execution.
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Generic execution queue with delayed dispatch.
pub trait Scheduler: Send + Sync + fmt::Debug {
    /// Run `task` once, no earlier than `delay` from now. Implementations must not
    /// run `task` before returning.
    fn schedule(&self, delay: Duration, task: Task);
}

/// Production scheduler: spawns a tokio task that sleeps, then runs the callback.
#[derive(Debug, Clone)]
pub struct TokioScheduler {
    handle: tokio::runtime::Handle,
}

impl TokioScheduler {
    pub fn new(handle: tokio::runtime::Handle) -> Self {
        Self { handle }
    }

    /// Scheduler bound to the runtime of the calling context.
    pub fn try_current() -> Result<Self, tokio::runtime::TryCurrentError> {
        tokio::runtime::Handle::try_current().map(Self::new)
    }
}

impl Scheduler for TokioScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            task();
        });
    }
}

/// Test scheduler that queues callbacks until [`ManualScheduler::run_pending`] is called.
#[derive(Clone, Default)]
pub struct ManualScheduler {
    queue: Arc<Mutex<Vec<(Duration, Task)>>>,
}

impl ManualScheduler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Delays of the callbacks still waiting, in scheduling order.
    pub fn pending_delays(&self) -> Vec<Duration> {
        self.lock().iter().map(|(delay, _)| *delay).collect()
    }

    pub fn pending(&self) -> usize {
        self.lock().len()
    }

    /// Run every queued callback and return how many ran. Callbacks scheduled while
    /// running stay queued for the next call.
    pub fn run_pending(&self) -> usize {
        let drained = std::mem::take(&mut *self.lock());
        let ran = drained.len();
        for (_, task) in drained {
            task();
        }
        ran
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<(Duration, Task)>> {
        self.queue.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl fmt::Debug for ManualScheduler {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ManualScheduler").field("pending", &self.pending_delays()).finish()
    }
}

impl Scheduler for ManualScheduler {
    fn schedule(&self, delay: Duration, task: Task) {
        self.lock().push((delay, task));
    }
}

//! Schedulable handle around a [`ThrottledCopier`].
//!
//! The handle owns the copier behind a mutex and answers backpressure by
//! asking its [`Scheduler`] for a deferred re-drive. At most one re-drive is
//! pending per stream at any time. The deferred callback only holds a [`Weak`]
//! reference, so a stream that is closed or dropped while a re-drive is pending
//! is never touched again.

use crate::copier::{ByteSink, ByteSource, CopierEvent, CopierState, Drive, ThrottledCopier};
use crate::scheduler::Scheduler;
use crate::telemetry::{NullSink, TelemetrySink};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

#[derive(Debug)]
struct Driven<C> {
    copier: C,
    pulse_pending: bool,
}

impl<C> Driven<C> {
    /// Claim the single re-drive slot. Returns `false` when one is already queued.
    fn claim_pulse(&mut self) -> bool {
        !std::mem::replace(&mut self.pulse_pending, true)
    }
}

type Shared<Src, Snk, T> = Arc<Mutex<Driven<ThrottledCopier<Src, Snk, T>>>>;

/// One active throttled stream, driven by an external event dispatcher.
///
/// Dropping the handle tears the stream down.
pub struct ThrottleTransform<Src, Snk, T = NullSink>
where
    Src: ByteSource + Send + 'static,
    Snk: ByteSink + Send + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    shared: Shared<Src, Snk, T>,
    scheduler: Arc<dyn Scheduler>,
}

impl<Src, Snk, T> ThrottleTransform<Src, Snk, T>
where
    Src: ByteSource + Send + 'static,
    Snk: ByteSink + Send + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    /// Take ownership of `copier`; re-drives go through `scheduler`.
    pub fn new(copier: ThrottledCopier<Src, Snk, T>, scheduler: Arc<dyn Scheduler>) -> Self {
        Self {
            shared: Arc::new(Mutex::new(Driven { copier, pulse_pending: false })),
            scheduler,
        }
    }

    /// Deliver one event. A throttled outcome schedules a re-drive unless one is
    /// already pending.
    pub fn on_event(&self, event: CopierEvent) -> Drive {
        let (outcome, schedule) = {
            let mut driven = lock(&self.shared);
            let outcome = driven.copier.handle(event);
            let schedule = matches!(outcome, Drive::Throttled(_)) && driven.claim_pulse();
            (outcome, schedule)
        };
        if let (Drive::Throttled(delay), true) = (outcome, schedule) {
            schedule_pulse(&self.shared, &self.scheduler, delay);
        }
        outcome
    }

    /// Keep driving while bytes move, for hosts whose sink notifications do not
    /// loop back into [`ThrottleTransform::on_event`]. Returns the first outcome that
    /// is not [`Drive::Progress`].
    pub fn pump(&self) -> Drive {
        loop {
            match self.on_event(CopierEvent::WriteReady) {
                Drive::Progress => continue,
                other => return other,
            }
        }
    }

    /// Tear the stream down. Safe to call repeatedly; pending re-drives become no-ops.
    pub fn close(&self) {
        lock(&self.shared).copier.close();
    }

    pub fn state(&self) -> CopierState {
        lock(&self.shared).copier.state()
    }

    /// Whether a re-drive is queued on the scheduler.
    pub fn pulse_pending(&self) -> bool {
        lock(&self.shared).pulse_pending
    }

    /// Run `f` against the copier under its lock.
    pub fn inspect<R>(&self, f: impl FnOnce(&ThrottledCopier<Src, Snk, T>) -> R) -> R {
        f(&lock(&self.shared).copier)
    }
}

impl<Src, Snk, T> Drop for ThrottleTransform<Src, Snk, T>
where
    Src: ByteSource + Send + 'static,
    Snk: ByteSink + Send + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    fn drop(&mut self) {
        self.close();
    }
}

impl<Src, Snk, T> std::fmt::Debug for ThrottleTransform<Src, Snk, T>
where
    Src: ByteSource + Send + 'static,
    Snk: ByteSink + Send + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottleTransform")
            .field("state", &self.state())
            .field("pulse_pending", &self.pulse_pending())
            .field("scheduler", &self.scheduler)
            .finish()
    }
}

/// Queue one re-drive. The caller must already hold the pulse slot.
fn schedule_pulse<Src, Snk, T>(
    shared: &Shared<Src, Snk, T>,
    scheduler: &Arc<dyn Scheduler>,
    delay: Duration,
) where
    Src: ByteSource + Send + 'static,
    Snk: ByteSink + Send + 'static,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    let weak: Weak<Mutex<Driven<ThrottledCopier<Src, Snk, T>>>> = Arc::downgrade(shared);
    let next = scheduler.clone();
    scheduler.schedule(
        delay,
        Box::new(move || {
            let Some(shared) = weak.upgrade() else {
                tracing::trace!("re-drive fired after stream was dropped");
                return;
            };
            let outcome = {
                let mut driven = lock(&shared);
                driven.pulse_pending = false;
                let outcome = driven.copier.handle(CopierEvent::Pulse);
                if matches!(outcome, Drive::Throttled(_)) {
                    driven.pulse_pending = true;
                }
                outcome
            };
            if let Drive::Throttled(delay) = outcome {
                schedule_pulse(&shared, &next, delay);
            }
        }),
    );
}

fn lock<C>(shared: &Mutex<C>) -> MutexGuard<'_, C> {
    shared.lock().unwrap_or_else(PoisonError::into_inner)
}

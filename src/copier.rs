//! Throttled stream copier.
//!
//! [`ThrottledCopier`] is the per-stream state machine that moves bytes from a
//! [`ByteSource`] to a [`ByteSink`] at the rate a shared [`RateLimiter`] allows.
//! It never blocks: when the limiter grants nothing, [`ThrottledCopier::handle`]
//! returns [`Drive::Throttled`] and the owner schedules a re-drive (see
//! [`ThrottleTransform`](crate::ThrottleTransform)).
//!
//! # States
//!
//! ```text
//! Uninitialized ──first drive──▶ Streaming ──source exhausted──▶ Draining ──write complete──▶ Done
//!       │                            │                              │
//!       └──────────── close / upstream error ──────────────────────┴──────────▶ Closed
//! ```

use crate::allowance::AllowanceState;
use crate::limiter::RateLimiter;
use crate::telemetry::{emit_detached, NullSink, TelemetrySink, ThrottleEvent};
use std::sync::Arc;
use std::time::Duration;

/// Delay before re-driving a stream whose grant came back empty.
pub const DEFAULT_BACKOFF: Duration = Duration::from_millis(100);

/// Upstream side of a throttled stream.
pub trait ByteSource {
    /// Total body length announced by upstream.
    fn total_len(&self) -> u64;
    /// Bytes not yet consumed out of `total_len`.
    fn bytes_remaining(&self) -> u64;
    /// Bytes buffered and ready to be consumed now.
    fn bytes_available(&self) -> u64;
    /// Bytes consumed so far.
    fn bytes_done(&self) -> u64;
    /// Remove up to `n` available bytes and count them as done.
    fn consume(&mut self, n: u64) -> Vec<u8>;
    /// Upstream has nothing more to deliver.
    fn end_of_stream(&self) -> bool;
}

/// Notification sent to the downstream side.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkEvent {
    /// More data was written; the consumer may read again.
    Ready,
    /// The body is complete.
    Complete,
    /// Upstream failed; no more data will follow.
    Error,
}

/// Downstream side of a throttled stream.
pub trait ByteSink {
    /// Prepare the output for a body of `expected_len` bytes.
    fn open(&mut self, expected_len: u64);
    fn write(&mut self, bytes: Vec<u8>);
    /// Fix the number of bytes the output will carry.
    fn set_final_size(&mut self, n: u64);
    /// Re-enable the output so it picks up newly written bytes.
    fn rearm(&mut self);
    fn notify(&mut self, event: SinkEvent);
    /// Close the write side of the output.
    fn shutdown(&mut self);
}

/// Events delivered to a copier by its dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopierEvent {
    /// Upstream has bytes ready (or the output wants more).
    WriteReady,
    /// A scheduled re-drive after backpressure.
    Pulse,
    /// The output flushed every byte written to it.
    WriteComplete,
    /// Upstream reported an abnormal condition.
    Error,
}

/// Lifecycle of a [`ThrottledCopier`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CopierState {
    /// Output not opened yet.
    Uninitialized,
    /// Forwarding bytes.
    Streaming,
    /// Every byte was handed to the output; waiting for it to flush.
    Draining,
    /// Output flushed and shut down.
    Done,
    /// Torn down early, or failed upstream.
    Closed,
}

impl CopierState {
    pub fn is_terminal(self) -> bool {
        matches!(self, CopierState::Done | CopierState::Closed)
    }
}

/// What a single drive accomplished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Drive {
    /// Bytes moved; more remain.
    Progress,
    /// Nothing granted; re-drive after the given delay.
    Throttled(Duration),
    /// The stream reached `Draining`, `Done` or `Closed` during this call.
    Finished,
    /// Nothing to do until the next event.
    Idle,
}

#[derive(Debug)]
struct Io<Src, Snk> {
    source: Src,
    sink: Snk,
}

/// Per-stream throttled copy loop.
#[derive(Debug)]
pub struct ThrottledCopier<Src, Snk, T = NullSink> {
    state: CopierState,
    io: Option<Io<Src, Snk>>,
    limiter: Arc<RateLimiter>,
    allowance: Option<AllowanceState>,
    backoff: Duration,
    telemetry: T,
}

impl<Src, Snk> ThrottledCopier<Src, Snk, NullSink>
where
    Src: ByteSource,
    Snk: ByteSink,
{
    /// Register a fresh allowance with `limiter` and wrap `source`/`sink`.
    pub fn new(limiter: Arc<RateLimiter>, source: Src, sink: Snk) -> Self {
        let allowance = limiter.register_limiter();
        Self {
            state: CopierState::Uninitialized,
            io: Some(Io { source, sink }),
            limiter,
            allowance: Some(allowance),
            backoff: DEFAULT_BACKOFF,
            telemetry: NullSink,
        }
    }
}

impl<Src, Snk, T> ThrottledCopier<Src, Snk, T>
where
    Src: ByteSource,
    Snk: ByteSink,
    T: TelemetrySink,
    T::Future: Send + 'static,
{
    /// Attach a telemetry sink.
    pub fn with_telemetry<U>(self, telemetry: U) -> ThrottledCopier<Src, Snk, U>
    where
        U: TelemetrySink,
    {
        ThrottledCopier {
            state: self.state,
            io: self.io,
            limiter: self.limiter,
            allowance: self.allowance,
            backoff: self.backoff,
            telemetry,
        }
    }

    /// Override the backpressure delay.
    pub fn with_backoff(mut self, backoff: Duration) -> Self {
        self.backoff = backoff;
        self
    }

    /// Current lifecycle state.
    pub fn state(&self) -> CopierState {
        self.state
    }

    /// Delay requested from the scheduler after an empty grant.
    pub fn backoff(&self) -> Duration {
        self.backoff
    }

    /// This stream's allowance; `None` once released.
    pub fn allowance(&self) -> Option<&AllowanceState> {
        self.allowance.as_ref()
    }

    /// Whether the source, sink and allowance have been dropped.
    pub fn is_released(&self) -> bool {
        self.io.is_none() && self.allowance.is_none()
    }

    /// React to one dispatcher event. Terminal copiers ignore every event.
    pub fn handle(&mut self, event: CopierEvent) -> Drive {
        if self.state.is_terminal() {
            tracing::trace!(?event, state = ?self.state, "event after teardown ignored");
            return Drive::Idle;
        }
        match event {
            CopierEvent::Error => self.fail(),
            CopierEvent::WriteComplete => self.finish_output(),
            CopierEvent::WriteReady | CopierEvent::Pulse => self.drive(),
        }
    }

    /// Tear the stream down, dropping source, sink and allowance. Idempotent.
    pub fn close(&mut self) {
        if self.state == CopierState::Closed && self.is_released() {
            return;
        }
        let bytes_done = self.io.as_ref().map_or(0, |io| io.source.bytes_done());
        let was_terminal = self.state.is_terminal();
        self.release();
        self.state = CopierState::Closed;
        if !was_terminal {
            tracing::debug!(bytes_done, "throttled stream closed");
            emit_detached(self.telemetry.clone(), ThrottleEvent::Closed { bytes_done });
        }
    }

    fn drive(&mut self) -> Drive {
        let Some(io) = self.io.as_mut() else {
            return Drive::Idle;
        };

        if self.state == CopierState::Uninitialized {
            io.sink.open(io.source.total_len());
            self.state = CopierState::Streaming;
        }
        if self.state != CopierState::Streaming {
            return Drive::Idle;
        }

        if io.source.end_of_stream() {
            let done = io.source.bytes_done();
            io.sink.set_final_size(done);
            io.sink.rearm();
            self.state = CopierState::Draining;
            tracing::debug!(bytes = done, "upstream ended; draining");
            return Drive::Finished;
        }

        let requested = io.source.bytes_remaining().min(io.source.bytes_available());
        let mut moved = 0;
        if requested > 0 {
            moved = self.limiter.get_max_units(requested, self.allowance.as_mut());
            if moved == 0 {
                tracing::debug!(requested, backoff = ?self.backoff, "allowance exhausted; rescheduling");
                emit_detached(
                    self.telemetry.clone(),
                    ThrottleEvent::Throttled { requested, retry_in: self.backoff },
                );
                return Drive::Throttled(self.backoff);
            }
            let bytes = io.source.consume(moved);
            io.sink.write(bytes);
            emit_detached(self.telemetry.clone(), ThrottleEvent::Granted { requested, granted: moved });
        }

        if io.source.bytes_remaining() > 0 {
            if moved == 0 {
                return Drive::Idle;
            }
            io.sink.rearm();
            io.sink.notify(SinkEvent::Ready);
            Drive::Progress
        } else {
            let done = io.source.bytes_done();
            io.sink.set_final_size(done);
            io.sink.rearm();
            io.sink.notify(SinkEvent::Complete);
            self.state = CopierState::Draining;
            emit_detached(self.telemetry.clone(), ThrottleEvent::Completed { bytes: done });
            Drive::Finished
        }
    }

    fn finish_output(&mut self) -> Drive {
        if self.state != CopierState::Draining {
            tracing::debug!(state = ?self.state, "output completed before the body was drained");
        }
        if let Some(io) = self.io.as_mut() {
            io.sink.shutdown();
        }
        self.release();
        self.state = CopierState::Done;
        Drive::Finished
    }

    fn fail(&mut self) -> Drive {
        let bytes_done = match self.io.as_mut() {
            Some(io) => {
                io.sink.notify(SinkEvent::Error);
                io.source.bytes_done()
            }
            None => 0,
        };
        tracing::warn!(bytes_done, "upstream error; stream abandoned");
        emit_detached(self.telemetry.clone(), ThrottleEvent::Failed { bytes_done });
        self.release();
        self.state = CopierState::Closed;
        Drive::Finished
    }

    fn release(&mut self) {
        self.io = None;
        self.allowance = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::pipe::{PipeSource, RecordingSink, SinkCall};
    use crate::quota::QuotaTable;
    use crate::telemetry::MemorySink;

    fn limiter(rate: u64, clock: &ManualClock) -> Arc<RateLimiter> {
        Arc::new(RateLimiter::new(QuotaTable::uniform(rate, 1000).unwrap()).with_clock(clock.clone()))
    }

    #[test]
    fn first_drive_opens_output_and_forwards_granted_bytes() {
        let clock = ManualClock::new();
        let source = PipeSource::from_bytes(&[7u8; 300]);
        let sink = RecordingSink::new();
        let mut copier = ThrottledCopier::new(limiter(1000, &clock), source.clone(), sink.clone());
        assert_eq!(copier.state(), CopierState::Uninitialized);

        assert_eq!(copier.handle(CopierEvent::WriteReady), Drive::Finished);
        assert_eq!(copier.state(), CopierState::Draining);
        assert_eq!(
            sink.calls(),
            vec![
                SinkCall::Open(300),
                SinkCall::Write(300),
                SinkCall::SetFinalSize(300),
                SinkCall::Rearm,
                SinkCall::Notify(SinkEvent::Complete),
            ]
        );
        assert_eq!(sink.written().len(), 300);
    }

    #[test]
    fn partial_grant_rearms_and_notifies_ready() {
        let clock = ManualClock::new();
        let source = PipeSource::from_bytes(&[1u8; 1500]);
        let sink = RecordingSink::new();
        let mut copier = ThrottledCopier::new(limiter(1000, &clock), source.clone(), sink.clone());

        assert_eq!(copier.handle(CopierEvent::WriteReady), Drive::Progress);
        assert_eq!(source.bytes_done(), 1000);
        assert_eq!(sink.notifications(), vec![SinkEvent::Ready]);
        assert_eq!(copier.state(), CopierState::Streaming);
    }

    #[test]
    fn zero_grant_throttles_without_touching_io() {
        let clock = ManualClock::new();
        let source = PipeSource::from_bytes(&[1u8; 1500]);
        let sink = RecordingSink::new();
        let mut copier = ThrottledCopier::new(limiter(1000, &clock), source.clone(), sink.clone());
        copier.handle(CopierEvent::WriteReady);

        let calls_before = sink.calls();
        let done_before = source.bytes_done();
        assert_eq!(copier.handle(CopierEvent::WriteReady), Drive::Throttled(DEFAULT_BACKOFF));
        assert_eq!(sink.calls(), calls_before);
        assert_eq!(source.bytes_done(), done_before);
        assert_eq!(source.bytes_available(), 500);

        clock.advance(Duration::from_millis(500));
        assert_eq!(copier.handle(CopierEvent::Pulse), Drive::Finished);
        assert_eq!(sink.final_size(), Some(1500));
    }

    #[test]
    fn end_of_stream_drains_without_consulting_limiter() {
        let clock = ManualClock::new();
        let limiter = limiter(1000, &clock);
        let source = PipeSource::new(0);
        source.close_upstream();
        let sink = RecordingSink::new();
        let mut copier = ThrottledCopier::new(limiter, source, sink.clone());

        assert_eq!(copier.handle(CopierEvent::WriteReady), Drive::Finished);
        assert_eq!(copier.state(), CopierState::Draining);
        assert_eq!(sink.final_size(), Some(0));
        assert_eq!(copier.allowance().map(|a| a.total_taken()), Some(0));
        assert!(!sink.calls().iter().any(|c| matches!(c, SinkCall::Write(_))));
    }

    #[test]
    fn truncated_upstream_finalizes_at_bytes_done() {
        let clock = ManualClock::new();
        let source = PipeSource::new(100);
        source.push(&[0u8; 40]);
        let sink = RecordingSink::new();
        let mut copier = ThrottledCopier::new(limiter(1000, &clock), source.clone(), sink.clone());

        assert_eq!(copier.handle(CopierEvent::WriteReady), Drive::Progress);
        source.close_upstream();
        assert_eq!(copier.handle(CopierEvent::WriteReady), Drive::Finished);
        assert_eq!(sink.final_size(), Some(40));
    }

    #[test]
    fn waiting_for_upstream_is_idle() {
        let clock = ManualClock::new();
        let source = PipeSource::new(10);
        let sink = RecordingSink::new();
        let mut copier = ThrottledCopier::new(limiter(1000, &clock), source.clone(), sink.clone());

        assert_eq!(copier.handle(CopierEvent::WriteReady), Drive::Idle);
        assert_eq!(sink.calls(), vec![SinkCall::Open(10)]);
    }

    #[test]
    fn write_complete_shuts_down_and_releases() {
        let clock = ManualClock::new();
        let sink = RecordingSink::new();
        let mut copier =
            ThrottledCopier::new(limiter(1000, &clock), PipeSource::from_bytes(b"abc"), sink.clone());
        copier.handle(CopierEvent::WriteReady);

        assert_eq!(copier.handle(CopierEvent::WriteComplete), Drive::Finished);
        assert_eq!(copier.state(), CopierState::Done);
        assert!(sink.is_shutdown());
        assert!(copier.is_released());

        assert_eq!(copier.handle(CopierEvent::WriteReady), Drive::Idle);
        copier.close();
        copier.close();
        assert_eq!(copier.state(), CopierState::Closed);
    }

    #[test]
    fn upstream_error_is_forwarded_once() {
        let clock = ManualClock::new();
        let sink = RecordingSink::new();
        let mut copier =
            ThrottledCopier::new(limiter(1000, &clock), PipeSource::new(10), sink.clone());

        assert_eq!(copier.handle(CopierEvent::Error), Drive::Finished);
        assert_eq!(copier.state(), CopierState::Closed);
        assert_eq!(sink.notifications(), vec![SinkEvent::Error]);
        assert!(!sink.calls().iter().any(|c| matches!(c, SinkCall::Write(_))));

        assert_eq!(copier.handle(CopierEvent::Error), Drive::Idle);
        assert_eq!(sink.notifications().len(), 1);
    }

    #[test]
    fn telemetry_records_grants_and_backpressure() {
        let clock = ManualClock::new();
        let events = MemorySink::new();
        let mut copier = ThrottledCopier::new(
            limiter(100, &clock),
            PipeSource::from_bytes(&[0u8; 150]),
            RecordingSink::new(),
        )
        .with_telemetry(events.clone())
        .with_backoff(Duration::from_millis(20));

        copier.handle(CopierEvent::WriteReady);
        copier.handle(CopierEvent::WriteReady);
        copier.close();

        assert_eq!(
            events.events(),
            vec![
                ThrottleEvent::Granted { requested: 150, granted: 100 },
                ThrottleEvent::Throttled { requested: 50, retry_in: Duration::from_millis(20) },
                ThrottleEvent::Closed { bytes_done: 100 },
            ]
        );
    }
}

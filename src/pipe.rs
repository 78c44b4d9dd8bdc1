//! In-memory byte source and sink.
//!
//! [`PipeSource`] stands in for the proxy's upstream body buffer and
//! [`RecordingSink`] for the downstream connection. Both are cheap to clone and
//! clones share state, so a test (or a host adapter) can keep feeding and
//! observing a pipeline after handing it to a copier.

use crate::copier::{ByteSink, ByteSource, SinkEvent};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

#[derive(Debug, Default)]
struct PipeInner {
    buf: VecDeque<u8>,
    total_len: u64,
    done: u64,
    closed: bool,
}

/// Upstream body buffer with a known total length.
#[derive(Debug, Clone, Default)]
pub struct PipeSource {
    inner: Arc<Mutex<PipeInner>>,
}

impl PipeSource {
    /// Empty pipe expecting `total_len` bytes.
    pub fn new(total_len: u64) -> Self {
        let pipe = Self::default();
        pipe.lock().total_len = total_len;
        pipe
    }

    /// Pipe already holding the whole body.
    pub fn from_bytes(body: &[u8]) -> Self {
        let pipe = Self::new(body.len() as u64);
        pipe.push(body);
        pipe
    }

    /// Make more upstream bytes available.
    pub fn push(&self, bytes: &[u8]) {
        self.lock().buf.extend(bytes.iter().copied());
    }

    /// Upstream is finished; once the buffered bytes drain the source reports
    /// end-of-stream.
    pub fn close_upstream(&self) {
        self.lock().closed = true;
    }

    fn lock(&self) -> MutexGuard<'_, PipeInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ByteSource for PipeSource {
    fn total_len(&self) -> u64 {
        self.lock().total_len
    }

    fn bytes_remaining(&self) -> u64 {
        let inner = self.lock();
        inner.total_len.saturating_sub(inner.done)
    }

    fn bytes_available(&self) -> u64 {
        self.lock().buf.len() as u64
    }

    fn bytes_done(&self) -> u64 {
        self.lock().done
    }

    fn consume(&mut self, n: u64) -> Vec<u8> {
        let mut inner = self.lock();
        let n = usize::try_from(n).unwrap_or(usize::MAX).min(inner.buf.len());
        let taken: Vec<u8> = inner.buf.drain(..n).collect();
        inner.done += taken.len() as u64;
        taken
    }

    fn end_of_stream(&self) -> bool {
        let inner = self.lock();
        inner.closed && inner.buf.is_empty()
    }
}

/// Every call a copier made on a [`RecordingSink`], in order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SinkCall {
    Open(u64),
    Write(usize),
    SetFinalSize(u64),
    Rearm,
    Notify(SinkEvent),
    Shutdown,
}

#[derive(Debug, Default)]
struct RecordingInner {
    calls: Vec<SinkCall>,
    written: Vec<u8>,
}

/// Downstream sink that keeps the bytes and records each contract call.
#[derive(Debug, Clone, Default)]
pub struct RecordingSink {
    inner: Arc<Mutex<RecordingInner>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<SinkCall> {
        self.lock().calls.clone()
    }

    pub fn written(&self) -> Vec<u8> {
        self.lock().written.clone()
    }

    /// Last size passed to `set_final_size`.
    pub fn final_size(&self) -> Option<u64> {
        self.lock().calls.iter().rev().find_map(|call| match call {
            SinkCall::SetFinalSize(n) => Some(*n),
            _ => None,
        })
    }

    pub fn notifications(&self) -> Vec<SinkEvent> {
        self.lock()
            .calls
            .iter()
            .filter_map(|call| match call {
                SinkCall::Notify(event) => Some(*event),
                _ => None,
            })
            .collect()
    }

    pub fn is_shutdown(&self) -> bool {
        self.lock().calls.contains(&SinkCall::Shutdown)
    }

    fn record(&self, call: SinkCall) {
        self.lock().calls.push(call);
    }

    fn lock(&self) -> MutexGuard<'_, RecordingInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl ByteSink for RecordingSink {
    fn open(&mut self, expected_len: u64) {
        self.record(SinkCall::Open(expected_len));
    }

    fn write(&mut self, bytes: Vec<u8>) {
        let mut inner = self.lock();
        inner.calls.push(SinkCall::Write(bytes.len()));
        inner.written.extend_from_slice(&bytes);
    }

    fn set_final_size(&mut self, n: u64) {
        self.record(SinkCall::SetFinalSize(n));
    }

    fn rearm(&mut self) {
        self.record(SinkCall::Rearm);
    }

    fn notify(&mut self, event: SinkEvent) {
        self.record(SinkCall::Notify(event));
    }

    fn shutdown(&mut self) {
        self.record(SinkCall::Shutdown);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_tracks_done_and_remaining() {
        let mut source = PipeSource::new(10);
        source.push(b"hello");
        assert_eq!(source.bytes_available(), 5);
        assert_eq!(source.bytes_remaining(), 10);

        assert_eq!(source.consume(3), b"hel".to_vec());
        assert_eq!(source.bytes_done(), 3);
        assert_eq!(source.bytes_remaining(), 7);
        assert_eq!(source.bytes_available(), 2);
    }

    #[test]
    fn consume_never_exceeds_available() {
        let mut source = PipeSource::from_bytes(b"abc");
        assert_eq!(source.consume(10), b"abc".to_vec());
        assert_eq!(source.bytes_done(), 3);
    }

    #[test]
    fn end_of_stream_waits_for_buffer_to_drain() {
        let mut source = PipeSource::new(4);
        source.push(b"ab");
        source.close_upstream();
        assert!(!source.end_of_stream());
        source.consume(2);
        assert!(source.end_of_stream());
    }

    #[test]
    fn recording_sink_clones_share_log() {
        let sink = RecordingSink::new();
        let mut handle = sink.clone();
        handle.open(3);
        handle.write(b"xyz".to_vec());
        handle.set_final_size(3);
        handle.notify(SinkEvent::Complete);
        handle.shutdown();

        assert_eq!(sink.written(), b"xyz".to_vec());
        assert_eq!(sink.final_size(), Some(3));
        assert_eq!(sink.notifications(), vec![SinkEvent::Complete]);
        assert!(sink.is_shutdown());
        assert_eq!(sink.calls()[0], SinkCall::Open(3));
    }
}

#![forbid(unsafe_code)]
#![deny(warnings)]
#![cfg_attr(not(test), deny(clippy::all))]

//! # limit-rate
//!
//! Hour-of-day byte throttling for proxied response bodies.
//!
//! A [`QuotaTable`] holds one `(max_rate, window)` pair for each local hour. A
//! shared [`RateLimiter`] hands out byte grants against a per-stream
//! [`AllowanceState`], refilling each hour's bucket in proportion to the time
//! since that hour was last used. A [`ThrottledCopier`] moves bytes from a
//! [`ByteSource`] to a [`ByteSink`] no faster than the limiter allows and reports
//! [`Drive::Throttled`] when the bucket is empty; a [`ThrottleTransform`] turns that
//! into a single deferred re-drive on a [`Scheduler`].
//!
//! ## Features
//!
//! - **Per-hour quotas** loaded from `key=value` configuration files
//! - **Token-bucket accounting** shared safely across concurrent streams
//! - **Backpressured copying** that never blocks the caller
//! - **Cancellation-safe re-drives** that become no-ops once a stream is gone
//! - **Telemetry** through `tower::Service` sinks
//!
//! ## Quick Start
//!
//! ```rust
//! use limit_rate::{
//!     CopierEvent, Drive, ManualClock, PipeSource, QuotaTable, RateLimiter, RecordingSink,
//!     ThrottledCopier,
//! };
//! use std::sync::Arc;
//!
//! let limiter = Arc::new(
//!     RateLimiter::new(QuotaTable::uniform(1_000, 1_000).unwrap()).with_clock(ManualClock::new()),
//! );
//! let source = PipeSource::from_bytes(&[0u8; 600]);
//! let sink = RecordingSink::new();
//! let mut copier = ThrottledCopier::new(limiter, source, sink.clone());
//!
//! assert_eq!(copier.handle(CopierEvent::WriteReady), Drive::Finished);
//! assert_eq!(sink.written().len(), 600);
//! ```

pub mod allowance;
pub mod clock;
pub mod config;
pub mod copier;
pub mod limiter;
pub mod pipe;
pub mod prelude;
pub mod quota;
pub mod scheduler;
pub mod telemetry;
pub mod transform;

// Re-exports
pub use allowance::{AllowanceState, Slot};
pub use clock::{Clock, ManualClock, SystemClock, Timestamp};
pub use config::{build_limiter, ConfigError, Configuration, QuotaDefaults};
pub use copier::{
    ByteSink, ByteSource, CopierEvent, CopierState, Drive, SinkEvent, ThrottledCopier,
    DEFAULT_BACKOFF,
};
pub use limiter::RateLimiter;
pub use pipe::{PipeSource, RecordingSink, SinkCall};
pub use quota::{QuotaEntry, QuotaError, QuotaTable, QuotaTableBuilder, HOURS_PER_DAY};
pub use scheduler::{ManualScheduler, Scheduler, TokioScheduler};
pub use telemetry::{LogSink, MemorySink, NullSink, TelemetrySink, ThrottleEvent};
pub use transform::ThrottleTransform;

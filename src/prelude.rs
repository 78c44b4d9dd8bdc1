//! Convenient re-exports for wiring a throttled stream.
pub use crate::{
    config::{build_limiter, QuotaDefaults},
    copier::{ByteSink, ByteSource, CopierEvent, CopierState, Drive, SinkEvent, ThrottledCopier},
    limiter::RateLimiter,
    quota::{QuotaError, QuotaTable},
    scheduler::{Scheduler, TokioScheduler},
    telemetry::{LogSink, TelemetrySink, ThrottleEvent},
    transform::ThrottleTransform,
};

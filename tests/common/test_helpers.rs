use limit_rate::{ManualClock, PipeSource, QuotaTable, RateLimiter, RecordingSink, ThrottledCopier};
use std::path::PathBuf;
use std::sync::Arc;

/// Fresh directory under the system temp dir, unique per test.
pub fn scratch_dir(test: &str) -> PathBuf {
    let dir = std::env::temp_dir().join(format!("limit-rate-{}-{}", std::process::id(), test));
    let _ = std::fs::remove_dir_all(&dir);
    std::fs::create_dir_all(&dir).expect("create scratch dir");
    dir
}

/// Write `contents` to `dir/name` and return the full path.
pub fn write_file(dir: &PathBuf, name: &str, contents: &str) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, contents).expect("write config");
    path
}

/// Limiter with the same quota every hour, a 1 s window and a shared manual clock.
pub fn uniform_limiter(rate: u64, clock: &ManualClock) -> Arc<RateLimiter> {
    Arc::new(RateLimiter::new(QuotaTable::uniform(rate, 1000).unwrap()).with_clock(clock.clone()))
}

/// Copier over an in-memory body, plus handles on its source and sink.
pub fn copier(
    limiter: &Arc<RateLimiter>,
    body: &[u8],
) -> (ThrottledCopier<PipeSource, RecordingSink>, PipeSource, RecordingSink) {
    let source = PipeSource::from_bytes(body);
    let sink = RecordingSink::new();
    (ThrottledCopier::new(limiter.clone(), source.clone(), sink.clone()), source, sink)
}

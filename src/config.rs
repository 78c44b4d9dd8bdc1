//! Quota configuration loading.
//!
//! The configuration file is a list of `key=value` lines. Keys of the form
//! `<hour>hour` (for example `0hour`, `23hour`) set the quota of that hour slot;
//! other keys are kept but ignored by quota assembly. Hours without a key fall
//! back to [`QuotaDefaults::fallback_rate`], and every hour shares the same window.
//!
//! ```text
//! # bytes per second, by local hour
//! 0hour=2097152
//! 9hour=524288
//! 18hour=262144
//! ```

use crate::limiter::RateLimiter;
use crate::quota::{QuotaError, QuotaTable, HOURS_PER_DAY};
use std::collections::BTreeMap;
use std::io;
use std::path::{Path, PathBuf};

/// Quota used for hours the configuration does not mention.
pub const DEFAULT_FALLBACK_RATE: u64 = 1_048_576;
/// Replenishment window applied to every hour.
pub const DEFAULT_WINDOW_MS: u64 = 1_000;
/// Suffix following the hour number in configuration keys.
pub const HOUR_KEY_SUFFIX: &str = "hour";

/// Errors produced while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("no configuration file name provided")]
    EmptyPath,
    #[error("unable to read {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Quota(#[from] QuotaError),
}

/// Defaults applied when turning a [`Configuration`] into a [`QuotaTable`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaDefaults {
    pub fallback_rate: u64,
    pub window_ms: u64,
}

impl Default for QuotaDefaults {
    fn default() -> Self {
        Self { fallback_rate: DEFAULT_FALLBACK_RATE, window_ms: DEFAULT_WINDOW_MS }
    }
}

/// Named numeric limits read from a configuration file.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Configuration {
    limits: BTreeMap<String, u64>,
}

impl Configuration {
    /// Parse `key=value` lines. Blank lines, `#` comments and lines without `=`
    /// are skipped. Values are read like C `atol` into an unsigned slot: an
    /// optional sign and leading digits, `0` when there are none, saturating at
    /// `i64::MAX`, with negative values wrapping. The first occurrence of a key wins.
    pub fn parse(text: &str) -> Self {
        let mut limits = BTreeMap::new();
        for line in text.lines() {
            let line = line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let Some((key, value)) = line.split_once('=') else {
                continue;
            };
            limits.entry(key.trim().to_string()).or_insert_with(|| parse_leading_u64(value));
        }
        Self { limits }
    }

    /// Read and parse `path`. Relative paths are resolved against `config_dir`.
    pub fn load(path: impl AsRef<Path>, config_dir: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = resolve_path(path.as_ref(), config_dir.as_ref())?;
        let text = std::fs::read_to_string(&path)
            .map_err(|source| ConfigError::Io { path: path.clone(), source })?;
        let config = Self::parse(&text);
        tracing::debug!(path = %path.display(), keys = config.len(), "loaded limit configuration");
        Ok(config)
    }

    /// Value parsed for `key`, if the file had it.
    pub fn get(&self, key: &str) -> Option<u64> {
        self.limits.get(key).copied()
    }

    /// Configured quota for `hour`, if any.
    pub fn hour_limit(&self, hour: usize) -> Option<u64> {
        self.get(&format!("{}{}", hour, HOUR_KEY_SUFFIX))
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, u64)> {
        self.limits.iter().map(|(k, v)| (k.as_str(), *v))
    }

    pub fn len(&self) -> usize {
        self.limits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.limits.is_empty()
    }

    /// One entry per hour: the configured quota, or the fallback.
    pub fn quota_table(&self, defaults: &QuotaDefaults) -> Result<QuotaTable, QuotaError> {
        let mut builder = QuotaTable::builder();
        for hour in 0..HOURS_PER_DAY {
            let rate = match self.hour_limit(hour) {
                Some(rate) => rate,
                None => {
                    tracing::debug!(hour, fallback = defaults.fallback_rate, "no quota configured");
                    defaults.fallback_rate
                }
            };
            builder.add_counter(rate, defaults.window_ms)?;
        }
        builder.build()
    }
}

/// Resolve a configuration path: absolute paths are used as-is, relative ones are
/// joined onto `config_dir`.
pub fn resolve_path(path: &Path, config_dir: &Path) -> Result<PathBuf, ConfigError> {
    if path.as_os_str().is_empty() {
        return Err(ConfigError::EmptyPath);
    }
    if path.is_absolute() {
        Ok(path.to_path_buf())
    } else {
        Ok(config_dir.join(path))
    }
}

/// Build the limiter for one configured instance.
///
/// With a readable configuration the limiter is enabled. When no path is given or
/// the file cannot be read, the limiter is built on a fallback table and left
/// disabled, so hosts skip throttling for it. Only an unusable `defaults` (a zero
/// window) is an error.
pub fn build_limiter(
    path: Option<&Path>,
    config_dir: &Path,
    defaults: &QuotaDefaults,
) -> Result<RateLimiter, QuotaError> {
    let loaded = match path {
        Some(path) => Configuration::load(path, config_dir),
        None => Err(ConfigError::EmptyPath),
    };

    match loaded {
        Ok(config) => {
            let limiter = RateLimiter::new(config.quota_table(defaults)?);
            limiter.set_enabled(true);
            let configured_hours =
                (0..HOURS_PER_DAY).filter(|h| config.hour_limit(*h).is_some()).count();
            tracing::info!(configured_hours, "rate limiter enabled");
            Ok(limiter)
        }
        Err(err) => {
            tracing::warn!(error = %err, "limit configuration unavailable; throttling disabled");
            Ok(RateLimiter::new(QuotaTable::uniform(defaults.fallback_rate, defaults.window_ms)?))
        }
    }
}

fn parse_leading_u64(value: &str) -> u64 {
    let value = value.trim_start();
    let (negative, digits) = match value.as_bytes().first() {
        Some(b'-') => (true, &value[1..]),
        Some(b'+') => (false, &value[1..]),
        _ => (false, value),
    };
    let magnitude = digits
        .bytes()
        .take_while(u8::is_ascii_digit)
        .fold(0i64, |acc, d| acc.saturating_mul(10).saturating_add(i64::from(d - b'0')));
    // Signed like `atol`, then reinterpreted as unsigned: `-1` means no practical limit.
    let signed = if negative { magnitude.saturating_neg() } else { magnitude };
    signed as u64
}

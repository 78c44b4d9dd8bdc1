//! Rate accounting engine: hourly token buckets with per-stream allowances.

use crate::allowance::AllowanceState;
use crate::clock::{Clock, SystemClock};
use crate::quota::{QuotaEntry, QuotaTable, HOURS_PER_DAY};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

/// Grants units against the quota of the current local hour.
///
/// The quota table is shared read-only; each stream brings its own
/// [`AllowanceState`]. Every grant computation runs under one exclusive lock owned
/// by the limiter, so "read clock, compute, commit" sequences are globally ordered
/// across all streams of this instance.
///
/// # Examples
/// ```
/// use limit_rate::{QuotaTable, RateLimiter};
///
/// let limiter = RateLimiter::new(QuotaTable::uniform(1000, 1000).unwrap());
/// let mut state = limiter.register_limiter();
/// assert_eq!(limiter.get_max_units(1500, Some(&mut state)), 1000);
/// assert_eq!(limiter.get_max_units(1, Some(&mut state)), 0);
/// ```
#[derive(Debug)]
pub struct RateLimiter {
    table: Arc<QuotaTable>,
    update_lock: Mutex<()>,
    enabled: AtomicBool,
    clock: Arc<dyn Clock>,
}

impl RateLimiter {
    /// Create a limiter over `table` using the system clock. Starts disabled; see
    /// [`RateLimiter::set_enabled`].
    pub fn new(table: QuotaTable) -> Self {
        Self::from_shared(Arc::new(table))
    }

    /// Create a limiter over an already shared table.
    pub fn from_shared(table: Arc<QuotaTable>) -> Self {
        Self {
            table,
            update_lock: Mutex::new(()),
            enabled: AtomicBool::new(false),
            clock: Arc::new(SystemClock),
        }
    }

    /// Override the clock (useful for deterministic tests).
    ///
    /// # Example
    /// ```
    /// # use limit_rate::{ManualClock, QuotaTable, RateLimiter};
    /// let clock = ManualClock::at_hour(9);
    /// let limiter = RateLimiter::new(QuotaTable::uniform(10, 1000).unwrap())
    ///     .with_clock(clock.clone());
    /// ```
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    /// The quota table shared by every stream of this limiter.
    pub fn table(&self) -> &Arc<QuotaTable> {
        &self.table
    }

    /// Quota entry for hour slot `index`.
    pub fn entry(&self, index: usize) -> Option<&QuotaEntry> {
        self.table.get(index)
    }

    /// Whether the host integration should install throttling for new streams.
    pub fn enabled(&self) -> bool {
        self.enabled.load(Ordering::Acquire)
    }

    /// Turn throttling on or off for streams installed after this call.
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Release);
    }

    /// Allocate a fresh allowance for one stream: every slot full, every timestamp now.
    pub fn register_limiter(&self) -> AllowanceState {
        AllowanceState::seeded(&self.table, self.clock.now())
    }

    /// How many of `amount` units the caller may use right now.
    ///
    /// The hour slot is sampled once, on entry. Without a `state` the caller is
    /// unregistered and gets the hour's `max_rate` with no accounting. Otherwise
    /// the slot is replenished in proportion to the time elapsed since its last
    /// update, capped at `max_rate`, and the grant is deducted from it.
    pub fn get_max_units(&self, amount: u64, state: Option<&mut AllowanceState>) -> u64 {
        let hour = self.clock.local_hour() % HOURS_PER_DAY;
        let entry = self.table[hour];

        let Some(state) = state else {
            return entry.max_rate();
        };

        let _guard = self.update_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let now = self.clock.now();
        let slot = state.slot_mut(hour);
        let max_rate = entry.max_rate() as f64;

        let elapsed_ms = now.millis_since(slot.last_update);
        // Floor only: idle time beyond one window overshoots here and is capped below.
        let fraction = (elapsed_ms / entry.window_ms() as f64).max(0.0);
        let replenishment = fraction * max_rate;
        let mut new_allowance = (slot.allowance + replenishment).min(max_rate);

        let granted = if amount as f64 > new_allowance { new_allowance as u64 } else { amount };
        new_allowance -= granted as f64;

        if new_allowance >= 0.0 {
            slot.allowance = new_allowance;
            slot.last_update = now;
            slot.taken = slot.taken.saturating_add(granted);
        }

        if granted < amount {
            tracing::debug!(
                hour,
                requested = amount,
                granted,
                remaining = new_allowance,
                "grant capped by hourly allowance"
            );
        }

        granted
    }
}

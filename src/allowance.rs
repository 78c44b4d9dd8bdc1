//! Per-stream allowance bookkeeping.

use crate::clock::Timestamp;
use crate::quota::{QuotaTable, HOURS_PER_DAY};

/// Bookkeeping for one hour slot.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Slot {
    /// Units currently available in this slot.
    pub allowance: f64,
    /// Time of the last committed grant computation.
    pub last_update: Timestamp,
    /// Units ever granted from this slot.
    pub taken: u64,
}

/// Private allowance for one stream, one [`Slot`] per hour of day.
///
/// Created by [`RateLimiter::register_limiter`](crate::RateLimiter::register_limiter) and
/// owned by the stream that registered it; never shared.
#[derive(Debug, Clone, PartialEq)]
pub struct AllowanceState {
    slots: [Slot; HOURS_PER_DAY],
}

impl AllowanceState {
    /// Full allowance in every slot, all timestamps set to `now`.
    pub(crate) fn seeded(table: &QuotaTable, now: Timestamp) -> Self {
        let slots = std::array::from_fn(|hour| Slot {
            allowance: table[hour].max_rate() as f64,
            last_update: now,
            taken: 0,
        });
        Self { slots }
    }

    /// Snapshot of the slot for `hour`. Panics if `hour >= 24`.
    pub fn slot(&self, hour: usize) -> Slot {
        self.slots[hour]
    }

    /// Units granted across every hour.
    pub fn total_taken(&self) -> u64 {
        self.slots.iter().fold(0u64, |acc, slot| acc.saturating_add(slot.taken))
    }

    pub(crate) fn slot_mut(&mut self, hour: usize) -> &mut Slot {
        &mut self.slots[hour]
    }
}

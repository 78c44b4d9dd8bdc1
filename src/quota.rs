//! Per-hour quota definitions.

use std::ops::Index;

/// Number of hour slots in a [`QuotaTable`].
pub const HOURS_PER_DAY: usize = 24;

/// Errors produced while assembling a quota table.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QuotaError {
    /// A replenishment window of zero milliseconds was supplied.
    #[error("quota window must be > 0 ms (hour slot {index})")]
    ZeroWindow {
        /// Slot the entry would have occupied.
        index: usize,
    },
    /// Fewer than 24 entries were added before building.
    #[error("quota table needs 24 entries, got {provided}")]
    Incomplete {
        /// Entries added so far.
        provided: usize,
    },
    /// A 25th entry was added.
    #[error("quota table already holds 24 entries")]
    TooManyEntries,
}

/// Maximum rate for one hour slot: `max_rate` units per `window_ms` milliseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QuotaEntry {
    max_rate: u64,
    window_ms: u64,
}

impl QuotaEntry {
    /// Create an entry. `window_ms` must be non-zero.
    pub fn new(max_rate: u64, window_ms: u64) -> Result<Self, QuotaError> {
        if window_ms == 0 {
            return Err(QuotaError::ZeroWindow { index: 0 });
        }
        Ok(Self { max_rate, window_ms })
    }

    /// Units granted per window when the bucket is full.
    pub fn max_rate(&self) -> u64 {
        self.max_rate
    }

    /// Time, in milliseconds, for an empty bucket to refill completely.
    pub fn window_ms(&self) -> u64 {
        self.window_ms
    }
}

/// Immutable table of 24 quota entries, indexed by local hour of day.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QuotaTable {
    entries: [QuotaEntry; HOURS_PER_DAY],
}

impl QuotaTable {
    /// Start an empty table; add exactly one entry per hour, starting at hour 0.
    pub fn builder() -> QuotaTableBuilder {
        QuotaTableBuilder::default()
    }

    /// Table with the same entry for every hour.
    pub fn uniform(max_rate: u64, window_ms: u64) -> Result<Self, QuotaError> {
        let entry = QuotaEntry::new(max_rate, window_ms)?;
        Ok(Self { entries: [entry; HOURS_PER_DAY] })
    }

    /// Entry for `hour`, or `None` when `hour >= 24`.
    pub fn get(&self, hour: usize) -> Option<&QuotaEntry> {
        self.entries.get(hour)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QuotaEntry> {
        self.entries.iter()
    }

    pub fn len(&self) -> usize {
        HOURS_PER_DAY
    }

    pub fn is_empty(&self) -> bool {
        false
    }
}

impl Index<usize> for QuotaTable {
    type Output = QuotaEntry;

    fn index(&self, hour: usize) -> &QuotaEntry {
        &self.entries[hour]
    }
}

/// Collects entries one hour at a time; `build` only succeeds once all 24 are present.
#[derive(Debug, Clone, Default)]
pub struct QuotaTableBuilder {
    entries: Vec<QuotaEntry>,
}

impl QuotaTableBuilder {
    /// Append the entry for the next hour and return its index.
    pub fn add_counter(&mut self, max_rate: u64, window_ms: u64) -> Result<usize, QuotaError> {
        let index = self.entries.len();
        if index >= HOURS_PER_DAY {
            return Err(QuotaError::TooManyEntries);
        }
        let entry = QuotaEntry::new(max_rate, window_ms)
            .map_err(|_| QuotaError::ZeroWindow { index })?;
        self.entries.push(entry);
        Ok(index)
    }

    /// Entries added so far.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn build(self) -> Result<QuotaTable, QuotaError> {
        let provided = self.entries.len();
        let entries: [QuotaEntry; HOURS_PER_DAY] =
            self.entries.try_into().map_err(|_| QuotaError::Incomplete { provided })?;
        Ok(QuotaTable { entries })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_builder() -> QuotaTableBuilder {
        let mut builder = QuotaTable::builder();
        for hour in 0..HOURS_PER_DAY {
            builder.add_counter(100 * (hour as u64 + 1), 1000).unwrap();
        }
        builder
    }

    #[test]
    fn add_counter_returns_sequential_indexes() {
        let mut builder = QuotaTable::builder();
        assert_eq!(builder.add_counter(10, 1000).unwrap(), 0);
        assert_eq!(builder.add_counter(20, 1000).unwrap(), 1);
        assert_eq!(builder.len(), 2);
    }

    #[test]
    fn build_indexes_by_hour() {
        let table = full_builder().build().unwrap();
        assert_eq!(table[0].max_rate(), 100);
        assert_eq!(table[23].max_rate(), 2400);
        assert_eq!(table.get(5).map(QuotaEntry::window_ms), Some(1000));
        assert!(table.get(24).is_none());
        assert_eq!(table.iter().count(), 24);
    }

    #[test]
    fn build_rejects_partial_table() {
        let mut builder = QuotaTable::builder();
        for _ in 0..23 {
            builder.add_counter(1, 1000).unwrap();
        }
        assert_eq!(builder.build().unwrap_err(), QuotaError::Incomplete { provided: 23 });
    }

    #[test]
    fn add_counter_rejects_twenty_fifth_entry() {
        let mut builder = full_builder();
        assert_eq!(builder.add_counter(1, 1000).unwrap_err(), QuotaError::TooManyEntries);
    }

    #[test]
    fn zero_window_is_rejected_with_slot() {
        let mut builder = QuotaTable::builder();
        builder.add_counter(1, 1000).unwrap();
        assert_eq!(builder.add_counter(1, 0).unwrap_err(), QuotaError::ZeroWindow { index: 1 });
        assert!(QuotaEntry::new(5, 0).is_err());
        assert!(QuotaTable::uniform(5, 0).is_err());
    }

    #[test]
    fn error_messages_name_the_problem() {
        let msg = QuotaError::Incomplete { provided: 3 }.to_string();
        assert!(msg.contains("24"));
        assert!(msg.contains('3'));
    }
}

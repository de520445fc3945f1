use std::sync::atomic::{AtomicU64, Ordering};

use super::event::{RecordKind, RECORD_KIND_COUNT};

/// Lock-free per-RecordKind read/drop counters shared by all readers.
pub struct RecordStats {
    read: [AtomicU64; RECORD_KIND_COUNT],
    dropped: [AtomicU64; RECORD_KIND_COUNT],
}

/// Totals for one record kind.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct KindTotals {
    pub read: u64,
    pub dropped: u64,
}

impl RecordStats {
    /// Create a new zeroed RecordStats.
    pub fn new() -> Self {
        Self {
            read: std::array::from_fn(|_| AtomicU64::new(0)),
            dropped: std::array::from_fn(|_| AtomicU64::new(0)),
        }
    }

    /// Add n successfully decoded records.
    pub fn record_read(&self, kind: RecordKind, n: u64) {
        if let Some(counter) = self.read.get(kind as usize) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Add n malformed records that were dropped.
    pub fn record_dropped(&self, kind: RecordKind, n: u64) {
        if let Some(counter) = self.dropped.get(kind as usize) {
            counter.fetch_add(n, Ordering::Relaxed);
        }
    }

    /// Current totals for one kind.
    pub fn totals(&self, kind: RecordKind) -> KindTotals {
        let load = |arr: &[AtomicU64; RECORD_KIND_COUNT]| {
            arr.get(kind as usize)
                .map(|c| c.load(Ordering::Relaxed))
                .unwrap_or(0)
        };
        KindTotals {
            read: load(&self.read),
            dropped: load(&self.dropped),
        }
    }

    /// Totals for every kind that saw any record, in kind order.
    pub fn snapshot(&self) -> Vec<(RecordKind, KindTotals)> {
        RecordKind::all()
            .iter()
            .map(|kind| (*kind, self.totals(*kind)))
            .filter(|(_, t)| t.read > 0 || t.dropped > 0)
            .collect()
    }
}

impl Default for RecordStats {
    fn default() -> Self {
        Self::new()
    }
}

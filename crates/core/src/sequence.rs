//! Monotonic id sequences
//!
//! One `Sequence` backs each id family: transaction ids and batch ids per
//! client session, global transaction ids per server stripe. A sequence is
//! created once for its owner and only moves forward; after a restart it is
//! rebuilt from recovered state with [`Sequence::starting_after`].

use std::sync::atomic::{AtomicU64, Ordering};

/// Atomic fetch-and-increment counter
///
/// Values start at 1 so that 0 stays free for the null sentinel of every id
/// type.
#[derive(Debug)]
pub struct Sequence {
    next: AtomicU64,
}

impl Sequence {
    /// A fresh sequence whose first value is 1
    pub fn new() -> Self {
        Self::starting_after(0)
    }

    /// A sequence whose first value is `last + 1`
    ///
    /// Used when resuming from a recovered high-water mark.
    pub fn starting_after(last: u64) -> Self {
        Sequence {
            next: AtomicU64::new(last + 1),
        }
    }

    /// Issue the next value
    #[inline]
    pub fn next_value(&self) -> u64 {
        self.next.fetch_add(1, Ordering::SeqCst)
    }

    /// The last value issued, or 0 if none
    #[inline]
    pub fn current(&self) -> u64 {
        self.next.load(Ordering::SeqCst) - 1
    }

    /// Make sure every value up to and including `value` is considered issued
    pub fn advance_past(&self, value: u64) {
        self.next.fetch_max(value + 1, Ordering::SeqCst);
    }
}

impl Default for Sequence {
    fn default() -> Self {
        Self::new()
    }
}

//! Client-side id synthesis.
//!
//! Used when a backend does not assign ids itself (a Milvus collection
//! without auto-id) and when migrated ids cannot be carried over.

use chrono::Utc;
use std::sync::atomic::{AtomicI64, Ordering};

/// Id slots per millisecond.
const SEQUENCE_SPACE: i64 = 1000;

/// Strictly increasing generator of `unix_millis * 1000 + sequence` ids.
///
/// Values stay far below 2^53 for the foreseeable future, so they survive a
/// round-trip through JSON numbers.
#[derive(Debug, Default)]
pub struct IdGenerator {
    last: AtomicI64,
}

impl IdGenerator {
    /// Creates a generator.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the next id. Never returns the same value twice.
    pub fn next_id(&self) -> i64 {
        let now = Utc::now().timestamp_millis().saturating_mul(SEQUENCE_SPACE);
        let step = |last: i64| if now > last { now } else { last + 1 };
        let prev = match self
            .last
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |last| Some(step(last)))
        {
            Ok(prev) | Err(prev) => prev,
        };
        step(prev)
    }

    /// Reserves `n` increasing ids.
    pub fn next_ids(&self, n: usize) -> Vec<i64> {
        (0..n).map(|_| self.next_id()).collect()
    }

    /// Ensures every later id is greater than `floor`.
    pub fn observe(&self, floor: i64) {
        self.last.fetch_max(floor, Ordering::SeqCst);
    }
}

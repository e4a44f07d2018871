//! Source-to-target id reconciliation.
//!
//! With `preserve_ids` a source id that is a positive integer no larger than
//! [`MAX_SAFE_ID`] is written unchanged. Anything else gets a synthesized
//! id: the digits of the source id when they form a fresh in-range integer,
//! otherwise a time-based id from [`IdGenerator`]. Every synthesized or
//! target-assigned id is reported as a mapping. Only ids kept unchanged are
//! idempotent across reruns.

use std::collections::HashSet;
use vecshift_core::ids::IdGenerator;
use vecshift_core::types::{VectorRecord, MAX_SAFE_ID};

/// How a source id relates to the target id space.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceId {
    /// Usable as-is.
    Numeric(i64),
    /// Not usable; `digits` is the digit-based fallback, when in range.
    Foreign {
        /// Digits of the id read as an integer.
        digits: Option<i64>,
    },
}

/// Classifies a source id.
#[must_use]
pub fn classify(id: &str) -> SourceId {
    match id.trim().parse::<i64>() {
        Ok(n) if (1..=MAX_SAFE_ID).contains(&n) => SourceId::Numeric(n),
        _ => SourceId::Foreign {
            digits: digit_candidate(id),
        },
    }
}

/// The digits of `id` read as one integer, if that is a valid target id.
#[must_use]
pub fn digit_candidate(id: &str) -> Option<i64> {
    let digits: String = id.chars().filter(char::is_ascii_digit).collect();
    let trimmed = digits.trim_start_matches('0');
    // More than 16 digits can never be <= 2^53 - 1.
    if trimmed.is_empty() || trimmed.len() > 16 {
        return None;
    }
    trimmed
        .parse::<i64>()
        .ok()
        .filter(|n| (1..=MAX_SAFE_ID).contains(n))
}

/// Where one record lands on the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Placement {
    /// Written under its own id.
    Keep(i64),
    /// Its id already exists on the target; nothing is written.
    Present(i64),
    /// Written under a synthesized id.
    Remap(i64),
    /// Written under an id the target picks.
    Assign,
}

impl Placement {
    /// Id to write with, when chosen client-side.
    #[must_use]
    pub fn target_id(self) -> Option<i64> {
        match self {
            Self::Keep(id) | Self::Remap(id) => Some(id),
            Self::Present(_) | Self::Assign => None,
        }
    }

    /// Whether the source id will differ from the target id.
    #[must_use]
    pub fn is_mapped(self) -> bool {
        matches!(self, Self::Remap(_) | Self::Assign)
    }
}

/// Plans target ids for import batches.
#[derive(Debug)]
pub struct IdPlanner {
    preserve_ids: bool,
    generator: IdGenerator,
}

impl IdPlanner {
    /// Creates a planner.
    pub fn new(preserve_ids: bool) -> Self {
        Self {
            preserve_ids,
            generator: IdGenerator::new(),
        }
    }

    /// Whether source ids are carried over.
    pub fn preserve_ids(&self) -> bool {
        self.preserve_ids
    }

    /// Target ids whose existence must be known before planning `records`.
    pub fn lookup_ids(&self, records: &[&VectorRecord]) -> Vec<i64> {
        if !self.preserve_ids {
            return Vec::new();
        }
        let mut seen = HashSet::new();
        records
            .iter()
            .filter_map(|record| match classify(&record.id) {
                SourceId::Numeric(n) => Some(n),
                SourceId::Foreign { digits } => digits,
            })
            .filter(|id| seen.insert(*id))
            .collect()
    }

    /// Places every record, in input order.
    ///
    /// `existing` holds the looked-up ids already present on the target.
    /// Numeric ids are claimed before any fallback so a synthesized id never
    /// steals the id of a later record in the same batch.
    ///
    /// Synthesized ids are not stable across runs. Importing the same foreign
    /// record again finds its digit id taken, by the row written the first
    /// time, and remaps it to a new id, so the target holds both rows. Clear
    /// the target before rerunning a migration whose source has non-numeric
    /// ids.
    pub fn plan(&self, records: &[&VectorRecord], existing: &HashSet<i64>) -> Vec<Placement> {
        if !self.preserve_ids {
            return vec![Placement::Assign; records.len()];
        }

        let classes: Vec<SourceId> = records.iter().map(|r| classify(&r.id)).collect();
        let mut claimed: HashSet<i64> = HashSet::new();
        let mut placements = vec![Placement::Assign; records.len()];

        for (slot, class) in placements.iter_mut().zip(&classes) {
            if let SourceId::Numeric(n) = *class {
                *slot = if existing.contains(&n) || !claimed.insert(n) {
                    Placement::Present(n)
                } else {
                    Placement::Keep(n)
                };
            }
        }

        for (slot, class) in placements.iter_mut().zip(&classes) {
            if let SourceId::Foreign { digits } = *class {
                let id = match digits {
                    Some(d) if !existing.contains(&d) && !claimed.contains(&d) => d,
                    _ => self.fresh_id(existing, &claimed),
                };
                claimed.insert(id);
                *slot = Placement::Remap(id);
            }
        }
        placements
    }

    fn fresh_id(&self, existing: &HashSet<i64>, claimed: &HashSet<i64>) -> i64 {
        loop {
            let id = self.generator.next_id();
            if !existing.contains(&id) && !claimed.contains(&id) {
                return id;
            }
        }
    }
}

#[cfg(test)]
#[path = "id_map_tests.rs"]
mod tests;

//! Collection filter policy shared by every backend's `emb_recall`.
//!
//! The allow/deny lists coming from the application are reduced to a single
//! [`CollectionFilter`] before any backend is touched, so all three families
//! apply exactly the same semantics.

use std::collections::HashSet;

/// Effective collection constraint of a search.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CollectionFilter {
    /// No collection constraint.
    Unrestricted,
    /// Only these collections may match.
    Allow(Vec<String>),
    /// These collections must not match.
    Deny(Vec<String>),
    /// Nothing can match; the search must return no hits without querying.
    Nothing,
}

impl CollectionFilter {
    /// Reduces the forbid list and optional allow list to one constraint.
    ///
    /// With an allow list the result is `allow - forbid`; an empty difference
    /// yields [`CollectionFilter::Nothing`]. Without one, the forbid list
    /// becomes a negative filter.
    #[must_use]
    pub fn resolve(forbid: &[String], filter: Option<&[String]>) -> Self {
        match filter {
            Some(allow) => {
                let forbidden: HashSet<&str> = forbid.iter().map(String::as_str).collect();
                let ids = dedup(allow.iter().filter(|id| !forbidden.contains(id.as_str())));
                if ids.is_empty() {
                    Self::Nothing
                } else {
                    Self::Allow(ids)
                }
            }
            None => {
                let ids = dedup(forbid.iter());
                if ids.is_empty() {
                    Self::Unrestricted
                } else {
                    Self::Deny(ids)
                }
            }
        }
    }

    /// True when the search can be answered with an empty result locally.
    #[must_use]
    pub const fn matches_nothing(&self) -> bool {
        matches!(self, Self::Nothing)
    }

    /// Returns true if a record in `collection_id` passes the filter.
    #[must_use]
    pub fn admits(&self, collection_id: &str) -> bool {
        match self {
            Self::Unrestricted => true,
            Self::Allow(ids) => ids.iter().any(|id| id == collection_id),
            Self::Deny(ids) => !ids.iter().any(|id| id == collection_id),
            Self::Nothing => false,
        }
    }
}

fn dedup<'a>(ids: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut seen = HashSet::new();
    ids.filter(|id| seen.insert(id.as_str()))
        .cloned()
        .collect()
}

//! Tag predicates evaluated against series tag sets.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Boolean expression over a series' tag set.
///
/// Evaluated once per series during a read or delete; an absent tag key
/// compares as the empty string, matching how series without a tag sort.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Predicate {
    /// Tag equals a value.
    TagEq(String, String),
    /// Tag differs from a value.
    TagNeq(String, String),
    /// Both branches hold.
    And(Box<Predicate>, Box<Predicate>),
    /// Either branch holds.
    Or(Box<Predicate>, Box<Predicate>),
}

impl Predicate {
    /// Evaluate against one tag set.
    pub fn matches(&self, tags: &BTreeMap<String, String>) -> bool {
        match self {
            Predicate::TagEq(key, value) => {
                tags.get(key).map(String::as_str).unwrap_or("") == value
            }
            Predicate::TagNeq(key, value) => {
                tags.get(key).map(String::as_str).unwrap_or("") != value
            }
            Predicate::And(a, b) => a.matches(tags) && b.matches(tags),
            Predicate::Or(a, b) => a.matches(tags) || b.matches(tags),
        }
    }

    /// `key == value`.
    pub fn tag_eq(key: impl Into<String>, value: impl Into<String>) -> Self {
        Predicate::TagEq(key.into(), value.into())
    }

    /// Conjunction.
    pub fn and(self, other: Predicate) -> Self {
        Predicate::And(Box::new(self), Box::new(other))
    }

    /// Disjunction.
    pub fn or(self, other: Predicate) -> Self {
        Predicate::Or(Box::new(self), Box::new(other))
    }
}

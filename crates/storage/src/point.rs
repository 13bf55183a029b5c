//! Samples as written into the engine.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::value::FieldValue;
use rill_common::{Result, RillError};

/// Half-open time interval `[start, stop)` in UTC nanoseconds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TimeBounds {
    /// Inclusive lower bound.
    pub start: i64,
    /// Exclusive upper bound.
    pub stop: i64,
}

impl TimeBounds {
    /// Construct validated bounds.
    pub fn new(start: i64, stop: i64) -> Result<Self> {
        if start >= stop {
            return Err(RillError::InvalidArgument(format!(
                "time bounds start {start} must precede stop {stop}"
            )));
        }
        Ok(Self { start, stop })
    }

    /// Whether `t` falls inside the interval.
    pub fn contains(&self, t: i64) -> bool {
        self.start <= t && t < self.stop
    }
}

/// One tagged sample.
///
/// The tag map is ordered; (measurement, tags, field) identifies the
/// series the sample belongs to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Point {
    /// Measurement name.
    pub measurement: String,
    /// Lexicographically ordered tag set.
    pub tags: BTreeMap<String, String>,
    /// Field name.
    pub field: String,
    /// Timestamp in UTC nanoseconds.
    pub time: i64,
    /// Typed value.
    pub value: FieldValue,
}

impl Point {
    /// Convenience constructor for the common float case.
    pub fn float(
        measurement: impl Into<String>,
        tags: BTreeMap<String, String>,
        field: impl Into<String>,
        time: i64,
        value: f64,
    ) -> Self {
        Self {
            measurement: measurement.into(),
            tags,
            field: field.into(),
            time,
            value: FieldValue::Float(value),
        }
    }
}

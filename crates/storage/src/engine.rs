//! In-memory columnar series engine.
//!
//! Series are keyed by (measurement, tag set, field) within an
//! (org, bucket) scope. Each series holds a time-sorted timestamp column
//! and a typed value column; duplicate-timestamp writes replace the prior
//! value. The engine is safe for concurrent reads and writes; the read
//! path copies the requested slices out under the read lock.

use std::collections::BTreeMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use parking_lot::RwLock;
use tracing::debug;

use crate::point::{Point, TimeBounds};
use crate::predicate::Predicate;
use crate::value::{FieldValue, ValueArray};
use rill_common::{BucketId, OrgId, Result, RillError};

/// Series identity within a bucket.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SeriesKey {
    /// Measurement name.
    pub measurement: String,
    /// Ordered tag pairs.
    pub tags: Vec<(String, String)>,
    /// Field name.
    pub field: String,
}

impl SeriesKey {
    fn from_point(point: &Point) -> Self {
        Self {
            measurement: point.measurement.clone(),
            tags: point
                .tags
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            field: point.field.clone(),
        }
    }
}

/// A copied, time-sorted slice of one series, as handed to the read path.
#[derive(Debug, Clone)]
pub struct SeriesBlock {
    /// Measurement name.
    pub measurement: String,
    /// Ordered tag set.
    pub tags: BTreeMap<String, String>,
    /// Field name.
    pub field: String,
    /// Ascending timestamps in UTC nanoseconds.
    pub times: Vec<i64>,
    /// Value column, same length as `times`.
    pub values: ValueArray,
}

#[derive(Debug)]
struct SeriesData {
    times: Vec<i64>,
    values: ValueArray,
}

impl SeriesData {
    fn insert(&mut self, time: i64, value: FieldValue) -> Result<()> {
        match self.times.binary_search(&time) {
            Ok(at) => self.values.set(at, value),
            Err(at) => {
                self.values.insert(at, value)?;
                self.times.insert(at, time);
                Ok(())
            }
        }
    }
}

type Shard = BTreeMap<SeriesKey, SeriesData>;

/// Engine operations the read path and the points-writer seam depend on.
pub trait Engine: Send + Sync + 'static {
    /// Make the engine ready to serve; idempotent.
    fn open(&self) -> Result<()>;

    /// Stop serving; subsequent operations fail with `unavailable`.
    fn close(&self) -> Result<()>;

    /// Write a batch of points. Duplicate timestamps within a series
    /// replace the stored value; a type change on an existing series is an
    /// `invalid argument`.
    fn write_points(&self, org: OrgId, bucket: BucketId, points: Vec<Point>) -> Result<()>;

    /// Remove samples in `bounds` from series matching `predicate`
    /// (every series when `None`). Series left empty disappear.
    fn delete_series(
        &self,
        org: OrgId,
        bucket: BucketId,
        predicate: Option<&Predicate>,
        bounds: TimeBounds,
    ) -> Result<()>;

    /// Copy out the `bounds` slice of every series matching `predicate`,
    /// ordered by series key. Series with no samples in `bounds` are
    /// omitted.
    fn read_series(
        &self,
        org: OrgId,
        bucket: BucketId,
        predicate: Option<&Predicate>,
        bounds: TimeBounds,
    ) -> Result<Vec<SeriesBlock>>;
}

/// The in-memory [`Engine`] implementation.
#[derive(Debug, Default)]
pub struct MemEngine {
    open: AtomicBool,
    shards: RwLock<HashMap<(OrgId, BucketId), Shard>>,
}

impl MemEngine {
    /// Create a closed engine; call [`Engine::open`] before use.
    pub fn new() -> Self {
        Self::default()
    }

    fn ensure_open(&self) -> Result<()> {
        if !self.open.load(Ordering::Acquire) {
            return Err(RillError::Unavailable("engine is not open".into()));
        }
        Ok(())
    }
}

impl Engine for MemEngine {
    fn open(&self) -> Result<()> {
        self.open.store(true, Ordering::Release);
        Ok(())
    }

    fn close(&self) -> Result<()> {
        self.open.store(false, Ordering::Release);
        Ok(())
    }

    fn write_points(&self, org: OrgId, bucket: BucketId, points: Vec<Point>) -> Result<()> {
        self.ensure_open()?;
        let mut shards = self.shards.write();
        let shard = shards.entry((org, bucket)).or_default();
        for point in points {
            let key = SeriesKey::from_point(&point);
            let series = shard.entry(key).or_insert_with(|| SeriesData {
                times: Vec::new(),
                values: ValueArray::empty(point.value.value_type()),
            });
            series.insert(point.time, point.value)?;
        }
        Ok(())
    }

    fn delete_series(
        &self,
        org: OrgId,
        bucket: BucketId,
        predicate: Option<&Predicate>,
        bounds: TimeBounds,
    ) -> Result<()> {
        self.ensure_open()?;
        let mut shards = self.shards.write();
        let Some(shard) = shards.get_mut(&(org, bucket)) else {
            return Ok(());
        };
        let mut removed = 0usize;
        shard.retain(|key, series| {
            if let Some(predicate) = predicate {
                let tags: BTreeMap<String, String> = key.tags.iter().cloned().collect();
                if !predicate.matches(&tags) {
                    return true;
                }
            }
            let start = series.times.partition_point(|&t| t < bounds.start);
            let end = series.times.partition_point(|&t| t < bounds.stop);
            if start < end {
                removed += end - start;
                series.times.drain(start..end);
                series.values.drain(start, end);
            }
            !series.times.is_empty()
        });
        debug!(org = %org, bucket = %bucket, removed, "deleted series samples");
        Ok(())
    }

    fn read_series(
        &self,
        org: OrgId,
        bucket: BucketId,
        predicate: Option<&Predicate>,
        bounds: TimeBounds,
    ) -> Result<Vec<SeriesBlock>> {
        self.ensure_open()?;
        let shards = self.shards.read();
        let Some(shard) = shards.get(&(org, bucket)) else {
            return Ok(Vec::new());
        };
        let mut blocks = Vec::new();
        for (key, series) in shard {
            let tags: BTreeMap<String, String> = key.tags.iter().cloned().collect();
            if let Some(predicate) = predicate {
                if !predicate.matches(&tags) {
                    continue;
                }
            }
            let start = series.times.partition_point(|&t| t < bounds.start);
            let end = series.times.partition_point(|&t| t < bounds.stop);
            if start == end {
                continue;
            }
            blocks.push(SeriesBlock {
                measurement: key.measurement.clone(),
                tags,
                field: key.field.clone(),
                times: series.times[start..end].to_vec(),
                values: series.values.slice(start, end),
            });
        }
        Ok(blocks)
    }
}

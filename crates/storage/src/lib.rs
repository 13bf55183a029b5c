//! Columnar series storage and the windowed-aggregate read path.
//!
//! Architecture role:
//! - the in-memory [`engine`] ingests tagged samples and serves time-range
//!   slices of series, safe for concurrent read + write
//! - the [`reader`] translates `ReadFilter` / `ReadGroup` /
//!   `ReadWindowAggregate` specs into lazy streams of columnar [`table`]s
//! - every table buffer is charged to the query's allocator, which is how
//!   the controller enforces memory budgets on the read path
//!
//! Key modules:
//! - [`engine`]
//! - [`reader`]
//! - [`table`]
//! - [`window`]

/// Row extraction from record batches back into points.
pub mod convert;
/// The in-memory columnar series engine.
pub mod engine;
/// Samples and time bounds.
pub mod point;
/// Tag predicates.
pub mod predicate;
/// The read path: specs, aggregates, table streams.
pub mod reader;
/// Group keys, tables, and table streams.
pub mod table;
/// Typed sample values.
pub mod value;
/// Window grids.
pub mod window;

pub use convert::batch_points;
pub use engine::{Engine, MemEngine, SeriesBlock};
pub use point::{Point, TimeBounds};
pub use predicate::Predicate;
pub use reader::{
    AggregateKind, GroupMode, ReadFilterSpec, ReadGroupSpec, ReadSpec, ReadWindowAggregateSpec,
    StorageReader, TimeColumn,
};
pub use table::{
    drive, BoxTableStream, GroupKey, KeyValue, Table, TableStream, FIELD_COL, MEASUREMENT_COL,
    START_COL, STOP_COL, TIME_COL, VALUE_COL,
};
pub use value::{FieldValue, ValueArray, ValueType};
pub use window::Window;

/// The points-writer seam: the executor drains task query results through
/// this interface. Implementations must be idempotent on retry within one
/// run deadline; the engine satisfies that by replacing points at
/// duplicate timestamps.
pub trait PointsWriter: Send + Sync + 'static {
    /// Write a batch of points into a bucket.
    fn write(
        &self,
        org: rill_common::OrgId,
        bucket: rill_common::BucketId,
        points: Vec<Point>,
    ) -> rill_common::Result<()>;
}

/// Every engine is also a points writer.
impl<E: Engine> PointsWriter for E {
    fn write(
        &self,
        org: rill_common::OrgId,
        bucket: rill_common::BucketId,
        points: Vec<Point>,
    ) -> rill_common::Result<()> {
        self.write_points(org, bucket, points)
    }
}

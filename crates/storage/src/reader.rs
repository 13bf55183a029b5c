//! The storage read path: `ReadFilter`, `ReadGroup`, `ReadWindowAggregate`.
//!
//! Each call translates a spec into a lazy [`TableStream`]: the plan
//! (matching series, group order, window grid) is fixed up front, but each
//! table is materialized and charged to the query's allocator only when
//! the consumer asks for it.

use std::collections::BTreeMap;
use std::sync::Arc;

use arrow::array::{
    ArrayRef, BooleanArray, Float64Array, Int64Array, StringArray, TimestampNanosecondArray,
    UInt64Array,
};
use arrow::record_batch::RecordBatch;
use arrow_schema::{DataType, Field, Schema, TimeUnit};
use serde::{Deserialize, Serialize};

use crate::engine::{Engine, SeriesBlock};
use crate::point::TimeBounds;
use crate::predicate::Predicate;
use crate::table::{
    BoxTableStream, GroupKey, KeyValue, Table, TableStream, FIELD_COL, MEASUREMENT_COL, START_COL,
    STOP_COL, TIME_COL, VALUE_COL,
};
use crate::value::{FieldValue, ValueType};
use crate::window::{Window, WindowGrid};
use rill_common::{Allocator, BucketId, ErrorKind, OrgId, Result, RillError};

/// Point selection: every sample of every matching series in the bounds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadFilterSpec {
    /// Owning organization.
    pub org: OrgId,
    /// Bucket to read.
    pub bucket: BucketId,
    /// Half-open time range.
    pub bounds: TimeBounds,
    /// Optional tag predicate.
    #[serde(default)]
    pub predicate: Option<Predicate>,
}

/// How `ReadGroup` forms its output groups.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum GroupMode {
    /// Default grouping: one group per series (`_measurement`, `_field`,
    /// and every tag key).
    None,
    /// Group by the listed keys only.
    By,
}

/// Group-by read with an optional terminal aggregate per group.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadGroupSpec {
    /// Underlying point selection.
    pub filter: ReadFilterSpec,
    /// Grouping mode.
    pub group_mode: GroupMode,
    /// Group keys; consulted only for [`GroupMode::By`]. Values may name
    /// `_measurement`, `_field`, or tag keys.
    #[serde(default)]
    pub group_keys: Vec<String>,
    /// Terminal aggregate applied once per group; `None` emits raw rows.
    #[serde(default)]
    pub aggregate: Option<AggregateKind>,
}

/// Which window boundary becomes the `_time` column when windows of one
/// series merge into a single table.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeColumn {
    /// Use the (clipped) window start.
    Start,
    /// Use the (clipped) window stop.
    Stop,
}

/// Windowed aggregate read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReadWindowAggregateSpec {
    /// Underlying point selection.
    pub filter: ReadFilterSpec,
    /// Window period in nanoseconds; `i64::MAX` makes the whole bounds a
    /// single window.
    pub window_every: i64,
    /// Phase shift of the window grid in nanoseconds, reduced modulo
    /// `window_every`.
    #[serde(default)]
    pub offset: i64,
    /// Aggregates to apply; exactly one is supported per read.
    pub aggregates: Vec<AggregateKind>,
    /// Merge windows into one table per series, with `_time` set to this
    /// boundary.
    #[serde(default)]
    pub time_column: Option<TimeColumn>,
    /// Emit rows for windows that contain no samples.
    #[serde(default)]
    pub create_empty: bool,
}

/// Aggregate functions supported by the read path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AggregateKind {
    /// Number of samples.
    Count,
    /// Sum of samples; keeps the input's numeric type.
    Sum,
    /// Smallest sample; ties resolved to the earliest timestamp.
    Min,
    /// Largest sample; ties resolved to the earliest timestamp.
    Max,
    /// Arithmetic mean; always `Float64`.
    Mean,
    /// Sample with the smallest `_time`.
    First,
    /// Sample with the largest `_time`.
    Last,
}

impl AggregateKind {
    /// Selector aggregates carry the chosen sample's `_time`.
    pub fn is_selector(self) -> bool {
        matches!(
            self,
            AggregateKind::Min | AggregateKind::Max | AggregateKind::First | AggregateKind::Last
        )
    }

    /// Lowercase name, for error messages.
    pub fn as_str(self) -> &'static str {
        match self {
            AggregateKind::Count => "count",
            AggregateKind::Sum => "sum",
            AggregateKind::Min => "min",
            AggregateKind::Max => "max",
            AggregateKind::Mean => "mean",
            AggregateKind::First => "first",
            AggregateKind::Last => "last",
        }
    }

    /// Output value type for a series of `input` type, or `invalid
    /// argument` when the combination is unsupported.
    fn output_type(self, input: ValueType) -> Result<ValueType> {
        let numeric = matches!(
            input,
            ValueType::Float | ValueType::Integer | ValueType::Unsigned
        );
        match self {
            AggregateKind::Count => Ok(ValueType::Integer),
            AggregateKind::Mean => {
                if numeric {
                    Ok(ValueType::Float)
                } else {
                    Err(unsupported_input(self, input))
                }
            }
            AggregateKind::Sum | AggregateKind::Min | AggregateKind::Max => {
                if numeric {
                    Ok(input)
                } else {
                    Err(unsupported_input(self, input))
                }
            }
            AggregateKind::First | AggregateKind::Last => Ok(input),
        }
    }
}

fn unsupported_input(kind: AggregateKind, input: ValueType) -> RillError {
    RillError::InvalidArgument(format!(
        "aggregate {} does not support {:?} series",
        kind.as_str(),
        input
    ))
}

/// Read surface over an [`Engine`].
#[derive(Clone)]
pub struct StorageReader {
    engine: Arc<dyn Engine>,
}

/// A read request of any shape, as carried by query programs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "lowercase", tag = "read")]
pub enum ReadSpec {
    /// Point selection.
    Filter(ReadFilterSpec),
    /// Group-by with terminal aggregate.
    Group(ReadGroupSpec),
    /// Windowed aggregates.
    Window(ReadWindowAggregateSpec),
}

impl StorageReader {
    /// Wrap an engine.
    pub fn new(engine: Arc<dyn Engine>) -> Self {
        Self { engine }
    }

    /// Dispatch a [`ReadSpec`].
    pub fn read(&self, spec: &ReadSpec, alloc: &Allocator) -> Result<BoxTableStream> {
        match spec {
            ReadSpec::Filter(spec) => self.read_filter(spec, alloc),
            ReadSpec::Group(spec) => self.read_group(spec, alloc),
            ReadSpec::Window(spec) => self.read_window_aggregate(spec, alloc),
        }
    }

    /// One table per series, every sample in the bounds.
    pub fn read_filter(
        &self,
        spec: &ReadFilterSpec,
        alloc: &Allocator,
    ) -> Result<BoxTableStream> {
        let series = self.fetch_sorted(spec)?;
        Ok(Box::new(FilterStream {
            alloc: alloc.clone(),
            bounds: spec.bounds,
            series: series.into_iter(),
            failed: None,
        }))
    }

    /// Windowed aggregates; see [`ReadWindowAggregateSpec`].
    pub fn read_window_aggregate(
        &self,
        spec: &ReadWindowAggregateSpec,
        alloc: &Allocator,
    ) -> Result<BoxTableStream> {
        if spec.aggregates.len() != 1 {
            return Err(RillError::InvalidArgument(format!(
                "window aggregate reads take exactly one aggregate, got {}",
                spec.aggregates.len()
            )));
        }
        let kind = spec.aggregates[0];
        let window = Window::new(spec.window_every, spec.offset)?;
        let series = self.fetch_sorted(&spec.filter)?;
        if let Some(time_column) = spec.time_column {
            Ok(Box::new(MergedWindowStream {
                alloc: alloc.clone(),
                bounds: spec.filter.bounds,
                kind,
                window,
                time_column,
                create_empty: spec.create_empty,
                series: series.into_iter(),
                failed: None,
            }))
        } else {
            Ok(Box::new(WindowStream {
                alloc: alloc.clone(),
                bounds: spec.filter.bounds,
                kind,
                window,
                create_empty: spec.create_empty,
                series: series.into_iter(),
                current: None,
                failed: None,
            }))
        }
    }

    /// Group-by read with one terminal aggregate per group.
    pub fn read_group(&self, spec: &ReadGroupSpec, alloc: &Allocator) -> Result<BoxTableStream> {
        let series = self.fetch_sorted(&spec.filter)?;
        let bounds = spec.filter.bounds;
        let plans: Vec<GroupPlan> = match spec.group_mode {
            GroupMode::None => series
                .into_iter()
                .map(|block| GroupPlan {
                    key: series_group_key(&block, bounds),
                    consts: series_consts(&block),
                    blocks: vec![block],
                })
                .collect(),
            GroupMode::By => {
                let mut groups: BTreeMap<Vec<String>, Vec<SeriesBlock>> = BTreeMap::new();
                for block in series {
                    let values: Vec<String> = spec
                        .group_keys
                        .iter()
                        .map(|key| group_column_value(&block, key))
                        .collect();
                    groups.entry(values).or_default().push(block);
                }
                groups
                    .into_iter()
                    .map(|(values, blocks)| {
                        let mut pairs = vec![
                            (START_COL.to_string(), KeyValue::Time(bounds.start)),
                            (STOP_COL.to_string(), KeyValue::Time(bounds.stop)),
                        ];
                        let mut consts = Vec::new();
                        for (key, value) in spec.group_keys.iter().zip(values) {
                            pairs.push((key.clone(), KeyValue::Str(value.clone())));
                            consts.push((key.clone(), value));
                        }
                        GroupPlan {
                            key: GroupKey::new(pairs),
                            consts,
                            blocks,
                        }
                    })
                    .collect()
            }
        };
        let mut plans = plans;
        plans.sort_by(|a, b| a.key.cmp(&b.key));
        Ok(Box::new(GroupStream {
            alloc: alloc.clone(),
            bounds,
            aggregate: spec.aggregate,
            plans: plans.into_iter(),
            failed: None,
        }))
    }

    /// Fetch matching series and order them by their output group key.
    fn fetch_sorted(&self, spec: &ReadFilterSpec) -> Result<Vec<SeriesBlock>> {
        let mut series = self.engine.read_series(
            spec.org,
            spec.bucket,
            spec.predicate.as_ref(),
            spec.bounds,
        )?;
        series.sort_by(|a, b| {
            series_group_key(a, spec.bounds).cmp(&series_group_key(b, spec.bounds))
        });
        Ok(series)
    }
}

/// Group key of one series for ungrouped reads:
/// `_start`, `_stop`, `_field`, `_measurement`, then tag keys.
fn series_group_key(block: &SeriesBlock, bounds: TimeBounds) -> GroupKey {
    let mut pairs = vec![
        (START_COL.to_string(), KeyValue::Time(bounds.start)),
        (STOP_COL.to_string(), KeyValue::Time(bounds.stop)),
        (FIELD_COL.to_string(), KeyValue::Str(block.field.clone())),
        (
            MEASUREMENT_COL.to_string(),
            KeyValue::Str(block.measurement.clone()),
        ),
    ];
    for (key, value) in &block.tags {
        pairs.push((key.clone(), KeyValue::Str(value.clone())));
    }
    GroupKey::new(pairs)
}

/// Trailing constant columns of one series' tables:
/// `_field`, `_measurement`, then tags.
fn series_consts(block: &SeriesBlock) -> Vec<(String, String)> {
    let mut consts = vec![
        (FIELD_COL.to_string(), block.field.clone()),
        (MEASUREMENT_COL.to_string(), block.measurement.clone()),
    ];
    for (key, value) in &block.tags {
        consts.push((key.clone(), value.clone()));
    }
    consts
}

fn group_column_value(block: &SeriesBlock, key: &str) -> String {
    match key {
        MEASUREMENT_COL => block.measurement.clone(),
        FIELD_COL => block.field.clone(),
        tag => block.tags.get(tag).cloned().unwrap_or_default(),
    }
}

/// Typed, null-capable output value column under construction.
enum ValueColumn {
    Float(Vec<Option<f64>>),
    Integer(Vec<Option<i64>>),
    Unsigned(Vec<Option<u64>>),
    Boolean(Vec<Option<bool>>),
    Str(Vec<Option<String>>),
}

impl ValueColumn {
    fn new(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Float => ValueColumn::Float(Vec::new()),
            ValueType::Integer => ValueColumn::Integer(Vec::new()),
            ValueType::Unsigned => ValueColumn::Unsigned(Vec::new()),
            ValueType::Boolean => ValueColumn::Boolean(Vec::new()),
            ValueType::String => ValueColumn::Str(Vec::new()),
        }
    }

    fn push(&mut self, value: Option<FieldValue>) -> Result<()> {
        match (self, value) {
            (ValueColumn::Float(col), Some(FieldValue::Float(v))) => col.push(Some(v)),
            (ValueColumn::Integer(col), Some(FieldValue::Integer(v))) => col.push(Some(v)),
            (ValueColumn::Unsigned(col), Some(FieldValue::Unsigned(v))) => col.push(Some(v)),
            (ValueColumn::Boolean(col), Some(FieldValue::Boolean(v))) => col.push(Some(v)),
            (ValueColumn::Str(col), Some(FieldValue::String(v))) => col.push(Some(v)),
            (ValueColumn::Float(col), None) => col.push(None),
            (ValueColumn::Integer(col), None) => col.push(None),
            (ValueColumn::Unsigned(col), None) => col.push(None),
            (ValueColumn::Boolean(col), None) => col.push(None),
            (ValueColumn::Str(col), None) => col.push(None),
            _ => {
                return Err(RillError::Internal(
                    "aggregate produced a value of the wrong type".into(),
                ))
            }
        }
        Ok(())
    }

    fn data_type(&self) -> DataType {
        match self {
            ValueColumn::Float(_) => DataType::Float64,
            ValueColumn::Integer(_) => DataType::Int64,
            ValueColumn::Unsigned(_) => DataType::UInt64,
            ValueColumn::Boolean(_) => DataType::Boolean,
            ValueColumn::Str(_) => DataType::Utf8,
        }
    }

    fn into_array(self) -> ArrayRef {
        match self {
            ValueColumn::Float(col) => Arc::new(Float64Array::from(col)),
            ValueColumn::Integer(col) => Arc::new(Int64Array::from(col)),
            ValueColumn::Unsigned(col) => Arc::new(UInt64Array::from(col)),
            ValueColumn::Boolean(col) => Arc::new(BooleanArray::from(col)),
            ValueColumn::Str(col) => Arc::new(StringArray::from(col)),
        }
    }
}

/// Aggregate one `[start, end)` index range of a series.
///
/// `value == None` means the range is empty (except `count`, which is `0`
/// for an empty range); `time` is set for selector aggregates only.
struct RangeAgg {
    time: Option<i64>,
    value: Option<FieldValue>,
}

fn aggregate_range(
    kind: AggregateKind,
    block: &SeriesBlock,
    start: usize,
    end: usize,
) -> Result<RangeAgg> {
    let n = end - start;
    match kind {
        AggregateKind::Count => Ok(RangeAgg {
            time: None,
            value: Some(FieldValue::Integer(n as i64)),
        }),
        AggregateKind::Sum => {
            if n == 0 {
                return Ok(RangeAgg {
                    time: None,
                    value: None,
                });
            }
            let value = match &block.values {
                crate::value::ValueArray::Float(v) => {
                    FieldValue::Float(v[start..end].iter().sum())
                }
                crate::value::ValueArray::Integer(v) => {
                    FieldValue::Integer(v[start..end].iter().sum())
                }
                crate::value::ValueArray::Unsigned(v) => {
                    FieldValue::Unsigned(v[start..end].iter().sum())
                }
                other => return Err(unsupported_input(kind, other.value_type())),
            };
            Ok(RangeAgg {
                time: None,
                value: Some(value),
            })
        }
        AggregateKind::Mean => {
            if n == 0 {
                return Ok(RangeAgg {
                    time: None,
                    value: None,
                });
            }
            let sum = match &block.values {
                crate::value::ValueArray::Float(v) => v[start..end].iter().sum::<f64>(),
                crate::value::ValueArray::Integer(v) => {
                    v[start..end].iter().map(|&x| x as f64).sum()
                }
                crate::value::ValueArray::Unsigned(v) => {
                    v[start..end].iter().map(|&x| x as f64).sum()
                }
                other => return Err(unsupported_input(kind, other.value_type())),
            };
            Ok(RangeAgg {
                time: None,
                value: Some(FieldValue::Float(sum / n as f64)),
            })
        }
        AggregateKind::Min | AggregateKind::Max => {
            if n == 0 {
                return Ok(RangeAgg {
                    time: None,
                    value: None,
                });
            }
            let chosen = match &block.values {
                crate::value::ValueArray::Float(v) => {
                    extremum_index(&v[start..end], kind == AggregateKind::Min, |a, b| {
                        a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal)
                    })
                }
                crate::value::ValueArray::Integer(v) => {
                    extremum_index(&v[start..end], kind == AggregateKind::Min, Ord::cmp)
                }
                crate::value::ValueArray::Unsigned(v) => {
                    extremum_index(&v[start..end], kind == AggregateKind::Min, Ord::cmp)
                }
                other => return Err(unsupported_input(kind, other.value_type())),
            };
            let at = start + chosen;
            Ok(RangeAgg {
                time: Some(block.times[at]),
                value: Some(block.values.value_at(at)),
            })
        }
        AggregateKind::First | AggregateKind::Last => {
            if n == 0 {
                return Ok(RangeAgg {
                    time: None,
                    value: None,
                });
            }
            let at = if kind == AggregateKind::First {
                start
            } else {
                end - 1
            };
            Ok(RangeAgg {
                time: Some(block.times[at]),
                value: Some(block.values.value_at(at)),
            })
        }
    }
}

/// Index of the extremum within `values`; the earliest (lowest index)
/// strictly better value wins, which resolves timestamp ties because rows
/// are time-sorted.
fn extremum_index<T: Copy>(
    values: &[T],
    want_min: bool,
    cmp: impl Fn(&T, &T) -> std::cmp::Ordering,
) -> usize {
    let mut best = 0;
    for (i, v) in values.iter().enumerate().skip(1) {
        let ord = cmp(v, &values[best]);
        let better = if want_min {
            ord == std::cmp::Ordering::Less
        } else {
            ord == std::cmp::Ordering::Greater
        };
        if better {
            best = i;
        }
    }
    best
}

/// Assemble a table: `_start`, `_stop`, optional `_time`, `_value`, then
/// constant string columns, charged to `alloc`.
fn build_table(
    alloc: &Allocator,
    group_key: GroupKey,
    start: i64,
    stop: i64,
    times: Option<Vec<Option<i64>>>,
    values: ValueColumn,
    consts: &[(String, String)],
) -> Result<Table> {
    let n = match (&times, &values) {
        (Some(times), _) => times.len(),
        (None, ValueColumn::Float(v)) => v.len(),
        (None, ValueColumn::Integer(v)) => v.len(),
        (None, ValueColumn::Unsigned(v)) => v.len(),
        (None, ValueColumn::Boolean(v)) => v.len(),
        (None, ValueColumn::Str(v)) => v.len(),
    };
    let ts_type = DataType::Timestamp(TimeUnit::Nanosecond, None);

    let mut fields = vec![
        Field::new(START_COL, ts_type.clone(), false),
        Field::new(STOP_COL, ts_type.clone(), false),
    ];
    let mut columns: Vec<ArrayRef> = vec![
        Arc::new(TimestampNanosecondArray::from(vec![start; n])),
        Arc::new(TimestampNanosecondArray::from(vec![stop; n])),
    ];
    if let Some(times) = times {
        fields.push(Field::new(TIME_COL, ts_type, true));
        columns.push(Arc::new(TimestampNanosecondArray::from(times)));
    }
    fields.push(Field::new(VALUE_COL, values.data_type(), true));
    columns.push(values.into_array());
    for (label, value) in consts {
        fields.push(Field::new(label, DataType::Utf8, false));
        columns.push(Arc::new(StringArray::from(vec![value.as_str(); n])));
    }

    let schema = Arc::new(Schema::new(fields));
    let batch = RecordBatch::try_new(schema, columns)
        .map_err(|e| RillError::Internal(format!("table batch build failed: {e}")))?;
    Table::new(group_key, batch, alloc)
}

/// Remember a stream failure so later polls keep surfacing it.
fn replay_failure(failed: &Option<(ErrorKind, String)>) -> Option<RillError> {
    failed
        .as_ref()
        .map(|(kind, msg)| RillError::from_kind(*kind, msg.clone()))
}

fn record_failure(failed: &mut Option<(ErrorKind, String)>, err: &RillError) {
    *failed = Some((err.kind(), err.message()));
}

/// `ReadFilter` output: one table per series.
struct FilterStream {
    alloc: Allocator,
    bounds: TimeBounds,
    series: std::vec::IntoIter<SeriesBlock>,
    failed: Option<(ErrorKind, String)>,
}

impl TableStream for FilterStream {
    fn next_table(&mut self) -> Result<Option<Table>> {
        if let Some(err) = replay_failure(&self.failed) {
            return Err(err);
        }
        let Some(block) = self.series.next() else {
            return Ok(None);
        };
        let result = (|| {
            let mut values = ValueColumn::new(block.values.value_type());
            for i in 0..block.times.len() {
                values.push(Some(block.values.value_at(i)))?;
            }
            build_table(
                &self.alloc,
                series_group_key(&block, self.bounds),
                self.bounds.start,
                self.bounds.stop,
                Some(block.times.iter().map(|&t| Some(t)).collect()),
                values,
                &series_consts(&block),
            )
        })();
        match result {
            Ok(table) => Ok(Some(table)),
            Err(err) => {
                record_failure(&mut self.failed, &err);
                Err(err)
            }
        }
    }
}

/// Per-window index ranges of one series against a grid.
fn window_ranges(block: &SeriesBlock, grid: &WindowGrid) -> Vec<(usize, usize)> {
    let mut ranges = vec![(0usize, 0usize); grid.len()];
    let mut i = 0;
    while i < block.times.len() {
        let w = grid.index_of(block.times[i]);
        let (_, stop) = grid.window(w);
        let end = block.times.partition_point(|&t| t < stop);
        ranges[w] = (i, end);
        i = end;
    }
    ranges
}

struct SeriesWindows {
    block: SeriesBlock,
    grid: WindowGrid,
    ranges: Vec<(usize, usize)>,
    next: usize,
}

/// Window-aggregate output in per-window-table mode: the group key of each
/// table carries that window's `_start`/`_stop`.
struct WindowStream {
    alloc: Allocator,
    bounds: TimeBounds,
    kind: AggregateKind,
    window: Window,
    create_empty: bool,
    series: std::vec::IntoIter<SeriesBlock>,
    current: Option<SeriesWindows>,
    failed: Option<(ErrorKind, String)>,
}

impl WindowStream {
    fn advance(&mut self) -> Result<Option<Table>> {
        loop {
            if self.current.is_none() {
                let Some(block) = self.series.next() else {
                    return Ok(None);
                };
                let grid = self.window.grid(self.bounds);
                let ranges = window_ranges(&block, &grid);
                self.current = Some(SeriesWindows {
                    block,
                    grid,
                    ranges,
                    next: 0,
                });
            }
            let state = self.current.as_mut().expect("current series present");
            while state.next < state.grid.len() {
                let w = state.next;
                state.next += 1;
                let (start, end) = state.ranges[w];
                if start == end && !self.create_empty {
                    continue;
                }
                let (win_start, win_stop) = state.grid.window(w);
                let agg = aggregate_range(self.kind, &state.block, start, end)?;
                let output_type = self
                    .kind
                    .output_type(state.block.values.value_type())?;
                let mut values = ValueColumn::new(output_type);
                let times = if self.kind.is_selector() {
                    // Empty selector windows become zero-row tables.
                    match agg.time {
                        Some(t) => {
                            values.push(agg.value)?;
                            Some(vec![Some(t)])
                        }
                        None => Some(Vec::new()),
                    }
                } else {
                    values.push(agg.value)?;
                    None
                };
                let mut pairs = vec![
                    (START_COL.to_string(), KeyValue::Time(win_start)),
                    (STOP_COL.to_string(), KeyValue::Time(win_stop)),
                    (
                        FIELD_COL.to_string(),
                        KeyValue::Str(state.block.field.clone()),
                    ),
                    (
                        MEASUREMENT_COL.to_string(),
                        KeyValue::Str(state.block.measurement.clone()),
                    ),
                ];
                for (key, value) in &state.block.tags {
                    pairs.push((key.clone(), KeyValue::Str(value.clone())));
                }
                let table = build_table(
                    &self.alloc,
                    GroupKey::new(pairs),
                    win_start,
                    win_stop,
                    times,
                    values,
                    &series_consts(&state.block),
                )?;
                return Ok(Some(table));
            }
            self.current = None;
        }
    }
}

impl TableStream for WindowStream {
    fn next_table(&mut self) -> Result<Option<Table>> {
        if let Some(err) = replay_failure(&self.failed) {
            return Err(err);
        }
        match self.advance() {
            Ok(out) => Ok(out),
            Err(err) => {
                record_failure(&mut self.failed, &err);
                Err(err)
            }
        }
    }
}

/// Window-aggregate output with `time_column` set: one table per series,
/// `_start`/`_stop` scalars over the whole bounds, `_time` the chosen
/// (clipped) boundary of each row's window.
struct MergedWindowStream {
    alloc: Allocator,
    bounds: TimeBounds,
    kind: AggregateKind,
    window: Window,
    time_column: TimeColumn,
    create_empty: bool,
    series: std::vec::IntoIter<SeriesBlock>,
    failed: Option<(ErrorKind, String)>,
}

impl MergedWindowStream {
    fn advance(&mut self) -> Result<Option<Table>> {
        let Some(block) = self.series.next() else {
            return Ok(None);
        };
        let grid = self.window.grid(self.bounds);
        let ranges = window_ranges(&block, &grid);
        let output_type = self.kind.output_type(block.values.value_type())?;
        let mut values = ValueColumn::new(output_type);
        let mut times: Vec<Option<i64>> = Vec::new();
        for w in 0..grid.len() {
            let (start, end) = ranges[w];
            let empty = start == end;
            if empty && !self.create_empty {
                continue;
            }
            let (win_start, win_stop) = grid.window(w);
            let boundary = match self.time_column {
                TimeColumn::Start => win_start,
                TimeColumn::Stop => win_stop,
            };
            let agg = aggregate_range(self.kind, &block, start, end)?;
            if empty && self.kind.is_selector() {
                // Merged empty selector windows keep their row with a null
                // timestamp and value.
                times.push(None);
                values.push(None)?;
            } else {
                times.push(Some(boundary));
                values.push(agg.value)?;
            }
        }
        let table = build_table(
            &self.alloc,
            series_group_key(&block, self.bounds),
            self.bounds.start,
            self.bounds.stop,
            Some(times),
            values,
            &series_consts(&block),
        )?;
        Ok(Some(table))
    }
}

impl TableStream for MergedWindowStream {
    fn next_table(&mut self) -> Result<Option<Table>> {
        if let Some(err) = replay_failure(&self.failed) {
            return Err(err);
        }
        match self.advance() {
            Ok(out) => Ok(out),
            Err(err) => {
                record_failure(&mut self.failed, &err);
                Err(err)
            }
        }
    }
}

struct GroupPlan {
    key: GroupKey,
    consts: Vec<(String, String)>,
    blocks: Vec<SeriesBlock>,
}

/// `ReadGroup` output: one table per group.
struct GroupStream {
    alloc: Allocator,
    bounds: TimeBounds,
    aggregate: Option<AggregateKind>,
    plans: std::vec::IntoIter<GroupPlan>,
    failed: Option<(ErrorKind, String)>,
}

impl GroupStream {
    fn advance(&mut self) -> Result<Option<Table>> {
        let Some(plan) = self.plans.next() else {
            return Ok(None);
        };
        let merged = merge_blocks(&plan.blocks)?;
        let table = match self.aggregate {
            Some(kind) => {
                let agg = aggregate_range(kind, &merged, 0, merged.times.len())?;
                let output_type = kind.output_type(merged.values.value_type())?;
                let mut values = ValueColumn::new(output_type);
                let times = if kind.is_selector() {
                    match agg.time {
                        Some(t) => {
                            values.push(agg.value)?;
                            Some(vec![Some(t)])
                        }
                        None => Some(Vec::new()),
                    }
                } else {
                    values.push(agg.value)?;
                    None
                };
                build_table(
                    &self.alloc,
                    plan.key,
                    self.bounds.start,
                    self.bounds.stop,
                    times,
                    values,
                    &plan.consts,
                )?
            }
            None => {
                let mut values = ValueColumn::new(merged.values.value_type());
                for i in 0..merged.times.len() {
                    values.push(Some(merged.values.value_at(i)))?;
                }
                build_table(
                    &self.alloc,
                    plan.key,
                    self.bounds.start,
                    self.bounds.stop,
                    Some(merged.times.iter().map(|&t| Some(t)).collect()),
                    values,
                    &plan.consts,
                )?
            }
        };
        Ok(Some(table))
    }
}

impl TableStream for GroupStream {
    fn next_table(&mut self) -> Result<Option<Table>> {
        if let Some(err) = replay_failure(&self.failed) {
            return Err(err);
        }
        match self.advance() {
            Ok(out) => Ok(out),
            Err(err) => {
                record_failure(&mut self.failed, &err);
                Err(err)
            }
        }
    }
}

/// Merge the blocks of one group into a single time-sorted block. All
/// blocks must share a value type.
fn merge_blocks(blocks: &[SeriesBlock]) -> Result<SeriesBlock> {
    let first = blocks.first().ok_or_else(|| {
        RillError::Internal("group plan without series".into())
    })?;
    if blocks.len() == 1 {
        return Ok(first.clone());
    }
    let value_type = first.values.value_type();
    for block in &blocks[1..] {
        if block.values.value_type() != value_type {
            return Err(RillError::InvalidArgument(format!(
                "group mixes {:?} and {:?} series",
                value_type,
                block.values.value_type()
            )));
        }
    }
    let mut rows: Vec<(i64, FieldValue)> = Vec::new();
    for block in blocks {
        for i in 0..block.times.len() {
            rows.push((block.times[i], block.values.value_at(i)));
        }
    }
    rows.sort_by_key(|(t, _)| *t);
    let mut merged = SeriesBlock {
        measurement: first.measurement.clone(),
        tags: first.tags.clone(),
        field: first.field.clone(),
        times: Vec::with_capacity(rows.len()),
        values: crate::value::ValueArray::empty(value_type),
    };
    for (i, (t, v)) in rows.into_iter().enumerate() {
        merged.times.push(t);
        merged.values.insert(i, v)?;
    }
    Ok(merged)
}

//! Columnar query-path values: group keys, tables, and table streams.

use std::cmp::Ordering;
use std::fmt;

use arrow::record_batch::RecordBatch;
use arrow_schema::SchemaRef;

use rill_common::{Allocator, Result, RillError};

/// Label of the window-start column.
pub const START_COL: &str = "_start";
/// Label of the window-stop column.
pub const STOP_COL: &str = "_stop";
/// Label of the sample-timestamp column.
pub const TIME_COL: &str = "_time";
/// Label of the value column.
pub const VALUE_COL: &str = "_value";
/// Label of the measurement column.
pub const MEASUREMENT_COL: &str = "_measurement";
/// Label of the field column.
pub const FIELD_COL: &str = "_field";

/// A constant scalar bound to a group-key label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum KeyValue {
    /// String-valued key column (tags, `_measurement`, `_field`).
    Str(String),
    /// Time-valued key column (`_start`, `_stop`), UTC nanoseconds.
    Time(i64),
}

impl KeyValue {
    fn rank(&self) -> u8 {
        match self {
            KeyValue::Time(_) => 0,
            KeyValue::Str(_) => 1,
        }
    }
}

impl PartialOrd for KeyValue {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for KeyValue {
    fn cmp(&self, other: &Self) -> Ordering {
        match (self, other) {
            (KeyValue::Str(a), KeyValue::Str(b)) => a.cmp(b),
            (KeyValue::Time(a), KeyValue::Time(b)) => a.cmp(b),
            _ => self.rank().cmp(&other.rank()),
        }
    }
}

impl fmt::Display for KeyValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            KeyValue::Str(s) => write!(f, "{s}"),
            KeyValue::Time(t) => write!(f, "{t}"),
        }
    }
}

/// Ordered (label, constant) pairs that hold for every row of a table.
///
/// Tables emitted by one read call are ordered by comparing group keys
/// pair-wise, label first.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Default)]
pub struct GroupKey {
    pairs: Vec<(String, KeyValue)>,
}

impl GroupKey {
    /// Build from ordered pairs.
    pub fn new(pairs: Vec<(String, KeyValue)>) -> Self {
        Self { pairs }
    }

    /// The ordered pairs.
    pub fn pairs(&self) -> &[(String, KeyValue)] {
        &self.pairs
    }

    /// Ordered labels.
    pub fn labels(&self) -> impl Iterator<Item = &str> {
        self.pairs.iter().map(|(label, _)| label.as_str())
    }

    /// Constant bound to `label`, if the label is part of the key.
    pub fn get(&self, label: &str) -> Option<&KeyValue> {
        self.pairs
            .iter()
            .find(|(l, _)| l == label)
            .map(|(_, v)| v)
    }
}

impl fmt::Display for GroupKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut first = true;
        for (label, value) in &self.pairs {
            if !first {
                write!(f, ",")?;
            }
            write!(f, "{label}={value}")?;
            first = false;
        }
        Ok(())
    }
}

/// One columnar table: a group key plus a record batch whose rows are
/// sorted by `_time` ascending.
///
/// The batch may be taken exactly once; afterwards the table is done and
/// only its metadata remains readable. The memory charged for the batch is
/// returned to the query's allocator when the table is dropped.
#[derive(Debug)]
pub struct Table {
    group_key: GroupKey,
    schema: SchemaRef,
    batch: Option<RecordBatch>,
    num_rows: usize,
    size_bytes: u64,
    alloc: Allocator,
}

impl Table {
    /// Build a table, charging the batch's buffers to `alloc`.
    pub fn new(group_key: GroupKey, batch: RecordBatch, alloc: &Allocator) -> Result<Self> {
        let size_bytes = batch.get_array_memory_size() as u64;
        alloc.account(size_bytes)?;
        Ok(Self {
            group_key,
            schema: batch.schema(),
            num_rows: batch.num_rows(),
            batch: Some(batch),
            size_bytes,
            alloc: alloc.clone(),
        })
    }

    /// The table's group key.
    pub fn group_key(&self) -> &GroupKey {
        &self.group_key
    }

    /// Schema of the (possibly already taken) batch.
    pub fn schema(&self) -> SchemaRef {
        self.schema.clone()
    }

    /// Row count of the payload.
    pub fn num_rows(&self) -> usize {
        self.num_rows
    }

    /// Whether the payload was already consumed.
    pub fn is_done(&self) -> bool {
        self.batch.is_none()
    }

    /// Consume the payload. A second take is an `internal` error: the
    /// stream contract hands each table to exactly one consumer.
    pub fn take_batch(&mut self) -> Result<RecordBatch> {
        self.batch.take().ok_or_else(|| {
            RillError::Internal(format!(
                "table {} payload read after done",
                self.group_key
            ))
        })
    }
}

impl Drop for Table {
    fn drop(&mut self) {
        self.alloc.free(self.size_bytes);
    }
}

/// A lazy sequence of tables.
///
/// `next_table` returns `Ok(None)` once exhausted; after an error the
/// stream is dead and further calls keep returning errors. Already-emitted
/// tables stay valid either way.
pub trait TableStream: Send {
    /// Produce the next table.
    fn next_table(&mut self) -> Result<Option<Table>>;
}

/// The boxed stream handed across component boundaries.
pub type BoxTableStream = Box<dyn TableStream>;

/// Visitor-style driver: invoke `visit` for each table in stream order.
pub fn drive(mut stream: BoxTableStream, mut visit: impl FnMut(Table) -> Result<()>) -> Result<()> {
    while let Some(table) = stream.next_table()? {
        visit(table)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use arrow::array::Int64Array;
    use arrow_schema::{DataType, Field, Schema};
    use std::sync::Arc;

    fn batch() -> RecordBatch {
        let schema = Arc::new(Schema::new(vec![Field::new(
            VALUE_COL,
            DataType::Int64,
            true,
        )]));
        RecordBatch::try_new(schema, vec![Arc::new(Int64Array::from(vec![1, 2, 3]))]).unwrap()
    }

    #[test]
    fn group_keys_order_pairwise() {
        let a = GroupKey::new(vec![
            ("_field".into(), KeyValue::Str("f0".into())),
            ("t0".into(), KeyValue::Str("a-0".into())),
        ]);
        let b = GroupKey::new(vec![
            ("_field".into(), KeyValue::Str("f0".into())),
            ("t0".into(), KeyValue::Str("a-1".into())),
        ]);
        assert!(a < b);
    }

    #[test]
    fn take_batch_is_single_shot() {
        let alloc = Allocator::unlimited();
        let mut table = Table::new(GroupKey::default(), batch(), &alloc).unwrap();
        assert!(!table.is_done());
        table.take_batch().unwrap();
        assert!(table.is_done());
        let err = table.take_batch().unwrap_err();
        assert_eq!(err.kind(), rill_common::ErrorKind::Internal);
    }

    #[test]
    fn dropping_a_table_frees_its_bytes() {
        let alloc = Allocator::unlimited();
        {
            let _table = Table::new(GroupKey::default(), batch(), &alloc).unwrap();
            assert!(alloc.used() > 0);
        }
        assert_eq!(alloc.used(), 0);
    }
}

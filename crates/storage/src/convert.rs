//! Row extraction from record batches back into engine points.
//!
//! Used by the task executor to drain query results into the points
//! writer: `_measurement`, `_field`, `_time`, `_value` map back onto the
//! sample tuple, every other string column is treated as a tag, and the
//! `_start` / `_stop` window columns are dropped.

use std::collections::BTreeMap;

use arrow::array::{
    Array, BooleanArray, Float64Array, Int64Array, StringArray, TimestampNanosecondArray,
    UInt64Array,
};
use arrow::record_batch::RecordBatch;
use arrow_schema::DataType;

use crate::point::Point;
use crate::table::{FIELD_COL, MEASUREMENT_COL, START_COL, STOP_COL, TIME_COL, VALUE_COL};
use crate::value::FieldValue;
use rill_common::{Result, RillError};

fn string_column<'a>(batch: &'a RecordBatch, label: &str) -> Result<&'a StringArray> {
    let idx = batch
        .schema()
        .index_of(label)
        .map_err(|_| RillError::InvalidArgument(format!("result batch misses column {label}")))?;
    batch
        .column(idx)
        .as_any()
        .downcast_ref::<StringArray>()
        .ok_or_else(|| RillError::InvalidArgument(format!("column {label} is not a string")))
}

/// Convert one result batch into points.
///
/// Rows with a null `_value` or null `_time` are skipped; they stand for
/// empty windows and carry no sample.
pub fn batch_points(batch: &RecordBatch) -> Result<Vec<Point>> {
    let schema = batch.schema();
    let measurements = string_column(batch, MEASUREMENT_COL)?;
    let fields = string_column(batch, FIELD_COL)?;

    let time_idx = schema
        .index_of(TIME_COL)
        .map_err(|_| RillError::InvalidArgument("result batch misses column _time".into()))?;
    let times = batch
        .column(time_idx)
        .as_any()
        .downcast_ref::<TimestampNanosecondArray>()
        .ok_or_else(|| RillError::InvalidArgument("column _time is not a timestamp".into()))?;

    let value_idx = schema
        .index_of(VALUE_COL)
        .map_err(|_| RillError::InvalidArgument("result batch misses column _value".into()))?;
    let value_col = batch.column(value_idx);

    let mut tag_cols: Vec<(String, &StringArray)> = Vec::new();
    for (idx, field) in schema.fields().iter().enumerate() {
        let name = field.name().as_str();
        if matches!(
            name,
            START_COL | STOP_COL | TIME_COL | VALUE_COL | MEASUREMENT_COL | FIELD_COL
        ) {
            continue;
        }
        if field.data_type() == &DataType::Utf8 {
            let col = batch
                .column(idx)
                .as_any()
                .downcast_ref::<StringArray>()
                .ok_or_else(|| {
                    RillError::InvalidArgument(format!("column {name} is not a string"))
                })?;
            tag_cols.push((name.to_string(), col));
        }
    }

    let mut points = Vec::with_capacity(batch.num_rows());
    for row in 0..batch.num_rows() {
        if times.is_null(row) || value_col.is_null(row) {
            continue;
        }
        let value = match value_col.data_type() {
            DataType::Float64 => FieldValue::Float(
                value_col
                    .as_any()
                    .downcast_ref::<Float64Array>()
                    .expect("float column")
                    .value(row),
            ),
            DataType::Int64 => FieldValue::Integer(
                value_col
                    .as_any()
                    .downcast_ref::<Int64Array>()
                    .expect("int column")
                    .value(row),
            ),
            DataType::UInt64 => FieldValue::Unsigned(
                value_col
                    .as_any()
                    .downcast_ref::<UInt64Array>()
                    .expect("uint column")
                    .value(row),
            ),
            DataType::Boolean => FieldValue::Boolean(
                value_col
                    .as_any()
                    .downcast_ref::<BooleanArray>()
                    .expect("bool column")
                    .value(row),
            ),
            DataType::Utf8 => FieldValue::String(
                value_col
                    .as_any()
                    .downcast_ref::<StringArray>()
                    .expect("string column")
                    .value(row)
                    .to_string(),
            ),
            other => {
                return Err(RillError::InvalidArgument(format!(
                    "unsupported _value type {other}"
                )))
            }
        };
        let mut tags = BTreeMap::new();
        for (name, col) in &tag_cols {
            tags.insert(name.clone(), col.value(row).to_string());
        }
        points.push(Point {
            measurement: measurements.value(row).to_string(),
            tags,
            field: fields.value(row).to_string(),
            time: times.value(row),
            value,
        });
    }
    Ok(points)
}

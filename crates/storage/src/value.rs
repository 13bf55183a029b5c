//! Typed sample values and their columnar carriers.

use serde::{Deserialize, Serialize};

use rill_common::{Result, RillError};

/// Scalar type of a series' field values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ValueType {
    /// 64-bit IEEE float.
    Float,
    /// Signed 64-bit integer.
    Integer,
    /// Unsigned 64-bit integer.
    Unsigned,
    /// Boolean.
    Boolean,
    /// UTF-8 string.
    String,
}

/// One typed sample value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldValue {
    /// 64-bit IEEE float.
    Float(f64),
    /// Signed 64-bit integer.
    Integer(i64),
    /// Unsigned 64-bit integer.
    Unsigned(u64),
    /// Boolean.
    Boolean(bool),
    /// UTF-8 string.
    String(String),
}

impl FieldValue {
    /// Scalar type of this value.
    pub fn value_type(&self) -> ValueType {
        match self {
            FieldValue::Float(_) => ValueType::Float,
            FieldValue::Integer(_) => ValueType::Integer,
            FieldValue::Unsigned(_) => ValueType::Unsigned,
            FieldValue::Boolean(_) => ValueType::Boolean,
            FieldValue::String(_) => ValueType::String,
        }
    }
}

/// Columnar value storage for one series.
///
/// The engine keeps one variant per series; a series never changes type
/// after its first write.
#[derive(Debug, Clone, PartialEq)]
pub enum ValueArray {
    /// Float column.
    Float(Vec<f64>),
    /// Integer column.
    Integer(Vec<i64>),
    /// Unsigned column.
    Unsigned(Vec<u64>),
    /// Boolean column.
    Boolean(Vec<bool>),
    /// String column.
    String(Vec<String>),
}

impl ValueArray {
    /// Empty column of the given type.
    pub fn empty(value_type: ValueType) -> Self {
        match value_type {
            ValueType::Float => ValueArray::Float(Vec::new()),
            ValueType::Integer => ValueArray::Integer(Vec::new()),
            ValueType::Unsigned => ValueArray::Unsigned(Vec::new()),
            ValueType::Boolean => ValueArray::Boolean(Vec::new()),
            ValueType::String => ValueArray::String(Vec::new()),
        }
    }

    /// Scalar type of the column.
    pub fn value_type(&self) -> ValueType {
        match self {
            ValueArray::Float(_) => ValueType::Float,
            ValueArray::Integer(_) => ValueType::Integer,
            ValueArray::Unsigned(_) => ValueType::Unsigned,
            ValueArray::Boolean(_) => ValueType::Boolean,
            ValueArray::String(_) => ValueType::String,
        }
    }

    /// Number of values.
    pub fn len(&self) -> usize {
        match self {
            ValueArray::Float(v) => v.len(),
            ValueArray::Integer(v) => v.len(),
            ValueArray::Unsigned(v) => v.len(),
            ValueArray::Boolean(v) => v.len(),
            ValueArray::String(v) => v.len(),
        }
    }

    /// Whether the column holds no values.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Value at `index`.
    pub fn value_at(&self, index: usize) -> FieldValue {
        match self {
            ValueArray::Float(v) => FieldValue::Float(v[index]),
            ValueArray::Integer(v) => FieldValue::Integer(v[index]),
            ValueArray::Unsigned(v) => FieldValue::Unsigned(v[index]),
            ValueArray::Boolean(v) => FieldValue::Boolean(v[index]),
            ValueArray::String(v) => FieldValue::String(v[index].clone()),
        }
    }

    /// Insert `value` at `index`, shifting the tail right.
    pub fn insert(&mut self, index: usize, value: FieldValue) -> Result<()> {
        match (self, value) {
            (ValueArray::Float(v), FieldValue::Float(x)) => v.insert(index, x),
            (ValueArray::Integer(v), FieldValue::Integer(x)) => v.insert(index, x),
            (ValueArray::Unsigned(v), FieldValue::Unsigned(x)) => v.insert(index, x),
            (ValueArray::Boolean(v), FieldValue::Boolean(x)) => v.insert(index, x),
            (ValueArray::String(v), FieldValue::String(x)) => v.insert(index, x),
            (column, value) => {
                return Err(RillError::InvalidArgument(format!(
                    "series value type mismatch: column is {:?}, write is {:?}",
                    column.value_type(),
                    value.value_type(),
                )))
            }
        }
        Ok(())
    }

    /// Replace the value at `index`.
    pub fn set(&mut self, index: usize, value: FieldValue) -> Result<()> {
        match (self, value) {
            (ValueArray::Float(v), FieldValue::Float(x)) => v[index] = x,
            (ValueArray::Integer(v), FieldValue::Integer(x)) => v[index] = x,
            (ValueArray::Unsigned(v), FieldValue::Unsigned(x)) => v[index] = x,
            (ValueArray::Boolean(v), FieldValue::Boolean(x)) => v[index] = x,
            (ValueArray::String(v), FieldValue::String(x)) => v[index] = x,
            (column, value) => {
                return Err(RillError::InvalidArgument(format!(
                    "series value type mismatch: column is {:?}, write is {:?}",
                    column.value_type(),
                    value.value_type(),
                )))
            }
        }
        Ok(())
    }

    /// Remove the index range `[start, end)`.
    pub fn drain(&mut self, start: usize, end: usize) {
        match self {
            ValueArray::Float(v) => drop(v.drain(start..end)),
            ValueArray::Integer(v) => drop(v.drain(start..end)),
            ValueArray::Unsigned(v) => drop(v.drain(start..end)),
            ValueArray::Boolean(v) => drop(v.drain(start..end)),
            ValueArray::String(v) => drop(v.drain(start..end)),
        }
    }

    /// Copy of the index range `[start, end)`.
    pub fn slice(&self, start: usize, end: usize) -> ValueArray {
        match self {
            ValueArray::Float(v) => ValueArray::Float(v[start..end].to_vec()),
            ValueArray::Integer(v) => ValueArray::Integer(v[start..end].to_vec()),
            ValueArray::Unsigned(v) => ValueArray::Unsigned(v[start..end].to_vec()),
            ValueArray::Boolean(v) => ValueArray::Boolean(v[start..end].to_vec()),
            ValueArray::String(v) => ValueArray::String(v[start..end].to_vec()),
        }
    }
}

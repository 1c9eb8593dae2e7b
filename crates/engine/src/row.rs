//! Rows, column values and the on-page row codec.
//!
//! A row is encoded as one flag byte per column (null / present) followed by
//! the typed payload for each present column. Text carries a u32 length
//! prefix; every other type is fixed width.

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, EngineResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DataType {
    Integer,
    BigInt,
    Text,
    Boolean,
    Timestamp,
}

impl DataType {
    pub(crate) fn to_byte(self) -> u8 {
        match self {
            DataType::Integer => 1,
            DataType::BigInt => 2,
            DataType::Text => 3,
            DataType::Boolean => 4,
            DataType::Timestamp => 5,
        }
    }

    pub(crate) fn from_byte(byte: u8) -> EngineResult<Self> {
        match byte {
            1 => Ok(DataType::Integer),
            2 => Ok(DataType::BigInt),
            3 => Ok(DataType::Text),
            4 => Ok(DataType::Boolean),
            5 => Ok(DataType::Timestamp),
            other => Err(EngineError::Corrupt(format!(
                "unknown data type tag {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Integer(i64),
    Text(String),
    Boolean(bool),
    Timestamp(i64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// True when the value can be stored in a column of `data_type`.
    pub fn matches_type(&self, data_type: DataType) -> bool {
        match (self, data_type) {
            (Value::Null, _) => true,
            (Value::Integer(_), DataType::Integer | DataType::BigInt) => true,
            (Value::Text(_), DataType::Text) => true,
            (Value::Boolean(_), DataType::Boolean) => true,
            (Value::Timestamp(_), DataType::Timestamp) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for Value {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Value::Null => write!(f, "NULL"),
            Value::Integer(v) => write!(f, "{v}"),
            Value::Text(v) => write!(f, "{v}"),
            Value::Boolean(v) => write!(f, "{v}"),
            Value::Timestamp(v) => write!(f, "{v}"),
        }
    }
}

pub type Row = Vec<Value>;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ColumnDef {
    pub name: String,
    pub data_type: DataType,
}

impl ColumnDef {
    pub fn new(name: impl Into<String>, data_type: DataType) -> Self {
        Self {
            name: name.into(),
            data_type,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableSchema {
    pub columns: Vec<ColumnDef>,
}

impl TableSchema {
    pub fn new(columns: Vec<ColumnDef>) -> Self {
        Self { columns }
    }

    pub fn column_index(&self, name: &str) -> Option<usize> {
        self.columns.iter().position(|column| column.name == name)
    }

    pub fn column_types(&self) -> Vec<DataType> {
        self.columns.iter().map(|column| column.data_type).collect()
    }

    /// Checks arity and per-column type compatibility of a candidate row.
    pub fn check_row(&self, row: &Row) -> EngineResult<()> {
        if row.len() != self.columns.len() {
            return Err(EngineError::Schema(format!(
                "row has {} values, schema has {} columns",
                row.len(),
                self.columns.len()
            )));
        }
        for (value, column) in row.iter().zip(&self.columns) {
            if !value.matches_type(column.data_type) {
                return Err(EngineError::Schema(format!(
                    "value {value} does not fit column {} ({:?})",
                    column.name, column.data_type
                )));
            }
        }
        Ok(())
    }
}

pub(crate) fn encode_values(values: &[Value], types: &[DataType]) -> EngineResult<Vec<u8>> {
    if values.len() != types.len() {
        return Err(EngineError::Schema(format!(
            "encoding {} values against {} types",
            values.len(),
            types.len()
        )));
    }
    let mut buf = Vec::new();
    for (value, data_type) in values.iter().zip(types) {
        if !value.matches_type(*data_type) {
            return Err(EngineError::Schema(format!(
                "value {value} does not fit type {data_type:?}"
            )));
        }
        if value.is_null() {
            buf.push(1);
            continue;
        }
        buf.push(0);
        match value {
            Value::Null => unreachable!(),
            Value::Integer(v) | Value::Timestamp(v) => buf.extend_from_slice(&v.to_le_bytes()),
            Value::Boolean(v) => buf.push(*v as u8),
            Value::Text(v) => {
                buf.extend_from_slice(&(v.len() as u32).to_le_bytes());
                buf.extend_from_slice(v.as_bytes());
            }
        }
    }
    Ok(buf)
}

pub(crate) fn decode_values(data: &[u8], types: &[DataType]) -> EngineResult<Vec<Value>> {
    let mut values = Vec::with_capacity(types.len());
    let mut pos = 0usize;
    for data_type in types {
        let flag = *data
            .get(pos)
            .ok_or_else(|| EngineError::Corrupt("truncated row: missing null flag".into()))?;
        pos += 1;
        if flag == 1 {
            values.push(Value::Null);
            continue;
        }
        let value = match data_type {
            DataType::Integer | DataType::BigInt => {
                let bytes = read_slice(data, pos, 8)?;
                pos += 8;
                Value::Integer(i64::from_le_bytes(fixed8(bytes)))
            }
            DataType::Timestamp => {
                let bytes = read_slice(data, pos, 8)?;
                pos += 8;
                Value::Timestamp(i64::from_le_bytes(fixed8(bytes)))
            }
            DataType::Boolean => {
                let bytes = read_slice(data, pos, 1)?;
                pos += 1;
                Value::Boolean(bytes[0] != 0)
            }
            DataType::Text => {
                let len_bytes = read_slice(data, pos, 4)?;
                pos += 4;
                let len = u32::from_le_bytes([
                    len_bytes[0],
                    len_bytes[1],
                    len_bytes[2],
                    len_bytes[3],
                ]) as usize;
                let bytes = read_slice(data, pos, len)?;
                pos += len;
                Value::Text(
                    String::from_utf8(bytes.to_vec())
                        .map_err(|_| EngineError::Corrupt("row text is not utf-8".into()))?,
                )
            }
        };
        values.push(value);
    }
    Ok(values)
}

fn read_slice(data: &[u8], pos: usize, len: usize) -> EngineResult<&[u8]> {
    data.get(pos..pos + len)
        .ok_or_else(|| EngineError::Corrupt("truncated row payload".into()))
}

fn fixed8(bytes: &[u8]) -> [u8; 8] {
    let mut out = [0u8; 8];
    out.copy_from_slice(bytes);
    out
}

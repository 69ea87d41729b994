use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

mod codec;
pub use codec::{decode, encode, DecodeError};

/// Batch metadata key carrying the global sample indices of the batch.
pub const INDICES_KEY: &str = "_lavender_data_indices";
/// Batch metadata key carrying the sequence number of the batch.
pub const CURRENT_KEY: &str = "_lavender_data_current";

/// Element type of a multidimensional numeric array.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Dtype {
    I8,
    I16,
    I32,
    I64,
    U8,
    U16,
    U32,
    U64,
    F32,
    F64,
}

impl Dtype {
    pub fn size(&self) -> usize {
        match self {
            Dtype::I8 | Dtype::U8 => 1,
            Dtype::I16 | Dtype::U16 => 2,
            Dtype::I32 | Dtype::U32 | Dtype::F32 => 4,
            Dtype::I64 | Dtype::U64 | Dtype::F64 => 8,
        }
    }

    pub(crate) fn code(&self) -> u8 {
        match self {
            Dtype::I8 => 0,
            Dtype::I16 => 1,
            Dtype::I32 => 2,
            Dtype::I64 => 3,
            Dtype::U8 => 4,
            Dtype::U16 => 5,
            Dtype::U32 => 6,
            Dtype::U64 => 7,
            Dtype::F32 => 8,
            Dtype::F64 => 9,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<Dtype> {
        Some(match code {
            0 => Dtype::I8,
            1 => Dtype::I16,
            2 => Dtype::I32,
            3 => Dtype::I64,
            4 => Dtype::U8,
            5 => Dtype::U16,
            6 => Dtype::U32,
            7 => Dtype::U64,
            8 => Dtype::F32,
            9 => Dtype::F64,
            _ => return None,
        })
    }
}

/// A multidimensional numeric array: dtype, shape, and raw little-endian
/// element bytes. `data.len()` always equals `shape.product() * dtype.size()`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NdArray {
    pub dtype: Dtype,
    pub shape: Vec<usize>,
    pub data: Vec<u8>,
}

impl NdArray {
    pub fn new(dtype: Dtype, shape: Vec<usize>, data: Vec<u8>) -> Result<Self, DecodeError> {
        let elements: usize = shape.iter().product();
        if data.len() != elements * dtype.size() {
            return Err(DecodeError::ArrayLength {
                expected: elements * dtype.size(),
                actual: data.len(),
            });
        }
        Ok(NdArray { dtype, shape, data })
    }

    pub fn from_f32(shape: Vec<usize>, values: &[f32]) -> Result<Self, DecodeError> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(Dtype::F32, shape, data)
    }

    pub fn from_i32(shape: Vec<usize>, values: &[i32]) -> Result<Self, DecodeError> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(Dtype::I32, shape, data)
    }

    pub fn from_i64(shape: Vec<usize>, values: &[i64]) -> Result<Self, DecodeError> {
        let data = values.iter().flat_map(|v| v.to_le_bytes()).collect();
        Self::new(Dtype::I64, shape, data)
    }
}

/// A typed value of a sample column or batch entry.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Value {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
    Bytes(Vec<u8>),
    List(Vec<Value>),
    Map(BTreeMap<String, Value>),
    Array(NdArray),
}

/// A single record read from shards: column name to value.
pub type Sample = BTreeMap<String, Value>;

/// A collated batch: column name to (usually list-valued) entries, plus
/// the `_lavender_data_*` metadata keys.
pub type Batch = BTreeMap<String, Value>;

impl Value {
    /// The null of a column type, used to fill missing feature values in
    /// left joins: NaN for floats, empty string/bytes, empty containers.
    pub fn null_for_type(type_: &str) -> Value {
        match type_ {
            "float" | "double" => Value::Float(f64::NAN),
            "string" | "text" | "str" => Value::String(String::new()),
            "bytes" | "binary" => Value::Bytes(Vec::new()),
            "list" => Value::List(Vec::new()),
            "map" => Value::Map(BTreeMap::new()),
            _ => Value::Null,
        }
    }

    pub fn as_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v),
            _ => None,
        }
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Value::Float(v) => Some(*v),
            Value::Int(v) => Some(*v as f64),
            _ => None,
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        match self {
            Value::String(v) => Some(v),
            _ => None,
        }
    }

    /// A stable textual key for uid lookups across shard formats.
    pub fn uid_key(&self) -> String {
        match self {
            Value::Int(v) => v.to_string(),
            Value::Float(v) => v.to_string(),
            Value::String(v) => v.clone(),
            Value::Bool(v) => v.to_string(),
            Value::Bytes(v) => format!("b:{}", v.len()),
            other => format!("{other:?}"),
        }
    }
}

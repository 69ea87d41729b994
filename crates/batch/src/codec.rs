//! Canonical binary encoding of batches. The format is a tagged tree:
//! every value is one type byte followed by a fixed-width or
//! length-prefixed payload, all integers little-endian. It is lossless
//! under round-trip and preserves array dtypes, which is what training
//! clients rely on when reassembling tensors.

use std::collections::BTreeMap;

use bytes::{Buf, BufMut};

use crate::{Batch, Dtype, NdArray, Value};

const VERSION: u8 = 1;

const TAG_NULL: u8 = 0x00;
const TAG_BOOL: u8 = 0x01;
const TAG_INT: u8 = 0x02;
const TAG_FLOAT: u8 = 0x03;
const TAG_STRING: u8 = 0x04;
const TAG_BYTES: u8 = 0x05;
const TAG_LIST: u8 = 0x06;
const TAG_MAP: u8 = 0x07;
const TAG_ARRAY: u8 = 0x08;

#[derive(Debug, thiserror::Error, PartialEq)]
pub enum DecodeError {
    #[error("unsupported format version {0}")]
    Version(u8),
    #[error("unknown value tag {0:#04x}")]
    Tag(u8),
    #[error("unknown array dtype code {0}")]
    DtypeCode(u8),
    #[error("truncated input: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("invalid utf-8 in string value")]
    Utf8,
    #[error("array data length mismatch: expected {expected}, got {actual}")]
    ArrayLength { expected: usize, actual: usize },
}

pub fn encode(batch: &Batch) -> Vec<u8> {
    let mut buf = Vec::with_capacity(256);
    buf.put_u8(VERSION);
    put_map(&mut buf, batch);
    buf
}

pub fn decode(mut input: &[u8]) -> Result<Batch, DecodeError> {
    let version = take_u8(&mut input)?;
    if version != VERSION {
        return Err(DecodeError::Version(version));
    }
    let batch = get_map(&mut input)?;
    Ok(batch)
}

fn put_value(buf: &mut Vec<u8>, value: &Value) {
    match value {
        Value::Null => buf.put_u8(TAG_NULL),
        Value::Bool(v) => {
            buf.put_u8(TAG_BOOL);
            buf.put_u8(*v as u8);
        }
        Value::Int(v) => {
            buf.put_u8(TAG_INT);
            buf.put_i64_le(*v);
        }
        Value::Float(v) => {
            buf.put_u8(TAG_FLOAT);
            buf.put_f64_le(*v);
        }
        Value::String(v) => {
            buf.put_u8(TAG_STRING);
            put_len(buf, v.len());
            buf.put_slice(v.as_bytes());
        }
        Value::Bytes(v) => {
            buf.put_u8(TAG_BYTES);
            put_len(buf, v.len());
            buf.put_slice(v);
        }
        Value::List(items) => {
            buf.put_u8(TAG_LIST);
            put_len(buf, items.len());
            for item in items {
                put_value(buf, item);
            }
        }
        Value::Map(map) => {
            buf.put_u8(TAG_MAP);
            put_map(buf, map);
        }
        Value::Array(array) => {
            buf.put_u8(TAG_ARRAY);
            buf.put_u8(array.dtype.code());
            put_len(buf, array.shape.len());
            for dim in &array.shape {
                put_len(buf, *dim);
            }
            put_len(buf, array.data.len());
            buf.put_slice(&array.data);
        }
    }
}

fn put_map(buf: &mut Vec<u8>, map: &BTreeMap<String, Value>) {
    put_len(buf, map.len());
    for (key, value) in map {
        put_len(buf, key.len());
        buf.put_slice(key.as_bytes());
        put_value(buf, value);
    }
}

fn put_len(buf: &mut Vec<u8>, len: usize) {
    buf.put_u32_le(len as u32);
}

fn take_u8(input: &mut &[u8]) -> Result<u8, DecodeError> {
    if input.remaining() < 1 {
        return Err(DecodeError::Truncated { needed: 1 });
    }
    Ok(input.get_u8())
}

fn take_len(input: &mut &[u8]) -> Result<usize, DecodeError> {
    if input.remaining() < 4 {
        return Err(DecodeError::Truncated {
            needed: 4 - input.remaining(),
        });
    }
    Ok(input.get_u32_le() as usize)
}

fn take_slice(input: &mut &[u8], len: usize) -> Result<Vec<u8>, DecodeError> {
    if input.remaining() < len {
        return Err(DecodeError::Truncated {
            needed: len - input.remaining(),
        });
    }
    let mut out = vec![0u8; len];
    input.copy_to_slice(&mut out);
    Ok(out)
}

fn get_value(input: &mut &[u8]) -> Result<Value, DecodeError> {
    match take_u8(input)? {
        TAG_NULL => Ok(Value::Null),
        TAG_BOOL => Ok(Value::Bool(take_u8(input)? != 0)),
        TAG_INT => {
            if input.remaining() < 8 {
                return Err(DecodeError::Truncated {
                    needed: 8 - input.remaining(),
                });
            }
            Ok(Value::Int(input.get_i64_le()))
        }
        TAG_FLOAT => {
            if input.remaining() < 8 {
                return Err(DecodeError::Truncated {
                    needed: 8 - input.remaining(),
                });
            }
            Ok(Value::Float(input.get_f64_le()))
        }
        TAG_STRING => {
            let len = take_len(input)?;
            let raw = take_slice(input, len)?;
            String::from_utf8(raw)
                .map(Value::String)
                .map_err(|_| DecodeError::Utf8)
        }
        TAG_BYTES => {
            let len = take_len(input)?;
            Ok(Value::Bytes(take_slice(input, len)?))
        }
        TAG_LIST => {
            let len = take_len(input)?;
            let mut items = Vec::with_capacity(len.min(1024));
            for _ in 0..len {
                items.push(get_value(input)?);
            }
            Ok(Value::List(items))
        }
        TAG_MAP => Ok(Value::Map(get_map(input)?)),
        TAG_ARRAY => {
            let code = take_u8(input)?;
            let dtype = Dtype::from_code(code).ok_or(DecodeError::DtypeCode(code))?;
            let ndim = take_len(input)?;
            let mut shape = Vec::with_capacity(ndim.min(16));
            for _ in 0..ndim {
                shape.push(take_len(input)?);
            }
            let len = take_len(input)?;
            let data = take_slice(input, len)?;
            Ok(Value::Array(NdArray::new(dtype, shape, data)?))
        }
        tag => Err(DecodeError::Tag(tag)),
    }
}

fn get_map(input: &mut &[u8]) -> Result<BTreeMap<String, Value>, DecodeError> {
    let len = take_len(input)?;
    let mut map = BTreeMap::new();
    for _ in 0..len {
        let key_len = take_len(input)?;
        let key_raw = take_slice(input, key_len)?;
        let key = String::from_utf8(key_raw).map_err(|_| DecodeError::Utf8)?;
        map.insert(key, get_value(input)?);
    }
    Ok(map)
}

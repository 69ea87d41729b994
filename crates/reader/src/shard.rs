use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;

use batch::{Sample, Value};
use models::ShardInfo;

use crate::{Error, Result};

/// A decoded shard file. Implementations hold the fully parsed records
/// in memory together with a uid index for feature-join lookups.
pub trait ShardReader: Send + Sync {
    fn columns(&self) -> &BTreeMap<String, String>;
    fn len(&self) -> usize;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    /// The record at an in-shard offset.
    fn sample_at(&self, offset: usize) -> Result<Sample>;
    /// The record whose uid column equals `uid`, if present.
    fn sample_by_uid(&self, uid: &Value) -> Result<Option<Sample>>;
}

/// Open the shard file at `path` with the reader for its format.
pub fn open_shard(
    info: &ShardInfo,
    path: &Path,
    uid_column_name: &str,
    uid_column_type: &str,
) -> Result<Arc<dyn ShardReader>> {
    let mut columns = info.columns.clone();
    columns
        .entry(uid_column_name.to_string())
        .or_insert_with(|| uid_column_type.to_string());

    match info.format.as_str() {
        "csv" => Ok(Arc::new(CsvShardReader::open(
            path,
            &info.location,
            columns,
            uid_column_name,
        )?)),
        other => Err(Error::UnsupportedFormat(other.to_string())),
    }
}

/// Resolve a raw CSV field into the typed value of its column.
fn resolve_type(raw: &str, type_: &str) -> Value {
    match type_ {
        "int" | "int32" | "int64" => match raw.trim().parse::<i64>() {
            Ok(v) => Value::Int(v),
            Err(_) => Value::Null,
        },
        "float" | "double" => match raw.trim().parse::<f64>() {
            Ok(v) => Value::Float(v),
            Err(_) => Value::Float(f64::NAN),
        },
        "bool" | "boolean" => Value::Bool(matches!(
            raw.trim().to_ascii_lowercase().as_str(),
            "true" | "t" | "yes" | "y" | "1"
        )),
        _ => Value::String(raw.to_string()),
    }
}

pub struct CsvShardReader {
    location: String,
    columns: BTreeMap<String, String>,
    samples: Vec<Sample>,
    by_uid: HashMap<String, usize>,
}

impl CsvShardReader {
    pub fn open(
        path: &Path,
        location: &str,
        columns: BTreeMap<String, String>,
        uid_column_name: &str,
    ) -> Result<Self> {
        let mut reader = csv::Reader::from_path(path).map_err(|err| Error::Decode {
            location: location.to_string(),
            reason: err.to_string(),
        })?;
        let headers = reader
            .headers()
            .map_err(|err| Error::Decode {
                location: location.to_string(),
                reason: err.to_string(),
            })?
            .clone();

        let mut samples = Vec::new();
        let mut by_uid = HashMap::new();
        for record in reader.records() {
            let record = record.map_err(|err| Error::Decode {
                location: location.to_string(),
                reason: err.to_string(),
            })?;
            let mut sample = Sample::new();
            for (header, raw) in headers.iter().zip(record.iter()) {
                let Some(type_) = columns.get(header) else {
                    continue;
                };
                sample.insert(header.to_string(), resolve_type(raw, type_));
            }
            if let Some(uid) = sample.get(uid_column_name) {
                by_uid.entry(uid.uid_key()).or_insert(samples.len());
            }
            samples.push(sample);
        }

        Ok(CsvShardReader {
            location: location.to_string(),
            columns,
            samples,
            by_uid,
        })
    }
}

impl ShardReader for CsvShardReader {
    fn columns(&self) -> &BTreeMap<String, String> {
        &self.columns
    }

    fn len(&self) -> usize {
        self.samples.len()
    }

    fn sample_at(&self, offset: usize) -> Result<Sample> {
        self.samples
            .get(offset)
            .cloned()
            .ok_or_else(|| Error::SampleOutOfRange {
                location: self.location.clone(),
                offset,
            })
    }

    fn sample_by_uid(&self, uid: &Value) -> Result<Option<Sample>> {
        Ok(self
            .by_uid
            .get(&uid.uid_key())
            .map(|&at| self.samples[at].clone()))
    }
}

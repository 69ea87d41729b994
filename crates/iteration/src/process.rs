use std::sync::Arc;

use batch::{Batch, NdArray, Sample, Value};
use models::{GlobalSampleIndex, JoinMethod, RegistryRef};
use reader::SampleReader;
use registry::{Params, Preprocessor, Registries};
use serde::{Deserialize, Serialize};

/// Everything needed to turn a reserved set of global sample indices
/// into a stored batch. Serializable so the head can hand it to a worker
/// node over the state-op RPC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessNextSamplesParams {
    /// Sequence number of this batch within its rank.
    pub current: usize,
    pub global_sample_indices: Vec<GlobalSampleIndex>,
    /// Pre-gathered samples; when present the read-and-filter step is
    /// skipped.
    #[serde(default)]
    pub samples: Option<Vec<Sample>>,
    #[serde(default)]
    pub filters: Vec<RegistryRef>,
    #[serde(default)]
    pub collater: Option<RegistryRef>,
    #[serde(default)]
    pub preprocessors: Vec<RegistryRef>,
    pub batch_size: usize,
    #[serde(default)]
    pub join_method: JoinMethod,
}

/// A sample-processing failure: user code or the gather step failed past
/// its retry budget. Carried through the batch cache as a tagged value
/// so a failed sequence stays failed for its TTL.
#[derive(Debug, Clone, Serialize, Deserialize, thiserror::Error)]
#[error("error processing samples (current: {current}, indices: {indices:?}): {message}")]
pub struct ProcessingError {
    pub message: String,
    pub stack: String,
    pub current: usize,
    pub indices: Vec<usize>,
}

impl ProcessingError {
    pub fn new(err: &anyhow::Error, current: usize, indices: Vec<usize>) -> Self {
        ProcessingError {
            message: err.to_string(),
            stack: format!("{err:?}"),
            current,
            indices,
        }
    }

    pub fn to_json(&self) -> String {
        serde_json::to_string(self).unwrap_or_else(|_| self.message.clone())
    }

    pub fn from_json(raw: &[u8]) -> Option<Self> {
        serde_json::from_slice(raw).ok()
    }
}

/// The gathered-and-collated form of a batch, before preprocessing.
pub struct GatherOutcome {
    pub batch: Batch,
    /// Indices that made it into the batch.
    pub kept: Vec<usize>,
    /// Indices rejected by the iteration's filters; the caller reports
    /// these to the iteration state.
    pub filtered: Vec<usize>,
}

#[derive(Debug, thiserror::Error)]
pub enum GatherError {
    #[error("no samples remained after joining and filtering")]
    NoSamplesFound,
    #[error(transparent)]
    Read(reader::Error),
    #[error(transparent)]
    Registry(#[from] registry::Error),
    #[error("filter '{name}' failed: {source}")]
    Filter {
        name: String,
        #[source]
        source: anyhow::Error,
    },
    #[error("collater failed: {0}")]
    Collate(#[source] anyhow::Error),
}

/// Gather: read each sample (inner-join misses are silently skipped),
/// apply the iteration's filters, collate into a batch, and attach the
/// `_lavender_data_*` metadata.
pub async fn gather_samples(
    reader: &SampleReader,
    registries: &Registries,
    params: &ProcessNextSamplesParams,
) -> Result<GatherOutcome, GatherError> {
    let mut kept: Vec<usize> = Vec::new();
    let mut filtered: Vec<usize> = Vec::new();

    let samples = match &params.samples {
        Some(samples) => {
            kept = params.global_sample_indices.iter().map(|i| i.index).collect();
            samples.clone()
        }
        None => {
            let mut samples = Vec::new();
            'indices: for index in &params.global_sample_indices {
                let sample = match reader.get_sample(index, params.join_method).await {
                    Ok(sample) => sample,
                    Err(reader::Error::InsufficientSample { .. }) => continue,
                    Err(err) => return Err(GatherError::Read(err)),
                };
                for reference in &params.filters {
                    let filter = registries.filters.get(&reference.name)?;
                    let keep = filter.filter(&sample, &reference.params).map_err(|source| {
                        GatherError::Filter {
                            name: reference.name.clone(),
                            source,
                        }
                    })?;
                    if !keep {
                        filtered.push(index.index);
                        continue 'indices;
                    }
                }
                kept.push(index.index);
                samples.push(sample);
            }
            samples
        }
    };

    if samples.is_empty() {
        return Err(GatherError::NoSamplesFound);
    }

    let (collater, collater_params) = registries.collater_for(params.collater.as_ref())?;
    let mut batch = collater
        .collate(samples, &collater_params)
        .map_err(GatherError::Collate)?;

    batch.insert(
        batch::INDICES_KEY.to_string(),
        Value::List(kept.iter().map(|&i| Value::Int(i as i64)).collect()),
    );
    batch.insert(
        batch::CURRENT_KEY.to_string(),
        Value::Int(params.current as i64),
    );

    Ok(GatherOutcome {
        batch,
        kept,
        filtered,
    })
}

/// Run one preprocessor layer. Preprocessors of a layer run concurrently
/// on clones of the batch and their outputs merge back in declaration
/// order.
pub fn apply_layer(
    batch: Batch,
    layer: &[(Arc<dyn Preprocessor>, Params)],
) -> anyhow::Result<Batch> {
    if let [(preprocessor, params)] = layer {
        return preprocessor
            .process(batch, params)
            .map_err(|err| anyhow::anyhow!("preprocessor '{}': {err}", preprocessor.name()));
    }

    let mut outputs: Vec<anyhow::Result<Batch>> = Vec::new();
    std::thread::scope(|scope| {
        let handles: Vec<_> = layer
            .iter()
            .map(|(preprocessor, params)| {
                let batch = batch.clone();
                scope.spawn(move || {
                    preprocessor.process(batch, params).map_err(|err| {
                        anyhow::anyhow!("preprocessor '{}': {err}", preprocessor.name())
                    })
                })
            })
            .collect();
        for handle in handles {
            outputs.push(match handle.join() {
                Ok(result) => result,
                Err(_) => Err(anyhow::anyhow!("preprocessor panicked")),
            });
        }
    });

    let mut merged = batch;
    for output in outputs {
        merged.extend(output?);
    }
    Ok(merged)
}

/// Convert single-element containers back into scalars, recursively.
/// Applied when `batch_size == 0`: the client asked for samples, not
/// stacked batches.
pub fn decollate(batch: Batch) -> Batch {
    batch
        .into_iter()
        .map(|(key, value)| (key, decollate_value(value)))
        .collect()
}

fn decollate_value(value: Value) -> Value {
    match value {
        Value::List(mut items) if items.len() == 1 => items.remove(0),
        Value::Map(map) => Value::Map(
            map.into_iter()
                .map(|(key, value)| (key, decollate_value(value)))
                .collect(),
        ),
        Value::Array(array) if array.shape.iter().product::<usize>() == 1 => {
            scalar_from_array(&array)
        }
        other => other,
    }
}

fn scalar_from_array(array: &NdArray) -> Value {
    let data = &array.data;
    match array.dtype {
        batch::Dtype::I8 => Value::Int(data[0] as i8 as i64),
        batch::Dtype::U8 => Value::Int(data[0] as i64),
        batch::Dtype::I16 => Value::Int(i16::from_le_bytes([data[0], data[1]]) as i64),
        batch::Dtype::U16 => Value::Int(u16::from_le_bytes([data[0], data[1]]) as i64),
        batch::Dtype::I32 => {
            Value::Int(i32::from_le_bytes(data[..4].try_into().unwrap()) as i64)
        }
        batch::Dtype::U32 => {
            Value::Int(u32::from_le_bytes(data[..4].try_into().unwrap()) as i64)
        }
        batch::Dtype::I64 => Value::Int(i64::from_le_bytes(data[..8].try_into().unwrap())),
        batch::Dtype::U64 => {
            Value::Int(u64::from_le_bytes(data[..8].try_into().unwrap()) as i64)
        }
        batch::Dtype::F32 => {
            Value::Float(f32::from_le_bytes(data[..4].try_into().unwrap()) as f64)
        }
        batch::Dtype::F64 => Value::Float(f64::from_le_bytes(data[..8].try_into().unwrap())),
    }
}

/// The full processing pipeline, run synchronously: gather, preprocess
/// layer by layer, decollate. Transient failures retry up to
/// `max_retry_count` additional attempts; exhaustion yields a
/// `ProcessingError`. Returns the batch and the filter-rejected indices.
pub async fn process_next_samples(
    reader: &SampleReader,
    registries: &Registries,
    params: &ProcessNextSamplesParams,
    max_retry_count: usize,
) -> Result<(Batch, Vec<usize>), ProcessingError> {
    let indices: Vec<usize> = params.global_sample_indices.iter().map(|i| i.index).collect();

    let mut attempt = 0usize;
    loop {
        match process_once(reader, registries, params).await {
            Ok(outcome) => return Ok(outcome),
            // An empty gather is not retried: re-reading the same
            // indices cannot produce more samples.
            Err(err)
                if matches!(
                    err.downcast_ref::<GatherError>(),
                    Some(GatherError::NoSamplesFound)
                ) =>
            {
                return Err(ProcessingError::new(&err, params.current, indices));
            }
            Err(err) if attempt < max_retry_count => {
                attempt += 1;
                tracing::warn!(
                    current = params.current,
                    %err,
                    "sample processing failed, retrying ({attempt}/{max_retry_count})"
                );
            }
            Err(err) => {
                tracing::error!(current = params.current, %err, "sample processing failed");
                return Err(ProcessingError::new(&err, params.current, indices));
            }
        }
    }
}

async fn process_once(
    reader: &SampleReader,
    registries: &Registries,
    params: &ProcessNextSamplesParams,
) -> anyhow::Result<(Batch, Vec<usize>)> {
    let outcome = gather_samples(reader, registries, params).await?;
    let mut batch = outcome.batch;

    let layers = registry::plan_layers(&params.preprocessors, &registries.preprocessors)?;
    for layer in &layers {
        batch = apply_layer(batch, layer)?;
    }

    if params.batch_size == 0 {
        batch = decollate(batch);
    }
    Ok((batch, outcome.filtered))
}

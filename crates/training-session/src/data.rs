use std::collections::HashMap;

use serde::Deserialize;

use crate::{device::Device, SessionError};

/// Opaque collaborator state carried inside checkpoint records. The blob
/// format belongs to the collaborator; the session only stores and returns
/// it whole.
pub type StateBlob = serde_json::Value;

/// One named stream of a minibatch: a flat value vector plus the number of
/// samples it spans.
#[derive(Debug, Clone, PartialEq)]
pub struct StreamBatch {
    pub data: Vec<f32>,
    pub num_samples: usize,
}

/// Minibatch keyed by stream name as produced by a source, or by
/// model-input name after remapping.
pub type MinibatchData = HashMap<String, StreamBatch>;

/// Number of samples a minibatch spans; the widest stream wins.
pub fn sample_count(minibatch: &MinibatchData) -> usize {
    minibatch
        .values()
        .map(|stream| stream.num_samples)
        .max()
        .unwrap_or(0)
}

/// Producer of training or validation minibatches.
pub trait MinibatchSource {
    /// Pull up to `batch_size` samples restricted to this worker's shard.
    /// An empty map signals exhaustion, not an error.
    fn next_minibatch(
        &mut self,
        batch_size: usize,
        num_workers: usize,
        worker_rank: usize,
        device: Device,
    ) -> Result<MinibatchData, SessionError>;

    /// Opaque position state stored inside checkpoints.
    fn checkpoint_state(&self) -> StateBlob;

    fn restore_from_state(&mut self, state: &StateBlob) -> Result<(), SessionError>;
}

/// Batch size as a function of the cumulative sample count.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum MinibatchSchedule {
    Constant(usize),
    Piecewise(Vec<ScheduleSegment>),
}

/// One piecewise segment: `size` applies from `start_at` samples onward,
/// until a later segment takes over.
#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleSegment {
    pub start_at: u64,
    pub size: usize,
}

impl MinibatchSchedule {
    pub fn size_at(&self, samples_seen: u64) -> usize {
        match self {
            MinibatchSchedule::Constant(size) => *size,
            MinibatchSchedule::Piecewise(segments) => segments
                .iter()
                .rev()
                .find(|segment| segment.start_at <= samples_seen)
                .map(|segment| segment.size)
                .unwrap_or(0),
        }
    }

    pub(crate) fn collect_validation_errors(&self, label: &str, errors: &mut Vec<String>) {
        match self {
            MinibatchSchedule::Constant(0) => {
                errors.push(format!("{} must schedule a batch size greater than 0", label));
            }
            MinibatchSchedule::Constant(_) => {}
            MinibatchSchedule::Piecewise(segments) => {
                if segments.is_empty() {
                    errors.push(format!("{} must contain at least one segment", label));
                }
                if segments.iter().any(|segment| segment.size == 0) {
                    errors.push(format!("{} segments must have a size greater than 0", label));
                }
                if segments.windows(2).any(|w| w[0].start_at >= w[1].start_at) {
                    errors.push(format!(
                        "{} segments must be sorted by strictly increasing start_at",
                        label
                    ));
                }
                if segments.first().map(|segment| segment.start_at) != Some(0) {
                    errors.push(format!("{} must start its first segment at sample 0", label));
                }
            }
        }
    }
}

/// Fetch one minibatch and remap the source's named outputs onto the
/// model's named inputs. A zero batch size returns an empty batch without
/// touching the source. Source outputs absent from the mapping are
/// dropped; a mapped stream missing from the source's outputs is an error.
pub(crate) fn fetch_minibatch(
    source: &mut dyn MinibatchSource,
    bindings: &HashMap<String, String>,
    batch_size: usize,
    num_workers: usize,
    worker_rank: usize,
    device: Device,
) -> Result<MinibatchData, SessionError> {
    if batch_size == 0 {
        return Ok(MinibatchData::new());
    }

    let produced = source.next_minibatch(batch_size, num_workers, worker_rank, device)?;
    if produced.is_empty() {
        return Ok(produced);
    }

    let mut minibatch = MinibatchData::with_capacity(bindings.len());
    for (input, stream) in bindings {
        let batch = produced.get(stream).cloned().ok_or_else(|| {
            SessionError::runtime(format!(
                "source produced no stream '{}' required by input '{}'",
                stream, input
            ))
        })?;
        minibatch.insert(input.clone(), batch);
    }
    Ok(minibatch)
}

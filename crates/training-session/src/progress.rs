use std::{
    fs::{self, File},
    io::{BufWriter, Write},
    path::Path,
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;

use crate::{metrics::CrossValidationSummary, SessionError};

/// Training-progress sample handed to sinks at each progress firing.
#[derive(Debug, Clone)]
pub struct ProgressRecord {
    pub index: u64,
    pub total_samples: u64,
    pub samples_per_sec: f64,
    pub average_samples_per_sec: f64,
}

/// Sink for periodic progress and cross-validation summaries.
pub trait ProgressWriter {
    fn write_training_progress(&mut self, record: &ProgressRecord);

    fn write_cross_validation(&mut self, summary: &CrossValidationSummary);

    fn flush(&mut self) {}
}

/// Plain stdout sink.
pub struct StdoutProgressWriter;

impl ProgressWriter for StdoutProgressWriter {
    fn write_training_progress(&mut self, record: &ProgressRecord) {
        println!(
            "train period={} samples={} samples/s={:.1} avg samples/s={:.1}",
            record.index,
            record.total_samples,
            record.samples_per_sec,
            record.average_samples_per_sec
        );
    }

    fn write_cross_validation(&mut self, summary: &CrossValidationSummary) {
        println!(
            "validate period={} error={:.6} samples={} minibatches={}",
            summary.index, summary.average_error, summary.samples, summary.minibatches
        );
    }
}

/// TensorBoard event-file sink. Writes length-delimited, CRC-framed
/// prost-encoded Event records the way the tfevents format expects.
pub struct TensorBoardProgressWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardProgressWriter {
    pub fn create(dir: &Path, flush_every: usize) -> Result<Self, SessionError> {
        fs::create_dir_all(dir).map_err(|err| {
            SessionError::runtime(format!(
                "failed to create tensorboard directory {}: {err}",
                dir.display()
            ))
        })?;
        let filename = format!(
            "events.out.tfevents.{}.{}",
            current_unix_timestamp(),
            hostname()
        );
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            SessionError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), SessionError> {
        let summary = Summary {
            value: vec![summary::Value {
                tag: tag.to_string(),
                simple_value: Some(value as f32),
            }],
        };
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(summary),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), SessionError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            SessionError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let data = buffer.freeze();
        let len = data.len() as u64;

        let mut len_bytes = [0u8; 8];
        len_bytes.copy_from_slice(&len.to_le_bytes());
        let len_crc = masked_crc32(&len_bytes);
        let data_crc = masked_crc32(data.as_ref());

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc.to_le_bytes()))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc.to_le_bytes()))
            .map_err(|err| {
                SessionError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush_inner()?;
        }
        Ok(())
    }

    fn flush_inner(&mut self) -> Result<(), SessionError> {
        self.writer.flush().map_err(|err| {
            SessionError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl ProgressWriter for TensorBoardProgressWriter {
    fn write_training_progress(&mut self, record: &ProgressRecord) {
        let step = record.total_samples as i64;
        let _ = self.write_scalar("train/samples_per_sec", step, record.samples_per_sec);
        let _ = self.write_scalar(
            "train/samples_per_sec_avg",
            step,
            record.average_samples_per_sec,
        );
    }

    fn write_cross_validation(&mut self, summary: &CrossValidationSummary) {
        let step = summary.index as i64;
        let _ = self.write_scalar("validate/average_error", step, summary.average_error);
        let _ = self.write_scalar("validate/samples", step, summary.samples as f64);
    }

    fn flush(&mut self) {
        let _ = self.flush_inner();
    }
}

impl Drop for TensorBoardProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush_inner();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "3")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "7")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

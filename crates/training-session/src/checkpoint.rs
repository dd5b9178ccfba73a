use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::SessionError;

pub const CHECKPOINT_VERSION: u32 = 1;

/// Auxiliary-state key under which the training source's position lives.
pub const TRAINING_SOURCE_STATE_KEY: &str = "training-minibatch-source";

const MARKER_EXTENSION: &str = "marker";

/// Everything needed to resume a run: the optimizer's opaque state plus an
/// auxiliary map of collaborator sub-state keyed by logical name. A record
/// is only ever read or written as a whole.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CheckpointRecord {
    pub version: u32,
    pub optimizer: Value,
    pub external: BTreeMap<String, Value>,
}

/// Companion file written after the record; its presence marks the record
/// complete, its digest guards against torn writes.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct CheckpointMarker {
    sha256: String,
    bytes: u64,
}

/// Owns the on-disk naming scheme: a bare `base` file when checkpoints are
/// overwritten in place, or a rotated `base<index>` family when all
/// checkpoints are preserved.
#[derive(Debug)]
pub(crate) struct CheckpointCoordinator {
    file_name: PathBuf,
    preserve_all: bool,
}

impl CheckpointCoordinator {
    pub fn new(file_name: PathBuf, preserve_all: bool) -> Result<Self, SessionError> {
        if let Some(parent) = file_name.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent).map_err(|err| {
                    SessionError::runtime(format!(
                        "failed to create checkpoint directory {}: {err}",
                        parent.display()
                    ))
                })?;
            }
        }
        Ok(Self {
            file_name,
            preserve_all,
        })
    }

    pub fn base_path(&self) -> &Path {
        &self.file_name
    }

    pub fn save(&self, index: u64, record: &CheckpointRecord) -> Result<PathBuf, SessionError> {
        let path = if self.preserve_all {
            rotated_path(&self.file_name, index)
        } else {
            self.file_name.clone()
        };
        write_record(&path, record)?;
        Ok(path)
    }

    /// Write one more record at the bare base name, regardless of
    /// rotation.
    pub fn save_final(&self, record: &CheckpointRecord) -> Result<PathBuf, SessionError> {
        write_record(&self.file_name, record)?;
        Ok(self.file_name.clone())
    }

    pub fn latest(&self) -> Result<Option<PathBuf>, SessionError> {
        latest_checkpoint(&self.file_name)
    }
}

pub fn marker_path(record_path: &Path) -> PathBuf {
    let mut name = record_path.as_os_str().to_os_string();
    name.push(".");
    name.push(MARKER_EXTENSION);
    PathBuf::from(name)
}

fn rotated_path(base: &Path, index: u64) -> PathBuf {
    let mut name = base.as_os_str().to_os_string();
    name.push(index.to_string());
    PathBuf::from(name)
}

pub fn write_record(path: &Path, record: &CheckpointRecord) -> Result<(), SessionError> {
    let payload = serde_json::to_vec_pretty(record).map_err(|err| {
        SessionError::checkpoint(format!("failed to serialize checkpoint record: {err}"))
    })?;
    fs::write(path, &payload).map_err(|err| {
        SessionError::runtime(format!("failed to write checkpoint {}: {err}", path.display()))
    })?;

    let marker = CheckpointMarker {
        sha256: hex::encode(Sha256::digest(&payload)),
        bytes: payload.len() as u64,
    };
    let marker_payload = serde_json::to_vec(&marker).map_err(|err| {
        SessionError::checkpoint(format!("failed to serialize checkpoint marker: {err}"))
    })?;
    let marker_file = marker_path(path);
    fs::write(&marker_file, marker_payload).map_err(|err| {
        SessionError::runtime(format!(
            "failed to write checkpoint marker {}: {err}",
            marker_file.display()
        ))
    })
}

pub fn read_record(path: &Path) -> Result<CheckpointRecord, SessionError> {
    let payload = fs::read(path).map_err(|err| {
        SessionError::runtime(format!("failed to read checkpoint {}: {err}", path.display()))
    })?;

    let marker_file = marker_path(path);
    if marker_file.is_file() {
        let marker_payload = fs::read(&marker_file).map_err(|err| {
            SessionError::runtime(format!(
                "failed to read checkpoint marker {}: {err}",
                marker_file.display()
            ))
        })?;
        let marker: CheckpointMarker = serde_json::from_slice(&marker_payload).map_err(|err| {
            SessionError::checkpoint(format!(
                "failed to parse checkpoint marker {}: {err}",
                marker_file.display()
            ))
        })?;
        if marker.sha256 != hex::encode(Sha256::digest(&payload)) {
            return Err(SessionError::checkpoint(format!(
                "checkpoint {} failed checksum validation",
                path.display()
            )));
        }
    }

    let record: CheckpointRecord = serde_json::from_slice(&payload).map_err(|err| {
        SessionError::checkpoint(format!(
            "failed to parse checkpoint {}: {err}",
            path.display()
        ))
    })?;
    if record.version != CHECKPOINT_VERSION {
        return Err(SessionError::checkpoint(format!(
            "unsupported checkpoint version {} (expected {})",
            record.version, CHECKPOINT_VERSION
        )));
    }
    Ok(record)
}

/// Resolve the newest restorable checkpoint for `base`: the rotated file
/// with the greatest purely-numeric suffix whose marker exists, falling
/// back to the bare base name. Candidates with malformed suffixes or
/// missing markers are skipped, never fatal. `None` means a first run with
/// nothing to restore.
pub fn latest_checkpoint(base: &Path) -> Result<Option<PathBuf>, SessionError> {
    let file_name = match base.file_name().and_then(|name| name.to_str()) {
        Some(name) => name,
        None => return Ok(None),
    };
    let parent = match base.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent.to_path_buf(),
        _ => PathBuf::from("."),
    };

    let mut best: Option<(u64, PathBuf)> = None;
    if parent.is_dir() {
        let entries = fs::read_dir(&parent).map_err(|err| {
            SessionError::runtime(format!(
                "failed to scan checkpoint directory {}: {err}",
                parent.display()
            ))
        })?;
        for entry in entries {
            let entry = entry.map_err(|err| {
                SessionError::runtime(format!("failed to read checkpoint directory entry: {err}"))
            })?;
            let name = entry.file_name();
            let Some(name) = name.to_str() else {
                continue;
            };
            let Some(suffix) = name.strip_prefix(file_name) else {
                continue;
            };
            if suffix.is_empty() || !suffix.bytes().all(|byte| byte.is_ascii_digit()) {
                continue;
            }
            let Ok(value) = suffix.parse::<u64>() else {
                continue;
            };
            let candidate = entry.path();
            if !candidate.is_file() || !marker_path(&candidate).is_file() {
                continue;
            }
            if best.as_ref().map_or(true, |(max, _)| value > *max) {
                best = Some((value, candidate));
            }
        }
    }

    if let Some((_, path)) = best {
        return Ok(Some(path));
    }
    if base.is_file() {
        return Ok(Some(base.to_path_buf()));
    }
    Ok(None)
}

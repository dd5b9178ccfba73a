use std::{
    collections::HashMap,
    fmt, fs,
    path::{Path, PathBuf},
};

use serde::Deserialize;

use crate::{
    data::{MinibatchSchedule, MinibatchSource},
    progress::ProgressWriter,
};

/// Immutable-after-build session configuration: the training source, the
/// batch-size schedule, the model-input to source-stream bindings, the
/// sample budget, and up to one instance of each optional feature group.
pub struct SessionConfig {
    pub(crate) source: Box<dyn MinibatchSource>,
    pub(crate) schedule: MinibatchSchedule,
    pub(crate) bindings: HashMap<String, String>,
    pub(crate) max_training_samples: u64,
    pub(crate) checkpoint: Option<CheckpointSettings>,
    pub(crate) cross_validation: Option<CrossValidationSettings>,
    pub(crate) progress: Option<ProgressSettings>,
    with_checkpointing: bool,
    with_cross_validation: bool,
    with_progress: bool,
}

#[derive(Debug, Clone)]
pub struct CheckpointSettings {
    pub file_name: PathBuf,
    /// Checkpoint every this many samples. Zero registers no periodic
    /// action; `u64::MAX` means a single checkpoint at the end.
    pub frequency_in_samples: u64,
    /// Restore from the latest matching checkpoint before training.
    pub restore: bool,
    /// Keep every rotated checkpoint instead of overwriting in place.
    pub preserve_all: bool,
}

pub(crate) struct CrossValidationSettings {
    pub(crate) source: Option<Box<dyn MinibatchSource>>,
    pub(crate) schedule: MinibatchSchedule,
    pub(crate) frequency_in_samples: u64,
}

pub(crate) struct ProgressSettings {
    pub(crate) writers: Vec<Box<dyn ProgressWriter>>,
    pub(crate) frequency_in_samples: u64,
}

impl SessionConfig {
    pub fn new(
        source: Box<dyn MinibatchSource>,
        schedule: MinibatchSchedule,
        bindings: HashMap<String, String>,
        max_training_samples: u64,
    ) -> Result<Self, SessionError> {
        let mut errors = Vec::new();
        if max_training_samples == 0 {
            errors.push("max_training_samples must be greater than 0".to_string());
        }
        if bindings.is_empty() {
            errors.push("input-to-stream bindings must not be empty".to_string());
        }
        schedule.collect_validation_errors("minibatch schedule", &mut errors);
        if !errors.is_empty() {
            return Err(SessionError::Configuration(errors));
        }

        Ok(Self {
            source,
            schedule,
            bindings,
            max_training_samples,
            checkpoint: None,
            cross_validation: None,
            progress: None,
            with_checkpointing: false,
            with_cross_validation: false,
            with_progress: false,
        })
    }

    /// Configure checkpointing. May be called at most once. An empty file
    /// name is only accepted alongside a zero frequency and disables the
    /// group entirely.
    pub fn checkpointing(mut self, settings: CheckpointSettings) -> Result<Self, SessionError> {
        if self.with_checkpointing {
            return Err(SessionError::configuration(
                "checkpointing has already been configured",
            ));
        }
        self.with_checkpointing = true;

        if settings.file_name.as_os_str().is_empty() {
            if settings.frequency_in_samples != 0 && settings.frequency_in_samples != u64::MAX {
                return Err(SessionError::configuration(
                    "checkpoint file name must not be empty when a checkpoint frequency is set",
                ));
            }
            if settings.preserve_all {
                return Err(SessionError::configuration(
                    "checkpoint file name must not be empty when preserving all checkpoints",
                ));
            }
            return Ok(self);
        }

        self.checkpoint = Some(settings);
        Ok(self)
    }

    /// Configure cross-validation. May be called at most once. Without a
    /// source the scheduled action still fires and reports a zero summary,
    /// so hooks tied to its cadence keep running.
    pub fn cross_validation(
        mut self,
        source: Option<Box<dyn MinibatchSource>>,
        schedule: MinibatchSchedule,
        frequency_in_samples: u64,
    ) -> Result<Self, SessionError> {
        if self.with_cross_validation {
            return Err(SessionError::configuration(
                "cross-validation has already been configured",
            ));
        }
        self.with_cross_validation = true;

        let mut errors = Vec::new();
        schedule.collect_validation_errors("cross-validation schedule", &mut errors);
        if !errors.is_empty() {
            return Err(SessionError::Configuration(errors));
        }

        self.cross_validation = Some(CrossValidationSettings {
            source,
            schedule,
            frequency_in_samples,
        });
        Ok(self)
    }

    /// Configure progress reporting. May be called at most once.
    pub fn progress(
        mut self,
        writers: Vec<Box<dyn ProgressWriter>>,
        frequency_in_samples: u64,
    ) -> Result<Self, SessionError> {
        if self.with_progress {
            return Err(SessionError::configuration(
                "progress reporting has already been configured",
            ));
        }
        self.with_progress = true;

        self.progress = Some(ProgressSettings {
            writers,
            frequency_in_samples,
        });
        Ok(self)
    }

    pub fn max_training_samples(&self) -> u64 {
        self.max_training_samples
    }
}

/// File-loadable session options for driver binaries: everything a
/// `SessionConfig` needs except the collaborator handles themselves.
#[derive(Debug, Clone, Deserialize)]
pub struct SessionOptions {
    pub max_training_samples: u64,
    #[serde(default = "default_schedule")]
    pub minibatch_size: MinibatchSchedule,
    #[serde(default)]
    pub checkpoint: Option<CheckpointOptions>,
    #[serde(default)]
    pub cross_validation: Option<CrossValidationOptions>,
    #[serde(default)]
    pub progress: Option<ProgressOptions>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CheckpointOptions {
    pub file_name: PathBuf,
    #[serde(default = "default_checkpoint_frequency")]
    pub frequency_in_samples: u64,
    #[serde(default = "default_true")]
    pub restore: bool,
    #[serde(default)]
    pub preserve_all: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CrossValidationOptions {
    pub frequency_in_samples: u64,
    #[serde(default = "default_schedule")]
    pub minibatch_size: MinibatchSchedule,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ProgressOptions {
    pub frequency_in_samples: u64,
    #[serde(default = "default_true")]
    pub stdout: bool,
    #[serde(default)]
    pub tensorboard_dir: Option<PathBuf>,
}

impl SessionOptions {
    pub fn from_path(path: impl AsRef<Path>) -> Result<Self, SessionError> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)?;
        let mut options: SessionOptions = match path.extension().and_then(|ext| ext.to_str()) {
            Some("json") => serde_json::from_str(&contents)?,
            Some("toml") | Some("tml") | None => toml::from_str(&contents)?,
            Some(other) => {
                return Err(SessionError::ConfigFormat(format!(
                    "unsupported configuration extension '{}'",
                    other
                )));
            }
        };

        let base_dir = path.parent().unwrap_or_else(|| Path::new("."));
        options.apply_base_path(base_dir);
        options.validate()?;

        Ok(options)
    }

    pub fn validate(&self) -> Result<(), SessionError> {
        let mut errors = Vec::new();

        if self.max_training_samples == 0 {
            errors.push("max_training_samples must be greater than 0".to_string());
        }
        self.minibatch_size
            .collect_validation_errors("minibatch_size", &mut errors);

        if let Some(checkpoint) = &self.checkpoint {
            if checkpoint.file_name.as_os_str().is_empty() {
                errors.push("checkpoint.file_name must not be empty".to_string());
            }
        }

        if let Some(validation) = &self.cross_validation {
            if validation.frequency_in_samples == 0 {
                errors.push(
                    "cross_validation.frequency_in_samples must be greater than 0".to_string(),
                );
            }
            validation
                .minibatch_size
                .collect_validation_errors("cross_validation.minibatch_size", &mut errors);
        }

        if let Some(progress) = &self.progress {
            if progress.frequency_in_samples == 0 {
                errors.push("progress.frequency_in_samples must be greater than 0".to_string());
            }
        }

        if !errors.is_empty() {
            return Err(SessionError::Configuration(errors));
        }
        Ok(())
    }

    fn apply_base_path(&mut self, base: &Path) {
        if let Some(checkpoint) = self.checkpoint.as_mut() {
            absolutize_in_place(&mut checkpoint.file_name, base);
        }
        if let Some(progress) = self.progress.as_mut() {
            if let Some(dir) = progress.tensorboard_dir.as_mut() {
                absolutize_in_place(dir, base);
            }
        }
    }
}

fn absolutize_in_place(path: &mut PathBuf, base: &Path) {
    if path.is_relative() {
        *path = base.join(&*path);
    }
}

fn default_schedule() -> MinibatchSchedule {
    MinibatchSchedule::Constant(32)
}

fn default_checkpoint_frequency() -> u64 {
    u64::MAX
}

fn default_true() -> bool {
    true
}

#[derive(Debug)]
pub enum SessionError {
    Io(std::io::Error),
    ConfigFormat(String),
    Configuration(Vec<String>),
    Checkpoint(String),
    Runtime(String),
}

impl SessionError {
    pub fn configuration(message: impl Into<String>) -> Self {
        Self::Configuration(vec![message.into()])
    }

    pub fn checkpoint(message: impl Into<String>) -> Self {
        Self::Checkpoint(message.into())
    }

    pub fn runtime(message: impl Into<String>) -> Self {
        Self::Runtime(message.into())
    }
}

impl fmt::Display for SessionError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SessionError::Io(err) => write!(f, "failed to read config: {}", err),
            SessionError::ConfigFormat(err) => write!(f, "failed to parse config: {}", err),
            SessionError::Configuration(messages) => {
                write!(f, "invalid configuration: {}", messages.join("; "))
            }
            SessionError::Checkpoint(msg) => write!(f, "checkpoint failed: {}", msg),
            SessionError::Runtime(msg) => write!(f, "training session failed: {}", msg),
        }
    }
}

impl std::error::Error for SessionError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            SessionError::Io(err) => Some(err),
            SessionError::ConfigFormat(_)
            | SessionError::Configuration(_)
            | SessionError::Checkpoint(_)
            | SessionError::Runtime(_) => None,
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(value: std::io::Error) -> Self {
        SessionError::Io(value)
    }
}

impl From<toml::de::Error> for SessionError {
    fn from(value: toml::de::Error) -> Self {
        SessionError::ConfigFormat(value.to_string())
    }
}

impl From<serde_json::Error> for SessionError {
    fn from(value: serde_json::Error) -> Self {
        SessionError::ConfigFormat(value.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn options_load_from_toml_and_absolutize_paths() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("session.toml");
        fs::write(
            &path,
            r#"
max_training_samples = 1000
minibatch_size = 32

[checkpoint]
file_name = "checkpoints/ckpt"
frequency_in_samples = 100
preserve_all = true

[cross_validation]
frequency_in_samples = 200

[progress]
frequency_in_samples = 50
stdout = false
"#,
        )
        .expect("write");

        let options = SessionOptions::from_path(&path).expect("options");

        assert_eq!(options.max_training_samples, 1000);
        assert_eq!(options.minibatch_size.size_at(0), 32);

        let checkpoint = options.checkpoint.expect("checkpoint options");
        assert_eq!(
            checkpoint.file_name,
            dir.path().join("checkpoints").join("ckpt")
        );
        assert_eq!(checkpoint.frequency_in_samples, 100);
        assert!(checkpoint.restore);
        assert!(checkpoint.preserve_all);

        assert_eq!(
            options
                .cross_validation
                .expect("cv options")
                .frequency_in_samples,
            200
        );
        assert!(!options.progress.expect("progress options").stdout);
    }

    #[test]
    fn options_load_a_piecewise_schedule() {
        let dir = tempdir().expect("tempdir");
        let path = dir.path().join("session.toml");
        fs::write(
            &path,
            r#"
max_training_samples = 1000
minibatch_size = [
    { start_at = 0, size = 8 },
    { start_at = 500, size = 32 },
]
"#,
        )
        .expect("write");

        let options = SessionOptions::from_path(&path).expect("options");
        assert_eq!(options.minibatch_size.size_at(0), 8);
        assert_eq!(options.minibatch_size.size_at(500), 32);
    }

    #[test]
    fn validation_collects_every_problem_at_once() {
        let options = SessionOptions {
            max_training_samples: 0,
            minibatch_size: MinibatchSchedule::Constant(0),
            checkpoint: Some(CheckpointOptions {
                file_name: PathBuf::new(),
                frequency_in_samples: 10,
                restore: true,
                preserve_all: false,
            }),
            cross_validation: Some(CrossValidationOptions {
                frequency_in_samples: 0,
                minibatch_size: MinibatchSchedule::Constant(16),
            }),
            progress: Some(ProgressOptions {
                frequency_in_samples: 0,
                stdout: true,
                tensorboard_dir: None,
            }),
        };

        match options.validate() {
            Err(SessionError::Configuration(messages)) => assert_eq!(messages.len(), 5),
            other => panic!("expected configuration error, got {:?}", other.err()),
        }
    }
}

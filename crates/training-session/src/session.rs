use std::{
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
};

use crate::{
    actions::{ActionKind, ActionSchedule},
    checkpoint::{
        self, CheckpointCoordinator, CheckpointRecord, CHECKPOINT_VERSION,
        TRAINING_SOURCE_STATE_KEY,
    },
    config::{CheckpointSettings, SessionConfig},
    data::{self, MinibatchData, MinibatchSchedule, MinibatchSource, StateBlob},
    device::Device,
    distributed::{Learner, WorkerTopology},
    metrics::{CrossValidationAccumulator, CrossValidationSummary, ThroughputMeter},
    progress::{ProgressRecord, ProgressWriter},
    SessionError,
};

/// The optimizer collaborating with a session. It owns the numerical
/// update, the cumulative sample count, and its own checkpoint state; the
/// session never looks inside any of them.
pub trait Optimizer {
    /// Run one optimization step. Returns whether training should
    /// continue (`false` is the optimizer's own convergence signal).
    fn train_minibatch(
        &mut self,
        minibatch: &MinibatchData,
        device: Device,
    ) -> Result<bool, SessionError>;

    /// Evaluate one held-out minibatch and return its error.
    fn test_minibatch(
        &mut self,
        minibatch: &MinibatchData,
        device: Device,
        num_samples: usize,
    ) -> Result<f64, SessionError>;

    fn total_samples_seen(&self) -> u64;

    fn checkpoint_state(&self) -> StateBlob;

    fn restore_from_state(&mut self, state: &StateBlob) -> Result<(), SessionError>;

    fn summarize_training_progress(&mut self) {}

    fn summarize_test_progress(&mut self) {}

    fn learners(&self) -> &[Box<dyn Learner>] {
        &[]
    }
}

/// Lifecycle hooks fired at defined points of the loop. Every method has a
/// no-op default; override what you need.
pub trait SessionHooks {
    fn on_minibatch_start(&mut self) {}

    fn on_minibatch_end(&mut self) {}

    fn on_checkpoint_start(&mut self, index: u64) {
        let _ = index;
    }

    /// Fired after a checkpoint record lands on disk. External
    /// collaborators (profilers, upload hooks) subscribe here.
    fn on_checkpoint_saved(&mut self, index: u64, path: &Path) {
        let _ = (index, path);
    }

    /// Return `false` to request a graceful stop.
    fn on_cross_validation_end(&mut self, summary: &CrossValidationSummary) -> bool {
        let _ = summary;
        true
    }
}

struct NoopHooks;

impl SessionHooks for NoopHooks {}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    NotStarted,
    Running,
    Finished,
}

/// Orchestrates one training run: drives the optimizer over scheduled
/// minibatches and fires checkpoint, cross-validation, and progress
/// actions at sample-count boundaries without derailing the loop.
pub struct TrainingSession {
    optimizer: Box<dyn Optimizer>,
    config: SessionConfig,
    topology: WorkerTopology,
    actions: ActionSchedule,
    coordinator: Option<CheckpointCoordinator>,
    hooks: Box<dyn SessionHooks>,
    throughput: ThroughputMeter,
    state: SessionState,
}

impl TrainingSession {
    pub fn new(optimizer: Box<dyn Optimizer>, config: SessionConfig) -> Result<Self, SessionError> {
        let topology = WorkerTopology::from_learners(optimizer.learners());

        let mut actions = ActionSchedule::default();
        let coordinator = match &config.checkpoint {
            Some(settings) => {
                actions.register(settings.frequency_in_samples, ActionKind::Checkpoint);
                Some(CheckpointCoordinator::new(
                    settings.file_name.clone(),
                    settings.preserve_all,
                )?)
            }
            None => None,
        };
        if let Some(validation) = &config.cross_validation {
            actions.register(validation.frequency_in_samples, ActionKind::CrossValidate);
        }
        if let Some(progress) = &config.progress {
            actions.register(progress.frequency_in_samples, ActionKind::Progress);
        }

        Ok(Self {
            optimizer,
            config,
            topology,
            actions,
            coordinator,
            hooks: Box::new(NoopHooks),
            throughput: ThroughputMeter::new(),
            state: SessionState::NotStarted,
        })
    }

    /// Flattened construction: every feature group supplied positionally
    /// in one call, for callers predating the builder.
    #[allow(clippy::too_many_arguments)]
    pub fn from_legacy_args(
        optimizer: Box<dyn Optimizer>,
        training_source: Box<dyn MinibatchSource>,
        schedule: MinibatchSchedule,
        bindings: HashMap<String, String>,
        max_training_samples: u64,
        checkpoint_file_name: PathBuf,
        checkpoint_frequency_in_samples: u64,
        restore_from_checkpoint_if_exists: bool,
        preserve_all_checkpoints: bool,
        cross_validation_source: Option<Box<dyn MinibatchSource>>,
        cross_validation_schedule: MinibatchSchedule,
        cross_validation_frequency_in_samples: u64,
        progress_writers: Vec<Box<dyn ProgressWriter>>,
        progress_frequency_in_samples: u64,
    ) -> Result<Self, SessionError> {
        let config = SessionConfig::new(training_source, schedule, bindings, max_training_samples)?
            .checkpointing(CheckpointSettings {
                file_name: checkpoint_file_name,
                frequency_in_samples: checkpoint_frequency_in_samples,
                restore: restore_from_checkpoint_if_exists,
                preserve_all: preserve_all_checkpoints,
            })?
            .cross_validation(
                cross_validation_source,
                cross_validation_schedule,
                cross_validation_frequency_in_samples,
            )?
            .progress(progress_writers, progress_frequency_in_samples)?;
        Self::new(optimizer, config)
    }

    pub fn with_hooks(mut self, hooks: Box<dyn SessionHooks>) -> Self {
        self.hooks = hooks;
        self
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn worker_topology(&self) -> WorkerTopology {
        self.topology
    }

    pub fn optimizer(&self) -> &dyn Optimizer {
        self.optimizer.as_ref()
    }

    pub fn optimizer_mut(&mut self) -> &mut dyn Optimizer {
        self.optimizer.as_mut()
    }

    pub fn into_optimizer(self) -> Box<dyn Optimizer> {
        self.optimizer
    }

    /// Run training to completion on `device`.
    pub fn train(&mut self, device: Device) -> Result<(), SessionError> {
        self.state = SessionState::Running;

        let mut restored_samples = 0;
        let restore = self
            .config
            .checkpoint
            .as_ref()
            .map_or(false, |settings| settings.restore);
        if restore {
            self.restore_latest()?;
            restored_samples = self.optimizer.total_samples_seen();
        }

        let mut early_exit = false;
        let mut should_train = true;
        while should_train {
            let seen = self.optimizer.total_samples_seen();
            let remaining = if early_exit || seen >= self.config.max_training_samples {
                0
            } else {
                self.config.max_training_samples - seen
            };
            if remaining == 0 {
                break;
            }

            let minibatch = self.training_minibatch(remaining, device)?;
            if minibatch.is_empty() {
                // Upstream exhaustion is a normal end, not an error.
                break;
            }

            self.hooks.on_minibatch_start();
            should_train = self.optimizer.train_minibatch(&minibatch, device)?;
            self.hooks.on_minibatch_end();

            let total = self.optimizer.total_samples_seen();
            for (kind, index) in self.actions.due(total) {
                if !self.apply_action(kind, index, device)? {
                    early_exit = true;
                }
            }
        }

        // One last pass over actions owed a trailing partial period, but
        // only if training advanced past the restore point at all.
        let total = self.optimizer.total_samples_seen();
        if restored_samples != total {
            for (kind, index) in self.actions.flush(total) {
                self.apply_action(kind, index, device)?;
            }
        }

        // With rotated checkpoints every record carries a numeric suffix,
        // so make sure the bare base name holds the final state too.
        if let Some(settings) = &self.config.checkpoint {
            if settings.preserve_all && !settings.file_name.is_file() {
                self.save_final_checkpoint()?;
            }
        }

        if let Some(progress) = self.config.progress.as_mut() {
            for writer in &mut progress.writers {
                writer.flush();
            }
        }

        self.state = SessionState::Finished;
        Ok(())
    }

    /// Restore from the newest checkpoint matching the configured base
    /// name. A first run with nothing to restore from is a no-op.
    pub fn restore_latest(&mut self) -> Result<Option<PathBuf>, SessionError> {
        let Some(coordinator) = &self.coordinator else {
            return Ok(None);
        };
        let Some(path) = coordinator.latest()? else {
            return Ok(None);
        };
        eprintln!(
            "restoring training session from checkpoint '{}'",
            path.display()
        );
        self.restore_from(&path)?;
        Ok(Some(path))
    }

    /// Restore from an explicit checkpoint path and resynchronize action
    /// bookkeeping to the restored sample count.
    pub fn restore_from(&mut self, path: &Path) -> Result<(), SessionError> {
        let record = checkpoint::read_record(path)?;
        self.optimizer.restore_from_state(&record.optimizer)?;
        let source_state = record.external.get(TRAINING_SOURCE_STATE_KEY).ok_or_else(|| {
            SessionError::checkpoint(format!(
                "checkpoint {} is missing the training source state",
                path.display()
            ))
        })?;
        self.config.source.restore_from_state(source_state)?;

        self.actions.resync(self.optimizer.total_samples_seen());
        Ok(())
    }

    fn apply_action(
        &mut self,
        kind: ActionKind,
        index: u64,
        device: Device,
    ) -> Result<bool, SessionError> {
        match kind {
            ActionKind::Checkpoint => {
                self.save_checkpoint(index)?;
                Ok(true)
            }
            ActionKind::CrossValidate => self.cross_validate(index, device),
            ActionKind::Progress => {
                self.report_progress(index);
                Ok(true)
            }
        }
    }

    fn training_minibatch(
        &mut self,
        samples_left: u64,
        device: Device,
    ) -> Result<MinibatchData, SessionError> {
        let seen = self.optimizer.total_samples_seen();
        let (worker_rank, num_workers) = self.topology.shard_at(seen);
        let scheduled = self.config.schedule.size_at(seen) as u64;
        let batch_size = scheduled.min(samples_left) as usize;
        data::fetch_minibatch(
            self.config.source.as_mut(),
            &self.config.bindings,
            batch_size,
            num_workers,
            worker_rank,
            device,
        )
    }

    fn save_checkpoint(&mut self, index: u64) -> Result<(), SessionError> {
        let Some(coordinator) = &self.coordinator else {
            return Ok(());
        };
        self.hooks.on_checkpoint_start(index);
        let record = build_record(self.optimizer.as_ref(), self.config.source.as_ref());
        let path = coordinator.save(index, &record)?;
        self.hooks.on_checkpoint_saved(index, &path);
        Ok(())
    }

    fn save_final_checkpoint(&mut self) -> Result<(), SessionError> {
        let Some(coordinator) = &self.coordinator else {
            return Ok(());
        };
        let record = build_record(self.optimizer.as_ref(), self.config.source.as_ref());
        coordinator.save_final(&record)?;
        Ok(())
    }

    /// One full pass over the validation source. The source's position is
    /// snapshotted up front and restored afterwards, so every pass starts
    /// from the same point.
    fn cross_validate(&mut self, index: u64, device: Device) -> Result<bool, SessionError> {
        let summary = if let Some(validation) = self.config.cross_validation.as_mut() {
            if let Some(source) = validation.source.as_mut() {
                let snapshot = source.checkpoint_state();
                let mut accumulator = CrossValidationAccumulator::default();
                let mut drained: u64 = 0;
                loop {
                    let batch_size = validation.schedule.size_at(drained);
                    let minibatch = data::fetch_minibatch(
                        source.as_mut(),
                        &self.config.bindings,
                        batch_size,
                        1,
                        0,
                        device,
                    )?;
                    if minibatch.is_empty() {
                        break;
                    }
                    let num_samples = data::sample_count(&minibatch);
                    let error = self.optimizer.test_minibatch(&minibatch, device, num_samples)?;
                    accumulator.update(error, num_samples);
                    drained += num_samples as u64;
                }
                source.restore_from_state(&snapshot)?;
                self.optimizer.summarize_test_progress();
                accumulator.finalize(index)
            } else {
                CrossValidationAccumulator::default().finalize(index)
            }
        } else {
            CrossValidationAccumulator::default().finalize(index)
        };

        if summary.minibatches > 0 {
            if let Some(progress) = self.config.progress.as_mut() {
                for writer in &mut progress.writers {
                    writer.write_cross_validation(&summary);
                }
            }
        }

        Ok(self.hooks.on_cross_validation_end(&summary))
    }

    fn report_progress(&mut self, index: u64) {
        self.optimizer.summarize_training_progress();
        let snapshot = self.throughput.record(self.optimizer.total_samples_seen());
        if let Some(progress) = self.config.progress.as_mut() {
            let record = ProgressRecord {
                index,
                total_samples: snapshot.total_samples,
                samples_per_sec: snapshot.samples_per_sec,
                average_samples_per_sec: snapshot.average_samples_per_sec,
            };
            for writer in &mut progress.writers {
                writer.write_training_progress(&record);
            }
        }
    }
}

fn build_record(optimizer: &dyn Optimizer, source: &dyn MinibatchSource) -> CheckpointRecord {
    let mut external = BTreeMap::new();
    external.insert(
        TRAINING_SOURCE_STATE_KEY.to_string(),
        source.checkpoint_state(),
    );
    CheckpointRecord {
        version: CHECKPOINT_VERSION,
        optimizer: optimizer.checkpoint_state(),
        external,
    }
}

use std::{
    cell::{Cell, RefCell},
    collections::{BTreeMap, HashMap},
    path::{Path, PathBuf},
    rc::Rc,
};

use tempfile::tempdir;
use training_session::{
    checkpoint::{self, CheckpointRecord, CHECKPOINT_VERSION, TRAINING_SOURCE_STATE_KEY},
    data::sample_count,
    CheckpointSettings, CrossValidationSummary, Device, DistributedCapability, Learner,
    MinibatchData, MinibatchSchedule, MinibatchSource, Optimizer, SessionConfig, SessionError,
    SessionHooks, SessionState, StateBlob, StreamBatch, TrainingSession,
};

#[derive(Debug, Default)]
struct SourceLog {
    calls: Vec<(usize, usize, usize)>,
}

/// Deterministic source: sample k carries the single value k. Position is
/// shared with the test through an `Rc` so it can be inspected after the
/// session consumes the source.
struct ArraySource {
    position: Rc<Cell<u64>>,
    limit: u64,
    log: Rc<RefCell<SourceLog>>,
}

impl ArraySource {
    fn new(limit: u64) -> Self {
        Self {
            position: Rc::new(Cell::new(0)),
            limit,
            log: Rc::new(RefCell::new(SourceLog::default())),
        }
    }

    fn position_handle(&self) -> Rc<Cell<u64>> {
        Rc::clone(&self.position)
    }

    fn log_handle(&self) -> Rc<RefCell<SourceLog>> {
        Rc::clone(&self.log)
    }
}

impl MinibatchSource for ArraySource {
    fn next_minibatch(
        &mut self,
        batch_size: usize,
        num_workers: usize,
        worker_rank: usize,
        _device: Device,
    ) -> Result<MinibatchData, SessionError> {
        self.log
            .borrow_mut()
            .calls
            .push((batch_size, num_workers, worker_rank));

        let position = self.position.get();
        let available = self
            .limit
            .saturating_sub(position)
            .min(batch_size as u64) as usize;
        if available == 0 {
            return Ok(MinibatchData::new());
        }

        let data: Vec<f32> = (0..available as u64)
            .map(|offset| (position + offset) as f32)
            .collect();
        self.position.set(position + available as u64);

        Ok(MinibatchData::from([(
            "samples".to_string(),
            StreamBatch {
                data,
                num_samples: available,
            },
        )]))
    }

    fn checkpoint_state(&self) -> StateBlob {
        serde_json::json!({ "position": self.position.get() })
    }

    fn restore_from_state(&mut self, state: &StateBlob) -> Result<(), SessionError> {
        let position = state["position"]
            .as_u64()
            .ok_or_else(|| SessionError::runtime("invalid source state"))?;
        self.position.set(position);
        Ok(())
    }
}

struct StubLearner(Option<DistributedCapability>);

impl Learner for StubLearner {
    fn distributed(&self) -> Option<DistributedCapability> {
        self.0
    }
}

/// Counts samples and hands back a constant validation error; stops on its
/// own once `stop_after` samples are reached, mimicking a convergence
/// signal.
struct CountingOptimizer {
    samples_seen: u64,
    stop_after: Option<u64>,
    validation_error: f64,
    learners: Vec<Box<dyn Learner>>,
}

impl CountingOptimizer {
    fn new() -> Self {
        Self {
            samples_seen: 0,
            stop_after: None,
            validation_error: 0.5,
            learners: Vec::new(),
        }
    }

    fn with_learners(mut self, learners: Vec<Box<dyn Learner>>) -> Self {
        self.learners = learners;
        self
    }

    fn with_stop_after(mut self, samples: u64) -> Self {
        self.stop_after = Some(samples);
        self
    }
}

impl Optimizer for CountingOptimizer {
    fn train_minibatch(
        &mut self,
        minibatch: &MinibatchData,
        _device: Device,
    ) -> Result<bool, SessionError> {
        self.samples_seen += sample_count(minibatch) as u64;
        Ok(self
            .stop_after
            .map_or(true, |limit| self.samples_seen < limit))
    }

    fn test_minibatch(
        &mut self,
        _minibatch: &MinibatchData,
        _device: Device,
        _num_samples: usize,
    ) -> Result<f64, SessionError> {
        Ok(self.validation_error)
    }

    fn total_samples_seen(&self) -> u64 {
        self.samples_seen
    }

    fn checkpoint_state(&self) -> StateBlob {
        serde_json::json!({ "samples_seen": self.samples_seen })
    }

    fn restore_from_state(&mut self, state: &StateBlob) -> Result<(), SessionError> {
        self.samples_seen = state["samples_seen"]
            .as_u64()
            .ok_or_else(|| SessionError::runtime("invalid optimizer state"))?;
        Ok(())
    }

    fn learners(&self) -> &[Box<dyn Learner>] {
        &self.learners
    }
}

#[derive(Debug, Clone, PartialEq)]
enum Event {
    CheckpointStart(u64),
    CheckpointSaved(u64, PathBuf),
    Validation {
        index: u64,
        samples: u64,
        minibatches: u64,
    },
}

struct RecordingHooks {
    events: Rc<RefCell<Vec<Event>>>,
    stop_on_validation: bool,
}

impl RecordingHooks {
    fn new() -> (Self, Rc<RefCell<Vec<Event>>>) {
        let events = Rc::new(RefCell::new(Vec::new()));
        (
            Self {
                events: Rc::clone(&events),
                stop_on_validation: false,
            },
            events,
        )
    }

    fn stopping() -> (Self, Rc<RefCell<Vec<Event>>>) {
        let (mut hooks, events) = Self::new();
        hooks.stop_on_validation = true;
        (hooks, events)
    }
}

impl SessionHooks for RecordingHooks {
    fn on_checkpoint_start(&mut self, index: u64) {
        self.events.borrow_mut().push(Event::CheckpointStart(index));
    }

    fn on_checkpoint_saved(&mut self, index: u64, path: &Path) {
        self.events
            .borrow_mut()
            .push(Event::CheckpointSaved(index, path.to_path_buf()));
    }

    fn on_cross_validation_end(&mut self, summary: &CrossValidationSummary) -> bool {
        self.events.borrow_mut().push(Event::Validation {
            index: summary.index,
            samples: summary.samples,
            minibatches: summary.minibatches,
        });
        !self.stop_on_validation
    }
}

fn bindings() -> HashMap<String, String> {
    HashMap::from([("samples".to_string(), "samples".to_string())])
}

fn validation_indices(events: &[Event]) -> Vec<u64> {
    events
        .iter()
        .filter_map(|event| match event {
            Event::Validation { index, .. } => Some(*index),
            _ => None,
        })
        .collect()
}

#[test]
fn checkpoints_fire_exactly_on_period_boundaries() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path().join("ckpt");

    let source = ArraySource::new(10_000);
    let config = SessionConfig::new(
        Box::new(source),
        MinibatchSchedule::Constant(10),
        bindings(),
        100,
    )
    .expect("config")
    .checkpointing(CheckpointSettings {
        file_name: base.clone(),
        frequency_in_samples: 50,
        restore: false,
        preserve_all: true,
    })
    .expect("checkpointing");

    let (hooks, events) = RecordingHooks::new();
    let mut session = TrainingSession::new(Box::new(CountingOptimizer::new()), config)
        .expect("session")
        .with_hooks(Box::new(hooks));
    session.train(Device::Cpu).expect("train");

    // 100 samples at frequency 50: two fires, no flush (exact boundary).
    let events = events.borrow();
    assert_eq!(
        *events,
        vec![
            Event::CheckpointStart(0),
            Event::CheckpointSaved(0, dir.path().join("ckpt0")),
            Event::CheckpointStart(1),
            Event::CheckpointSaved(1, dir.path().join("ckpt1")),
        ]
    );
    assert_eq!(session.optimizer().total_samples_seen(), 100);
    assert_eq!(session.state(), SessionState::Finished);

    // Rotated records, their markers, and the final bare-name record.
    assert!(dir.path().join("ckpt0").is_file());
    assert!(dir.path().join("ckpt1").is_file());
    assert!(checkpoint::marker_path(&dir.path().join("ckpt1")).is_file());
    assert!(base.is_file());
}

#[test]
fn flush_checkpoints_the_trailing_partial_period() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path().join("ckpt");

    let config = SessionConfig::new(
        Box::new(ArraySource::new(10_000)),
        MinibatchSchedule::Constant(10),
        bindings(),
        100,
    )
    .expect("config")
    .checkpointing(CheckpointSettings {
        file_name: base.clone(),
        frequency_in_samples: 30,
        restore: false,
        preserve_all: true,
    })
    .expect("checkpointing");

    let (hooks, events) = RecordingHooks::new();
    let mut session = TrainingSession::new(Box::new(CountingOptimizer::new()), config)
        .expect("session")
        .with_hooks(Box::new(hooks));
    session.train(Device::Cpu).expect("train");

    // Periods 0..2 close during the loop; the leftover 10 samples flush
    // under the already-advanced index 3.
    let starts: Vec<u64> = events
        .borrow()
        .iter()
        .filter_map(|event| match event {
            Event::CheckpointStart(index) => Some(*index),
            _ => None,
        })
        .collect();
    assert_eq!(starts, vec![0, 1, 2, 3]);
    assert!(dir.path().join("ckpt3").is_file());
    assert!(base.is_file());
}

#[test]
fn restore_resumes_the_action_sequence_without_refire_or_skip() {
    // Reference: one uninterrupted run to 100 samples.
    let reference_indices = {
        let config = SessionConfig::new(
            Box::new(ArraySource::new(10_000)),
            MinibatchSchedule::Constant(10),
            bindings(),
            100,
        )
        .expect("config")
        .cross_validation(
            Some(Box::new(ArraySource::new(20))),
            MinibatchSchedule::Constant(20),
            25,
        )
        .expect("cross_validation");

        let (hooks, events) = RecordingHooks::new();
        let mut session = TrainingSession::new(Box::new(CountingOptimizer::new()), config)
            .expect("session")
            .with_hooks(Box::new(hooks));
        session.train(Device::Cpu).expect("train");
        let indices = validation_indices(&events.borrow());
        indices
    };

    let dir = tempdir().expect("tempdir");
    let base = dir.path().join("ckpt");

    // First half: stop at 50 with a checkpoint exactly there.
    let first_half = {
        let config = SessionConfig::new(
            Box::new(ArraySource::new(10_000)),
            MinibatchSchedule::Constant(10),
            bindings(),
            50,
        )
        .expect("config")
        .checkpointing(CheckpointSettings {
            file_name: base.clone(),
            frequency_in_samples: 50,
            restore: false,
            preserve_all: false,
        })
        .expect("checkpointing")
        .cross_validation(
            Some(Box::new(ArraySource::new(20))),
            MinibatchSchedule::Constant(20),
            25,
        )
        .expect("cross_validation");

        let (hooks, events) = RecordingHooks::new();
        let mut session = TrainingSession::new(Box::new(CountingOptimizer::new()), config)
            .expect("session")
            .with_hooks(Box::new(hooks));
        session.train(Device::Cpu).expect("train");
        let indices = validation_indices(&events.borrow());
        indices
    };

    // Second half: fresh collaborators, restore, continue to 100.
    let second_half = {
        let source = ArraySource::new(10_000);
        let position = source.position_handle();
        let config = SessionConfig::new(
            Box::new(source),
            MinibatchSchedule::Constant(10),
            bindings(),
            100,
        )
        .expect("config")
        .checkpointing(CheckpointSettings {
            file_name: base.clone(),
            frequency_in_samples: 50,
            restore: true,
            preserve_all: false,
        })
        .expect("checkpointing")
        .cross_validation(
            Some(Box::new(ArraySource::new(20))),
            MinibatchSchedule::Constant(20),
            25,
        )
        .expect("cross_validation");

        let (hooks, events) = RecordingHooks::new();
        let mut session = TrainingSession::new(Box::new(CountingOptimizer::new()), config)
            .expect("session")
            .with_hooks(Box::new(hooks));
        session.train(Device::Cpu).expect("train");

        assert_eq!(session.optimizer().total_samples_seen(), 100);
        // The data position came back from the checkpoint too.
        assert_eq!(position.get(), 100);
        let indices = validation_indices(&events.borrow());
        indices
    };

    let mut combined = first_half;
    combined.extend(second_half);
    assert_eq!(combined, reference_indices);
}

#[test]
fn restore_latest_prefers_the_greatest_numeric_suffix() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path().join("ckpt");

    for (suffix, samples) in [("", 5u64), ("3", 300), ("10", 1_000)] {
        let mut external = BTreeMap::new();
        external.insert(
            TRAINING_SOURCE_STATE_KEY.to_string(),
            serde_json::json!({ "position": samples }),
        );
        let record = CheckpointRecord {
            version: CHECKPOINT_VERSION,
            optimizer: serde_json::json!({ "samples_seen": samples }),
            external,
        };
        let path = dir.path().join(format!("ckpt{}", suffix));
        checkpoint::write_record(&path, &record).expect("write");
    }

    let source = ArraySource::new(10_000);
    let position = source.position_handle();
    let config = SessionConfig::new(
        Box::new(source),
        MinibatchSchedule::Constant(10),
        bindings(),
        1_000,
    )
    .expect("config")
    .checkpointing(CheckpointSettings {
        file_name: base,
        frequency_in_samples: 0,
        restore: true,
        preserve_all: false,
    })
    .expect("checkpointing");

    let mut session =
        TrainingSession::new(Box::new(CountingOptimizer::new()), config).expect("session");
    session.train(Device::Cpu).expect("train");

    // ckpt10 wins over ckpt3 and the bare ckpt; the budget was already
    // reached there, so nothing trains.
    assert_eq!(session.optimizer().total_samples_seen(), 1_000);
    assert_eq!(position.get(), 1_000);
}

#[test]
fn restore_latest_falls_back_to_the_bare_file_and_noops_when_absent() {
    let dir = tempdir().expect("tempdir");
    let base = dir.path().join("ckpt");

    let mut external = BTreeMap::new();
    external.insert(
        TRAINING_SOURCE_STATE_KEY.to_string(),
        serde_json::json!({ "position": 40u64 }),
    );
    checkpoint::write_record(
        &base,
        &CheckpointRecord {
            version: CHECKPOINT_VERSION,
            optimizer: serde_json::json!({ "samples_seen": 40u64 }),
            external,
        },
    )
    .expect("write");

    let config = SessionConfig::new(
        Box::new(ArraySource::new(10_000)),
        MinibatchSchedule::Constant(10),
        bindings(),
        40,
    )
    .expect("config")
    .checkpointing(CheckpointSettings {
        file_name: base,
        frequency_in_samples: 0,
        restore: true,
        preserve_all: false,
    })
    .expect("checkpointing");
    let mut session =
        TrainingSession::new(Box::new(CountingOptimizer::new()), config).expect("session");
    session.train(Device::Cpu).expect("train");
    assert_eq!(session.optimizer().total_samples_seen(), 40);

    // Nothing on disk: restoring is a no-op and training starts fresh.
    let empty = tempdir().expect("tempdir");
    let config = SessionConfig::new(
        Box::new(ArraySource::new(10_000)),
        MinibatchSchedule::Constant(10),
        bindings(),
        40,
    )
    .expect("config")
    .checkpointing(CheckpointSettings {
        file_name: empty.path().join("ckpt"),
        frequency_in_samples: 0,
        restore: true,
        preserve_all: false,
    })
    .expect("checkpointing");
    let mut session =
        TrainingSession::new(Box::new(CountingOptimizer::new()), config).expect("session");
    session.train(Device::Cpu).expect("train");
    assert_eq!(session.optimizer().total_samples_seen(), 40);
}

#[test]
fn cross_validation_leaves_the_source_position_unchanged() {
    let validation_source = ArraySource::new(40);
    let validation_position = validation_source.position_handle();

    let config = SessionConfig::new(
        Box::new(ArraySource::new(10_000)),
        MinibatchSchedule::Constant(10),
        bindings(),
        60,
    )
    .expect("config")
    .cross_validation(
        Some(Box::new(validation_source)),
        MinibatchSchedule::Constant(16),
        30,
    )
    .expect("cross_validation");

    let (hooks, events) = RecordingHooks::new();
    let mut session = TrainingSession::new(Box::new(CountingOptimizer::new()), config)
        .expect("session")
        .with_hooks(Box::new(hooks));
    session.train(Device::Cpu).expect("train");

    // Both passes drained 40 samples in batches of 16, 16, 8 and put the
    // position back where they found it.
    assert_eq!(validation_position.get(), 0);
    let events = events.borrow();
    assert_eq!(
        *events,
        vec![
            Event::Validation {
                index: 0,
                samples: 40,
                minibatches: 3,
            },
            Event::Validation {
                index: 1,
                samples: 40,
                minibatches: 3,
            },
        ]
    );
}

#[test]
fn cross_validation_without_a_source_still_fires_the_hook() {
    let config = SessionConfig::new(
        Box::new(ArraySource::new(10_000)),
        MinibatchSchedule::Constant(10),
        bindings(),
        50,
    )
    .expect("config")
    .cross_validation(None, MinibatchSchedule::Constant(16), 25)
    .expect("cross_validation");

    let (hooks, events) = RecordingHooks::new();
    let mut session = TrainingSession::new(Box::new(CountingOptimizer::new()), config)
        .expect("session")
        .with_hooks(Box::new(hooks));
    session.train(Device::Cpu).expect("train");

    assert_eq!(
        *events.borrow(),
        vec![
            Event::Validation {
                index: 0,
                samples: 0,
                minibatches: 0,
            },
            Event::Validation {
                index: 1,
                samples: 0,
                minibatches: 0,
            },
        ]
    );
}

#[test]
fn budget_clamps_batch_sizes_and_never_issues_zero_requests() {
    let source = ArraySource::new(10_000);
    let log = source.log_handle();

    let config = SessionConfig::new(
        Box::new(source),
        MinibatchSchedule::Constant(10),
        bindings(),
        35,
    )
    .expect("config");

    let mut session =
        TrainingSession::new(Box::new(CountingOptimizer::new()), config).expect("session");
    session.train(Device::Cpu).expect("train");

    assert_eq!(session.optimizer().total_samples_seen(), 35);
    let log = log.borrow();
    let sizes: Vec<usize> = log.calls.iter().map(|(size, _, _)| *size).collect();
    assert_eq!(sizes, vec![10, 10, 10, 5]);
}

#[test]
fn source_exhaustion_ends_training_cleanly() {
    let config = SessionConfig::new(
        Box::new(ArraySource::new(30)),
        MinibatchSchedule::Constant(10),
        bindings(),
        100,
    )
    .expect("config");

    let mut session =
        TrainingSession::new(Box::new(CountingOptimizer::new()), config).expect("session");
    session.train(Device::Cpu).expect("train");

    assert_eq!(session.state(), SessionState::Finished);
    assert_eq!(session.optimizer().total_samples_seen(), 30);
}

#[test]
fn validation_hook_can_request_a_graceful_stop() {
    let config = SessionConfig::new(
        Box::new(ArraySource::new(10_000)),
        MinibatchSchedule::Constant(10),
        bindings(),
        1_000,
    )
    .expect("config")
    .cross_validation(None, MinibatchSchedule::Constant(16), 25)
    .expect("cross_validation");

    let (hooks, events) = RecordingHooks::stopping();
    let mut session = TrainingSession::new(Box::new(CountingOptimizer::new()), config)
        .expect("session")
        .with_hooks(Box::new(hooks));
    session.train(Device::Cpu).expect("train");

    // The first fire (closing period 0 at 30 samples) requests the stop;
    // the iteration's bookkeeping still completes.
    assert_eq!(session.state(), SessionState::Finished);
    assert_eq!(session.optimizer().total_samples_seen(), 30);
    assert_eq!(validation_indices(&events.borrow()), vec![0]);
}

#[test]
fn optimizer_convergence_signal_stops_the_loop() {
    let config = SessionConfig::new(
        Box::new(ArraySource::new(10_000)),
        MinibatchSchedule::Constant(10),
        bindings(),
        1_000,
    )
    .expect("config");

    let optimizer = CountingOptimizer::new().with_stop_after(40);
    let mut session = TrainingSession::new(Box::new(optimizer), config).expect("session");
    session.train(Device::Cpu).expect("train");

    assert_eq!(session.state(), SessionState::Finished);
    assert_eq!(session.optimizer().total_samples_seen(), 40);
}

#[test]
fn sharding_stays_suppressed_through_the_warmup_threshold() {
    let source = ArraySource::new(10_000);
    let log = source.log_handle();

    let learners: Vec<Box<dyn Learner>> = vec![
        Box::new(StubLearner(Some(DistributedCapability {
            worker_rank: 1,
            num_workers: 2,
            parallelize_after: 200,
        }))),
        Box::new(StubLearner(Some(DistributedCapability {
            worker_rank: 1,
            num_workers: 2,
            parallelize_after: 500,
        }))),
    ];
    let optimizer = CountingOptimizer::new().with_learners(learners);

    let config = SessionConfig::new(
        Box::new(source),
        MinibatchSchedule::Constant(100),
        bindings(),
        700,
    )
    .expect("config");

    let mut session = TrainingSession::new(Box::new(optimizer), config).expect("session");
    assert_eq!(session.worker_topology().parallel_after_samples, 500);
    session.train(Device::Cpu).expect("train");

    let log = log.borrow();
    let shards: Vec<(usize, usize)> = log
        .calls
        .iter()
        .map(|(_, workers, rank)| (*rank, *workers))
        .collect();
    assert_eq!(
        shards,
        vec![
            (0, 1),
            (0, 1),
            (0, 1),
            (0, 1),
            (0, 1),
            (1, 2),
            (1, 2),
        ]
    );
}

#[test]
fn optional_groups_reject_a_second_configuration() {
    let config = SessionConfig::new(
        Box::new(ArraySource::new(100)),
        MinibatchSchedule::Constant(10),
        bindings(),
        100,
    )
    .expect("config")
    .checkpointing(CheckpointSettings {
        file_name: PathBuf::from("ckpt"),
        frequency_in_samples: 50,
        restore: false,
        preserve_all: false,
    })
    .expect("checkpointing");

    let result = config.checkpointing(CheckpointSettings {
        file_name: PathBuf::from("other"),
        frequency_in_samples: 10,
        restore: false,
        preserve_all: false,
    });
    assert!(matches!(result, Err(SessionError::Configuration(_))));

    let config = SessionConfig::new(
        Box::new(ArraySource::new(100)),
        MinibatchSchedule::Constant(10),
        bindings(),
        100,
    )
    .expect("config")
    .cross_validation(None, MinibatchSchedule::Constant(10), 25)
    .expect("cross_validation");
    let result = config.cross_validation(None, MinibatchSchedule::Constant(10), 25);
    assert!(matches!(result, Err(SessionError::Configuration(_))));

    let config = SessionConfig::new(
        Box::new(ArraySource::new(100)),
        MinibatchSchedule::Constant(10),
        bindings(),
        100,
    )
    .expect("config")
    .progress(Vec::new(), 25)
    .expect("progress");
    let result = config.progress(Vec::new(), 25);
    assert!(matches!(result, Err(SessionError::Configuration(_))));
}

#[test]
fn construction_rejects_empty_budget_bindings_and_names() {
    let result = SessionConfig::new(
        Box::new(ArraySource::new(100)),
        MinibatchSchedule::Constant(10),
        bindings(),
        0,
    );
    assert!(matches!(result, Err(SessionError::Configuration(_))));

    let result = SessionConfig::new(
        Box::new(ArraySource::new(100)),
        MinibatchSchedule::Constant(10),
        HashMap::new(),
        100,
    );
    assert!(matches!(result, Err(SessionError::Configuration(_))));

    // An empty checkpoint file name is only valid with a zero frequency.
    let result = SessionConfig::new(
        Box::new(ArraySource::new(100)),
        MinibatchSchedule::Constant(10),
        bindings(),
        100,
    )
    .expect("config")
    .checkpointing(CheckpointSettings {
        file_name: PathBuf::new(),
        frequency_in_samples: 50,
        restore: false,
        preserve_all: false,
    });
    assert!(matches!(result, Err(SessionError::Configuration(_))));
}

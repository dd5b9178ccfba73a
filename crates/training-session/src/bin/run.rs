use std::{collections::HashMap, path::PathBuf};

use clap::Parser;
use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::Deserialize;

use training_session::{
    CheckpointSettings, Device, Learner, MinibatchData, MinibatchSource, Optimizer,
    ProgressWriter, SessionConfig, SessionError, SessionOptions, StateBlob,
    StdoutProgressWriter, StreamBatch, TensorBoardProgressWriter, TrainingSession,
};

const FEATURE_DIM: usize = 4;
const TRUE_WEIGHTS: [f32; FEATURE_DIM] = [0.6, -0.3, 0.9, 0.2];
const VALIDATION_SAMPLES: u64 = 256;

fn main() {
    if let Err(err) = run() {
        eprintln!("training session failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Drive a training session over a synthetic regression task", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to session options file")]
    config: PathBuf,

    #[arg(long, default_value_t = 17, help = "Seed for the synthetic data stream")]
    seed: u64,

    #[arg(long, default_value_t = 0.05, help = "SGD learning rate")]
    learning_rate: f32,
}

fn run() -> Result<(), SessionError> {
    let args = Args::parse();
    let options = SessionOptions::from_path(&args.config)?;

    let bindings = HashMap::from([
        ("features".to_string(), "features".to_string()),
        ("targets".to_string(), "targets".to_string()),
    ]);

    let training_source = Box::new(SyntheticRegressionSource::unbounded(args.seed));
    let mut config = SessionConfig::new(
        training_source,
        options.minibatch_size.clone(),
        bindings,
        options.max_training_samples,
    )?;

    if let Some(checkpoint) = &options.checkpoint {
        config = config.checkpointing(CheckpointSettings {
            file_name: checkpoint.file_name.clone(),
            frequency_in_samples: checkpoint.frequency_in_samples,
            restore: checkpoint.restore,
            preserve_all: checkpoint.preserve_all,
        })?;
    }

    if let Some(validation) = &options.cross_validation {
        let validation_source = Box::new(SyntheticRegressionSource::bounded(
            args.seed.wrapping_add(1),
            VALIDATION_SAMPLES,
        ));
        config = config.cross_validation(
            Some(validation_source),
            validation.minibatch_size.clone(),
            validation.frequency_in_samples,
        )?;
    }

    if let Some(progress) = &options.progress {
        let mut writers: Vec<Box<dyn ProgressWriter>> = Vec::new();
        if progress.stdout {
            writers.push(Box::new(StdoutProgressWriter));
        }
        if let Some(dir) = &progress.tensorboard_dir {
            writers.push(Box::new(TensorBoardProgressWriter::create(dir, 10)?));
        }
        config = config.progress(writers, progress.frequency_in_samples)?;
    }

    let optimizer = Box::new(SgdRegressor::new(args.learning_rate));
    let mut session = TrainingSession::new(optimizer, config)?;
    session.train(Device::Cpu)?;

    let optimizer = session.into_optimizer();
    println!(
        "finished after {} samples; learned weights {:?} (target {:?})",
        optimizer.total_samples_seen(),
        optimizer.checkpoint_state()["weights"],
        TRUE_WEIGHTS
    );

    Ok(())
}

/// Deterministic stream of regression samples: every sample is derived
/// from its global index alone, so a restored position replays the exact
/// same data.
struct SyntheticRegressionSource {
    seed: u64,
    position: u64,
    limit: Option<u64>,
}

impl SyntheticRegressionSource {
    fn unbounded(seed: u64) -> Self {
        Self {
            seed,
            position: 0,
            limit: None,
        }
    }

    fn bounded(seed: u64, limit: u64) -> Self {
        Self {
            seed,
            position: 0,
            limit: Some(limit),
        }
    }

    fn sample(&self, index: u64) -> ([f32; FEATURE_DIM], f32) {
        let mut rng = StdRng::seed_from_u64(self.seed ^ index.wrapping_mul(0x9e37_79b9_7f4a_7c15));
        let mut features = [0.0f32; FEATURE_DIM];
        for value in features.iter_mut() {
            *value = rng.gen_range(-1.0..1.0);
        }
        let noise: f32 = rng.gen_range(-0.01..0.01);
        let target = features
            .iter()
            .zip(TRUE_WEIGHTS.iter())
            .map(|(x, w)| x * w)
            .sum::<f32>()
            + noise;
        (features, target)
    }
}

#[derive(Deserialize)]
struct SourcePosition {
    position: u64,
}

impl MinibatchSource for SyntheticRegressionSource {
    fn next_minibatch(
        &mut self,
        batch_size: usize,
        _num_workers: usize,
        _worker_rank: usize,
        _device: Device,
    ) -> Result<MinibatchData, SessionError> {
        let available = match self.limit {
            Some(limit) => limit.saturating_sub(self.position).min(batch_size as u64) as usize,
            None => batch_size,
        };
        if available == 0 {
            return Ok(MinibatchData::new());
        }

        let mut features = Vec::with_capacity(available * FEATURE_DIM);
        let mut targets = Vec::with_capacity(available);
        for offset in 0..available as u64 {
            let (x, y) = self.sample(self.position + offset);
            features.extend_from_slice(&x);
            targets.push(y);
        }
        self.position += available as u64;

        Ok(MinibatchData::from([
            (
                "features".to_string(),
                StreamBatch {
                    data: features,
                    num_samples: available,
                },
            ),
            (
                "targets".to_string(),
                StreamBatch {
                    data: targets,
                    num_samples: available,
                },
            ),
        ]))
    }

    fn checkpoint_state(&self) -> StateBlob {
        serde_json::json!({ "position": self.position })
    }

    fn restore_from_state(&mut self, state: &StateBlob) -> Result<(), SessionError> {
        let restored: SourcePosition = serde_json::from_value(state.clone())
            .map_err(|err| SessionError::runtime(format!("invalid source state: {err}")))?;
        self.position = restored.position;
        Ok(())
    }
}

#[derive(Deserialize)]
struct RegressorState {
    weights: Vec<f32>,
    samples_seen: u64,
}

/// Plain SGD over a linear model; enough of an optimizer to exercise the
/// whole session surface.
struct SgdRegressor {
    weights: Vec<f32>,
    learning_rate: f32,
    samples_seen: u64,
    learners: Vec<Box<dyn Learner>>,
}

impl SgdRegressor {
    fn new(learning_rate: f32) -> Self {
        Self {
            weights: vec![0.0; FEATURE_DIM],
            learning_rate,
            samples_seen: 0,
            learners: Vec::new(),
        }
    }

    fn predict(&self, features: &[f32]) -> f32 {
        features
            .iter()
            .zip(self.weights.iter())
            .map(|(x, w)| x * w)
            .sum()
    }
}

impl Optimizer for SgdRegressor {
    fn train_minibatch(
        &mut self,
        minibatch: &MinibatchData,
        _device: Device,
    ) -> Result<bool, SessionError> {
        let features = stream(minibatch, "features")?;
        let targets = stream(minibatch, "targets")?;

        for (row, target) in features
            .data
            .chunks_exact(FEATURE_DIM)
            .zip(targets.data.iter())
        {
            let residual = self.predict(row) - target;
            for (weight, x) in self.weights.iter_mut().zip(row.iter()) {
                *weight -= self.learning_rate * residual * x;
            }
        }
        self.samples_seen += targets.num_samples as u64;
        Ok(true)
    }

    fn test_minibatch(
        &mut self,
        minibatch: &MinibatchData,
        _device: Device,
        num_samples: usize,
    ) -> Result<f64, SessionError> {
        let features = stream(minibatch, "features")?;
        let targets = stream(minibatch, "targets")?;

        let squared_sum: f64 = features
            .data
            .chunks_exact(FEATURE_DIM)
            .zip(targets.data.iter())
            .map(|(row, target)| {
                let residual = (self.predict(row) - target) as f64;
                residual * residual
            })
            .sum();
        Ok(squared_sum / num_samples.max(1) as f64)
    }

    fn total_samples_seen(&self) -> u64 {
        self.samples_seen
    }

    fn checkpoint_state(&self) -> StateBlob {
        serde_json::json!({
            "weights": self.weights,
            "samples_seen": self.samples_seen,
        })
    }

    fn restore_from_state(&mut self, state: &StateBlob) -> Result<(), SessionError> {
        let restored: RegressorState = serde_json::from_value(state.clone())
            .map_err(|err| SessionError::runtime(format!("invalid optimizer state: {err}")))?;
        self.weights = restored.weights;
        self.samples_seen = restored.samples_seen;
        Ok(())
    }

    fn learners(&self) -> &[Box<dyn Learner>] {
        &self.learners
    }
}

fn stream<'a>(minibatch: &'a MinibatchData, name: &str) -> Result<&'a StreamBatch, SessionError> {
    minibatch
        .get(name)
        .ok_or_else(|| SessionError::runtime(format!("minibatch is missing stream '{}'", name)))
}

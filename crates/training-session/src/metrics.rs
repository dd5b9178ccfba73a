use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct ExponentialMovingAverage {
    alpha: f64,
    value: Option<f64>,
}

impl ExponentialMovingAverage {
    pub fn new(alpha: f64) -> Self {
        Self { alpha, value: None }
    }

    pub fn update(&mut self, sample: f64) -> f64 {
        let next = match self.value {
            Some(prev) => self.alpha * sample + (1.0 - self.alpha) * prev,
            None => sample,
        };
        self.value = Some(next);
        next
    }

    pub fn value(&self) -> Option<f64> {
        self.value
    }
}

/// Samples-per-second tracking between progress firings.
#[derive(Debug)]
pub struct ThroughputMeter {
    start_time: Instant,
    window_start: Instant,
    samples_at_window_start: u64,
    throughput_ema: ExponentialMovingAverage,
}

impl ThroughputMeter {
    pub fn new() -> Self {
        let now = Instant::now();
        Self {
            start_time: now,
            window_start: now,
            samples_at_window_start: 0,
            throughput_ema: ExponentialMovingAverage::new(0.1),
        }
    }

    pub fn record(&mut self, total_samples: u64) -> ThroughputSnapshot {
        let now = Instant::now();
        let window = now.duration_since(self.window_start);
        let window_samples = total_samples.saturating_sub(self.samples_at_window_start);
        let samples_per_sec = if window > Duration::ZERO {
            window_samples as f64 / window.as_secs_f64()
        } else {
            0.0
        };
        let average = self.throughput_ema.update(samples_per_sec);

        self.window_start = now;
        self.samples_at_window_start = total_samples;

        ThroughputSnapshot {
            total_samples,
            samples_per_sec,
            average_samples_per_sec: average,
            wall_time: now.duration_since(self.start_time),
        }
    }
}

impl Default for ThroughputMeter {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone)]
pub struct ThroughputSnapshot {
    pub total_samples: u64,
    pub samples_per_sec: f64,
    pub average_samples_per_sec: f64,
    pub wall_time: Duration,
}

/// Batch-size-weighted error accumulated over one validation pass.
#[derive(Debug, Default)]
pub struct CrossValidationAccumulator {
    error_sum: f64,
    samples: u64,
    minibatches: u64,
}

impl CrossValidationAccumulator {
    pub fn update(&mut self, error: f64, num_samples: usize) {
        self.error_sum += error * num_samples as f64;
        self.samples += num_samples as u64;
        self.minibatches += 1;
    }

    /// A pass over zero samples reports zero error, not NaN; the action
    /// still fires when no validation source is configured.
    pub fn finalize(self, index: u64) -> CrossValidationSummary {
        let average_error = if self.samples == 0 {
            0.0
        } else {
            self.error_sum / self.samples as f64
        };
        CrossValidationSummary {
            index,
            average_error,
            samples: self.samples,
            minibatches: self.minibatches,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct CrossValidationSummary {
    pub index: u64,
    pub average_error: f64,
    pub samples: u64,
    pub minibatches: u64,
}

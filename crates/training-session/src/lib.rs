pub mod actions;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod distributed;
pub mod metrics;
pub mod progress;
pub mod session;

pub use config::{
    CheckpointOptions, CheckpointSettings, CrossValidationOptions, ProgressOptions, SessionConfig,
    SessionError, SessionOptions,
};
pub use data::{
    MinibatchData, MinibatchSchedule, MinibatchSource, ScheduleSegment, StateBlob, StreamBatch,
};
pub use device::Device;
pub use distributed::{DistributedCapability, Learner, WorkerTopology};
pub use metrics::CrossValidationSummary;
pub use progress::{ProgressRecord, ProgressWriter, StdoutProgressWriter, TensorBoardProgressWriter};
pub use session::{Optimizer, SessionHooks, SessionState, TrainingSession};

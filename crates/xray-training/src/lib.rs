//! Training infrastructure for chest X-ray multi-label classification.
//!
//! This crate provides:
//! - The `Backbone` capability and two backbones (dense CNN, vision transformer)
//! - BCE-with-logits and focal loss
//! - The per-epoch training loop and the evaluator
//! - Checkpointing with early stopping
//! - Learning rate scheduling
//! - Metric sinks
//! - The outer experiment controller

pub mod backend;
pub mod checkpoint;
pub mod evaluator;
pub mod experiment;
pub mod loss;
pub mod lr_schedule;
pub mod model;
pub mod sink;
pub mod trainer;

pub use backend::{backend_name, default_device, DefaultBackend, TrainingBackend};
pub use checkpoint::{CheckpointManager, CheckpointMeta, Observation};
pub use evaluator::{evaluate, EvaluationReport};
pub use experiment::{create_run_dir, partition_source, run_experiment, RunOutcome};
pub use loss::LossKind;
pub use lr_schedule::LearningRateScheduler;
pub use model::{Backbone, DenseNet, VisionTransformer, XrayClassifier};
pub use sink::{
    open_sink, EpochRecord, FinalRecord, GuardedSink, JsonlSink, MetricSink, NoopSink, TracingSink,
};
pub use trainer::{Trainer, TrainerPhase};

pub use xray_core::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use super::checkpoint::{CheckpointManager, Observation};
    pub use super::evaluator::{evaluate, EvaluationReport};
    pub use super::experiment::{run_experiment, RunOutcome};
    pub use super::loss::LossKind;
    pub use super::model::{Backbone, XrayClassifier};
    pub use super::sink::MetricSink;
    pub use super::trainer::Trainer;
}

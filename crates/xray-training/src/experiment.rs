//! Outer experiment controller.
//!
//! Drives the epoch loop (train, validate, schedule, checkpoint), stops early
//! when the checkpoint manager says so, then reloads the best checkpoint and
//! evaluates it once on the test partition.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use burn::{
    module::{AutodiffModule, Module},
    optim::{decay::WeightDecayConfig, AdamConfig},
    record::CompactRecorder,
    tensor::backend::AutodiffBackend,
};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;
use xray_core::{save_toml_config, DataSplit, MonitorMetric, Result, RunConfig};
use xray_dataset::transform::{transforms_for, ImageTransform};
use xray_dataset::{PreparedDataset, SampleOrder, SampleSource, XrayDataset};

use crate::checkpoint::{CheckpointManager, Observation};
use crate::evaluator::{evaluate, EvaluationReport};
use crate::loss::LossKind;
use crate::lr_schedule::LearningRateScheduler;
use crate::model::Backbone;
use crate::sink::{EpochRecord, FinalRecord, MetricSink};
use crate::trainer::Trainer;

/// Resolved configuration file written into every run directory
pub const RUN_CONFIG_FILE: &str = "config.toml";

/// Summary of a finished run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunOutcome {
    pub run_dir: PathBuf,
    pub epochs_run: usize,
    pub stopped_early: bool,
    pub best_epoch: usize,
    pub best_value: f64,
    pub checkpoint: PathBuf,
    pub test: EvaluationReport,
    pub history: Vec<EpochRecord>,
}

/// Create `<output_dir>/<run_id>/` and write the resolved config into it
pub fn create_run_dir(config: &RunConfig) -> Result<(String, PathBuf)> {
    let uuid = Uuid::new_v4().simple().to_string();
    let run_id = format!("{}_{}", Local::now().format("%Y%m%d-%H%M%S"), &uuid[..8]);
    let run_dir = config.output_dir.join(&run_id);
    fs::create_dir_all(&run_dir)?;
    save_toml_config(config, &run_dir.join(RUN_CONFIG_FILE))?;
    info!("Run {} writing to {}", run_id, run_dir.display());
    Ok((run_id, run_dir))
}

/// Sample source for one partition.
///
/// Training shuffles every epoch with the training transform; validation and
/// test keep their order with the deterministic transform.
pub fn partition_source(
    config: &RunConfig,
    prepared: &PreparedDataset,
    split: DataSplit,
) -> Result<SampleSource> {
    let (train_transform, eval_transform) = transforms_for(config);
    let (transform, order): (Box<dyn ImageTransform>, _) = match split {
        DataSplit::Train => (train_transform, SampleOrder::Shuffled),
        DataSplit::Validation | DataSplit::Test => (eval_transform, SampleOrder::Fixed),
    };
    let dataset = XrayDataset::new(
        prepared.partitions.get(split),
        &prepared.index,
        Arc::from(transform),
    )?;
    SampleSource::new(
        dataset,
        order,
        config.training.batch_size,
        config.training.num_workers,
        config.seed,
    )
}

fn forward_to_sink(sink_name: &str, outcome: Result<()>) {
    if let Err(e) = outcome {
        warn!("Metric sink '{}' rejected a record: {}", sink_name, e);
    }
}

/// Train `model` on the prepared partitions and evaluate the best checkpoint.
///
/// Fails with `NoCheckpointFound` when no epoch ever improved the monitored
/// metric.
pub fn run_experiment<B, M>(
    config: &RunConfig,
    model: M,
    prepared: &PreparedDataset,
    run_dir: &Path,
    sink: &mut dyn MetricSink,
    device: &B::Device,
) -> Result<RunOutcome>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Backbone<B>,
    M::InnerModule: Backbone<B::InnerBackend>,
{
    prepared.partitions.ensure_non_empty()?;

    let target = config.target_index();
    let loss_kind = LossKind::from_strategy(&config.imbalance);
    let train = partition_source(config, prepared, DataSplit::Train)?;
    let validation = partition_source(config, prepared, DataSplit::Validation)?;
    let test = partition_source(config, prepared, DataSplit::Test)?;
    info!(
        "Partitions: {} train / {} validation / {} test, loss {}, monitoring {}",
        train.len(),
        validation.len(),
        test.len(),
        loss_kind.name(),
        config.monitor
    );

    let optimizer = AdamConfig::new()
        .with_weight_decay(Some(WeightDecayConfig::new(
            config.training.weight_decay as f32,
        )))
        .init::<B, M>();
    let mut trainer = Trainer::<B, M, _>::new(optimizer, loss_kind, device.clone());
    let mut scheduler =
        LearningRateScheduler::new(config.training.lr_schedule, config.training.learning_rate);
    let mut checkpoints = CheckpointManager::new(
        run_dir,
        config.training.patience,
        config.monitor.to_string(),
    );

    let mut model = model;
    let mut history = Vec::new();
    let mut stopped_early = false;

    for epoch in 1..=config.training.num_epochs {
        let learning_rate = scheduler.get_lr();
        let (updated, train_loss) = trainer.train_epoch(model, &train, epoch, learning_rate)?;
        model = updated;

        let report = evaluate::<B::InnerBackend, _>(
            &model.valid(),
            &validation,
            &loss_kind,
            target,
            device,
            DataSplit::Validation.to_string().as_str(),
        )?;
        scheduler.step_with_metric(report.loss);

        let record = EpochRecord {
            epoch,
            train_loss,
            val_loss: report.loss,
            val_auc: report.metrics.mean_auc,
            val_f1: report.metrics.macro_f1,
            val_target_f1: report.metrics.target_f1(),
            learning_rate,
            per_class_auc: report.metrics.per_class_auc.clone(),
            per_class_f1: report.metrics.per_class_f1.clone(),
        };
        info!(
            epoch,
            train_loss,
            val_loss = record.val_loss,
            val_auc = record.val_auc,
            val_f1 = record.val_f1,
            val_target_f1 = record.val_target_f1,
            learning_rate,
            "Epoch {}/{} complete",
            epoch,
            config.training.num_epochs
        );
        forward_to_sink(sink.name(), sink.log_epoch(&record));
        history.push(record);

        let monitored = match config.monitor {
            MonitorMetric::MeanAuc => report.metrics.mean_auc,
            MonitorMetric::TargetF1 => report.metrics.target_f1().unwrap_or(f64::NAN),
        };
        match checkpoints.observe(epoch, monitored) {
            Observation::Improved => {
                let meta = checkpoints.save::<B, M>(&model, epoch, monitored)?;
                forward_to_sink(sink.name(), sink.log_checkpoint(&meta));
            }
            Observation::NoImprovement { .. } => {}
            Observation::EarlyStop => {
                info!(
                    "Early stopping at epoch {}: no improvement in {} for {} epochs",
                    epoch, config.monitor, config.training.patience
                );
                stopped_early = true;
                break;
            }
        }
    }

    let checkpoint = checkpoints.best_checkpoint()?.to_path_buf();
    let (best_epoch, best_value) = checkpoints
        .best_meta()
        .map(|meta| (meta.epoch, meta.metric_value))
        .unwrap_or((0, checkpoints.best_value()));
    info!(
        "Reloading best checkpoint from epoch {} ({} = {:.4})",
        best_epoch, config.monitor, best_value
    );

    let model = model.load_file(&checkpoint, &CompactRecorder::new(), device)?;
    let test_report = evaluate::<B::InnerBackend, _>(
        &model.valid(),
        &test,
        &loss_kind,
        target,
        device,
        DataSplit::Test.to_string().as_str(),
    )?;

    let final_record = FinalRecord {
        test_loss: test_report.loss,
        test_auc: test_report.metrics.mean_auc,
        test_f1: test_report.metrics.macro_f1,
        test_target_f1: test_report.metrics.target_f1(),
        test_target_threshold: test_report.metrics.target.as_ref().map(|t| t.threshold),
        per_class_auc: test_report.metrics.per_class_auc.clone(),
        per_class_f1: test_report.metrics.per_class_f1.clone(),
        checkpoint: checkpoint.clone(),
    };
    info!(
        test_loss = final_record.test_loss,
        test_auc = final_record.test_auc,
        test_f1 = final_record.test_f1,
        test_target_f1 = final_record.test_target_f1,
        "Test evaluation complete"
    );
    forward_to_sink(sink.name(), sink.log_final(&final_record));

    Ok(RunOutcome {
        run_dir: run_dir.to_path_buf(),
        epochs_run: history.len(),
        stopped_early,
        best_epoch,
        best_value,
        checkpoint,
        test: test_report,
        history,
    })
}

//! Training CLI Tool
//!
//! Trains a 14-finding chest X-ray classifier from a preset or a TOML
//! configuration, writes checkpoints and metrics into a fresh run directory,
//! and evaluates the best checkpoint on the held-out test partition.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use burn::tensor::backend::Backend;
use clap::{Parser, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::info;
use xray_core::{resolve_device, setup_cli_logging, ConfigOverrides, Device, RunConfig};
use xray_dataset::build_dataset;
use xray_training::{
    backend_name, create_run_dir, default_device, open_sink, run_experiment, CheckpointMeta,
    EpochRecord, FinalRecord, MetricSink, TrainingBackend, XrayClassifier,
};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum Preset {
    /// Dense CNN, record-level split, Pneumonia oversampling
    Densenet,
    /// Vision transformer, patient-level split, focal loss
    Vit,
}

/// Chest X-ray Multi-label Training Tool
#[derive(Parser, Debug)]
#[command(
    name = "train",
    about = "Train chest X-ray multi-label classifiers",
    long_about = "Train a 14-finding chest X-ray classifier with early stopping on a \
                  validation metric, then evaluate the best checkpoint on the test partition."
)]
struct Args {
    /// Path to run configuration file (TOML); overrides --preset
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Built-in configuration to start from
    #[arg(short, long, value_enum, default_value = "densenet")]
    preset: Preset,

    /// Override data root
    #[arg(short, long, value_name = "DIR")]
    data: Option<PathBuf>,

    /// Override output directory
    #[arg(short, long, value_name = "DIR")]
    output: Option<PathBuf>,

    /// Override number of epochs
    #[arg(short, long, value_name = "N")]
    epochs: Option<usize>,

    /// Override learning rate
    #[arg(short, long, value_name = "LR")]
    lr: Option<f64>,

    /// Override batch size
    #[arg(short, long, value_name = "SIZE")]
    batch_size: Option<usize>,

    /// Override early-stopping patience
    #[arg(long, value_name = "N")]
    patience: Option<usize>,

    /// Override decode worker count
    #[arg(long, value_name = "N")]
    workers: Option<usize>,

    /// Override random seed
    #[arg(long)]
    seed: Option<u64>,

    /// Override image size
    #[arg(long, value_name = "PX")]
    image_size: Option<usize>,

    /// Override device (cpu, gpu, gpu:N)
    #[arg(long)]
    device: Option<Device>,

    /// Pretrained weights record
    #[arg(long, value_name = "FILE")]
    pretrained: Option<PathBuf>,

    /// Validate and print the configuration without training
    #[arg(long)]
    dry_run: bool,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
}

impl Args {
    fn overrides(&self) -> ConfigOverrides {
        ConfigOverrides {
            data_root: self.data.clone(),
            output_dir: self.output.clone(),
            num_epochs: self.epochs,
            batch_size: self.batch_size,
            learning_rate: self.lr,
            patience: self.patience,
            num_workers: self.workers,
            seed: self.seed,
            image_size: self.image_size,
            device: self.device,
            pretrained_path: self.pretrained.clone(),
        }
    }
}

/// Forwards records to the run's sink and advances an epoch progress bar
struct ProgressSink {
    inner: Box<dyn MetricSink>,
    bar: ProgressBar,
}

impl MetricSink for ProgressSink {
    fn log_epoch(&mut self, record: &EpochRecord) -> xray_core::Result<()> {
        self.bar.set_message(format!(
            "loss {:.4} | val_auc {:.4} | val_f1 {:.4}",
            record.train_loss, record.val_auc, record.val_f1
        ));
        self.bar.inc(1);
        self.inner.log_epoch(record)
    }

    fn log_final(&mut self, record: &FinalRecord) -> xray_core::Result<()> {
        self.bar.finish_with_message(format!("test_auc {:.4}", record.test_auc));
        self.inner.log_final(record)
    }

    fn log_checkpoint(&mut self, meta: &CheckpointMeta) -> xray_core::Result<()> {
        self.inner.log_checkpoint(meta)
    }

    fn name(&self) -> &'static str {
        self.inner.name()
    }
}

fn load_config(args: &Args) -> Result<RunConfig> {
    let base = match &args.config {
        Some(path) => RunConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration file: {}", path.display()))?,
        None => match args.preset {
            Preset::Densenet => RunConfig::densenet_preset(),
            Preset::Vit => RunConfig::vit_preset(),
        },
    };
    let config = base.with_overrides(&args.overrides());
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

/// Input errors exit with 2, everything else with 1
fn exit_code(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<xray_core::Error>() {
        Some(e) if e.is_input_error() => 2,
        _ => 1,
    }
}

fn main() -> ExitCode {
    match run(Args::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("Error: {err:#}");
            ExitCode::from(exit_code(&err))
        }
    }
}

fn run(args: Args) -> Result<()> {
    setup_cli_logging(args.verbose)?;

    info!("Chest X-ray Multi-label Classification - Training Tool");
    info!("======================================================");

    let config = load_config(&args)?;
    if args.dry_run {
        println!("{}", toml::to_string_pretty(&config)?);
        info!("Configuration validated successfully (dry run)");
        return Ok(());
    }

    let device = default_device(resolve_device(config.device));
    info!("Backend: {}", backend_name());
    TrainingBackend::seed(config.seed);

    let prepared = build_dataset(&config).context("Failed to prepare dataset")?;
    let (run_id, run_dir) = create_run_dir(&config).context("Failed to create run directory")?;

    let bar = ProgressBar::new(config.training.num_epochs as u64);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] epoch {pos}/{len} {msg}")?
            .progress_chars("#>-"),
    );
    let mut sink = ProgressSink {
        inner: open_sink(config.sink, &run_dir),
        bar,
    };

    let model = XrayClassifier::<TrainingBackend>::from_config(&config, &device)
        .context("Failed to build model")?;

    let outcome = run_experiment::<TrainingBackend, _>(
        &config,
        model,
        &prepared,
        &run_dir,
        &mut sink,
        &device,
    )
    .with_context(|| format!("Run {run_id} failed"))?;

    info!("Run {} finished after {} epochs", run_id, outcome.epochs_run);
    if outcome.stopped_early {
        info!("Stopped early; best {} = {:.4} at epoch {}", config.monitor, outcome.best_value, outcome.best_epoch);
    }
    info!("Best checkpoint: {}", outcome.checkpoint.display());
    info!(
        "Test: loss {:.4} | mean AUC {:.4} | macro F1 {:.4}",
        outcome.test.loss, outcome.test.metrics.mean_auc, outcome.test.metrics.macro_f1
    );
    if let Some(target) = &outcome.test.metrics.target {
        info!(
            "Test {}: F1 {:.4} at threshold {:.4}",
            target.disease, target.f1, target.threshold
        );
    }

    Ok(())
}

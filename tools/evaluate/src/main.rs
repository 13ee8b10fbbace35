//! Evaluation CLI Tool
//!
//! Reloads a checkpoint from a finished run and evaluates it on one data
//! partition. The partitions are rebuilt from the run's saved configuration,
//! so the same seed reproduces the same split.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{Context, Result};
use burn::module::Module;
use burn::record::CompactRecorder;
use clap::Parser;
use tracing::info;
use xray_core::{resolve_device, setup_cli_logging, DataSplit, RunConfig};
use xray_dataset::build_dataset;
use xray_training::experiment::RUN_CONFIG_FILE;
use xray_training::{
    backend_name, default_device, evaluate, partition_source, CheckpointManager, DefaultBackend,
    LossKind, XrayClassifier,
};

/// Chest X-ray Checkpoint Evaluation Tool
#[derive(Parser, Debug)]
#[command(
    name = "evaluate",
    about = "Evaluate a saved chest X-ray checkpoint",
    long_about = "Reload the latest (or a given) checkpoint of a run and report loss, \
                  per-class AUC-ROC and F1 on one partition as JSON."
)]
struct Args {
    /// Run directory produced by the train tool
    #[arg(short, long, value_name = "DIR")]
    run_dir: PathBuf,

    /// Checkpoint record; defaults to the latest in the run directory
    #[arg(short, long, value_name = "FILE")]
    checkpoint: Option<PathBuf>,

    /// Partition to evaluate (train, validation, test)
    #[arg(short, long, default_value = "test")]
    split: DataSplit,

    /// Override data root
    #[arg(short, long, value_name = "DIR")]
    data: Option<PathBuf>,

    /// Write the JSON report to this file instead of stdout
    #[arg(short, long, value_name = "FILE")]
    output: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    verbose: bool,
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

    info!("Chest X-ray Multi-label Classification - Evaluation Tool");
    info!("========================================================");

    let config_path = args.run_dir.join(RUN_CONFIG_FILE);
    let mut config = RunConfig::from_file(&config_path)
        .with_context(|| format!("Failed to load run configuration: {}", config_path.display()))?;
    if let Some(root) = &args.data {
        config.data.data_root = root.clone();
    }
    // The run's weights already include any pretrained backbone
    config.model.pretrained_path = None;

    let checkpoint = match &args.checkpoint {
        Some(path) => path.clone(),
        None => CheckpointManager::latest_in_dir(&args.run_dir)
            .context("No checkpoint to evaluate")?,
    };
    info!("Loading checkpoint: {}", checkpoint.display());
    if let Ok(meta) = CheckpointManager::read_meta(&checkpoint) {
        info!(
            "Checkpoint from epoch {} ({} = {:.4})",
            meta.epoch, meta.metric_name, meta.metric_value
        );
    }

    let device = default_device(resolve_device(config.device));
    info!("Backend: {}", backend_name());
    let model = XrayClassifier::<DefaultBackend>::from_config(&config, &device)?
        .load_file(&checkpoint, &CompactRecorder::new(), &device)
        .map_err(xray_core::Error::from)
        .context("Failed to load checkpoint weights")?;

    let prepared = build_dataset(&config).context("Failed to prepare dataset")?;
    let source = partition_source(&config, &prepared, args.split)?;
    info!("Evaluating {} records from the {} partition", source.len(), args.split);

    let report = evaluate::<DefaultBackend, _>(
        &model,
        &source,
        &LossKind::from_strategy(&config.imbalance),
        config.target_index(),
        &device,
        args.split.to_string().as_str(),
    )?;

    let json = serde_json::to_string_pretty(&report)?;
    match &args.output {
        Some(path) => {
            std::fs::write(path, json)
                .with_context(|| format!("Failed to write report: {}", path.display()))?;
            info!("Report written to {}", path.display());
        }
        None => println!("{json}"),
    }

    Ok(())
}

//! Best-model checkpointing and early stopping.
//!
//! This module provides:
//! - Monitored-metric tracking with a patience counter
//! - Saving improved models as `best_model_<YYYYMMDD-HHMMSS>_<seq>.mpk`
//!   with a JSON metadata sidecar
//! - An in-memory pointer to the best checkpoint
//! - Lookup of the latest checkpoint in an existing run directory

use std::fs;
use std::path::{Path, PathBuf};

use burn::{module::Module, record::CompactRecorder, tensor::backend::Backend};
use chrono::Local;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};
use xray_core::{Error, Result};

/// File name prefix shared by every checkpoint
pub const CHECKPOINT_PREFIX: &str = "best_model_";

/// Extension written by [`CompactRecorder`]
const RECORD_EXTENSION: &str = "mpk";

/// Outcome of observing one epoch's monitored metric
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// New best value; the model should be saved
    Improved,
    /// No improvement; `counter` epochs since the last one
    NoImprovement { counter: usize },
    /// Patience exhausted
    EarlyStop,
}

/// Metadata written next to each checkpoint
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CheckpointMeta {
    pub epoch: usize,
    pub metric_name: String,
    pub metric_value: f64,
    pub timestamp: String,
    pub sequence: usize,
    /// Path of the `.mpk` record
    pub path: PathBuf,
}

/// Tracks the best monitored value and owns the checkpoint files of one run
#[derive(Debug)]
pub struct CheckpointManager {
    checkpoint_dir: PathBuf,
    patience: usize,
    metric_name: String,
    best_value: f64,
    patience_counter: usize,
    sequence: usize,
    best: Option<CheckpointMeta>,
}

impl CheckpointManager {
    /// The baseline is zero, so the first finite positive value improves on it
    pub fn new(checkpoint_dir: impl Into<PathBuf>, patience: usize, metric_name: impl Into<String>) -> Self {
        Self {
            checkpoint_dir: checkpoint_dir.into(),
            patience,
            metric_name: metric_name.into(),
            best_value: 0.0,
            patience_counter: 0,
            sequence: 0,
            best: None,
        }
    }

    /// Compare `value` against the best so far.
    ///
    /// NaN never improves. [`Observation::EarlyStop`] is returned on the epoch
    /// where the counter reaches the patience.
    pub fn observe(&mut self, epoch: usize, value: f64) -> Observation {
        if value > self.best_value {
            debug!(
                "Epoch {}: {} improved from {:.4} to {:.4}",
                epoch, self.metric_name, self.best_value, value
            );
            self.best_value = value;
            self.patience_counter = 0;
            return Observation::Improved;
        }

        self.patience_counter += 1;
        info!(
            "Epoch {}: no improvement in {} ({:.4} <= {:.4}), patience {}/{}",
            epoch, self.metric_name, value, self.best_value, self.patience_counter, self.patience
        );
        if self.patience_counter >= self.patience {
            Observation::EarlyStop
        } else {
            Observation::NoImprovement {
                counter: self.patience_counter,
            }
        }
    }

    /// Persist `model` as the new best checkpoint
    pub fn save<B: Backend, M: Module<B>>(
        &mut self,
        model: &M,
        epoch: usize,
        value: f64,
    ) -> Result<CheckpointMeta> {
        fs::create_dir_all(&self.checkpoint_dir)?;

        self.sequence += 1;
        let timestamp = Local::now().format("%Y%m%d-%H%M%S").to_string();
        let stem = format!("{CHECKPOINT_PREFIX}{timestamp}_{:03}", self.sequence);
        let base = self.checkpoint_dir.join(&stem);

        model.clone().save_file(&base, &CompactRecorder::new())?;

        let meta = CheckpointMeta {
            epoch,
            metric_name: self.metric_name.clone(),
            metric_value: value,
            timestamp,
            sequence: self.sequence,
            path: base.with_extension(RECORD_EXTENSION),
        };
        let json = serde_json::to_string_pretty(&meta)?;
        fs::write(base.with_extension("json"), json)?;

        info!(
            "Saved checkpoint for epoch {} ({} = {:.4}) to {}",
            epoch,
            self.metric_name,
            value,
            meta.path.display()
        );
        self.best = Some(meta.clone());
        Ok(meta)
    }

    /// Record path of the best checkpoint written so far
    pub fn best_checkpoint(&self) -> Result<&Path> {
        self.best
            .as_ref()
            .map(|meta| meta.path.as_path())
            .ok_or_else(|| {
                Error::NoCheckpointFound(format!("no improved epoch in {}", self.checkpoint_dir.display()))
            })
    }

    pub fn best_meta(&self) -> Option<&CheckpointMeta> {
        self.best.as_ref()
    }

    pub fn best_value(&self) -> f64 {
        self.best_value
    }

    /// Lexicographically-last checkpoint record in `dir`
    pub fn latest_in_dir(dir: &Path) -> Result<PathBuf> {
        if !dir.is_dir() {
            return Err(Error::NoCheckpointFound(format!("{} is not a directory", dir.display())));
        }

        let mut checkpoints = Vec::new();
        for entry in fs::read_dir(dir)? {
            let path = entry?.path();
            let is_record = path.extension().and_then(|s| s.to_str()) == Some(RECORD_EXTENSION);
            let is_checkpoint = path
                .file_name()
                .and_then(|s| s.to_str())
                .is_some_and(|name| name.starts_with(CHECKPOINT_PREFIX));
            if path.is_file() && is_record && is_checkpoint {
                checkpoints.push(path);
            }
        }

        checkpoints.sort();
        checkpoints
            .pop()
            .ok_or_else(|| Error::NoCheckpointFound(format!("no checkpoints in {}", dir.display())))
    }

    /// Read the sidecar of a checkpoint record
    pub fn read_meta(record_path: &Path) -> Result<CheckpointMeta> {
        let json = fs::read_to_string(record_path.with_extension("json"))?;
        Ok(serde_json::from_str(&json)?)
    }
}

//! Metric sinks receiving per-epoch and final records.
//!
//! A sink never aborts a run: [`open_sink`] degrades an unavailable sink to
//! [`NoopSink`], and the returned sink disables itself after its first
//! failed write.

use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use xray_core::{Error, Result, SinkKind};

use crate::checkpoint::CheckpointMeta;

/// File name of the JSON-lines sink inside a run directory
pub const METRICS_FILE: &str = "metrics.jsonl";

/// Per-epoch training and validation summary
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EpochRecord {
    pub epoch: usize,
    pub train_loss: f64,
    pub val_loss: f64,
    pub val_auc: f64,
    pub val_f1: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub val_target_f1: Option<f64>,
    pub learning_rate: f64,
    pub per_class_auc: BTreeMap<String, f64>,
    pub per_class_f1: BTreeMap<String, f64>,
}

/// Test-partition summary written once at the end of a run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct FinalRecord {
    pub test_loss: f64,
    pub test_auc: f64,
    pub test_f1: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_target_f1: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub test_target_threshold: Option<f64>,
    pub per_class_auc: BTreeMap<String, f64>,
    pub per_class_f1: BTreeMap<String, f64>,
    pub checkpoint: PathBuf,
}

/// Destination for run metrics
pub trait MetricSink: Send {
    fn log_epoch(&mut self, record: &EpochRecord) -> Result<()>;

    fn log_final(&mut self, record: &FinalRecord) -> Result<()>;

    fn log_checkpoint(&mut self, meta: &CheckpointMeta) -> Result<()>;

    fn name(&self) -> &'static str;
}

/// Discards everything
#[derive(Debug, Default, Clone, Copy)]
pub struct NoopSink;

impl MetricSink for NoopSink {
    fn log_epoch(&mut self, _record: &EpochRecord) -> Result<()> {
        Ok(())
    }

    fn log_final(&mut self, _record: &FinalRecord) -> Result<()> {
        Ok(())
    }

    fn log_checkpoint(&mut self, _meta: &CheckpointMeta) -> Result<()> {
        Ok(())
    }

    fn name(&self) -> &'static str {
        "disabled"
    }
}

/// Emits records as structured `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl MetricSink for TracingSink {
    fn log_epoch(&mut self, record: &EpochRecord) -> Result<()> {
        info!(
            epoch = record.epoch,
            train_loss = record.train_loss,
            val_loss = record.val_loss,
            val_auc = record.val_auc,
            val_f1 = record.val_f1,
            val_target_f1 = record.val_target_f1,
            learning_rate = record.learning_rate,
            "epoch metrics"
        );
        Ok(())
    }

    fn log_final(&mut self, record: &FinalRecord) -> Result<()> {
        info!(
            test_loss = record.test_loss,
            test_auc = record.test_auc,
            test_f1 = record.test_f1,
            test_target_f1 = record.test_target_f1,
            test_target_threshold = record.test_target_threshold,
            checkpoint = %record.checkpoint.display(),
            "final test metrics"
        );
        Ok(())
    }

    fn log_checkpoint(&mut self, meta: &CheckpointMeta) -> Result<()> {
        info!(
            epoch = meta.epoch,
            metric = %meta.metric_name,
            value = meta.metric_value,
            path = %meta.path.display(),
            "checkpoint"
        );
        Ok(())
    }

    fn name(&self) -> &'static str {
        "tracing"
    }
}

#[derive(Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum Line<'a> {
    Epoch(&'a EpochRecord),
    Final(&'a FinalRecord),
    Checkpoint(&'a CheckpointMeta),
}

/// Appends one JSON object per record to `metrics.jsonl`
#[derive(Debug)]
pub struct JsonlSink {
    path: PathBuf,
    writer: BufWriter<File>,
}

impl JsonlSink {
    pub fn create(run_dir: &Path) -> Result<Self> {
        let path = run_dir.join(METRICS_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|e| Error::SinkUnavailable(format!("{}: {e}", path.display())))?;
        Ok(Self {
            path,
            writer: BufWriter::new(file),
        })
    }

    fn write_line(&mut self, line: &Line<'_>) -> Result<()> {
        let json = serde_json::to_string(line)?;
        writeln!(self.writer, "{json}")
            .and_then(|_| self.writer.flush())
            .map_err(|e| Error::SinkUnavailable(format!("{}: {e}", self.path.display())))
    }
}

impl MetricSink for JsonlSink {
    fn log_epoch(&mut self, record: &EpochRecord) -> Result<()> {
        self.write_line(&Line::Epoch(record))
    }

    fn log_final(&mut self, record: &FinalRecord) -> Result<()> {
        self.write_line(&Line::Final(record))
    }

    fn log_checkpoint(&mut self, meta: &CheckpointMeta) -> Result<()> {
        self.write_line(&Line::Checkpoint(meta))
    }

    fn name(&self) -> &'static str {
        "jsonl"
    }
}

/// Wraps a sink and stops forwarding after its first failure
pub struct GuardedSink {
    inner: Box<dyn MetricSink>,
    disabled: bool,
}

impl GuardedSink {
    pub fn new(inner: Box<dyn MetricSink>) -> Self {
        Self {
            inner,
            disabled: false,
        }
    }

    pub fn is_disabled(&self) -> bool {
        self.disabled
    }

    fn guard(&mut self, outcome: impl FnOnce(&mut dyn MetricSink) -> Result<()>) -> Result<()> {
        if self.disabled {
            return Ok(());
        }
        if let Err(e) = outcome(self.inner.as_mut()) {
            warn!("Metric sink '{}' failed, disabling it: {}", self.inner.name(), e);
            self.disabled = true;
        }
        Ok(())
    }
}

impl MetricSink for GuardedSink {
    fn log_epoch(&mut self, record: &EpochRecord) -> Result<()> {
        self.guard(|sink| sink.log_epoch(record))
    }

    fn log_final(&mut self, record: &FinalRecord) -> Result<()> {
        self.guard(|sink| sink.log_final(record))
    }

    fn log_checkpoint(&mut self, meta: &CheckpointMeta) -> Result<()> {
        self.guard(|sink| sink.log_checkpoint(meta))
    }

    fn name(&self) -> &'static str {
        if self.disabled {
            "disabled"
        } else {
            self.inner.name()
        }
    }
}

/// Open the configured sink for a run directory
pub fn open_sink(kind: SinkKind, run_dir: &Path) -> Box<dyn MetricSink> {
    let inner: Box<dyn MetricSink> = match kind {
        SinkKind::Jsonl => match JsonlSink::create(run_dir) {
            Ok(sink) => Box::new(sink),
            Err(e) => {
                warn!("{e}; continuing without metric logging");
                Box::new(NoopSink)
            }
        },
        SinkKind::Tracing => Box::new(TracingSink),
        SinkKind::Disabled => Box::new(NoopSink),
    };
    Box::new(GuardedSink::new(inner))
}

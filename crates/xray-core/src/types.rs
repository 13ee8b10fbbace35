//! Core type definitions for the chest X-ray experiment harness.

use serde::{Deserialize, Serialize};

/// Number of findings predicted by every backbone
pub const NUM_DISEASES: usize = 14;

/// Sentinel finding label for images without any pathology
pub const NO_FINDING: &str = "No Finding";

/// Fixed finding order defining the label-vector axis
pub const DISEASES: [&str; NUM_DISEASES] = [
    "Atelectasis",
    "Cardiomegaly",
    "Consolidation",
    "Edema",
    "Effusion",
    "Emphysema",
    "Fibrosis",
    "Hernia",
    "Infiltration",
    "Mass",
    "Nodule",
    "Pleural_Thickening",
    "Pneumonia",
    "Pneumothorax",
];

/// Get the label index for a finding name
pub fn disease_index(name: &str) -> Option<usize> {
    DISEASES.iter().position(|&d| d == name)
}

/// Data split type
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum DataSplit {
    /// Training data
    Train,
    /// Validation data
    Validation,
    /// Test data
    Test,
}

impl std::fmt::Display for DataSplit {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DataSplit::Train => write!(f, "train"),
            DataSplit::Validation => write!(f, "validation"),
            DataSplit::Test => write!(f, "test"),
        }
    }
}

impl std::str::FromStr for DataSplit {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "train" => Ok(DataSplit::Train),
            "val" | "validation" => Ok(DataSplit::Validation),
            "test" => Ok(DataSplit::Test),
            other => Err(format!("unknown partition '{other}'")),
        }
    }
}

/// Backbone architecture mapping an image batch to 14 logits
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum BackboneKind {
    /// Densely-connected convolutional network
    ConvNet,
    /// Patch-based vision transformer
    VisionTransformer,
}

impl std::fmt::Display for BackboneKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BackboneKind::ConvNet => write!(f, "convnet"),
            BackboneKind::VisionTransformer => write!(f, "vit"),
        }
    }
}

/// How filtered records are partitioned into train/validation/test
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SplitPolicy {
    /// Split by record; one patient may appear in several partitions
    RecordLevel,
    /// Split by unique patient identifier; no patient leaks across partitions
    PatientLevel,
}

impl std::fmt::Display for SplitPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SplitPolicy::RecordLevel => write!(f, "record_level"),
            SplitPolicy::PatientLevel => write!(f, "patient_level"),
        }
    }
}

/// Class-imbalance mitigation; exactly one is active per run
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ImbalanceStrategy {
    /// Resample the minority side of the target finding in the training partition
    Oversampling,
    /// Keep partitions as-is and train with focal loss
    FocalLoss { alpha: f64, gamma: f64 },
}

impl ImbalanceStrategy {
    /// Focal loss with the default `alpha = 1`, `gamma = 2`
    pub fn focal() -> Self {
        ImbalanceStrategy::FocalLoss {
            alpha: 1.0,
            gamma: 2.0,
        }
    }
}

impl std::fmt::Display for ImbalanceStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ImbalanceStrategy::Oversampling => write!(f, "oversampling"),
            ImbalanceStrategy::FocalLoss { alpha, gamma } => {
                write!(f, "focal_loss(alpha={alpha}, gamma={gamma})")
            }
        }
    }
}

/// Validation metric consulted for checkpointing and early stopping
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum MonitorMetric {
    /// Mean of per-class AUC-ROC
    MeanAuc,
    /// F1 of the target finding at its optimal threshold
    TargetF1,
}

impl std::fmt::Display for MonitorMetric {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            MonitorMetric::MeanAuc => write!(f, "val_auc"),
            MonitorMetric::TargetF1 => write!(f, "val_target_f1"),
        }
    }
}

/// Destination for structured metric records
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum SinkKind {
    /// JSON lines file inside the run directory
    Jsonl,
    /// Structured `tracing` events
    Tracing,
    /// Discard everything
    Disabled,
}

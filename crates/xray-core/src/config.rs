//! Run configuration for the chest X-ray experiment harness.
//!
//! A [`RunConfig`] is built once at run start (from a preset, a TOML file, or
//! both plus CLI overrides), validated, and then only ever borrowed.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::backend::Device;
use crate::error::{Error, Result};
use crate::types::{
    disease_index, BackboneKind, ImbalanceStrategy, MonitorMetric, SinkKind, SplitPolicy,
};

/// Immutable record of every hyperparameter of one run
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RunConfig {
    /// Model configuration
    pub model: ModelConfig,
    /// Training hyperparameters
    pub training: TrainingParams,
    /// Data layout
    pub data: DataConfig,
    /// Record-level or patient-level partitioning
    pub split_policy: SplitPolicy,
    /// Class-imbalance mitigation
    pub imbalance: ImbalanceStrategy,
    /// Validation metric driving checkpointing and early stopping
    pub monitor: MonitorMetric,
    /// Finding whose decision threshold is tuned and which oversampling targets
    pub target_disease: Option<String>,
    /// Preferred device
    pub device: Device,
    /// Random seed for splits, resampling, shuffling and augmentation
    pub seed: u64,
    /// Square side length of the transformed image tensor
    pub image_size: usize,
    /// Directory receiving one subdirectory per run
    pub output_dir: PathBuf,
    /// Metric sink
    pub sink: SinkKind,
}

impl Default for RunConfig {
    fn default() -> Self {
        Self::densenet_preset()
    }
}

/// Model configuration
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelConfig {
    /// Backbone architecture
    pub backbone: BackboneKind,
    /// Record file holding pretrained backbone weights
    pub pretrained_path: Option<PathBuf>,
    /// Dropout rate before the classification head
    pub dropout: f64,
    /// Patch side length for the vision transformer
    pub patch_size: usize,
    /// Embedding width for the vision transformer
    pub embed_dim: usize,
    /// Encoder depth for the vision transformer
    pub depth: usize,
    /// Attention heads for the vision transformer
    pub num_heads: usize,
    /// Growth rate for the dense convolutional network
    pub growth_rate: usize,
    /// Layers per dense block
    pub block_layers: Vec<usize>,
}

impl ModelConfig {
    /// Dense convolutional network defaults
    pub fn convnet() -> Self {
        Self {
            backbone: BackboneKind::ConvNet,
            pretrained_path: None,
            dropout: 0.0,
            patch_size: 16,
            embed_dim: 192,
            depth: 6,
            num_heads: 3,
            growth_rate: 32,
            block_layers: vec![6, 12, 24, 16],
        }
    }

    /// Vision transformer defaults
    pub fn vit() -> Self {
        Self {
            backbone: BackboneKind::VisionTransformer,
            dropout: 0.1,
            ..Self::convnet()
        }
    }
}

/// Training hyperparameters
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct TrainingParams {
    /// Epoch budget
    pub num_epochs: usize,
    /// Batch size
    pub batch_size: usize,
    /// Initial learning rate
    pub learning_rate: f64,
    /// Adam weight decay
    pub weight_decay: f64,
    /// Epochs without improvement before early stopping
    pub patience: usize,
    /// Parallel decode workers
    pub num_workers: usize,
    /// Learning rate schedule
    pub lr_schedule: LrSchedule,
}

impl Default for TrainingParams {
    fn default() -> Self {
        Self {
            num_epochs: 20,
            batch_size: 16,
            learning_rate: 1e-3,
            weight_decay: 1e-5,
            patience: 5,
            num_workers: 8,
            lr_schedule: LrSchedule::default(),
        }
    }
}

/// Learning rate schedule, stepped once per epoch after validation
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum LrSchedule {
    /// Constant learning rate
    Constant,
    /// Multiply by `factor` once validation loss has not improved for more
    /// than `patience` epochs
    ReduceOnPlateau {
        factor: f64,
        patience: usize,
        threshold: f64,
        min_lr: f64,
    },
}

impl LrSchedule {
    /// Reduce-on-plateau with the given patience and a factor of 0.1
    pub fn plateau(patience: usize) -> Self {
        LrSchedule::ReduceOnPlateau {
            factor: 0.1,
            patience,
            threshold: 1e-4,
            min_lr: 0.0,
        }
    }
}

impl Default for LrSchedule {
    fn default() -> Self {
        Self::plateau(3)
    }
}

/// Image store and metadata layout
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DataConfig {
    /// Root directory containing the image folders and the metadata file
    pub data_root: PathBuf,
    /// Folder name prefix, e.g. `images_`
    pub folder_prefix: String,
    /// First folder number (inclusive)
    pub folder_start: usize,
    /// Last folder number (inclusive)
    pub folder_end: usize,
    /// Zero-padding width of the folder number
    pub folder_width: usize,
    /// Nested directory inside each folder holding the images
    pub images_subdir: Option<String>,
    /// Metadata CSV file name relative to `data_root`
    pub metadata_file: String,
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            data_root: PathBuf::from("data/nih"),
            folder_prefix: "images_".to_string(),
            folder_start: 1,
            folder_end: 12,
            folder_width: 3,
            images_subdir: Some("images".to_string()),
            metadata_file: "Data_Entry_2017.csv".to_string(),
        }
    }
}

impl DataConfig {
    /// Image directories to scan, in scan order
    pub fn folders(&self) -> Vec<PathBuf> {
        (self.folder_start..=self.folder_end)
            .map(|i| {
                let name = format!(
                    "{}{:0width$}",
                    self.folder_prefix,
                    i,
                    width = self.folder_width
                );
                let folder = self.data_root.join(name);
                match &self.images_subdir {
                    Some(sub) => folder.join(sub),
                    None => folder,
                }
            })
            .collect()
    }

    /// Full path of the metadata CSV
    pub fn metadata_path(&self) -> PathBuf {
        self.data_root.join(&self.metadata_file)
    }
}

/// CLI-level overrides applied on top of a preset or file
#[derive(Debug, Clone, Default)]
pub struct ConfigOverrides {
    pub data_root: Option<PathBuf>,
    pub output_dir: Option<PathBuf>,
    pub num_epochs: Option<usize>,
    pub batch_size: Option<usize>,
    pub learning_rate: Option<f64>,
    pub patience: Option<usize>,
    pub num_workers: Option<usize>,
    pub seed: Option<u64>,
    pub image_size: Option<usize>,
    pub device: Option<Device>,
    pub pretrained_path: Option<PathBuf>,
}

impl RunConfig {
    /// Convolutional backbone, record-level split, Pneumonia oversampling,
    /// early stopping on Pneumonia F1
    pub fn densenet_preset() -> Self {
        Self {
            model: ModelConfig::convnet(),
            training: TrainingParams {
                learning_rate: 1e-3,
                num_workers: 8,
                lr_schedule: LrSchedule::plateau(5),
                ..TrainingParams::default()
            },
            data: DataConfig::default(),
            split_policy: SplitPolicy::RecordLevel,
            imbalance: ImbalanceStrategy::Oversampling,
            monitor: MonitorMetric::TargetF1,
            target_disease: Some("Pneumonia".to_string()),
            device: Device::Cpu,
            seed: 42,
            image_size: 224,
            output_dir: PathBuf::from("models"),
            sink: SinkKind::Jsonl,
        }
    }

    /// Vision transformer, patient-level split, focal loss,
    /// early stopping on mean AUC
    pub fn vit_preset() -> Self {
        Self {
            model: ModelConfig::vit(),
            training: TrainingParams {
                learning_rate: 1e-4,
                num_workers: 1,
                lr_schedule: LrSchedule::plateau(3),
                ..TrainingParams::default()
            },
            split_policy: SplitPolicy::PatientLevel,
            imbalance: ImbalanceStrategy::focal(),
            monitor: MonitorMetric::MeanAuc,
            target_disease: None,
            ..Self::densenet_preset()
        }
    }

    /// Load a configuration from a TOML file and validate it
    pub fn from_file(path: &Path) -> Result<Self> {
        let config: RunConfig = crate::cli::load_toml_config(path)?;
        config.validate()?;
        Ok(config)
    }

    /// Return a copy with the given overrides applied
    pub fn with_overrides(&self, overrides: &ConfigOverrides) -> Self {
        let mut config = self.clone();
        if let Some(root) = &overrides.data_root {
            config.data.data_root = root.clone();
        }
        if let Some(dir) = &overrides.output_dir {
            config.output_dir = dir.clone();
        }
        if let Some(epochs) = overrides.num_epochs {
            config.training.num_epochs = epochs;
        }
        if let Some(batch_size) = overrides.batch_size {
            config.training.batch_size = batch_size;
        }
        if let Some(lr) = overrides.learning_rate {
            config.training.learning_rate = lr;
        }
        if let Some(patience) = overrides.patience {
            config.training.patience = patience;
        }
        if let Some(workers) = overrides.num_workers {
            config.training.num_workers = workers;
        }
        if let Some(seed) = overrides.seed {
            config.seed = seed;
        }
        if let Some(size) = overrides.image_size {
            config.image_size = size;
        }
        if let Some(device) = overrides.device {
            config.device = device;
        }
        if let Some(path) = &overrides.pretrained_path {
            config.model.pretrained_path = Some(path.clone());
        }
        config
    }

    /// Label index of the target finding, if one is configured
    pub fn target_index(&self) -> Option<usize> {
        self.target_disease.as_deref().and_then(disease_index)
    }

    /// Check value ranges and cross-field requirements
    pub fn validate(&self) -> Result<()> {
        if self.training.batch_size == 0 {
            return Err(Error::Config("batch_size must be positive".to_string()));
        }
        if self.training.num_epochs == 0 {
            return Err(Error::Config("num_epochs must be positive".to_string()));
        }
        if self.training.patience == 0 {
            return Err(Error::Config("patience must be positive".to_string()));
        }
        if !(self.training.learning_rate > 0.0) {
            return Err(Error::Config(format!(
                "learning_rate must be positive, got {}",
                self.training.learning_rate
            )));
        }
        if self.training.weight_decay < 0.0 {
            return Err(Error::Config("weight_decay must be non-negative".to_string()));
        }
        if !(0.0..1.0).contains(&self.model.dropout) {
            return Err(Error::Config(format!(
                "dropout must be in [0, 1), got {}",
                self.model.dropout
            )));
        }
        if self.data.folder_start > self.data.folder_end {
            return Err(Error::Config(format!(
                "folder range {}..={} is empty",
                self.data.folder_start, self.data.folder_end
            )));
        }

        if self.model.backbone == BackboneKind::VisionTransformer {
            let patch = self.model.patch_size;
            if patch == 0 || self.image_size < patch || self.image_size % patch != 0 {
                return Err(Error::Config(format!(
                    "image_size {} must be a positive multiple of patch_size {}",
                    self.image_size, patch
                )));
            }
            if self.model.num_heads == 0 || self.model.embed_dim % self.model.num_heads != 0 {
                return Err(Error::Config(format!(
                    "embed_dim {} must be divisible by num_heads {}",
                    self.model.embed_dim, self.model.num_heads
                )));
            }
        } else if self.image_size < 32 {
            return Err(Error::Config(format!(
                "image_size {} is below the convolutional network minimum of 32",
                self.image_size
            )));
        }

        if let Some(name) = &self.target_disease {
            if disease_index(name).is_none() {
                return Err(Error::Config(format!(
                    "target_disease '{name}' is not in the disease vocabulary"
                )));
            }
        }
        if self.target_disease.is_none() {
            if self.monitor == MonitorMetric::TargetF1 {
                return Err(Error::Config(
                    "monitor = target_f1 requires a target_disease".to_string(),
                ));
            }
            if self.imbalance == ImbalanceStrategy::Oversampling {
                return Err(Error::Config(
                    "oversampling requires a target_disease".to_string(),
                ));
            }
        }
        if let ImbalanceStrategy::FocalLoss { alpha, gamma } = self.imbalance {
            if alpha <= 0.0 || gamma < 0.0 {
                return Err(Error::Config(format!(
                    "focal loss needs alpha > 0 and gamma >= 0, got alpha={alpha} gamma={gamma}"
                )));
            }
        }
        Ok(())
    }
}

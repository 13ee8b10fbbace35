//! Chest X-ray dataset assembly and batching.
//!
//! This crate provides:
//! - Metadata CSV loading and multi-hot label encoding
//! - The image-folder index and the metadata filter
//! - Record-level and patient-level train/validation/test splitting
//! - Oversampling of a target finding
//! - Train/eval image transforms, a burn `Dataset` and `Batcher`
//! - The per-epoch sample source with parallel decode

pub mod dataset;
pub mod imbalance;
pub mod index;
pub mod labels;
pub mod prepare;
pub mod record;
pub mod source;
pub mod split;
pub mod transform;

pub use dataset::{XrayBatch, XrayBatcher, XrayDataset, XrayItem};
pub use imbalance::oversample;
pub use index::ImageIndex;
pub use labels::{encode, DiseaseVocabulary};
pub use prepare::{build_dataset, PreparedDataset};
pub use record::{load_records, Record};
pub use source::{SampleOrder, SampleSource};
pub use split::{split_records, Partitions};
pub use transform::{transforms_for, EvalTransform, ImageTransform, Normalization, TrainTransform};

pub use xray_core::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::dataset::*;
    pub use crate::labels::*;
    pub use crate::prepare::*;
    pub use crate::record::*;
    pub use crate::source::*;
    pub use crate::split::*;
    pub use crate::transform::*;
}

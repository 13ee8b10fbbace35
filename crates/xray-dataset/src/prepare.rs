//! Dataset assembly from the image store and metadata file.

use std::collections::BTreeMap;

use tracing::{debug, info, warn};
use xray_core::{DataSplit, Error, ImbalanceStrategy, Result, RunConfig, DISEASES};

use crate::imbalance::oversample;
use crate::index::ImageIndex;
use crate::labels::DiseaseVocabulary;
use crate::record::{load_records, Record};
use crate::split::{split_records, Partitions};

/// Indexed images and their partitions, ready for the sample sources
#[derive(Debug, Clone)]
pub struct PreparedDataset {
    pub index: ImageIndex,
    pub partitions: Partitions,
}

/// Index images, filter metadata, split and optionally oversample.
///
/// Fails before any training with [`Error::ConfigurationMissing`] if the data
/// root or metadata file is absent, [`Error::EmptyDataset`] if no metadata
/// row has an indexed image, and [`Error::EmptySplit`] if a partition is
/// empty.
pub fn build_dataset(config: &RunConfig) -> Result<PreparedDataset> {
    let root = &config.data.data_root;
    if !root.is_dir() {
        return Err(Error::ConfigurationMissing(format!(
            "image root {} does not exist",
            root.display()
        )));
    }

    let records = load_records(&config.data.metadata_path())?;
    let index = ImageIndex::build(&config.data.folders())?;

    let total = records.len();
    let filtered: Vec<Record> = records
        .into_iter()
        .filter(|r| index.contains(&r.image_id))
        .collect();
    if filtered.is_empty() {
        return Err(Error::EmptyDataset(format!(
            "none of {total} metadata rows matched the {} indexed images under {}",
            index.len(),
            root.display()
        )));
    }
    info!("{} of {} metadata rows have an indexed image", filtered.len(), total);
    log_unrecognized(&filtered);

    let mut partitions = split_records(&filtered, config.split_policy, config.seed)?;

    if config.imbalance == ImbalanceStrategy::Oversampling {
        let disease = config.target_disease.as_deref().ok_or_else(|| {
            Error::Config("oversampling requires a target_disease".to_string())
        })?;
        partitions.train = oversample(&partitions.train, disease, config.seed)?;
    }

    for split in [DataSplit::Train, DataSplit::Validation, DataSplit::Test] {
        debug!("{split} prevalence: {:?}", prevalence(partitions.get(split)));
    }

    Ok(PreparedDataset { index, partitions })
}

/// Positive count per finding
pub fn prevalence(records: &[Record]) -> BTreeMap<&'static str, usize> {
    let vocab = DiseaseVocabulary::standard();
    let mut counts: BTreeMap<&'static str, usize> = DISEASES.iter().map(|&d| (d, 0)).collect();
    for record in records {
        for (i, value) in vocab.encode(&record.findings).into_iter().enumerate() {
            if value > 0.0 {
                if let Some(count) = counts.get_mut(DISEASES[i]) {
                    *count += 1;
                }
            }
        }
    }
    counts
}

fn log_unrecognized(records: &[Record]) {
    let vocab = DiseaseVocabulary::standard();
    let mut unknown: BTreeMap<&str, usize> = BTreeMap::new();
    for record in records {
        for token in vocab.unrecognized(&record.findings) {
            *unknown.entry(token).or_insert(0) += 1;
        }
    }
    if !unknown.is_empty() {
        warn!("Ignoring unrecognized finding tokens: {unknown:?}");
    }
}

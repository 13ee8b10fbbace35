//! Train/validation/test partitioning.
//!
//! Both policies run the same two stages with the same seed: hold out 20% as
//! test, then 25% of the remainder as validation, giving 60/20/20. The
//! patient-level policy splits unique patient identifiers and then assigns
//! every record to its patient's partition, so no patient crosses a boundary.

use std::collections::HashSet;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use tracing::info;
use xray_core::{DataSplit, Error, Result, SplitPolicy};

use crate::record::Record;

/// Percentage of all items held out for test
pub const TEST_PERCENT: usize = 20;

/// Percentage of the train+validation remainder used for validation
pub const VALIDATION_PERCENT: usize = 25;

/// Disjoint train/validation/test partitions
#[derive(Debug, Clone, Default)]
pub struct Partitions {
    pub train: Vec<Record>,
    pub validation: Vec<Record>,
    pub test: Vec<Record>,
}

impl Partitions {
    pub fn get(&self, split: DataSplit) -> &[Record] {
        match split {
            DataSplit::Train => &self.train,
            DataSplit::Validation => &self.validation,
            DataSplit::Test => &self.test,
        }
    }

    pub fn total(&self) -> usize {
        self.train.len() + self.validation.len() + self.test.len()
    }

    /// Fail with [`Error::EmptySplit`] if any partition is empty
    pub fn ensure_non_empty(&self) -> Result<()> {
        for split in [DataSplit::Train, DataSplit::Validation, DataSplit::Test] {
            if self.get(split).is_empty() {
                return Err(Error::EmptySplit(format!(
                    "{split} partition is empty ({} train, {} validation, {} test)",
                    self.train.len(),
                    self.validation.len(),
                    self.test.len()
                )));
            }
        }
        Ok(())
    }
}

/// Seeded permutation split into `(kept, held_out)`.
///
/// `held_out` has `ceil(len * percent / 100)` items.
pub fn holdout_split<T: Clone>(items: &[T], percent: usize, seed: u64) -> (Vec<T>, Vec<T>) {
    let n_held = (items.len() * percent).div_ceil(100);
    let mut indices: Vec<usize> = (0..items.len()).collect();
    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    indices.shuffle(&mut rng);

    let held = indices[..n_held].iter().map(|&i| items[i].clone()).collect();
    let kept = indices[n_held..].iter().map(|&i| items[i].clone()).collect();
    (kept, held)
}

/// Two-stage 80/20 then 75/25 split into `(train, validation, test)`
fn three_way<T: Clone>(items: &[T], seed: u64) -> (Vec<T>, Vec<T>, Vec<T>) {
    let (train_val, test) = holdout_split(items, TEST_PERCENT, seed);
    let (train, validation) = holdout_split(&train_val, VALIDATION_PERCENT, seed);
    (train, validation, test)
}

/// Partition filtered records under `policy`.
///
/// Fails with [`Error::EmptySplit`] if any partition ends up empty.
pub fn split_records(records: &[Record], policy: SplitPolicy, seed: u64) -> Result<Partitions> {
    let partitions = match policy {
        SplitPolicy::RecordLevel => {
            let (train, validation, test) = three_way(records, seed);
            Partitions {
                train,
                validation,
                test,
            }
        }
        SplitPolicy::PatientLevel => {
            let mut seen = HashSet::new();
            let patients: Vec<&str> = records
                .iter()
                .map(|r| r.patient_id.as_str())
                .filter(|p| seen.insert(*p))
                .collect();

            let (train_p, val_p, test_p) = three_way(&patients, seed);
            let members = |set: Vec<&str>| -> Vec<Record> {
                let set: HashSet<&str> = set.into_iter().collect();
                records
                    .iter()
                    .filter(|r| set.contains(r.patient_id.as_str()))
                    .cloned()
                    .collect()
            };
            info!(
                "Patient split: {} train, {} validation, {} test patients",
                train_p.len(),
                val_p.len(),
                test_p.len()
            );
            Partitions {
                train: members(train_p),
                validation: members(val_p),
                test: members(test_p),
            }
        }
    };

    info!(
        "{policy} split: train {}, validation {}, test {}",
        partitions.train.len(),
        partitions.validation.len(),
        partitions.test.len()
    );
    partitions.ensure_non_empty()?;
    Ok(partitions)
}

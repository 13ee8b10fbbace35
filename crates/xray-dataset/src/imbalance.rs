//! Oversampling of a target finding in the training partition.

use rand::seq::SliceRandom;
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use tracing::{debug, info};
use xray_core::{Error, Result};

use crate::record::Record;

/// Rebalance `train` so positives and negatives for `disease` are equal.
///
/// Every row of the smaller side is kept once and topped up with draws with
/// replacement until it matches the larger side; the result is shuffled.
/// Positives are rows whose finding tokens include `disease`.
pub fn oversample(train: &[Record], disease: &str, seed: u64) -> Result<Vec<Record>> {
    let (positives, negatives): (Vec<&Record>, Vec<&Record>) =
        train.iter().partition(|r| r.has_finding(disease));

    if positives.is_empty() {
        return Err(Error::EmptySplit(format!(
            "training partition has no {disease} records to oversample"
        )));
    }
    if negatives.is_empty() {
        return Err(Error::EmptySplit(format!(
            "training partition has no records without {disease}"
        )));
    }

    let (minority, majority) = if positives.len() <= negatives.len() {
        debug!("Resampling {disease} positives up to the negative count");
        (&positives, &negatives)
    } else {
        debug!("{disease} positives outnumber negatives; resampling negatives instead");
        (&negatives, &positives)
    };

    let mut rng = ChaCha8Rng::seed_from_u64(seed);
    let extra = majority.len() - minority.len();
    let mut balanced: Vec<Record> = Vec::with_capacity(2 * majority.len());
    balanced.extend(majority.iter().map(|&r| r.clone()));
    balanced.extend(minority.iter().map(|&r| r.clone()));
    for _ in 0..extra {
        let pick = rng.gen_range(0..minority.len());
        balanced.push(minority[pick].clone());
    }
    balanced.shuffle(&mut rng);

    info!(
        "Oversampled {disease}: {} positive / {} negative -> {} rows",
        positives.len(),
        negatives.len(),
        balanced.len()
    );
    Ok(balanced)
}

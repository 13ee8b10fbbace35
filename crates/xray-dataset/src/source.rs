//! Per-epoch sample source.
//!
//! The training partition is reshuffled every epoch; validation and test keep
//! their fixed order. Items of one batch are decoded in parallel on a bounded
//! rayon pool; `par_iter().collect()` keeps them in position order, so the
//! parallelism never changes what a batch contains or its ordering.

use std::sync::Arc;

use rand::seq::SliceRandom;
use rand::SeedableRng;
use rand_chacha::ChaCha8Rng;
use rayon::prelude::*;
use rayon::{ThreadPool, ThreadPoolBuilder};
use xray_core::{Error, Result};

use crate::dataset::{XrayDataset, XrayItem};

/// Order in which a partition is visited
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SampleOrder {
    /// New permutation every epoch
    Shuffled,
    /// Partition order, every epoch
    Fixed,
}

/// Mix `(seed, epoch, position)` into one RNG seed
fn mix_seed(seed: u64, epoch: usize, position: usize) -> u64 {
    let mut z = seed
        ^ (epoch as u64).wrapping_mul(0x9E37_79B9_7F4A_7C15)
        ^ (position as u64).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 30)).wrapping_mul(0xBF58_476D_1CE4_E5B9);
    z = (z ^ (z >> 27)).wrapping_mul(0x94D0_49BB_1331_11EB);
    z ^ (z >> 31)
}

/// Batched access to one partition
#[derive(Clone)]
pub struct SampleSource {
    dataset: Arc<XrayDataset>,
    order: SampleOrder,
    batch_size: usize,
    seed: u64,
    pool: Arc<ThreadPool>,
}

impl SampleSource {
    /// Create a source decoding with `num_workers` threads (at least one)
    pub fn new(
        dataset: XrayDataset,
        order: SampleOrder,
        batch_size: usize,
        num_workers: usize,
        seed: u64,
    ) -> Result<Self> {
        if batch_size == 0 {
            return Err(Error::InvalidArgument("batch_size must be positive".to_string()));
        }
        let pool = ThreadPoolBuilder::new()
            .num_threads(num_workers.max(1))
            .build()
            .map_err(|e| Error::Config(format!("Failed to build decode pool: {e}")))?;
        Ok(Self {
            dataset: Arc::new(dataset),
            order,
            batch_size,
            seed,
            pool: Arc::new(pool),
        })
    }

    pub fn len(&self) -> usize {
        self.dataset.num_samples()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn image_size(&self) -> usize {
        self.dataset.image_size()
    }

    /// Batches per epoch; the final partial batch counts
    pub fn num_batches(&self) -> usize {
        self.len().div_ceil(self.batch_size)
    }

    /// Dataset indices in visiting order for `epoch`
    pub fn epoch_order(&self, epoch: usize) -> Vec<usize> {
        let mut indices: Vec<usize> = (0..self.len()).collect();
        if self.order == SampleOrder::Shuffled {
            let mut rng = ChaCha8Rng::seed_from_u64(mix_seed(self.seed, epoch, usize::MAX));
            indices.shuffle(&mut rng);
        }
        indices
    }

    /// Iterate the batches of `epoch`
    pub fn batches(&self, epoch: usize) -> EpochBatches<'_> {
        EpochBatches {
            source: self,
            order: self.epoch_order(epoch),
            cursor: 0,
            epoch,
        }
    }

    fn load_batch(&self, epoch: usize, positions: &[(usize, usize)]) -> Result<Vec<XrayItem>> {
        let dataset = &self.dataset;
        let seed = self.seed;
        self.pool.install(|| {
            positions
                .par_iter()
                .map(|&(position, index)| {
                    let mut rng = ChaCha8Rng::seed_from_u64(mix_seed(seed, epoch, position));
                    dataset.load(index, &mut rng)
                })
                .collect::<Result<Vec<_>>>()
        })
    }
}

/// Iterator over the batches of one epoch
pub struct EpochBatches<'a> {
    source: &'a SampleSource,
    order: Vec<usize>,
    cursor: usize,
    epoch: usize,
}

impl Iterator for EpochBatches<'_> {
    type Item = Result<Vec<XrayItem>>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.cursor >= self.order.len() {
            return None;
        }
        let end = (self.cursor + self.source.batch_size).min(self.order.len());
        let positions: Vec<(usize, usize)> = (self.cursor..end)
            .map(|p| (p, self.order[p]))
            .collect();
        self.cursor = end;
        Some(self.source.load_batch(self.epoch, &positions))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::index::ImageIndex;
    use crate::record::Record;
    use crate::transform::{EvalTransform, Normalization, TrainTransform};
    use image::{ImageBuffer, Luma};
    use std::fs;
    use tempfile::TempDir;

    fn source(dir: &std::path::Path, n: usize, order: SampleOrder) -> Result<SampleSource> {
        let folder = dir.join("images");
        fs::create_dir_all(&folder)?;
        let mut records = Vec::new();
        for i in 0..n {
            let name = format!("{i:03}.png");
            let img = ImageBuffer::from_fn(6, 6, |x, y| Luma([(i * 7 + (x + y) as usize) as u8]));
            img.save(folder.join(&name))?;
            records.push(Record::new(name, format!("{i}"), "Mass"));
        }
        let index = ImageIndex::build(&[folder])?;
        let dataset = match order {
            SampleOrder::Fixed => XrayDataset::new(
                &records,
                &index,
                Arc::new(EvalTransform::new(4, 4, Normalization::imagenet())),
            )?,
            SampleOrder::Shuffled => XrayDataset::new(
                &records,
                &index,
                Arc::new(TrainTransform::new(4, Normalization::imagenet())),
            )?,
        };
        SampleSource::new(dataset, order, 4, 3, 42)
    }

    fn ids(source: &SampleSource, epoch: usize) -> Result<Vec<String>> {
        let mut out = Vec::new();
        for batch in source.batches(epoch) {
            out.extend(batch?.into_iter().map(|item| item.image_id));
        }
        Ok(out)
    }

    #[test]
    fn test_fixed_order_with_partial_batch() -> Result<()> {
        let dir = TempDir::new()?;
        let source = source(dir.path(), 10, SampleOrder::Fixed)?;
        assert_eq!(source.num_batches(), 3);

        let sizes: Vec<usize> = source
            .batches(0)
            .map(|b| b.map(|items| items.len()))
            .collect::<Result<_>>()?;
        assert_eq!(sizes, vec![4, 4, 2]);

        let expected: Vec<String> = (0..10).map(|i| format!("{i:03}.png")).collect();
        assert_eq!(ids(&source, 0)?, expected);
        assert_eq!(ids(&source, 1)?, expected);
        Ok(())
    }

    #[test]
    fn test_shuffled_order_changes_per_epoch() -> Result<()> {
        let dir = TempDir::new()?;
        let source = source(dir.path(), 12, SampleOrder::Shuffled)?;
        let first = ids(&source, 0)?;
        let again = ids(&source, 0)?;
        let second = ids(&source, 1)?;
        assert_eq!(first, again);
        assert_ne!(first, second);

        let mut sorted = second.clone();
        sorted.sort();
        let expected: Vec<String> = (0..12).map(|i| format!("{i:03}.png")).collect();
        assert_eq!(sorted, expected);
        Ok(())
    }

    #[test]
    fn test_augmentation_reproducible_across_runs() -> Result<()> {
        let dir = TempDir::new()?;
        let source = source(dir.path(), 5, SampleOrder::Shuffled)?;
        let a: Vec<Vec<f32>> = source.batches(2).next().unwrap()?.into_iter().map(|i| i.image).collect();
        let b: Vec<Vec<f32>> = source.batches(2).next().unwrap()?.into_iter().map(|i| i.image).collect();
        assert_eq!(a, b);
        Ok(())
    }
}

//! Partition datasets and the burn `Batcher` for chest X-ray images.

use std::path::PathBuf;
use std::sync::Arc;

use burn::data::dataloader::batcher::Batcher;
use burn::prelude::*;
use image::ImageReader;
use rand_chacha::ChaCha8Rng;
use xray_core::{Error, Result, NUM_DISEASES};

use crate::index::ImageIndex;
use crate::labels::DiseaseVocabulary;
use crate::record::Record;
use crate::transform::ImageTransform;

/// One transformed image and its label vector
#[derive(Clone, Debug)]
pub struct XrayItem {
    /// CHW float buffer `[3 * size * size]`
    pub image: Vec<f32>,
    /// Multi-hot label vector `[14]`
    pub label: Vec<f32>,
    pub image_id: String,
}

#[derive(Clone, Debug)]
struct Sample {
    path: PathBuf,
    label: Vec<f32>,
    image_id: String,
}

/// A partition bound to its image locations and a transform.
///
/// Images are decoded lazily on every access.
#[derive(Clone)]
pub struct XrayDataset {
    samples: Vec<Sample>,
    transform: Arc<dyn ImageTransform>,
}

impl std::fmt::Debug for XrayDataset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("XrayDataset")
            .field("samples", &self.samples.len())
            .field("image_size", &self.transform.size())
            .finish()
    }
}

impl XrayDataset {
    /// Resolve every record against the index and encode its labels.
    ///
    /// A record missing from the index is [`Error::InvalidArgument`]; the
    /// metadata filter guarantees this never happens for built partitions.
    pub fn new(
        records: &[Record],
        index: &ImageIndex,
        transform: Arc<dyn ImageTransform>,
    ) -> Result<Self> {
        let vocab = DiseaseVocabulary::standard();
        let samples = records
            .iter()
            .map(|r| {
                let path = index.path(&r.image_id).ok_or_else(|| {
                    Error::InvalidArgument(format!("{} is not in the image index", r.image_id))
                })?;
                Ok(Sample {
                    path,
                    label: vocab.encode(&r.findings),
                    image_id: r.image_id.clone(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self { samples, transform })
    }

    pub fn image_size(&self) -> usize {
        self.transform.size()
    }

    pub fn num_samples(&self) -> usize {
        self.samples.len()
    }

    /// Decode and transform the item at `index` with the given RNG
    pub fn load(&self, index: usize, rng: &mut ChaCha8Rng) -> Result<XrayItem> {
        let sample = self.samples.get(index).ok_or_else(|| {
            Error::InvalidArgument(format!(
                "index {index} out of range for {} samples",
                self.samples.len()
            ))
        })?;
        let decoded = ImageReader::open(&sample.path)?
            .with_guessed_format()?
            .decode()
            .map_err(|e| Error::Image(format!("{}: {e}", sample.path.display())))?;
        Ok(XrayItem {
            image: self.transform.apply(&decoded, rng),
            label: sample.label.clone(),
            image_id: sample.image_id.clone(),
        })
    }
}

/// A batch of images and label vectors
#[derive(Clone, Debug)]
pub struct XrayBatch<B: Backend> {
    /// `[batch, 3, size, size]`
    pub images: Tensor<B, 4>,
    /// `[batch, 14]`
    pub targets: Tensor<B, 2>,
}

/// Stacks items into tensors on one device
#[derive(Clone, Debug)]
pub struct XrayBatcher<B: Backend> {
    device: B::Device,
    image_size: usize,
}

impl<B: Backend> XrayBatcher<B> {
    pub fn new(device: B::Device, image_size: usize) -> Self {
        Self { device, image_size }
    }
}

impl<B: Backend> Batcher<XrayItem, XrayBatch<B>> for XrayBatcher<B> {
    fn batch(&self, items: Vec<XrayItem>) -> XrayBatch<B> {
        let batch_size = items.len();
        let size = self.image_size;

        let images_data: Vec<f32> = items.iter().flat_map(|item| item.image.iter().copied()).collect();
        let images = Tensor::<B, 4>::from_floats(
            TensorData::new(images_data, [batch_size, 3, size, size]),
            &self.device,
        );

        let targets_data: Vec<f32> = items.iter().flat_map(|item| item.label.iter().copied()).collect();
        let targets = Tensor::<B, 2>::from_floats(
            TensorData::new(targets_data, [batch_size, NUM_DISEASES]),
            &self.device,
        );

        XrayBatch { images, targets }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transform::{EvalTransform, Normalization};
    use burn_ndarray::NdArray;
    use image::{ImageBuffer, Luma};
    use rand::SeedableRng;
    use std::fs;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn fixture(dir: &std::path::Path) -> Result<(Vec<Record>, ImageIndex)> {
        let folder = dir.join("images_001").join("images");
        fs::create_dir_all(&folder)?;
        let records = vec![
            Record::new("a.png", "1", "Pneumonia"),
            Record::new("b.png", "2", "No Finding"),
        ];
        for r in &records {
            let img = ImageBuffer::from_fn(12, 10, |x, y| Luma([(x * 10 + y) as u8]));
            img.save(folder.join(&r.image_id))?;
        }
        let index = ImageIndex::build(&[folder])?;
        Ok((records, index))
    }

    #[test]
    fn test_dataset_loads_items() -> Result<()> {
        let dir = TempDir::new()?;
        let (records, index) = fixture(dir.path())?;
        let transform = Arc::new(EvalTransform::new(8, 8, Normalization::imagenet()));
        let dataset = XrayDataset::new(&records, &index, transform)?;

        assert_eq!(dataset.num_samples(), 2);
        let mut rng = ChaCha8Rng::seed_from_u64(0);
        let item = dataset.load(0, &mut rng)?;
        assert_eq!(item.image.len(), 3 * 8 * 8);
        assert_eq!(item.label[12], 1.0);
        assert_eq!(item.image_id, "a.png");
        assert!(matches!(
            dataset.load(2, &mut rng),
            Err(Error::InvalidArgument(_))
        ));
        Ok(())
    }

    #[test]
    fn test_unindexed_record_rejected() {
        let index = ImageIndex::default();
        let transform = Arc::new(EvalTransform::new(8, 8, Normalization::imagenet()));
        let records = vec![Record::new("missing.png", "1", "Mass")];
        assert!(XrayDataset::new(&records, &index, transform).is_err());
    }

    #[test]
    fn test_batcher_shapes() {
        let device = Default::default();
        let batcher = XrayBatcher::<TestBackend>::new(device, 4);
        let items = (0..3)
            .map(|i| XrayItem {
                image: vec![i as f32; 3 * 4 * 4],
                label: vec![1.0; NUM_DISEASES],
                image_id: format!("{i}.png"),
            })
            .collect();
        let batch = batcher.batch(items);
        assert_eq!(batch.images.dims(), [3, 3, 4, 4]);
        assert_eq!(batch.targets.dims(), [3, NUM_DISEASES]);
    }
}

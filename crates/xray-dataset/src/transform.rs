//! Image transforms: decoded image to a normalized CHW tensor buffer.
//!
//! This module provides:
//! - [`TrainTransform`]: random resized crop and horizontal flip
//! - [`EvalTransform`]: deterministic shorter-side resize and center crop
//! - [`Normalization`] presets for ImageNet and transformer inputs

use image::imageops::FilterType;
use image::{DynamicImage, GenericImageView};
use rand::Rng;
use rand_chacha::ChaCha8Rng;
use xray_core::{BackboneKind, RunConfig};

/// Maps a decoded image to a `[3, size, size]` buffer
pub trait ImageTransform: Send + Sync {
    /// Transform one image. Deterministic transforms ignore `rng`.
    fn apply(&self, image: &DynamicImage, rng: &mut ChaCha8Rng) -> Vec<f32>;

    /// Output side length
    fn size(&self) -> usize;
}

/// Per-channel mean/std normalization
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Normalization {
    pub mean: [f32; 3],
    pub std: [f32; 3],
}

impl Normalization {
    pub fn imagenet() -> Self {
        Self {
            mean: [0.485, 0.456, 0.406],
            std: [0.229, 0.224, 0.225],
        }
    }

    /// Maps `[0, 1]` to `[-1, 1]`
    pub fn symmetric() -> Self {
        Self {
            mean: [0.5; 3],
            std: [0.5; 3],
        }
    }

    pub fn for_backbone(backbone: BackboneKind) -> Self {
        match backbone {
            BackboneKind::ConvNet => Self::imagenet(),
            BackboneKind::VisionTransformer => Self::symmetric(),
        }
    }
}

/// RGB image to normalized CHW floats
pub fn to_chw(image: &DynamicImage, norm: &Normalization) -> Vec<f32> {
    let rgb = image.to_rgb8();
    let (width, height) = rgb.dimensions();
    let plane = (width * height) as usize;
    let mut data = vec![0.0f32; 3 * plane];

    for (x, y, pixel) in rgb.enumerate_pixels() {
        let offset = (y * width + x) as usize;
        for c in 0..3 {
            let value = pixel[c] as f32 / 255.0;
            data[c * plane + offset] = (value - norm.mean[c]) / norm.std[c];
        }
    }
    data
}

/// Stochastic training transform
#[derive(Debug, Clone)]
pub struct TrainTransform {
    pub size: u32,
    /// Crop area as a fraction of the source
    pub scale: (f64, f64),
    /// Crop aspect ratio bounds
    pub ratio: (f64, f64),
    pub flip_probability: f64,
    pub normalization: Normalization,
}

impl TrainTransform {
    pub fn new(size: usize, normalization: Normalization) -> Self {
        Self {
            size: size as u32,
            scale: (0.08, 1.0),
            ratio: (3.0 / 4.0, 4.0 / 3.0),
            flip_probability: 0.5,
            normalization,
        }
    }

    /// Crop window `(x, y, w, h)`; falls back to the largest centered
    /// window within the ratio bounds after ten rejected draws
    fn crop_window(&self, width: u32, height: u32, rng: &mut ChaCha8Rng) -> (u32, u32, u32, u32) {
        let area = (width * height) as f64;
        let (log_lo, log_hi) = (self.ratio.0.ln(), self.ratio.1.ln());

        for _ in 0..10 {
            let target = area * rng.gen_range(self.scale.0..=self.scale.1);
            let aspect = rng.gen_range(log_lo..=log_hi).exp();
            let w = (target * aspect).sqrt().round() as u32;
            let h = (target / aspect).sqrt().round() as u32;
            if w > 0 && h > 0 && w <= width && h <= height {
                let x = rng.gen_range(0..=width - w);
                let y = rng.gen_range(0..=height - h);
                return (x, y, w, h);
            }
        }

        let in_ratio = width as f64 / height as f64;
        let (w, h) = if in_ratio < self.ratio.0 {
            (width, (width as f64 / self.ratio.0).round() as u32)
        } else if in_ratio > self.ratio.1 {
            ((height as f64 * self.ratio.1).round() as u32, height)
        } else {
            (width, height)
        };
        let (w, h) = (w.clamp(1, width), h.clamp(1, height));
        ((width - w) / 2, (height - h) / 2, w, h)
    }
}

impl ImageTransform for TrainTransform {
    fn apply(&self, image: &DynamicImage, rng: &mut ChaCha8Rng) -> Vec<f32> {
        let (width, height) = image.dimensions();
        let (x, y, w, h) = self.crop_window(width, height, rng);
        let mut out = image
            .crop_imm(x, y, w, h)
            .resize_exact(self.size, self.size, FilterType::Triangle);
        if rng.gen_bool(self.flip_probability) {
            out = out.fliph();
        }
        to_chw(&out, &self.normalization)
    }

    fn size(&self) -> usize {
        self.size as usize
    }
}

/// Deterministic evaluation transform
#[derive(Debug, Clone)]
pub struct EvalTransform {
    pub size: u32,
    /// Shorter side after resizing, before the center crop
    pub resize: u32,
    pub normalization: Normalization,
}

impl EvalTransform {
    pub fn new(size: usize, resize: usize, normalization: Normalization) -> Self {
        Self {
            size: size as u32,
            resize: resize.max(size) as u32,
            normalization,
        }
    }
}

impl ImageTransform for EvalTransform {
    fn apply(&self, image: &DynamicImage, _rng: &mut ChaCha8Rng) -> Vec<f32> {
        let (width, height) = image.dimensions();
        let (nw, nh) = if width <= height {
            let nh = (height as f64 * self.resize as f64 / width as f64).round() as u32;
            (self.resize, nh.max(self.resize))
        } else {
            let nw = (width as f64 * self.resize as f64 / height as f64).round() as u32;
            (nw.max(self.resize), self.resize)
        };
        let resized = image.resize_exact(nw, nh, FilterType::Triangle);
        let x = (nw - self.size) / 2;
        let y = (nh - self.size) / 2;
        let cropped = resized.crop_imm(x, y, self.size, self.size);
        to_chw(&cropped, &self.normalization)
    }

    fn size(&self) -> usize {
        self.size as usize
    }
}

/// Train and eval transforms for a run.
///
/// The convolutional backbone trains with random resized crops and evaluates
/// on a 256/224-scaled center crop. The transformer uses the same direct
/// resize for both.
pub fn transforms_for(config: &RunConfig) -> (Box<dyn ImageTransform>, Box<dyn ImageTransform>) {
    let norm = Normalization::for_backbone(config.model.backbone);
    let size = config.image_size;
    match config.model.backbone {
        BackboneKind::ConvNet => (
            Box::new(TrainTransform::new(size, norm)),
            Box::new(EvalTransform::new(size, size * 256 / 224, norm)),
        ),
        BackboneKind::VisionTransformer => (
            Box::new(EvalTransform::new(size, size, norm)),
            Box::new(EvalTransform::new(size, size, norm)),
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use rand::SeedableRng;

    fn gradient_image(w: u32, h: u32) -> DynamicImage {
        let img = ImageBuffer::from_fn(w, h, |x, y| Rgb([(x * 4) as u8, (y * 4) as u8, 128u8]));
        DynamicImage::ImageRgb8(img)
    }

    #[test]
    fn test_eval_transform_is_deterministic() {
        let transform = EvalTransform::new(16, 18, Normalization::imagenet());
        let image = gradient_image(40, 30);
        let a = transform.apply(&image, &mut ChaCha8Rng::seed_from_u64(1));
        let b = transform.apply(&image, &mut ChaCha8Rng::seed_from_u64(2));
        assert_eq!(a.len(), 3 * 16 * 16);
        assert_eq!(a, b);
    }

    #[test]
    fn test_train_transform_shape_and_seed() {
        let transform = TrainTransform::new(8, Normalization::symmetric());
        let image = gradient_image(32, 32);
        let a = transform.apply(&image, &mut ChaCha8Rng::seed_from_u64(5));
        let b = transform.apply(&image, &mut ChaCha8Rng::seed_from_u64(5));
        assert_eq!(a.len(), 3 * 8 * 8);
        assert_eq!(a, b);
        assert!(a.iter().all(|v| (-1.0..=1.0).contains(v)));
    }

    #[test]
    fn test_crop_window_within_bounds() {
        let transform = TrainTransform::new(8, Normalization::imagenet());
        let mut rng = ChaCha8Rng::seed_from_u64(9);
        for _ in 0..50 {
            let (x, y, w, h) = transform.crop_window(20, 12, &mut rng);
            assert!(w > 0 && h > 0);
            assert!(x + w <= 20 && y + h <= 12);
        }
    }

    #[test]
    fn test_chw_layout_and_normalization() {
        let img = ImageBuffer::from_fn(2, 1, |x, _| {
            if x == 0 {
                Rgb([255u8, 0, 0])
            } else {
                Rgb([0u8, 255, 0])
            }
        });
        let data = to_chw(&DynamicImage::ImageRgb8(img), &Normalization::symmetric());
        assert_eq!(data, vec![1.0, -1.0, -1.0, 1.0, -1.0, -1.0]);
    }
}

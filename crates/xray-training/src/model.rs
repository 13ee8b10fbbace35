//! Backbones mapping an image batch to 14 logits.
//!
//! Implements:
//! - [`DenseNet`]: densely-connected CNN with global average pooling
//! - [`VisionTransformer`]: patch embedding, class token, transformer encoder
//! - [`XrayClassifier`]: the configured backbone behind one module type

use std::path::Path;

use burn::{
    module::{Module, Param},
    nn::{
        conv::{Conv2d, Conv2dConfig},
        pool::{
            AdaptiveAvgPool2d, AdaptiveAvgPool2dConfig, AvgPool2d, AvgPool2dConfig, MaxPool2d,
            MaxPool2dConfig,
        },
        transformer::{TransformerEncoder, TransformerEncoderConfig, TransformerEncoderInput},
        BatchNorm, BatchNormConfig, Dropout, DropoutConfig, Initializer, LayerNorm,
        LayerNormConfig, Linear, LinearConfig, PaddingConfig2d, Relu,
    },
    record::CompactRecorder,
    tensor::{backend::Backend, Tensor},
};
use tracing::info;
use xray_core::{BackboneKind, Result, RunConfig, NUM_DISEASES};

/// The only capability the harness needs from a model
pub trait Backbone<B: Backend> {
    /// `[batch, 3, H, W]` images to `[batch, 14]` logits
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2>;
}

/// BN-ReLU-Conv1x1-BN-ReLU-Conv3x3 producing `growth_rate` new channels
#[derive(Module, Debug)]
pub struct DenseLayer<B: Backend> {
    norm1: BatchNorm<B, 2>,
    conv1: Conv2d<B>,
    norm2: BatchNorm<B, 2>,
    conv2: Conv2d<B>,
    activation: Relu,
}

impl<B: Backend> DenseLayer<B> {
    fn new(in_channels: usize, growth_rate: usize, device: &B::Device) -> Self {
        let bottleneck = 4 * growth_rate;
        Self {
            norm1: BatchNormConfig::new(in_channels).init(device),
            conv1: Conv2dConfig::new([in_channels, bottleneck], [1, 1])
                .with_bias(false)
                .init(device),
            norm2: BatchNormConfig::new(bottleneck).init(device),
            conv2: Conv2dConfig::new([bottleneck, growth_rate], [3, 3])
                .with_padding(PaddingConfig2d::Explicit(1, 1))
                .with_bias(false)
                .init(device),
            activation: Relu::new(),
        }
    }

    /// Output is the input with the new features concatenated on channels
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.activation.forward(self.norm1.forward(input.clone()));
        let x = self.conv1.forward(x);
        let x = self.activation.forward(self.norm2.forward(x));
        let x = self.conv2.forward(x);
        Tensor::cat(vec![input, x], 1)
    }
}

/// Consecutive dense layers sharing one spatial resolution
#[derive(Module, Debug)]
pub struct DenseBlock<B: Backend> {
    layers: Vec<DenseLayer<B>>,
}

impl<B: Backend> DenseBlock<B> {
    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        self.layers.iter().fold(input, |x, layer| layer.forward(x))
    }
}

/// BN-ReLU-Conv1x1 halving channels, then 2x2 average pooling
#[derive(Module, Debug)]
pub struct Transition<B: Backend> {
    norm: BatchNorm<B, 2>,
    conv: Conv2d<B>,
    pool: AvgPool2d,
    activation: Relu,
}

impl<B: Backend> Transition<B> {
    fn new(in_channels: usize, out_channels: usize, device: &B::Device) -> Self {
        Self {
            norm: BatchNormConfig::new(in_channels).init(device),
            conv: Conv2dConfig::new([in_channels, out_channels], [1, 1])
                .with_bias(false)
                .init(device),
            pool: AvgPool2dConfig::new([2, 2]).with_strides([2, 2]).init(),
            activation: Relu::new(),
        }
    }

    fn forward(&self, input: Tensor<B, 4>) -> Tensor<B, 4> {
        let x = self.activation.forward(self.norm.forward(input));
        self.pool.forward(self.conv.forward(x))
    }
}

/// Densely-connected convolutional network
///
/// Architecture:
/// - Stem: Conv 7x7 stride 2, BN, ReLU, max-pool 3x3 stride 2
/// - Dense blocks separated by transitions
/// - Final BN, ReLU, global average pooling
/// - 14-way linear head
#[derive(Module, Debug)]
pub struct DenseNet<B: Backend> {
    stem: Conv2d<B>,
    stem_norm: BatchNorm<B, 2>,
    stem_pool: MaxPool2d,
    blocks: Vec<DenseBlock<B>>,
    /// One fewer than `blocks`
    transitions: Vec<Transition<B>>,
    final_norm: BatchNorm<B, 2>,
    pool: AdaptiveAvgPool2d,
    dropout: Dropout,
    classifier: Linear<B>,
    activation: Relu,
}

impl<B: Backend> DenseNet<B> {
    pub fn new(
        growth_rate: usize,
        block_layers: &[usize],
        dropout: f64,
        device: &B::Device,
    ) -> Self {
        let mut channels = 2 * growth_rate;
        let stem = Conv2dConfig::new([3, channels], [7, 7])
            .with_stride([2, 2])
            .with_padding(PaddingConfig2d::Explicit(3, 3))
            .with_bias(false)
            .init(device);
        let stem_norm = BatchNormConfig::new(channels).init(device);
        let stem_pool = MaxPool2dConfig::new([3, 3])
            .with_strides([2, 2])
            .with_padding(PaddingConfig2d::Explicit(1, 1))
            .init();

        let mut blocks = Vec::new();
        let mut transitions = Vec::new();
        for (block, &count) in block_layers.iter().enumerate() {
            let mut layers = Vec::with_capacity(count);
            for _ in 0..count {
                layers.push(DenseLayer::new(channels, growth_rate, device));
                channels += growth_rate;
            }
            blocks.push(DenseBlock { layers });
            if block + 1 < block_layers.len() {
                transitions.push(Transition::new(channels, channels / 2, device));
                channels /= 2;
            }
        }

        Self {
            stem,
            stem_norm,
            stem_pool,
            blocks,
            transitions,
            final_norm: BatchNormConfig::new(channels).init(device),
            pool: AdaptiveAvgPool2dConfig::new([1, 1]).init(),
            dropout: DropoutConfig::new(dropout).init(),
            classifier: LinearConfig::new(channels, NUM_DISEASES).init(device),
            activation: Relu::new(),
        }
    }

    /// Re-initialize the classification head to 14 outputs
    pub fn reset_head(mut self, device: &B::Device) -> Self {
        let [d_input, _] = self.classifier.weight.dims();
        self.classifier = LinearConfig::new(d_input, NUM_DISEASES).init(device);
        self
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let x = self.stem.forward(images);
        let x = self.activation.forward(self.stem_norm.forward(x));
        let mut x = self.stem_pool.forward(x);

        for (i, block) in self.blocks.iter().enumerate() {
            x = block.forward(x);
            if let Some(transition) = self.transitions.get(i) {
                x = transition.forward(x);
            }
        }

        let x = self.activation.forward(self.final_norm.forward(x));
        let x = self.pool.forward(x);
        let [batch, channels, _, _] = x.dims();
        let x = x.reshape([batch, channels]);
        self.classifier.forward(self.dropout.forward(x))
    }
}

/// Vision transformer over non-overlapping square patches
#[derive(Module, Debug)]
pub struct VisionTransformer<B: Backend> {
    patch_embed: Conv2d<B>,
    cls_token: Param<Tensor<B, 3>>,
    pos_embed: Param<Tensor<B, 3>>,
    dropout: Dropout,
    encoder: TransformerEncoder<B>,
    norm: LayerNorm<B>,
    head: Linear<B>,
}

impl<B: Backend> VisionTransformer<B> {
    pub fn new(
        image_size: usize,
        patch_size: usize,
        embed_dim: usize,
        depth: usize,
        num_heads: usize,
        dropout: f64,
        device: &B::Device,
    ) -> Self {
        let grid = image_size / patch_size;
        let num_tokens = grid * grid + 1;
        let init = Initializer::Normal {
            mean: 0.0,
            std: 0.02,
        };

        Self {
            patch_embed: Conv2dConfig::new([3, embed_dim], [patch_size, patch_size])
                .with_stride([patch_size, patch_size])
                .init(device),
            cls_token: init.init([1, 1, embed_dim], device),
            pos_embed: init.init([1, num_tokens, embed_dim], device),
            dropout: DropoutConfig::new(dropout).init(),
            encoder: TransformerEncoderConfig::new(embed_dim, 4 * embed_dim, num_heads, depth)
                .with_dropout(dropout)
                .with_norm_first(true)
                .init(device),
            norm: LayerNormConfig::new(embed_dim).init(device),
            head: LinearConfig::new(embed_dim, NUM_DISEASES).init(device),
        }
    }

    /// Re-initialize the classification head to 14 outputs
    pub fn reset_head(mut self, device: &B::Device) -> Self {
        let [d_input, _] = self.head.weight.dims();
        self.head = LinearConfig::new(d_input, NUM_DISEASES).init(device);
        self
    }

    pub fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        let device = images.device();
        let patches = self.patch_embed.forward(images);
        let [batch, embed_dim, grid_h, grid_w] = patches.dims();
        let tokens = patches
            .reshape([batch, embed_dim, grid_h * grid_w])
            .swap_dims(1, 2);

        let cls = Tensor::<B, 3>::zeros([batch, 1, embed_dim], &device) + self.cls_token.val();
        let x = Tensor::cat(vec![cls, tokens], 1) + self.pos_embed.val();
        let x = self.dropout.forward(x);
        let x = self.encoder.forward(TransformerEncoderInput::new(x));

        let cls_out = x.slice([0..batch, 0..1, 0..embed_dim]).reshape([batch, embed_dim]);
        self.head.forward(self.norm.forward(cls_out))
    }
}

/// The configured backbone
#[derive(Module, Debug)]
pub enum XrayClassifier<B: Backend> {
    ConvNet(DenseNet<B>),
    Vit(VisionTransformer<B>),
}

impl<B: Backend> XrayClassifier<B> {
    /// Build the backbone named in the run configuration.
    ///
    /// When a pretrained record is configured it is loaded first and the head
    /// is re-initialized afterwards.
    pub fn from_config(config: &RunConfig, device: &B::Device) -> Result<Self> {
        let model = &config.model;
        let classifier = match model.backbone {
            BackboneKind::ConvNet => XrayClassifier::ConvNet(DenseNet::new(
                model.growth_rate,
                &model.block_layers,
                model.dropout,
                device,
            )),
            BackboneKind::VisionTransformer => XrayClassifier::Vit(VisionTransformer::new(
                config.image_size,
                model.patch_size,
                model.embed_dim,
                model.depth,
                model.num_heads,
                model.dropout,
                device,
            )),
        };
        info!(
            "Built {} backbone with {} parameters",
            model.backbone,
            classifier.num_params()
        );

        match &model.pretrained_path {
            Some(path) => classifier.load_pretrained(path, device),
            None => Ok(classifier),
        }
    }

    /// Load weights from a record file, then reset the head
    pub fn load_pretrained(self, path: &Path, device: &B::Device) -> Result<Self> {
        let recorder = CompactRecorder::new();
        let loaded = self.load_file(path, &recorder, device)?;
        info!("Loaded pretrained weights from {}", path.display());
        Ok(loaded.reset_head(device))
    }

    pub fn reset_head(self, device: &B::Device) -> Self {
        match self {
            XrayClassifier::ConvNet(m) => XrayClassifier::ConvNet(m.reset_head(device)),
            XrayClassifier::Vit(m) => XrayClassifier::Vit(m.reset_head(device)),
        }
    }

    pub fn kind(&self) -> BackboneKind {
        match self {
            XrayClassifier::ConvNet(_) => BackboneKind::ConvNet,
            XrayClassifier::Vit(_) => BackboneKind::VisionTransformer,
        }
    }
}

impl<B: Backend> Backbone<B> for XrayClassifier<B> {
    fn forward(&self, images: Tensor<B, 4>) -> Tensor<B, 2> {
        match self {
            XrayClassifier::ConvNet(m) => m.forward(images),
            XrayClassifier::Vit(m) => m.forward(images),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn_ndarray::NdArray;
    use tempfile::TempDir;

    type TestBackend = NdArray;

    fn tiny_config(backbone: BackboneKind) -> RunConfig {
        let mut config = match backbone {
            BackboneKind::ConvNet => RunConfig::densenet_preset(),
            BackboneKind::VisionTransformer => RunConfig::vit_preset(),
        };
        config.image_size = 32;
        config.model.growth_rate = 4;
        config.model.block_layers = vec![1, 1];
        config.model.patch_size = 8;
        config.model.embed_dim = 16;
        config.model.depth = 1;
        config.model.num_heads = 2;
        config
    }

    #[test]
    fn test_densenet_output_shape() -> Result<()> {
        let device = Default::default();
        let model = XrayClassifier::<TestBackend>::from_config(&tiny_config(BackboneKind::ConvNet), &device)?;
        assert_eq!(model.kind(), BackboneKind::ConvNet);
        let images = Tensor::<TestBackend, 4>::zeros([2, 3, 32, 32], &device);
        assert_eq!(model.forward(images).dims(), [2, NUM_DISEASES]);
        Ok(())
    }

    #[test]
    fn test_vit_output_shape() -> Result<()> {
        let device = Default::default();
        let config = tiny_config(BackboneKind::VisionTransformer);
        let model = XrayClassifier::<TestBackend>::from_config(&config, &device)?;
        assert_eq!(model.kind(), BackboneKind::VisionTransformer);
        let images = Tensor::<TestBackend, 4>::ones([3, 3, 32, 32], &device);
        assert_eq!(model.forward(images).dims(), [3, NUM_DISEASES]);
        Ok(())
    }

    #[test]
    fn test_pretrained_load_resets_head() -> Result<()> {
        let device = Default::default();
        let dir = TempDir::new()?;
        let mut config = tiny_config(BackboneKind::ConvNet);
        let source = XrayClassifier::<TestBackend>::from_config(&config, &device)?;
        let path = dir.path().join("pretrained");
        source.save_file(&path, &CompactRecorder::new())?;

        config.model.pretrained_path = Some(path);
        let model = XrayClassifier::<TestBackend>::from_config(&config, &device)?;
        let images = Tensor::<TestBackend, 4>::zeros([1, 3, 32, 32], &device);
        assert_eq!(model.forward(images).dims(), [1, NUM_DISEASES]);
        Ok(())
    }
}

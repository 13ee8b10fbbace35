//! Multi-label losses over logits.
//!
//! Both losses work on `[batch, 14]` logits and multi-hot targets and are
//! averaged over every element.

use burn::tensor::{backend::Backend, Tensor};
use xray_core::ImbalanceStrategy;

/// Loss applied during training and evaluation
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum LossKind {
    /// Binary cross-entropy with logits
    Bce,
    /// `alpha * (1 - p_t)^gamma * BCE`
    Focal { alpha: f64, gamma: f64 },
}

impl LossKind {
    /// Oversampling trains with plain BCE; focal loss replaces it otherwise
    pub fn from_strategy(strategy: &ImbalanceStrategy) -> Self {
        match *strategy {
            ImbalanceStrategy::Oversampling => LossKind::Bce,
            ImbalanceStrategy::FocalLoss { alpha, gamma } => LossKind::Focal { alpha, gamma },
        }
    }

    /// Mean loss as a single-element tensor
    pub fn forward<B: Backend>(&self, logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 1> {
        let bce = elementwise_bce(logits, targets);
        match *self {
            LossKind::Bce => bce.mean(),
            LossKind::Focal { alpha, gamma } => {
                let pt = bce.clone().neg().exp();
                let modulator = pt.neg().add_scalar(1.0).powf_scalar(gamma);
                (modulator * bce).mul_scalar(alpha).mean()
            }
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            LossKind::Bce => "bce",
            LossKind::Focal { .. } => "focal",
        }
    }
}

/// `max(x, 0) - x * y + ln(1 + exp(-|x|))`, stable for large logits
fn elementwise_bce<B: Backend>(logits: Tensor<B, 2>, targets: Tensor<B, 2>) -> Tensor<B, 2> {
    let softplus = logits.clone().abs().neg().exp().log1p();
    logits.clone().clamp_min(0.0) - logits * targets + softplus
}

#[cfg(test)]
mod tests {
    use super::*;
    use burn::tensor::{ElementConversion, TensorData};
    use burn_ndarray::NdArray;

    type TestBackend = NdArray;

    fn scalar(t: Tensor<TestBackend, 1>) -> f64 {
        t.into_scalar().elem::<f64>()
    }

    fn tensor(values: Vec<f32>, shape: [usize; 2]) -> Tensor<TestBackend, 2> {
        Tensor::from_floats(TensorData::new(values, shape), &Default::default())
    }

    #[test]
    fn test_bce_zero_logits_is_ln2() {
        let logits = tensor(vec![0.0; 4], [2, 2]);
        let targets = tensor(vec![1.0, 0.0, 0.0, 1.0], [2, 2]);
        let loss = scalar(LossKind::Bce.forward(logits, targets));
        assert!((loss - std::f64::consts::LN_2).abs() < 1e-5);
    }

    #[test]
    fn test_bce_stable_for_large_logits() {
        let logits = tensor(vec![100.0, -100.0], [1, 2]);
        let targets = tensor(vec![1.0, 0.0], [1, 2]);
        let loss = scalar(LossKind::Bce.forward(logits, targets));
        assert!(loss.is_finite());
        assert!(loss < 1e-6);
    }

    #[test]
    fn test_focal_downweights_easy_examples() {
        let focal = LossKind::Focal {
            alpha: 1.0,
            gamma: 2.0,
        };
        let easy = tensor(vec![4.0], [1, 1]);
        let hard = tensor(vec![-1.0], [1, 1]);
        let target = tensor(vec![1.0], [1, 1]);

        let easy_bce = scalar(LossKind::Bce.forward(easy.clone(), target.clone()));
        let easy_focal = scalar(focal.forward(easy, target.clone()));
        let hard_bce = scalar(LossKind::Bce.forward(hard.clone(), target.clone()));
        let hard_focal = scalar(focal.forward(hard, target));

        assert!(easy_focal < easy_bce * 0.01);
        assert!(hard_focal / hard_bce > easy_focal / easy_bce);
    }

    #[test]
    fn test_focal_gamma_zero_matches_scaled_bce() {
        let logits = tensor(vec![0.3, -1.2, 2.0, 0.0], [2, 2]);
        let targets = tensor(vec![1.0, 0.0, 0.0, 1.0], [2, 2]);
        let bce = scalar(LossKind::Bce.forward(logits.clone(), targets.clone()));
        let focal = scalar(
            LossKind::Focal {
                alpha: 0.5,
                gamma: 0.0,
            }
            .forward(logits, targets),
        );
        assert!((focal - 0.5 * bce).abs() < 1e-5);
    }

    #[test]
    fn test_from_strategy() {
        assert_eq!(LossKind::from_strategy(&ImbalanceStrategy::Oversampling), LossKind::Bce);
        assert_eq!(
            LossKind::from_strategy(&ImbalanceStrategy::focal()),
            LossKind::Focal {
                alpha: 1.0,
                gamma: 2.0
            }
        );
    }
}

//! Forward-only evaluation over a whole partition.

use burn::{
    data::dataloader::batcher::Batcher,
    tensor::{activation::sigmoid, backend::Backend, ElementConversion},
};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use xray_core::{Error, MultiLabelMetrics, MultiLabelScores, Result};
use xray_dataset::{SampleSource, XrayBatcher};

use crate::loss::LossKind;
use crate::model::Backbone;

/// Loss and metrics for one partition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvaluationReport {
    /// Mean of the per-batch losses
    pub loss: f64,
    pub metrics: MultiLabelMetrics,
    pub num_samples: usize,
}

/// Run `model` over `source` in fixed order and compute metrics.
///
/// Pass a model without gradient tracking (`model.valid()`). Probabilities
/// and labels of the whole partition are collected before any metric is
/// computed.
pub fn evaluate<B: Backend, M: Backbone<B>>(
    model: &M,
    source: &SampleSource,
    loss_kind: &LossKind,
    target: Option<usize>,
    device: &B::Device,
    partition: &str,
) -> Result<EvaluationReport> {
    if source.is_empty() {
        return Err(Error::EmptySplit(format!("{partition} partition has no records")));
    }

    let batcher = XrayBatcher::<B>::new(device.clone(), source.image_size());
    let mut scores = MultiLabelScores::new();
    let mut loss_sum = 0.0;
    let mut num_batches = 0usize;

    for items in source.batches(0) {
        let batch = batcher.batch(items?);
        let logits = model.forward(batch.images);
        let loss = loss_kind.forward(logits.clone(), batch.targets.clone());
        loss_sum += loss.into_scalar().elem::<f64>();
        num_batches += 1;

        let probabilities = sigmoid(logits)
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| Error::Training(format!("reading probabilities: {e:?}")))?;
        let labels = batch
            .targets
            .into_data()
            .to_vec::<f32>()
            .map_err(|e| Error::Training(format!("reading labels: {e:?}")))?;
        scores.extend(&probabilities, &labels)?;
    }

    let loss = loss_sum / num_batches as f64;
    debug!("{} loss {:.4} over {} batches", partition, loss, num_batches);

    let metrics = MultiLabelMetrics::compute(&scores, target, partition)?;
    if metrics.mean_auc.is_nan() {
        warn!("{} produced non-finite probabilities; metrics are NaN", partition);
    }
    info!("{} metrics:\n{}", partition, metrics.format_table());

    Ok(EvaluationReport {
        loss,
        metrics,
        num_samples: scores.len(),
    })
}

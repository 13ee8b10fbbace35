//! One-epoch training loop.
//!
//! Each batch runs forward, loss, backward and one optimizer step; batches
//! are processed strictly in the order the sample source yields them.

use std::marker::PhantomData;

use burn::{
    data::dataloader::batcher::Batcher,
    module::AutodiffModule,
    optim::{GradientsParams, Optimizer},
    tensor::{backend::AutodiffBackend, ElementConversion},
};
use tracing::{debug, warn};
use xray_core::{Error, Result};
use xray_dataset::{SampleSource, XrayBatcher};

use crate::loss::LossKind;
use crate::model::Backbone;

/// `Idle -> Running -> Idle` around every epoch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrainerPhase {
    Idle,
    Running,
}

/// Owns the optimizer state across epochs
pub struct Trainer<B: AutodiffBackend, M, O> {
    optimizer: O,
    loss: LossKind,
    device: B::Device,
    phase: TrainerPhase,
    _model: PhantomData<M>,
}

impl<B, M, O> Trainer<B, M, O>
where
    B: AutodiffBackend,
    M: AutodiffModule<B> + Backbone<B>,
    O: Optimizer<M, B>,
{
    pub fn new(optimizer: O, loss: LossKind, device: B::Device) -> Self {
        Self {
            optimizer,
            loss,
            device,
            phase: TrainerPhase::Idle,
            _model: PhantomData,
        }
    }

    pub fn phase(&self) -> TrainerPhase {
        self.phase
    }

    /// Train over every batch of `epoch` and return the updated model with
    /// the mean batch loss.
    ///
    /// A non-finite batch loss is logged and still applied; the returned mean
    /// is then NaN or infinite, and so is every later epoch once the weights
    /// have diverged.
    pub fn train_epoch(
        &mut self,
        model: M,
        source: &SampleSource,
        epoch: usize,
        learning_rate: f64,
    ) -> Result<(M, f64)> {
        if source.is_empty() {
            return Err(Error::EmptySplit("train partition has no records".to_string()));
        }

        self.phase = TrainerPhase::Running;
        let outcome = self.run_batches(model, source, epoch, learning_rate);
        self.phase = TrainerPhase::Idle;
        outcome
    }

    fn run_batches(
        &mut self,
        mut model: M,
        source: &SampleSource,
        epoch: usize,
        learning_rate: f64,
    ) -> Result<(M, f64)> {
        let batcher = XrayBatcher::<B>::new(self.device.clone(), source.image_size());
        let num_batches = source.num_batches();
        let mut loss_sum = 0.0;

        for (i, items) in source.batches(epoch).enumerate() {
            let batch = batcher.batch(items?);
            let logits = model.forward(batch.images);
            let loss = self.loss.forward(logits, batch.targets);
            let loss_value = loss.clone().into_scalar().elem::<f64>();
            if !loss_value.is_finite() {
                warn!("Non-finite loss at epoch {} batch {}", epoch, i + 1);
            }

            let grads = loss.backward();
            let grads = GradientsParams::from_grads(grads, &model);
            model = self.optimizer.step(learning_rate, model, grads);
            loss_sum += loss_value;

            if (i + 1) % 50 == 0 {
                debug!(
                    "Epoch {} batch {}/{}: loss = {:.4}",
                    epoch,
                    i + 1,
                    num_batches,
                    loss_value
                );
            }
        }

        Ok((model, loss_sum / num_batches as f64))
    }
}

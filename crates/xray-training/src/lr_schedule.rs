//! Learning rate scheduling.
//!
//! The scheduler is stepped once per epoch with the validation loss. Under
//! reduce-on-plateau the rate is multiplied by `factor` once the loss has
//! failed to improve by a relative `threshold` for more than `patience`
//! consecutive epochs.

use tracing::info;
use xray_core::LrSchedule;

/// Learning rate scheduler
#[derive(Debug, Clone)]
pub struct LearningRateScheduler {
    schedule: LrSchedule,
    current_lr: f64,
    current_epoch: usize,

    // For ReduceOnPlateau
    best_metric: Option<f64>,
    bad_epochs: usize,
}

impl LearningRateScheduler {
    pub fn new(schedule: LrSchedule, base_lr: f64) -> Self {
        Self {
            schedule,
            current_lr: base_lr,
            current_epoch: 0,
            best_metric: None,
            bad_epochs: 0,
        }
    }

    /// Get the current learning rate
    pub fn get_lr(&self) -> f64 {
        self.current_lr
    }

    /// Step with the epoch's validation loss (lower is better)
    pub fn step_with_metric(&mut self, metric: f64) {
        self.current_epoch += 1;

        let LrSchedule::ReduceOnPlateau {
            factor,
            patience,
            threshold,
            min_lr,
        } = self.schedule
        else {
            return;
        };

        let improved = match self.best_metric {
            Some(best) => metric < best * (1.0 - threshold),
            None => !metric.is_nan(),
        };

        if improved {
            self.best_metric = Some(metric);
            self.bad_epochs = 0;
            return;
        }

        self.bad_epochs += 1;
        if self.bad_epochs > patience {
            let new_lr = (self.current_lr * factor).max(min_lr);
            if new_lr < self.current_lr {
                info!(
                    "Reducing learning rate from {:.2e} to {:.2e} at epoch {}",
                    self.current_lr, new_lr, self.current_epoch
                );
            }
            self.current_lr = new_lr;
            self.bad_epochs = 0;
        }
    }

    pub fn current_epoch(&self) -> usize {
        self.current_epoch
    }
}

use crate::{error::Error, result::Result};
use serde::{Deserialize, Serialize};

/// Reduces the learning rate by a factor every `step` updates.
///
/// The rate after `n` updates is `base_lr * factor^floor((n - 1) / step)`, bounded below by `stop_factor_lr`.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FactorScheduler {
    step: usize,
    factor: f64,
    stop_factor_lr: f64,
    count: usize,
    base_lr: f64,
}

impl FactorScheduler {
    /// The lower bound of the learning rate.
    pub const STOP_FACTOR_LR: f64 = 1e-8;
    /// Creates a new scheduler.
    ///
    /// **Errors**
    /// - `step` is less than 1.
    /// - `factor` is greater than 1.
    pub fn new(step: usize, factor: f64) -> Result<Self, Error> {
        if step < 1 {
            return Err(Error::Config(
                "Schedule step must be greater or equal than 1 round".into(),
            ));
        }
        if factor > 1. {
            return Err(Error::Config(
                "Factor must be no more than 1 to make lr reduce".into(),
            ));
        }
        Ok(Self {
            step,
            factor,
            stop_factor_lr: Self::STOP_FACTOR_LR,
            count: 0,
            base_lr: 0.01,
        })
    }
    /// Creates a scheduler that reduces the rate by `lr_factor` every `lr_factor_epoch` epochs.
    ///
    /// Returns None if `lr_factor` is not less than 1.
    pub fn from_epochs(
        lr_factor: f64,
        lr_factor_epoch: f64,
        epoch_size: usize,
    ) -> Result<Option<Self>, Error> {
        if lr_factor >= 1. {
            return Ok(None);
        }
        let step = ((epoch_size as f64 * lr_factor_epoch) as usize).max(1);
        Self::new(step, lr_factor).map(Some)
    }
    /// Sets the initial learning rate.
    pub fn with_base_lr(mut self, base_lr: f64) -> Self {
        self.base_lr = base_lr;
        self
    }
    /// The number of updates between reductions.
    pub fn step(&self) -> usize {
        self.step
    }
    /// The factor of each reduction.
    pub fn factor(&self) -> f64 {
        self.factor
    }
    /// The current learning rate.
    pub fn lr(&self) -> f64 {
        self.base_lr
    }
    /// Returns the learning rate for update `num_update`, starting at 1.
    pub fn call(&mut self, num_update: usize) -> f64 {
        while num_update > self.count + self.step {
            self.count += self.step;
            self.base_lr *= self.factor;
            if self.base_lr < self.stop_factor_lr {
                self.base_lr = self.stop_factor_lr;
                tracing::info!(
                    "Update[{num_update}]: now learning rate arrived at {:.5e}, will not change in the future",
                    self.base_lr
                );
            } else {
                tracing::info!(
                    "Update[{num_update}]: Change learning rate to {:.5e}",
                    self.base_lr
                );
            }
        }
        self.base_lr
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;

    #[test]
    fn invalid() {
        assert!(matches!(FactorScheduler::new(0, 0.5), Err(Error::Config(_))));
        assert!(matches!(FactorScheduler::new(1, 1.5), Err(Error::Config(_))));
    }

    #[test]
    fn reduces_every_step() {
        let mut scheduler = FactorScheduler::new(10, 0.5).unwrap().with_base_lr(0.1);
        for n in 1..=10 {
            assert_relative_eq!(scheduler.call(n), 0.1);
        }
        assert_relative_eq!(scheduler.call(11), 0.05);
        assert_relative_eq!(scheduler.call(20), 0.05);
        assert_relative_eq!(scheduler.call(21), 0.025);
        // Skipping updates applies every missed reduction.
        assert_relative_eq!(scheduler.call(51), 0.1 * 0.5f64.powi(5));
    }

    #[test]
    fn stops_at_minimum() {
        let mut scheduler = FactorScheduler::new(1, 0.1).unwrap().with_base_lr(1.);
        assert_relative_eq!(scheduler.call(100), FactorScheduler::STOP_FACTOR_LR);
        assert_relative_eq!(scheduler.lr(), FactorScheduler::STOP_FACTOR_LR);
    }

    #[test]
    fn from_epochs() {
        assert!(FactorScheduler::from_epochs(1., 1., 468).unwrap().is_none());
        let scheduler = FactorScheduler::from_epochs(0.9, 2.5, 468).unwrap().unwrap();
        assert_eq!(scheduler.step(), 1170);
        assert_relative_eq!(scheduler.factor(), 0.9);
        let scheduler = FactorScheduler::from_epochs(0.9, 0.001, 10).unwrap().unwrap();
        assert_eq!(scheduler.step(), 1);
    }
}

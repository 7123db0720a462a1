use crate::result::Result;
use serde::{Deserialize, Serialize};
use std::time::{Duration, Instant};

/// Checkpoints.
pub mod checkpoint;
/// Losses and metrics.
pub mod criterion;
/// Adversarial training and the DCGAN trainer.
pub mod gan;
/// Optimizers.
pub mod optimizer;
/// Semi-supervised GAN trainer.
pub mod semi_supervised;

/// Running mean of a scalar, ie a loss.
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Mean {
    sum: f64,
    count: usize,
}

impl Mean {
    /// Adds `value`, the mean over `count` items.
    pub fn update(&mut self, value: f32, count: usize) {
        self.sum += value as f64 * count as f64;
        self.count += count;
    }
    /// The mean, or None if empty.
    pub fn mean(&self) -> Option<f32> {
        if self.count > 0 {
            Some((self.sum / self.count as f64) as f32)
        } else {
            None
        }
    }
    /// The number of items.
    pub fn count(&self) -> usize {
        self.count
    }
    /// Clears the mean.
    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Classification statistics.
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct Stats {
    count: usize,
    loss: Option<f32>,
    correct: Option<usize>,
}

impl Stats {
    /// Adds a batch of `count` items with mean `loss` and `correct` predictions.
    pub fn update(&mut self, count: usize, loss: f32, correct: usize) {
        let total = self.count + count;
        let previous = self.loss.unwrap_or(0.) * self.count as f32;
        self.loss = Some((previous + loss * count as f32) / total.max(1) as f32);
        *self.correct.get_or_insert(0) += correct;
        self.count = total;
    }
    /// The number of items.
    pub fn count(&self) -> usize {
        self.count
    }
    /// The mean loss.
    pub fn mean_loss(&self) -> Option<f32> {
        self.loss
    }
    /// The number of correct predictions.
    pub fn correct(&self) -> Option<usize> {
        self.correct
    }
    /// The accuracy in percent.
    pub fn accuracy(&self) -> Option<f32> {
        let correct = self.correct?;
        if self.count > 0 {
            Some(100. * correct as f32 / self.count as f32)
        } else {
            None
        }
    }
}

/// Summary of training.
#[derive(Default, Clone, Debug, Serialize, Deserialize)]
pub struct Summary<S> {
    epoch: usize,
    epoch_time: Duration,
    total_time: Duration,
    stats: S,
}

impl<S: Clone> Summary<S> {
    /// Runs an epoch with `f`.
    ///
    /// Times `f`. If `f` returns `Ok`, updates the epoch time and accumulates the total time and
    /// the epoch. Otherwise returns the error.
    pub fn run_epoch<F>(&mut self, f: F) -> Result<S>
    where
        F: FnOnce(&Self) -> Result<S>,
    {
        let start = Instant::now();
        let stats = f(self)?;
        self.epoch_time = start.elapsed();
        self.total_time += self.epoch_time;
        self.epoch += 1;
        self.stats = stats.clone();
        Ok(stats)
    }
    /// The number of completed epochs.
    pub fn epoch(&self) -> usize {
        self.epoch
    }
    /// The duration of the last epoch.
    pub fn epoch_time(&self) -> Duration {
        self.epoch_time
    }
    /// The total duration.
    pub fn total_time(&self) -> Duration {
        self.total_time
    }
    /// The stats of the last epoch.
    pub fn stats(&self) -> &S {
        &self.stats
    }
}

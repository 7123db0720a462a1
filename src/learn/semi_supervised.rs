use super::{
    criterion::{Accuracy, Criterion, CrossEntropyLoss},
    gan::{adversarial_step, GanLosses, GanStats},
    optimizer::{Adam, Optimizer},
    Stats, Summary,
};
use crate::{
    config::SsganConfig,
    dataset::{mnist::Mnist, select_balanced, Batch, Batches},
    nn::{ssgan, Forward, Network},
    result::Result,
};
use anyhow::{anyhow, ensure};
use candle_core::{Device, Tensor};
use ndarray::{ArrayView1, ArrayView4};
use num_format::{Locale, ToFormattedString};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Statistics of one epoch.
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct SsganStats {
    /// Supervised steps on the labeled subset.
    pub classification: Stats,
    /// Adversarial steps on the unlabeled subset.
    pub adversarial: GanStats,
    /// Evaluation on the test set.
    pub test: Stats,
}

/// Trains a classifier with a small labeled subset, using a GAN on an unlabeled subset.
///
/// The classifier and the discriminator share an [`ssgan::Discriminator`]. Each epoch runs
/// three passes:
/// 1. supervised steps with cross entropy on the labeled subset.
/// 2. adversarial steps on the unlabeled subset, where the real / fake logit is the log sum
///    of the exponentiated class logits.
/// 3. evaluation of the classifier on the test set.
pub struct SsganTrainer {
    config: SsganConfig,
    device: Device,
    generator: Network<ssgan::Generator>,
    discriminator: Network<ssgan::Discriminator>,
    classifier_optimizer: Adam,
    discriminator_optimizer: Adam,
    generator_optimizer: Adam,
    rng: StdRng,
    summary: Summary<SsganStats>,
}

impl SsganTrainer {
    /// Creates the networks and optimizers on `device`.
    ///
    /// The classifier and discriminator optimizers update the same variables.
    pub fn new(device: Device, config: SsganConfig) -> Result<Self> {
        ensure!(config.batch_size > 0, "batch_size must be positive!");
        let rng = if let Some(seed) = config.seed {
            // the host generator cannot be seeded
            if !device.is_cpu() {
                device.set_seed(seed)?;
            }
            StdRng::seed_from_u64(seed)
        } else {
            StdRng::from_entropy()
        };
        let (latent_dim, classes) = (config.latent_dim, config.classes);
        let generator = Network::build(&device, |vb| ssgan::Generator::new(latent_dim, vb))?;
        let discriminator = Network::build(&device, |vb| ssgan::Discriminator::new(classes, vb))?;
        info!(
            generator = %generator.parameter_count().to_formatted_string(&Locale::en),
            discriminator = %discriminator.parameter_count().to_formatted_string(&Locale::en),
            "parameters"
        );
        let classifier_optimizer = Adam::for_network(&discriminator, config.classifier_optimizer)?;
        let discriminator_optimizer =
            Adam::for_network(&discriminator, config.discriminator_optimizer)?;
        let generator_optimizer = Adam::for_network(&generator, config.generator_optimizer)?;
        Ok(Self {
            config,
            device,
            generator,
            discriminator,
            classifier_optimizer,
            discriminator_optimizer,
            generator_optimizer,
            rng,
            summary: Summary::default(),
        })
    }
    /// The config.
    pub fn config(&self) -> &SsganConfig {
        &self.config
    }
    /// The generator.
    pub fn generator(&self) -> &Network<ssgan::Generator> {
        &self.generator
    }
    /// The shared classifier / discriminator.
    pub fn discriminator(&self) -> &Network<ssgan::Discriminator> {
        &self.discriminator
    }
    /// The summary of the epochs trained so far.
    pub fn summary(&self) -> &Summary<SsganStats> {
        &self.summary
    }
    /// Trains the classifier on a labeled batch.
    ///
    /// Returns the loss and the number of correct predictions.
    pub fn supervised_step(&mut self, images: &Tensor, classes: &Tensor) -> Result<(f32, usize)> {
        let logits = self.discriminator.forward(images, true)?;
        let loss = CrossEntropyLoss.eval(&logits, classes)?;
        let correct = Accuracy.eval(&logits, classes)?;
        self.classifier_optimizer.backward_step(&loss)?;
        Ok((loss.to_scalar::<f32>()?, correct))
    }
    /// Performs an adversarial step on an unlabeled batch.
    pub fn unsupervised_step(&mut self, images: &Tensor) -> Result<GanLosses> {
        adversarial_step(
            &self.generator,
            &self.discriminator,
            images,
            self.config.latent_dim,
            &mut self.generator_optimizer,
            &mut self.discriminator_optimizer,
        )
    }
    /// Evaluates the classifier in inference mode.
    ///
    /// Returns the loss and the number of correct predictions.
    pub fn test_step(&self, images: &Tensor, classes: &Tensor) -> Result<(f32, usize)> {
        let logits = self.discriminator.forward(images, false)?;
        let loss = CrossEntropyLoss.eval(&logits, classes)?;
        let correct = Accuracy.eval(&logits, classes)?;
        Ok((loss.to_scalar::<f32>()?, correct))
    }
    /// Trains one epoch, see [`SsganTrainer`].
    pub fn train_epoch<'a, 't>(
        &mut self,
        labeled: (ArrayView4<'a, u8>, ArrayView1<'a, u8>),
        unlabeled: ArrayView4<u8>,
        test: (ArrayView4<'t, u8>, ArrayView1<'t, u8>),
    ) -> Result<SsganStats> {
        let batch_size = self.config.batch_size;
        let mut stats = SsganStats::default();
        let batches = Batches::new(labeled.0, batch_size, &self.device)
            .with_classes(labeled.1)?
            .shuffled(&mut self.rng);
        for batch in batches {
            let (images, classes) = labeled_batch(batch?)?;
            let (loss, correct) = self.supervised_step(&images, &classes)?;
            stats.classification.update(images.dim(0)?, loss, correct);
        }
        let batches = Batches::new(unlabeled, batch_size, &self.device).shuffled(&mut self.rng);
        for batch in batches {
            let images = batch?.images;
            let losses = self.unsupervised_step(&images)?;
            stats.adversarial.update(losses, images.dim(0)?);
        }
        let batches = Batches::new(test.0, batch_size, &self.device).with_classes(test.1)?;
        for batch in batches {
            let (images, classes) = labeled_batch(batch?)?;
            let (loss, correct) = self.test_step(&images, &classes)?;
            stats.test.update(images.dim(0)?, loss, correct);
        }
        Ok(stats)
    }
    /// Loads MNIST and trains, see [`.fit_dataset()`](Self::fit_dataset).
    pub fn fit(&mut self) -> Result<Summary<SsganStats>> {
        let mnist = self.config.mnist.load()?;
        self.fit_dataset(&mnist)
    }
    /// Trains for the configured number of epochs.
    ///
    /// The labeled and unlabeled subsets are selected independently from the training set,
    /// balanced across classes. The test set is evaluated each epoch.
    ///
    /// **Errors**
    /// - The subset sizes are not multiples of the number of classes.
    /// - A class has no training samples.
    pub fn fit_dataset(&mut self, mnist: &Mnist) -> Result<Summary<SsganStats>> {
        let SsganConfig {
            labeled_samples,
            unlabeled_samples,
            classes,
            ..
        } = self.config;
        let (train_images, train_classes) = mnist.train();
        let labeled = select_balanced(
            train_images,
            train_classes,
            labeled_samples,
            classes,
            &mut self.rng,
        )?;
        let (unlabeled, _) = select_balanced(
            train_images,
            train_classes,
            unlabeled_samples,
            classes,
            &mut self.rng,
        )?;
        info!(
            labeled = labeled.0.dim().0,
            unlabeled = unlabeled.dim().0,
            test = mnist.test().1.len(),
            "selected subsets"
        );
        for _ in 0..self.config.epochs {
            let mut summary = self.summary.clone();
            let stats = summary.run_epoch(|_| {
                self.train_epoch(
                    (labeled.0.view(), labeled.1.view()),
                    unlabeled.view(),
                    mnist.test(),
                )
            })?;
            self.summary = summary;
            info!(
                epoch = self.summary.epoch(),
                class_loss = stats.classification.mean_loss(),
                class_accuracy = stats.classification.accuracy(),
                discriminator_loss = stats.adversarial.discriminator_loss(),
                generator_loss = stats.adversarial.generator_loss(),
                test_loss = stats.test.mean_loss(),
                test_accuracy = stats.test.accuracy(),
                seconds = self.summary.epoch_time().as_secs_f32(),
                "epoch"
            );
        }
        Ok(self.summary.clone())
    }
}

fn labeled_batch(batch: Batch) -> Result<(Tensor, Tensor)> {
    let Batch { images, classes } = batch;
    let classes = classes.ok_or_else(|| anyhow!("batch has no classes!"))?;
    Ok((images, classes))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdamConfig;
    use ndarray::{Array1, Array4};

    fn synthetic(n: usize) -> Result<Mnist> {
        let classes = Array1::from_shape_fn(n, |i| (i % 10) as u8);
        let images = Array4::from_shape_fn([n, 1, 28, 28], |(i, _, h, w)| {
            if (h + w) % 10 == i % 10 {
                255
            } else {
                0
            }
        });
        Mnist::from_arrays(images, classes, n / 2)
    }

    fn small_config() -> SsganConfig {
        SsganConfig {
            labeled_samples: 20,
            unlabeled_samples: 10,
            batch_size: 8,
            latent_dim: 4,
            seed: Some(0),
            ..SsganConfig::default()
        }
        .with_epochs(1)
    }

    #[test]
    fn one_epoch() -> Result<()> {
        let mnist = synthetic(40)?;
        let mut trainer = SsganTrainer::new(Device::Cpu, small_config())?;
        let summary = trainer.fit_dataset(&mnist)?;
        assert_eq!(summary.epoch(), 1);
        let stats = summary.stats();
        assert_eq!(stats.classification.count(), 20);
        assert_eq!(stats.test.count(), 20);
        let accuracy = stats.test.accuracy().unwrap();
        assert!((0. ..=100.).contains(&accuracy));
        assert!(stats.adversarial.discriminator_loss().unwrap().is_finite());
        assert!(stats.adversarial.generator_loss().unwrap().is_finite());
        Ok(())
    }

    #[test]
    fn supervised_step_lowers_loss() -> Result<()> {
        let mnist = synthetic(20)?;
        let config = SsganConfig {
            classifier_optimizer: AdamConfig::new(1e-4),
            ..small_config()
        };
        let mut trainer = SsganTrainer::new(Device::Cpu, config)?;
        let (images, classes) = mnist.train();
        let images = crate::dataset::images_to_tensor(images, &Device::Cpu)?;
        let classes = crate::dataset::classes_to_tensor(classes, &Device::Cpu)?;
        let (before, _) = trainer.test_step(&images, &classes)?;
        for _ in 0..20 {
            trainer.supervised_step(&images, &classes)?;
        }
        let (after, _) = trainer.test_step(&images, &classes)?;
        assert!(after < before, "{before} -> {after}");
        Ok(())
    }

    #[test]
    fn train_epoch_views() -> Result<()> {
        let mnist = synthetic(40)?;
        let mut trainer = SsganTrainer::new(Device::Cpu, small_config())?;
        let (images, classes) = mnist.train();
        // labeled images and classes owned by different arrays
        let labeled_images = images.to_owned();
        let labeled_classes = classes.to_owned();
        let stats = trainer.train_epoch(
            (labeled_images.view(), labeled_classes.view()),
            images,
            mnist.test(),
        )?;
        assert_eq!(stats.classification.count(), 20);
        assert!(stats.adversarial.generator_loss().unwrap().is_finite());
        assert_eq!(stats.test.count(), 20);
        Ok(())
    }

    #[test]
    fn unbalanced_subset() -> Result<()> {
        let mnist = synthetic(40)?;
        let config = SsganConfig {
            labeled_samples: 15,
            ..small_config()
        };
        let mut trainer = SsganTrainer::new(Device::Cpu, config)?;
        assert!(trainer.fit_dataset(&mnist).is_err());
        Ok(())
    }
}

use super::{
    checkpoint::{Checkpoint, Checkpointable},
    criterion::{discriminator_loss, generator_loss},
    optimizer::{Adam, Optimizer},
    Mean, Summary,
};
use crate::{
    config::DcganConfig,
    dataset::Batches,
    nn::{dcgan, ssgan, Forward, Network},
    render,
    result::Result,
};
use anyhow::{ensure, Context};
use candle_core::{Device, Tensor};
use ndarray::ArrayView4;
use num_format::{Locale, ToFormattedString};
use rand::{rngs::StdRng, SeedableRng};
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf};
use tracing::{debug, info};

/// Scores a batch as real or fake.
pub trait Discriminate {
    /// Returns one logit per item, shape = \[batch_size, 1\].
    ///
    /// `sigmoid(logit)` is the probability that the item is real.
    fn real_logits(&self, input: &Tensor, train: bool) -> Result<Tensor>;
}

impl Discriminate for dcgan::Discriminator {
    fn real_logits(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        self.forward(input, train)
    }
}

impl Discriminate for ssgan::Discriminator {
    fn real_logits(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        self.real_logit(input, train)
    }
}

impl<L: Discriminate> Discriminate for Network<L> {
    fn real_logits(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        self.layer().real_logits(input, train)
    }
}

/// Losses of one adversarial step.
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GanLosses {
    /// BCE(real, 1) + BCE(fake, 0).
    pub discriminator_loss: f32,
    /// BCE(fake, 1).
    pub generator_loss: f32,
}

/// Performs one adversarial step on a batch of real images.
///
/// Draws one latent vector per real image and generates a fake batch. The discriminator scores
/// both batches in training mode, then each network is updated by its own optimizer with the
/// gradient of its own loss.
pub fn adversarial_step<G, D, O1, O2>(
    generator: &G,
    discriminator: &D,
    real: &Tensor,
    latent_dim: usize,
    generator_optimizer: &mut O1,
    discriminator_optimizer: &mut O2,
) -> Result<GanLosses>
where
    G: Forward,
    D: Discriminate,
    O1: Optimizer,
    O2: Optimizer,
{
    let batch_size = real.dim(0)?;
    let noise = Tensor::randn(0f32, 1f32, (batch_size, latent_dim), real.device())?;
    let fake = generator.forward(&noise, true)?;
    let real_logits = discriminator.real_logits(real, true)?;
    let fake_logits = discriminator.real_logits(&fake, true)?;
    let gen_loss = generator_loss(&fake_logits)?;
    let disc_loss = discriminator_loss(&real_logits, &fake_logits)?;
    let generator_grads = gen_loss.backward()?;
    let discriminator_grads = disc_loss.backward()?;
    generator_optimizer.step(&generator_grads)?;
    discriminator_optimizer.step(&discriminator_grads)?;
    Ok(GanLosses {
        discriminator_loss: disc_loss.to_scalar::<f32>()?,
        generator_loss: gen_loss.to_scalar::<f32>()?,
    })
}

/// Mean losses of an epoch.
#[derive(Default, Clone, Copy, Debug, Serialize, Deserialize)]
pub struct GanStats {
    discriminator: Mean,
    generator: Mean,
}

impl GanStats {
    /// Adds the losses of a batch of `batch_size` items.
    pub fn update(&mut self, losses: GanLosses, batch_size: usize) {
        self.discriminator
            .update(losses.discriminator_loss, batch_size);
        self.generator.update(losses.generator_loss, batch_size);
    }
    /// The mean discriminator loss.
    pub fn discriminator_loss(&self) -> Option<f32> {
        self.discriminator.mean()
    }
    /// The mean generator loss.
    pub fn generator_loss(&self) -> Option<f32> {
        self.generator.mean()
    }
}

/// Trains a [`dcgan::Generator`] against a [`dcgan::Discriminator`] on MNIST digits.
///
/// After every epoch, the fixed sample latents are rendered to "image_at_epoch_{epoch}.png" in
/// the output directory. Every `checkpoint_every` epochs the networks and optimizers are
/// checkpointed. When training finishes, the images are assembled into an animation.
pub struct DcganTrainer {
    config: DcganConfig,
    device: Device,
    generator: Network<dcgan::Generator>,
    discriminator: Network<dcgan::Discriminator>,
    generator_optimizer: Adam,
    discriminator_optimizer: Adam,
    sample_latents: Tensor,
    rng: StdRng,
    checkpoint: Checkpoint,
    summary: Summary<GanStats>,
}

impl DcganTrainer {
    /// Creates the networks and optimizers on `device`.
    pub fn new(device: Device, config: DcganConfig) -> Result<Self> {
        ensure!(config.batch_size > 0, "batch_size must be positive!");
        ensure!(config.samples > 0, "samples must be positive!");
        let rng = if let Some(seed) = config.seed {
            // the host generator cannot be seeded
            if !device.is_cpu() {
                device.set_seed(seed)?;
            }
            StdRng::seed_from_u64(seed)
        } else {
            StdRng::from_entropy()
        };
        let latent_dim = config.latent_dim;
        let generator = Network::build(&device, |vb| dcgan::Generator::new(latent_dim, vb))?;
        let discriminator = Network::build(&device, dcgan::Discriminator::new)?;
        info!(
            generator = %generator.parameter_count().to_formatted_string(&Locale::en),
            discriminator = %discriminator.parameter_count().to_formatted_string(&Locale::en),
            "parameters"
        );
        let generator_optimizer = Adam::for_network(&generator, config.generator_optimizer)?;
        let discriminator_optimizer =
            Adam::for_network(&discriminator, config.discriminator_optimizer)?;
        let sample_latents = Tensor::randn(0f32, 1f32, (config.samples, latent_dim), &device)?;
        let checkpoint = Checkpoint::new(&config.checkpoint_dir, config.checkpoint_prefix.clone());
        Ok(Self {
            config,
            device,
            generator,
            discriminator,
            generator_optimizer,
            discriminator_optimizer,
            sample_latents,
            rng,
            checkpoint,
            summary: Summary::default(),
        })
    }
    /// The config.
    pub fn config(&self) -> &DcganConfig {
        &self.config
    }
    /// The generator.
    pub fn generator(&self) -> &Network<dcgan::Generator> {
        &self.generator
    }
    /// The discriminator.
    pub fn discriminator(&self) -> &Network<dcgan::Discriminator> {
        &self.discriminator
    }
    /// The summary of the epochs trained so far.
    pub fn summary(&self) -> &Summary<GanStats> {
        &self.summary
    }
    /// Saves the networks and optimizers as the next checkpoint.
    pub fn save_checkpoint(&self) -> Result<String> {
        self.checkpoint.save(&[
            ("generator", &self.generator as &dyn Checkpointable),
            ("discriminator", &self.discriminator),
            ("generator_optimizer", &self.generator_optimizer),
            ("discriminator_optimizer", &self.discriminator_optimizer),
        ])
    }
    /// Restores the networks and optimizers from the latest checkpoint, if any.
    pub fn resume(&mut self) -> Result<Option<String>> {
        self.checkpoint.restore_latest(&mut [
            ("generator", &mut self.generator as &mut dyn Checkpointable),
            ("discriminator", &mut self.discriminator),
            ("generator_optimizer", &mut self.generator_optimizer),
            ("discriminator_optimizer", &mut self.discriminator_optimizer),
        ])
    }
    /// Trains one epoch over `images`, shuffled, with shape \[n, 1, 28, 28\].
    pub fn train_epoch(&mut self, images: ArrayView4<u8>) -> Result<GanStats> {
        let mut stats = GanStats::default();
        let batches =
            Batches::new(images, self.config.batch_size, &self.device).shuffled(&mut self.rng);
        for batch in batches {
            let batch = batch?;
            let losses = adversarial_step(
                &self.generator,
                &self.discriminator,
                &batch.images,
                self.config.latent_dim,
                &mut self.generator_optimizer,
                &mut self.discriminator_optimizer,
            )?;
            stats.update(losses, batch.images.dim(0)?);
        }
        Ok(stats)
    }
    /// Renders the sample latents to the image for `epoch`.
    ///
    /// The generator runs in inference mode.
    pub fn render(&self, epoch: usize) -> Result<PathBuf> {
        let images = self.generator.forward(&self.sample_latents, false)?;
        let path = render::epoch_image_path(&self.config.out_dir, epoch);
        render::save_grid(&images, &path)?;
        Ok(path)
    }
    /// Loads MNIST and trains on the training images, see [`.fit_images()`](Self::fit_images).
    pub fn fit(&mut self) -> Result<Summary<GanStats>> {
        let mnist = self.config.mnist.load()?;
        let (images, _) = mnist.train();
        self.fit_images(images)
    }
    /// Trains for the configured number of epochs.
    ///
    /// Returns the summary.
    ///
    /// **Errors**
    /// - `images` are not \[n, 1, 28, 28\].
    /// - Training, rendering or checkpointing failed.
    pub fn fit_images(&mut self, images: ArrayView4<u8>) -> Result<Summary<GanStats>> {
        let (_, c, h, w) = images.dim();
        ensure!(
            (c, h, w) == (1, 28, 28),
            "expected images [n, 1, 28, 28], found {:?}!",
            images.dim()
        );
        let out_dir = self.config.out_dir.clone();
        fs::create_dir_all(&out_dir)
            .with_context(|| format!("failed to create {}", out_dir.display()))?;
        for _ in 0..self.config.epochs {
            let mut summary = self.summary.clone();
            let stats = summary.run_epoch(|_| self.train_epoch(images))?;
            self.summary = summary;
            let epoch = self.summary.epoch();
            info!(
                epoch,
                discriminator_loss = stats.discriminator_loss(),
                generator_loss = stats.generator_loss(),
                seconds = self.summary.epoch_time().as_secs_f32(),
                "epoch"
            );
            self.render(epoch)?;
            let every = self.config.checkpoint_every;
            if every > 0 && epoch % every == 0 {
                self.save_checkpoint()?;
            }
        }
        let path = self.render(self.summary.epoch())?;
        debug!(path = %path.display(), "final samples");
        let animation = out_dir.join(&self.config.animation);
        let frames = render::save_animation(&out_dir, &animation)?;
        info!(path = %animation.display(), frames, "saved animation");
        Ok(self.summary.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AdamConfig;

    #[test]
    fn step_updates_both_networks() -> Result<()> {
        let device = Device::Cpu;
        let generator = Network::build(&device, |vb| dcgan::Generator::new(8, vb))?;
        let discriminator = Network::build(&device, dcgan::Discriminator::new)?;
        let mut generator_optimizer = Adam::for_network(&generator, AdamConfig::new(1e-3))?;
        let mut discriminator_optimizer =
            Adam::for_network(&discriminator, AdamConfig::new(1e-3))?;
        let snapshot = |vars: Vec<(String, candle_core::Var)>| -> Result<Vec<Vec<f32>>> {
            vars.iter()
                .map(|(_, var)| Ok(var.as_tensor().flatten_all()?.to_vec1::<f32>()?))
                .collect()
        };
        let g0 = snapshot(generator.named_vars()?)?;
        let d0 = snapshot(discriminator.named_vars()?)?;
        let real = Tensor::rand(-1f32, 1f32, (4, 1, 28, 28), &device)?;
        let losses = adversarial_step(
            &generator,
            &discriminator,
            &real,
            8,
            &mut generator_optimizer,
            &mut discriminator_optimizer,
        )?;
        assert!(losses.discriminator_loss.is_finite() && losses.discriminator_loss > 0.);
        assert!(losses.generator_loss.is_finite() && losses.generator_loss > 0.);
        assert_ne!(g0, snapshot(generator.named_vars()?)?);
        assert_ne!(d0, snapshot(discriminator.named_vars()?)?);
        assert_eq!(generator_optimizer.steps(), 1);
        assert_eq!(discriminator_optimizer.steps(), 1);
        Ok(())
    }

    #[test]
    fn render_non_square_samples() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = DcganConfig {
            samples: 3,
            out_dir: dir.path().to_path_buf(),
            ..DcganConfig::default()
        };
        let trainer = DcganTrainer::new(Device::Cpu, config)?;
        let path = trainer.render(1)?;
        let image = image::open(&path)?;
        assert_eq!((image.width(), image.height()), (2 * 28, 2 * 28));
        Ok(())
    }

    #[test]
    fn stats_means() {
        let mut stats = GanStats::default();
        assert_eq!(stats.generator_loss(), None);
        let losses = |d, g| GanLosses {
            discriminator_loss: d,
            generator_loss: g,
        };
        stats.update(losses(1., 2.), 3);
        stats.update(losses(3., 4.), 1);
        approx::assert_relative_eq!(stats.discriminator_loss().unwrap(), 1.5);
        approx::assert_relative_eq!(stats.generator_loss().unwrap(), 2.5);
    }
}

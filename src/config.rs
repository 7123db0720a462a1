use crate::{dataset::mnist::Mnist, result::Result};
use anyhow::Context;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::{fs, path::Path, path::PathBuf};

/// Loads a config from a json file.
///
/// Missing fields take their default values.
pub fn from_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let json = fs::read_to_string(path)
        .with_context(|| format!("failed to read config {}", path.display()))?;
    serde_json::from_str(&json)
        .with_context(|| format!("failed to parse config {}", path.display()))
}

/// Adam hyper-parameters.
///
/// Defaults to lr = 0.001, beta1 = 0.9, beta2 = 0.999, epsilon = 1e-7.
#[derive(Clone, Copy, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AdamConfig {
    /// The learning rate.
    pub learning_rate: f64,
    /// Decay of the first moment.
    pub beta1: f64,
    /// Decay of the second moment.
    pub beta2: f64,
    /// Added to the denominator.
    pub epsilon: f64,
}

impl Default for AdamConfig {
    fn default() -> Self {
        Self {
            learning_rate: 1e-3,
            beta1: 0.9,
            beta2: 0.999,
            epsilon: 1e-7,
        }
    }
}

impl AdamConfig {
    /// Adam with `learning_rate`.
    pub fn new(learning_rate: f64) -> Self {
        Self {
            learning_rate,
            ..Self::default()
        }
    }
    /// Sets beta1.
    pub fn with_beta1(self, beta1: f64) -> Self {
        Self { beta1, ..self }
    }
}

/// Where to find MNIST.
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct MnistConfig {
    /// The folder containing "mnist". Defaults to the downloads or temp directory.
    pub data_dir: Option<PathBuf>,
    /// Download missing files.
    pub download: bool,
}

impl MnistConfig {
    /// Loads the dataset.
    pub fn load(&self) -> Result<Mnist> {
        let mut builder = Mnist::builder().download(self.download);
        if let Some(data_dir) = self.data_dir.as_ref() {
            builder = builder.path(data_dir);
        }
        builder.build()
    }
}

/// Configuration of the DCGAN trainer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DcganConfig {
    /// Dataset.
    pub mnist: MnistConfig,
    /// Training batch size.
    pub batch_size: usize,
    /// Number of epochs.
    pub epochs: usize,
    /// Length of the latent vectors.
    pub latent_dim: usize,
    /// Number of samples rendered per epoch, tiled into a grid of ceil(sqrt(samples)) columns.
    pub samples: usize,
    /// Save a checkpoint every n epochs, 0 disables checkpoints.
    pub checkpoint_every: usize,
    /// Checkpoint directory.
    pub checkpoint_dir: PathBuf,
    /// Checkpoint file prefix.
    pub checkpoint_prefix: String,
    /// Directory for the rendered images and the animation.
    pub out_dir: PathBuf,
    /// File name of the animation.
    pub animation: String,
    /// Generator optimizer.
    pub generator_optimizer: AdamConfig,
    /// Discriminator optimizer.
    pub discriminator_optimizer: AdamConfig,
    /// Seed for shuffling, and for the latent vectors on cuda devices.
    pub seed: Option<u64>,
}

impl Default for DcganConfig {
    fn default() -> Self {
        Self {
            mnist: MnistConfig::default(),
            batch_size: 256,
            epochs: 50,
            latent_dim: 100,
            samples: 16,
            checkpoint_every: 15,
            checkpoint_dir: PathBuf::from("training_checkpoints"),
            checkpoint_prefix: "ckpt".to_string(),
            out_dir: PathBuf::from("."),
            animation: "dcgan.gif".to_string(),
            generator_optimizer: AdamConfig::new(1e-4),
            discriminator_optimizer: AdamConfig::new(1e-4),
            seed: None,
        }
    }
}

impl DcganConfig {
    /// Sets the number of epochs.
    pub fn with_epochs(self, epochs: usize) -> Self {
        Self { epochs, ..self }
    }
    /// Sets the batch size.
    pub fn with_batch_size(self, batch_size: usize) -> Self {
        Self { batch_size, ..self }
    }
}

/// Configuration of the semi-supervised GAN trainer.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct SsganConfig {
    /// Dataset.
    pub mnist: MnistConfig,
    /// Size of the labeled subset.
    pub labeled_samples: usize,
    /// Size of the subset used for the adversarial steps.
    pub unlabeled_samples: usize,
    /// Number of classes.
    pub classes: usize,
    /// Batch size of all loaders.
    pub batch_size: usize,
    /// Length of the latent vectors.
    pub latent_dim: usize,
    /// Number of epochs.
    pub epochs: usize,
    /// Classifier optimizer.
    pub classifier_optimizer: AdamConfig,
    /// Discriminator optimizer.
    pub discriminator_optimizer: AdamConfig,
    /// Generator optimizer.
    pub generator_optimizer: AdamConfig,
    /// Seed for subset selection and shuffling, and for the latent vectors on cuda devices.
    pub seed: Option<u64>,
}

impl Default for SsganConfig {
    fn default() -> Self {
        let adam = AdamConfig::new(2e-4).with_beta1(0.5);
        Self {
            mnist: MnistConfig::default(),
            labeled_samples: 1000,
            unlabeled_samples: 1000,
            classes: 10,
            batch_size: 100,
            latent_dim: 100,
            epochs: 20,
            classifier_optimizer: adam,
            discriminator_optimizer: adam,
            generator_optimizer: adam,
            seed: None,
        }
    }
}

impl SsganConfig {
    /// Sets the number of epochs.
    pub fn with_epochs(self, epochs: usize) -> Self {
        Self { epochs, ..self }
    }
}

/// Configuration of the denoising inference.
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct DenoiseConfig {
    /// Frames per model call.
    pub batch_size: usize,
    /// Directory with noisy scans.
    pub noisy_path: PathBuf,
    /// Directory with clean scans.
    pub clean_path: PathBuf,
    /// Directory with the model weights.
    pub ckpt_path: PathBuf,
    /// Output directory.
    pub output_path: PathBuf,
    /// Only write the model predictions.
    pub model_only: bool,
    /// Index of the case to process.
    pub test_image: usize,
    /// Number of models, loaded from "unet3d_{i}.safetensors".
    pub models: usize,
    /// Width of the first U-Net level.
    pub base_channels: usize,
    /// File name suffix of noisy scans, following the case prefix.
    pub noisy_suffix: String,
    /// File name suffix of clean scans, following the case prefix.
    pub clean_suffix: String,
    /// Intensity scale used for normalization.
    pub scale: f32,
    /// Zero padding (before, after) of the spatial axes.
    pub padding: [[usize; 2]; 3],
    /// Edge length of the padded frames.
    pub frame: usize,
}

impl Default for DenoiseConfig {
    fn default() -> Self {
        Self {
            batch_size: 1,
            noisy_path: PathBuf::from("data/noisy"),
            clean_path: PathBuf::from("data/clean"),
            ckpt_path: PathBuf::from("checkpoints"),
            output_path: PathBuf::from("output"),
            model_only: false,
            test_image: 300,
            models: 1,
            base_channels: 16,
            noisy_suffix: "noise_sub2_tp300.nii.gz".to_string(),
            clean_suffix: "clean_sub2_tp300_v2.nii.gz".to_string(),
            scale: 40_000.,
            padding: [[9, 9], [5, 4], [9, 9]],
            frame: 64,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_uses_defaults() -> Result<()> {
        let config: DcganConfig = serde_json::from_str(r#"{ "epochs": 3 }"#)?;
        assert_eq!(config.epochs, 3);
        assert_eq!(config.batch_size, 256);
        assert_eq!(config.checkpoint_every, 15);
        Ok(())
    }

    #[test]
    fn ssgan_optimizers() {
        let config = SsganConfig::default();
        assert_eq!(config.generator_optimizer.beta1, 0.5);
        assert_eq!(config.classifier_optimizer.learning_rate, 2e-4);
    }

    #[test]
    fn denoise_round_trip() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let path = dir.path().join("denoise.json");
        let config = DenoiseConfig {
            test_image: 7,
            ..DenoiseConfig::default()
        };
        fs::write(&path, serde_json::to_string(&config)?)?;
        let loaded: DenoiseConfig = from_json_file(&path)?;
        assert_eq!(loaded.test_image, 7);
        assert_eq!(loaded.padding, [[9, 9], [5, 4], [9, 9]]);
        Ok(())
    }
}

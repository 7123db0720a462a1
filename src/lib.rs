/*!
# ganlab
Adversarial training on MNIST and volumetric denoising inference, built on
[candle](https://docs.rs/candle-core).

Three pipelines are provided, each with a thin binary:
- `dcgan`: an unconditional DCGAN, see [`learn::gan::DcganTrainer`].
- `ssgan`: a semi-supervised GAN with a shared classifier / discriminator backbone,
  see [`learn::semi_supervised::SsganTrainer`].
- `denoise`: applies a pretrained 3-D U-Net to a NIfTI scan, see [`denoise::run`].

# Example
```no_run
# use ganlab::{config::DcganConfig, device::Device, learn::gan::DcganTrainer, result::Result};
# fn main() -> Result<()> {
let config = DcganConfig::default().with_epochs(1);
let mut trainer = DcganTrainer::new(Device::Cpu, config)?;
let summary = trainer.fit()?;
println!("{summary:?}");
# Ok(())
# }
```
*/
#![deny(unsafe_code)]
#![warn(missing_docs)]

/// Result
pub mod result {
    /// Result type alias, defaults to [`anyhow::Error`].
    pub type Result<T, E = anyhow::Error> = std::result::Result<T, E>;
}

/// Configuration of the pipelines.
pub mod config;
/// Datasets.
pub mod dataset;
/// Denoising inference.
pub mod denoise;
/// Devices.
pub mod device;
/// Training.
pub mod learn;
/// Logging.
pub mod logging;
/// Networks.
pub mod nn;
/// Sample rendering.
pub mod render;
/// Volumes.
pub mod volume;

pub use candle_core;
pub use candle_nn;
pub use ndarray;

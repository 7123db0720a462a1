use super::{layer::leaky_relu, Forward};
use crate::result::Result;
use candle_core::{ModuleT, Tensor};
use candle_nn::{
    batch_norm, conv2d, conv_transpose2d_no_bias, linear, linear_no_bias, BatchNorm,
    BatchNormConfig, Conv2d, Conv2dConfig, ConvTranspose2d, ConvTranspose2dConfig, Dropout,
    Linear, Module, VarBuilder,
};

const NEGATIVE_SLOPE: f64 = 0.3;

/// Batch norm with epsilon 1e-3 and a running average decay of 0.99.
fn batch_norm_config() -> BatchNormConfig {
    BatchNormConfig {
        eps: 1e-3,
        momentum: 0.01,
        ..BatchNormConfig::default()
    }
}

/// "same" padded transposed convolution with a 5 x 5 kernel.
fn deconv_config(stride: usize) -> ConvTranspose2dConfig {
    ConvTranspose2dConfig {
        padding: 2,
        output_padding: stride - 1,
        stride,
        ..ConvTranspose2dConfig::default()
    }
}

/// Maps latent vectors to 28 x 28 images in \[-1, 1\].
#[derive(Debug)]
pub struct Generator {
    dense: Linear,
    bn0: BatchNorm,
    deconv1: ConvTranspose2d,
    bn1: BatchNorm,
    deconv2: ConvTranspose2d,
    bn2: BatchNorm,
    deconv3: ConvTranspose2d,
}

impl Generator {
    /// Creates a generator for latent vectors of length `latent_dim`.
    pub fn new(latent_dim: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            dense: linear_no_bias(latent_dim, 7 * 7 * 256, vb.pp("dense"))?,
            bn0: batch_norm(7 * 7 * 256, batch_norm_config(), vb.pp("bn0"))?,
            deconv1: conv_transpose2d_no_bias(256, 128, 5, deconv_config(1), vb.pp("deconv1"))?,
            bn1: batch_norm(128, batch_norm_config(), vb.pp("bn1"))?,
            deconv2: conv_transpose2d_no_bias(128, 64, 5, deconv_config(2), vb.pp("deconv2"))?,
            bn2: batch_norm(64, batch_norm_config(), vb.pp("bn2"))?,
            deconv3: conv_transpose2d_no_bias(64, 1, 5, deconv_config(2), vb.pp("deconv3"))?,
        })
    }
}

impl Forward for Generator {
    fn forward(&self, z: &Tensor, train: bool) -> Result<Tensor> {
        let batch_size = z.dim(0)?;
        let x = self.dense.forward(z)?;
        let x = leaky_relu(&self.bn0.forward_t(&x, train)?, NEGATIVE_SLOPE)?
            .reshape((batch_size, 256, 7, 7))?;
        let x = self.deconv1.forward(&x)?;
        let x = leaky_relu(&self.bn1.forward_t(&x, train)?, NEGATIVE_SLOPE)?;
        let x = self.deconv2.forward(&x)?;
        let x = leaky_relu(&self.bn2.forward_t(&x, train)?, NEGATIVE_SLOPE)?;
        Ok(self.deconv3.forward(&x)?.tanh()?)
    }
}

/// Scores 28 x 28 images, returning one logit per image.
#[derive(Debug)]
pub struct Discriminator {
    conv1: Conv2d,
    conv2: Conv2d,
    dropout: Dropout,
    dense: Linear,
}

impl Discriminator {
    /// Creates a discriminator.
    pub fn new(vb: VarBuilder) -> Result<Self> {
        let config = Conv2dConfig {
            padding: 2,
            stride: 2,
            ..Conv2dConfig::default()
        };
        Ok(Self {
            conv1: conv2d(1, 64, 5, config, vb.pp("conv1"))?,
            conv2: conv2d(64, 128, 5, config, vb.pp("conv2"))?,
            dropout: Dropout::new(0.3),
            dense: linear(128 * 7 * 7, 1, vb.pp("dense"))?,
        })
    }
}

impl Forward for Discriminator {
    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let x = leaky_relu(&self.conv1.forward(x)?, NEGATIVE_SLOPE)?;
        let x = self.dropout.forward_t(&x, train)?;
        let x = leaky_relu(&self.conv2.forward(&x)?, NEGATIVE_SLOPE)?;
        let x = self.dropout.forward_t(&x, train)?.flatten_from(1)?;
        Ok(self.dense.forward(&x)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Network;
    use candle_core::Device;

    #[test]
    fn shapes() -> Result<()> {
        let device = Device::Cpu;
        let generator = Network::build(&device, |vb| Generator::new(100, vb))?;
        let discriminator = Network::build(&device, Discriminator::new)?;
        let z = Tensor::randn(0f32, 1f32, (3, 100), &device)?;
        for train in [true, false] {
            let x = generator.forward(&z, train)?;
            assert_eq!(x.dims(), &[3, 1, 28, 28]);
            let values = x.flatten_all()?.to_vec1::<f32>()?;
            assert!(values.iter().all(|x| (-1. ..=1.).contains(x)));
            let y = discriminator.forward(&x, train)?;
            assert_eq!(y.dims(), &[3, 1]);
        }
        Ok(())
    }

    #[test]
    fn parameter_count() -> Result<()> {
        let device = Device::Cpu;
        let discriminator = Network::build(&device, Discriminator::new)?;
        let expected = (64 * 25 + 64) + (128 * 64 * 25 + 128) + (128 * 7 * 7 + 1);
        assert_eq!(discriminator.parameter_count(), expected);
        Ok(())
    }
}

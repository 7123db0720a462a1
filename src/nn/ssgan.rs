use super::{
    layer::{leaky_relu, log_sum_exp},
    Forward,
};
use crate::result::Result;
use candle_core::{ModuleT, Tensor, D};
use candle_nn::{
    conv2d, conv2d_no_bias, conv_transpose2d_no_bias, linear, Conv2d, Conv2dConfig,
    ConvTranspose2d, ConvTranspose2dConfig, Dropout, Linear, Module, VarBuilder,
};

const NEGATIVE_SLOPE: f64 = 0.2;

/// Collapses class logits into a real / fake probability.
///
/// With `z = sum(exp(logits))`, returns `z / (z + 1)` per row, which lies in \[0, 1).
/// This is the sigmoid of [`log_sum_exp`], which is how it is evaluated.
pub fn real_probability(logits: &Tensor) -> Result<Tensor> {
    let logit = log_sum_exp(logits)?;
    Ok(logit.neg()?.exp()?.affine(1., 1.)?.recip()?)
}

/// Maps latent vectors to 28 x 28 images in \[-1, 1\].
#[derive(Debug)]
pub struct Generator {
    dense: Linear,
    deconv1: ConvTranspose2d,
    deconv2: ConvTranspose2d,
    conv: Conv2d,
}

impl Generator {
    /// Creates a generator for latent vectors of length `latent_dim`.
    pub fn new(latent_dim: usize, vb: VarBuilder) -> Result<Self> {
        let deconv_config = ConvTranspose2dConfig {
            padding: 1,
            stride: 2,
            ..ConvTranspose2dConfig::default()
        };
        let conv_config = Conv2dConfig {
            padding: 3,
            ..Conv2dConfig::default()
        };
        Ok(Self {
            dense: linear(latent_dim, 128 * 7 * 7, vb.pp("dense"))?,
            deconv1: conv_transpose2d_no_bias(128, 128, 4, deconv_config, vb.pp("deconv1"))?,
            deconv2: conv_transpose2d_no_bias(128, 128, 4, deconv_config, vb.pp("deconv2"))?,
            conv: conv2d_no_bias(128, 1, 7, conv_config, vb.pp("conv"))?,
        })
    }
}

impl Forward for Generator {
    fn forward(&self, z: &Tensor, _train: bool) -> Result<Tensor> {
        let batch_size = z.dim(0)?;
        let x = leaky_relu(&self.dense.forward(z)?, NEGATIVE_SLOPE)?
            .reshape((batch_size, 128, 7, 7))?;
        let x = leaky_relu(&self.deconv1.forward(&x)?, NEGATIVE_SLOPE)?;
        let x = leaky_relu(&self.deconv2.forward(&x)?, NEGATIVE_SLOPE)?;
        Ok(self.conv.forward(&x)?.tanh()?)
    }
}

/// Discriminator with a shared backbone and two heads.
///
/// [`Forward`] returns the class logits, the classifier head is the softmax of these.
/// The real / fake head is [`real_probability`] of the same logits, see
/// [`.real_logit()`](Self::real_logit).
#[derive(Debug)]
pub struct Discriminator {
    convs: Vec<Conv2d>,
    dropout: Dropout,
    dense: Linear,
}

impl Discriminator {
    /// Creates a discriminator for `classes` classes.
    pub fn new(classes: usize, vb: VarBuilder) -> Result<Self> {
        let config = Conv2dConfig {
            padding: 1,
            stride: 2,
            ..Conv2dConfig::default()
        };
        let convs = (0..4)
            .map(|i| {
                let inputs = if i == 0 { 1 } else { 128 };
                conv2d(inputs, 128, 3, config, vb.pp(format!("conv{}", i + 1)))
            })
            .collect::<Result<Vec<_>, _>>()?;
        // 28 -> 14 -> 7 -> 4 -> 2
        Ok(Self {
            convs,
            dropout: Dropout::new(0.4),
            dense: linear(128 * 2 * 2, classes, vb.pp("dense"))?,
        })
    }
    /// Class probabilities.
    pub fn classify(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        Ok(candle_nn::ops::softmax(&self.forward(x, train)?, D::Minus1)?)
    }
    /// The real / fake logit, ie the log of the sum of the exponentiated class logits.
    ///
    /// Shape = \[batch_size, 1\].
    pub fn real_logit(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        log_sum_exp(&self.forward(x, train)?)
    }
}

impl Forward for Discriminator {
    fn forward(&self, x: &Tensor, train: bool) -> Result<Tensor> {
        let mut x = x.clone();
        for conv in self.convs.iter() {
            x = leaky_relu(&conv.forward(&x)?, NEGATIVE_SLOPE)?;
        }
        let x = self.dropout.forward_t(&x.flatten_from(1)?, train)?;
        Ok(self.dense.forward(&x)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Network;
    use candle_core::Device;

    #[test]
    fn real_probability_bounds() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(
            &[
                [0f32, 0., 0.],
                [-50., -50., -50.],
                [5., -3., 1.],
                [10., 10., 10.],
                [-1e4, -1e4, -1e4],
            ],
            &device,
        )?;
        let p = real_probability(&logits)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(p.iter().all(|p| (0. ..1.).contains(p)), "{p:?}");
        approx::assert_relative_eq!(p[0], 0.75);
        let z: f32 = [5f32, -3., 1.].iter().map(|x| x.exp()).sum();
        approx::assert_relative_eq!(p[2], z / (z + 1.), max_relative = 1e-5);
        Ok(())
    }

    #[test]
    fn real_probability_saturates() -> Result<()> {
        let logits = Tensor::new(&[[1e4f32, 0.], [-1e30, 1e30]], &Device::Cpu)?;
        let p = real_probability(&logits)?.flatten_all()?.to_vec1::<f32>()?;
        assert!(p.iter().all(|p| p.is_finite() && (0. ..=1.).contains(p)));
        Ok(())
    }

    #[test]
    fn shapes() -> Result<()> {
        let device = Device::Cpu;
        let generator = Network::build(&device, |vb| Generator::new(100, vb))?;
        let discriminator = Network::build(&device, |vb| Discriminator::new(10, vb))?;
        let z = Tensor::randn(0f32, 1f32, (2, 100), &device)?;
        let x = generator.forward(&z, true)?;
        assert_eq!(x.dims(), &[2, 1, 28, 28]);
        let d = discriminator.layer();
        assert_eq!(d.forward(&x, true)?.dims(), &[2, 10]);
        assert_eq!(d.real_logit(&x, false)?.dims(), &[2, 1]);
        let p = d.classify(&x, false)?.sum(1)?.to_vec1::<f32>()?;
        for p in p {
            approx::assert_relative_eq!(p, 1., max_relative = 1e-5);
        }
        Ok(())
    }
}

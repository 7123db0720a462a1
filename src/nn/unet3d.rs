use super::{
    layer::{conv3d, max_pool3d, upsample3d, Conv3d},
    Forward,
};
use crate::result::Result;
use anyhow::ensure;
use candle_core::Tensor;
use candle_nn::VarBuilder;
use serde::{Deserialize, Serialize};

/// [`UNet3d`] hyperparameters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UNet3dConfig {
    /// Input channels.
    pub in_channels: usize,
    /// Output channels.
    pub out_channels: usize,
    /// Channels of the first encoder level, doubled at each level.
    pub base_channels: usize,
}

impl Default for UNet3dConfig {
    fn default() -> Self {
        Self {
            in_channels: 1,
            out_channels: 1,
            base_channels: 16,
        }
    }
}

impl UNet3dConfig {
    /// Sets the base channels.
    pub fn with_base_channels(self, base_channels: usize) -> Self {
        Self {
            base_channels,
            ..self
        }
    }
}

#[derive(Debug)]
struct DoubleConv {
    conv1: Conv3d,
    conv2: Conv3d,
}

impl DoubleConv {
    fn new(inputs: usize, outputs: usize, vb: VarBuilder) -> Result<Self> {
        Ok(Self {
            conv1: conv3d(inputs, outputs, 3, 1, vb.pp("conv1"))?,
            conv2: conv3d(outputs, outputs, 3, 1, vb.pp("conv2"))?,
        })
    }
    fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let x = self.conv1.forward(x)?.relu()?;
        Ok(self.conv2.forward(&x)?.relu()?)
    }
}

/// Two level 3-D U-Net.
///
/// Input and output shape = \[batch_size, channels, depth, height, width\], where the spatial
/// dims are multiples of 4.
#[derive(Debug)]
pub struct UNet3d {
    enc1: DoubleConv,
    enc2: DoubleConv,
    bottleneck: DoubleConv,
    dec2: DoubleConv,
    dec1: DoubleConv,
    head: Conv3d,
}

impl UNet3d {
    /// Creates a U-Net.
    pub fn new(config: UNet3dConfig, vb: VarBuilder) -> Result<Self> {
        let UNet3dConfig {
            in_channels,
            out_channels,
            base_channels: b,
        } = config;
        ensure!(b > 0, "base_channels must be positive!");
        Ok(Self {
            enc1: DoubleConv::new(in_channels, b, vb.pp("enc1"))?,
            enc2: DoubleConv::new(b, 2 * b, vb.pp("enc2"))?,
            bottleneck: DoubleConv::new(2 * b, 4 * b, vb.pp("bottleneck"))?,
            dec2: DoubleConv::new(4 * b + 2 * b, 2 * b, vb.pp("dec2"))?,
            dec1: DoubleConv::new(2 * b + b, b, vb.pp("dec1"))?,
            head: conv3d(b, out_channels, 1, 0, vb.pp("head"))?,
        })
    }
}

impl Forward for UNet3d {
    fn forward(&self, x: &Tensor, _train: bool) -> Result<Tensor> {
        let e1 = self.enc1.forward(x)?;
        let e2 = self.enc2.forward(&max_pool3d(&e1)?)?;
        let b = self.bottleneck.forward(&max_pool3d(&e2)?)?;
        let d2 = self
            .dec2
            .forward(&Tensor::cat(&[&upsample3d(&b)?, &e2], 1)?)?;
        let d1 = self
            .dec1
            .forward(&Tensor::cat(&[&upsample3d(&d2)?, &e1], 1)?)?;
        self.head.forward(&d1)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::nn::Network;
    use candle_core::Device;

    #[test]
    fn shape() -> Result<()> {
        let device = Device::Cpu;
        let config = UNet3dConfig::default().with_base_channels(2);
        let unet = Network::build(&device, |vb| UNet3d::new(config, vb))?;
        let x = Tensor::randn(0f32, 1f32, (2, 1, 8, 8, 4), &device)?;
        let y = unet.forward(&x, false)?;
        assert_eq!(y.dims(), x.dims());
        Ok(())
    }

    #[test]
    fn indivisible_dims() -> Result<()> {
        let device = Device::Cpu;
        let config = UNet3dConfig::default().with_base_channels(1);
        let unet = Network::build(&device, |vb| UNet3d::new(config, vb))?;
        let x = Tensor::zeros((1, 1, 6, 4, 4), candle_core::DType::F32, &device)?;
        assert!(unet.forward(&x, false).is_err());
        Ok(())
    }
}

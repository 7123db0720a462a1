/*!
# Networks
Networks are plain structs of [candle_nn] layers, constructed from a [`VarBuilder`] and wrapped
in a [`Network`], which owns the variables.

```
# use ganlab::{device::Device, nn::{dcgan::Generator, Forward, Network}, result::Result};
# use ganlab::candle_core::Tensor;
# fn main() -> Result<()> {
let generator = Network::build(&Device::Cpu, |vb| Generator::new(100, vb))?;
let z = Tensor::randn(0f32, 1f32, (2, 100), &Device::Cpu)?;
let images = generator.forward(&z, false)?;
assert_eq!(images.dims(), &[2, 1, 28, 28]);
# Ok(())
# }
```
*/
use crate::result::Result;
use anyhow::anyhow;
use candle_core::{DType, Device, Tensor, Var};
use candle_nn::{VarBuilder, VarMap};
use std::path::Path;

/// Layers not provided by candle.
pub mod layer;

/// DCGAN generator and discriminator.
pub mod dcgan;

/// Semi-supervised GAN generator and two headed discriminator.
pub mod ssgan;

/// 3-D U-Net for volume denoising.
pub mod unet3d;

/// Computes the output as a function of the input.
pub trait Forward {
    /// Computes the forward pass.
    ///
    /// `train` selects training behavior for dropout and batch normalization.
    ///
    /// **Errors**
    /// Returns an error if the operation could not be performed, ie the input has the wrong shape.
    fn forward(&self, input: &Tensor, train: bool) -> Result<Tensor>;
}

/// A network and its variables.
pub struct Network<L> {
    layer: L,
    varmap: VarMap,
    device: Device,
}

impl<L> Network<L> {
    /// Creates the variables on `device` and constructs the layer with `f`.
    pub fn build<F>(device: &Device, f: F) -> Result<Self>
    where
        F: FnOnce(VarBuilder) -> Result<L>,
    {
        let varmap = VarMap::new();
        let var_builder = VarBuilder::from_varmap(&varmap, DType::F32, device);
        let layer = f(var_builder)?;
        Ok(Self {
            layer,
            varmap,
            device: device.clone(),
        })
    }
    /// The layer.
    pub fn layer(&self) -> &L {
        &self.layer
    }
    /// The variables.
    pub fn varmap(&self) -> &VarMap {
        &self.varmap
    }
    /// The device.
    pub fn device(&self) -> &Device {
        &self.device
    }
    /// The variables, sorted by name.
    pub fn named_vars(&self) -> Result<Vec<(String, Var)>> {
        let data = self
            .varmap
            .data()
            .lock()
            .map_err(|_| anyhow!("variables poisoned!"))?;
        let mut vars: Vec<_> = data
            .iter()
            .map(|(name, var)| (name.clone(), var.clone()))
            .collect();
        vars.sort_by(|a, b| a.0.cmp(&b.0));
        Ok(vars)
    }
    /// The number of scalar parameters.
    pub fn parameter_count(&self) -> usize {
        self.varmap
            .all_vars()
            .iter()
            .map(|var| var.elem_count())
            .sum()
    }
    /// Saves the variables to a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.save(path)?;
        Ok(())
    }
    /// Loads the variables from a safetensors file.
    ///
    /// **Errors**
    /// - The file does not contain a variable of the network, or its shape differs.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        self.varmap.load(path)?;
        Ok(())
    }
}

impl<L: Forward> Forward for Network<L> {
    fn forward(&self, input: &Tensor, train: bool) -> Result<Tensor> {
        self.layer.forward(input, train)
    }
}

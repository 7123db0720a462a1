use crate::{config::AdamConfig, nn::Network, result::Result};
use anyhow::{bail, Context};
use candle_core::{backprop::GradStore, DType, Tensor, Var};
use std::{collections::HashMap, path::Path};

/// Optimizers update the variables based on their gradients.
///
/// They may also store per variable state like the moment estimates of [`Adam`].
pub trait Optimizer {
    /// Updates the variables with `grads`.
    ///
    /// Variables without a gradient are left unchanged.
    ///
    /// **Errors**
    /// Returns an error if the update could not be performed.
    fn step(&mut self, grads: &GradStore) -> Result<()>;
    /// Computes the gradients of `loss` and updates the variables.
    fn backward_step(&mut self, loss: &Tensor) -> Result<()> {
        let grads = loss.backward()?;
        self.step(&grads)
    }
    /// The learning rate.
    fn learning_rate(&self) -> f64;
}

#[derive(Debug)]
struct AdamVar {
    name: String,
    var: Var,
    m: Var,
    v: Var,
}

/// Adam.
///
/// Each step computes
/// ```text
/// m = beta1 * m + (1 - beta1) * g
/// v = beta2 * v + (1 - beta2) * g^2
/// lr_t = learning_rate * sqrt(1 - beta2^t) / (1 - beta1^t)
/// w = w - lr_t * m / (sqrt(v) + epsilon)
/// ```
///
/// The moments are stored per named variable so that the state can be checkpointed
/// with [`.save()`](Adam::save) and [`.load()`](Adam::load).
#[derive(Debug)]
pub struct Adam {
    config: AdamConfig,
    vars: Vec<AdamVar>,
    step: usize,
}

impl Adam {
    /// Creates an optimizer for `vars`.
    pub fn new(vars: Vec<(String, Var)>, config: AdamConfig) -> Result<Self> {
        let vars = vars
            .into_iter()
            .filter(|(_, var)| var.dtype().is_float())
            .map(|(name, var)| {
                let m = Var::zeros(var.dims(), var.dtype(), var.device())?;
                let v = Var::zeros(var.dims(), var.dtype(), var.device())?;
                Ok(AdamVar { name, var, m, v })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            config,
            vars,
            step: 0,
        })
    }
    /// Creates an optimizer for the variables of `network`.
    pub fn for_network<L>(network: &Network<L>, config: AdamConfig) -> Result<Self> {
        Self::new(network.named_vars()?, config)
    }
    /// The hyper-parameters.
    pub fn config(&self) -> &AdamConfig {
        &self.config
    }
    /// The number of steps taken.
    pub fn steps(&self) -> usize {
        self.step
    }
    /// Saves the moments and the step count to a safetensors file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let mut tensors = HashMap::with_capacity(2 * self.vars.len() + 1);
        for AdamVar { name, m, v, .. } in self.vars.iter() {
            tensors.insert(format!("{name}.m"), m.as_tensor().clone());
            tensors.insert(format!("{name}.v"), v.as_tensor().clone());
        }
        let step = Tensor::new(&[self.step as i64], &candle_core::Device::Cpu)?;
        tensors.insert("step".to_string(), step);
        candle_core::safetensors::save(&tensors, path)?;
        Ok(())
    }
    /// Loads the moments and the step count from a safetensors file.
    ///
    /// **Errors**
    /// - A moment is missing or has the wrong shape.
    pub fn load(&mut self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        let tensors = candle_core::safetensors::load(path, &candle_core::Device::Cpu)
            .with_context(|| format!("failed to load optimizer state {}", path.display()))?;
        for AdamVar { name, var, m, v } in self.vars.iter() {
            for (suffix, moment) in [("m", m), ("v", v)] {
                let key = format!("{name}.{suffix}");
                let Some(value) = tensors.get(&key) else {
                    bail!("{key} not found in {}!", path.display());
                };
                if value.shape() != var.shape() {
                    bail!(
                        "{key} has shape {:?}, expected {:?}!",
                        value.shape(),
                        var.shape()
                    );
                }
                moment.set(&value.to_device(var.device())?.to_dtype(var.dtype())?)?;
            }
        }
        let step = tensors
            .get("step")
            .with_context(|| format!("step not found in {}!", path.display()))?
            .to_dtype(DType::I64)?
            .to_vec1::<i64>()?;
        self.step = step.first().copied().unwrap_or(0).max(0) as usize;
        Ok(())
    }
}

impl Optimizer for Adam {
    fn step(&mut self, grads: &GradStore) -> Result<()> {
        self.step += 1;
        let AdamConfig {
            learning_rate,
            beta1,
            beta2,
            epsilon,
        } = self.config;
        let t = self.step as i32;
        let lr_t = learning_rate * (1. - beta2.powi(t)).sqrt() / (1. - beta1.powi(t));
        for AdamVar { var, m, v, .. } in self.vars.iter() {
            let Some(g) = grads.get(var.as_tensor()) else {
                continue;
            };
            let next_m = m.affine(beta1, 0.)?.add(&g.affine(1. - beta1, 0.)?)?;
            let next_v = v.affine(beta2, 0.)?.add(&g.sqr()?.affine(1. - beta2, 0.)?)?;
            let update = next_m
                .div(&next_v.sqrt()?.affine(1., epsilon)?)?
                .affine(lr_t, 0.)?;
            var.set(&var.sub(&update)?)?;
            m.set(&next_m)?;
            v.set(&next_v)?;
        }
        Ok(())
    }
    fn learning_rate(&self) -> f64 {
        self.config.learning_rate
    }
}

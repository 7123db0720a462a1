use crate::result::Result;
use anyhow::ensure;
use candle_core::{DType, Tensor, D};

/// Evaluates an output against a target.
pub trait Criterion<X, T> {
    /// The result, ie a loss tensor or a count.
    type Output;
    /// Evaluates `input` against `target`.
    ///
    /// **Errors**
    /// Returns an error if the shapes or types do not match.
    fn eval(&self, input: X, target: T) -> Result<Self::Output>;
}

/// Counts the rows whose largest logit is at the target class.
#[derive(Default, Debug)]
pub struct Accuracy;

impl Criterion<&Tensor, &Tensor> for Accuracy {
    type Output = usize;
    fn eval(&self, input: &Tensor, target: &Tensor) -> Result<usize> {
        let predicted = input.argmax(D::Minus1)?;
        let target = target.to_dtype(DType::U32)?;
        let correct = predicted
            .eq(&target)?
            .to_dtype(DType::U32)?
            .sum_all()?
            .to_scalar::<u32>()?;
        Ok(correct as usize)
    }
}

/// Cross entropy of logits \[batch_size, classes\] against u32 classes \[batch_size\],
/// averaged over the batch.
#[derive(Default, Debug)]
pub struct CrossEntropyLoss;

impl Criterion<&Tensor, &Tensor> for CrossEntropyLoss {
    type Output = Tensor;
    fn eval(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        Ok(candle_nn::loss::cross_entropy(input, target)?)
    }
}

/// Binary cross entropy of logits against targets in \[0, 1\], averaged over all elements.
///
/// Evaluated as `max(x, 0) - x * t + log(1 + exp(-|x|))`, which is finite for any finite logit.
#[derive(Default, Debug)]
pub struct BinaryCrossEntropyWithLogits;

impl Criterion<&Tensor, &Tensor> for BinaryCrossEntropyWithLogits {
    type Output = Tensor;
    fn eval(&self, input: &Tensor, target: &Tensor) -> Result<Tensor> {
        ensure!(
            input.dims() == target.dims(),
            "logits {:?} != targets {:?}!",
            input.dims(),
            target.dims()
        );
        let softplus = input.abs()?.neg()?.exp()?.affine(1., 1.)?.log()?;
        let loss = input.relu()?.sub(&input.mul(target)?)?.add(&softplus)?;
        Ok(loss.mean_all()?)
    }
}

/// The non-saturating generator loss, BCE(fake, 1).
pub fn generator_loss(fake_logits: &Tensor) -> Result<Tensor> {
    BinaryCrossEntropyWithLogits.eval(fake_logits, &fake_logits.ones_like()?)
}

/// The discriminator loss, BCE(real, 1) + BCE(fake, 0).
pub fn discriminator_loss(real_logits: &Tensor, fake_logits: &Tensor) -> Result<Tensor> {
    let real = BinaryCrossEntropyWithLogits.eval(real_logits, &real_logits.ones_like()?)?;
    let fake = BinaryCrossEntropyWithLogits.eval(fake_logits, &fake_logits.zeros_like()?)?;
    Ok(real.add(&fake)?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::Device;

    fn bce(x: f32, t: f32) -> f32 {
        let p = 1. / (1. + (-x).exp());
        -(t * p.ln() + (1. - t) * (1. - p).ln())
    }

    #[test]
    fn bce_closed_form() -> Result<()> {
        let device = Device::Cpu;
        let x = [-2f32, -0.5, 0., 1., 3.];
        let t = [0f32, 1., 0.5, 1., 0.];
        let loss = BinaryCrossEntropyWithLogits
            .eval(&Tensor::new(&x, &device)?, &Tensor::new(&t, &device)?)?
            .to_scalar::<f32>()?;
        let expected = x.iter().zip(t).map(|(x, t)| bce(*x, t)).sum::<f32>() / 5.;
        assert_relative_eq!(loss, expected, max_relative = 1e-5);
        Ok(())
    }

    #[test]
    fn bce_large_logits() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::new(&[[1e4f32], [-1e4]], &device)?;
        let t = Tensor::new(&[[0f32], [1.]], &device)?;
        let loss = BinaryCrossEntropyWithLogits.eval(&x, &t)?.to_scalar::<f32>()?;
        assert!(loss.is_finite());
        assert_relative_eq!(loss, 1e4, max_relative = 1e-5);
        Ok(())
    }

    #[test]
    fn bce_shape_mismatch() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::zeros((2, 1), DType::F32, &device)?;
        let t = Tensor::zeros(2, DType::F32, &device)?;
        assert!(BinaryCrossEntropyWithLogits.eval(&x, &t).is_err());
        Ok(())
    }

    #[test]
    fn confident_discriminator() -> Result<()> {
        let device = Device::Cpu;
        let real = Tensor::new(&[[20f32], [15.]], &device)?;
        let fake = Tensor::new(&[[-20f32], [-15.]], &device)?;
        let d = discriminator_loss(&real, &fake)?.to_scalar::<f32>()?;
        assert!(d < 1e-5, "{d}");
        let g = generator_loss(&fake)?.to_scalar::<f32>()?;
        assert!(g > 10., "{g}");
        Ok(())
    }

    #[test]
    fn accuracy_and_cross_entropy() -> Result<()> {
        let device = Device::Cpu;
        let logits = Tensor::new(&[[2f32, 0., 0.], [0., 0., 5.], [1., 3., 0.]], &device)?;
        let target = Tensor::new(&[0u32, 2, 0], &device)?;
        assert_eq!(Accuracy.eval(&logits, &target)?, 2);
        let loss = CrossEntropyLoss.eval(&logits, &target)?.to_scalar::<f32>()?;
        let row = |x: [f32; 3], t: usize| {
            let z: f32 = x.iter().map(|x| x.exp()).sum();
            z.ln() - x[t]
        };
        let expected = (row([2., 0., 0.], 0) + row([0., 0., 5.], 2) + row([1., 3., 0.], 0)) / 3.;
        assert_relative_eq!(loss, expected, max_relative = 1e-5);
        Ok(())
    }
}

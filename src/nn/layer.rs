use crate::result::Result;
use anyhow::{anyhow, ensure};
use candle_core::{Tensor, D};
use candle_nn::{init::DEFAULT_KAIMING_NORMAL, Init, VarBuilder};

/// Leaky ReLU, `max(x, negative_slope * x)`.
///
/// `negative_slope` must be less than 1.
pub fn leaky_relu(x: &Tensor, negative_slope: f64) -> Result<Tensor> {
    Ok(x.maximum(&x.affine(negative_slope, 0.)?)?)
}

/// Numerically stable `log(sum(exp(x)))` over the last axis, keeping the axis.
pub fn log_sum_exp(x: &Tensor) -> Result<Tensor> {
    let max = x.max_keepdim(D::Minus1)?;
    let sum = x.broadcast_sub(&max)?.exp()?.sum_keepdim(D::Minus1)?;
    Ok(sum.log()?.add(&max)?)
}

/// Stride 1 3-D convolution.
///
/// candle has no 3-D convolution, so the depth axis is folded into the batch and the
/// convolution is computed as a sum of 2-D convolutions, one per kernel depth slice.
#[derive(Debug, Clone)]
pub struct Conv3d {
    weight: Tensor,
    bias: Option<Tensor>,
    padding: usize,
}

/// Creates a [`Conv3d`] with a cubic `kernel` and a bias.
///
/// Variables: "weight" \[outputs, inputs, kernel, kernel, kernel\], "bias" \[outputs\].
pub fn conv3d(
    inputs: usize,
    outputs: usize,
    kernel: usize,
    padding: usize,
    vb: VarBuilder,
) -> Result<Conv3d> {
    let weight = vb.get_with_hints(
        (outputs, inputs, kernel, kernel, kernel),
        "weight",
        DEFAULT_KAIMING_NORMAL,
    )?;
    let bound = 1. / ((inputs * kernel.pow(3)) as f64).sqrt();
    let bias = vb.get_with_hints(
        outputs,
        "bias",
        Init::Uniform {
            lo: -bound,
            up: bound,
        },
    )?;
    Ok(Conv3d {
        weight,
        bias: Some(bias),
        padding,
    })
}

impl Conv3d {
    /// The weight.
    pub fn weight(&self) -> &Tensor {
        &self.weight
    }
    /// Applies the convolution to an input with shape \[batch, channels, depth, height, width\].
    pub fn forward(&self, x: &Tensor) -> Result<Tensor> {
        let (n, c, d, _, _) = x.dims5()?;
        let (outputs, inputs, kernel_depth, _, _) = self.weight.dims5()?;
        ensure!(c == inputs, "expected {inputs} channels, found {c}!");
        let padding = self.padding;
        let x = if padding > 0 {
            x.pad_with_zeros(2, padding, padding)?
        } else {
            x.clone()
        };
        let depth = (d + 2 * padding)
            .checked_sub(kernel_depth)
            .map(|x| x + 1)
            .ok_or_else(|| anyhow!("input depth {d} is smaller than the kernel!"))?;
        let (_, _, _, h, w) = x.dims5()?;
        let mut y: Option<Tensor> = None;
        for k in 0..kernel_depth {
            let slab = x
                .narrow(2, k, depth)?
                .permute((0, 2, 1, 3, 4))?
                .contiguous()?
                .reshape((n * depth, c, h, w))?;
            let weight = self.weight.narrow(2, k, 1)?.squeeze(2)?.contiguous()?;
            let out = slab.conv2d(&weight, padding, 1, 1, 1)?;
            y = Some(match y {
                Some(y) => y.add(&out)?,
                None => out,
            });
        }
        let y = y.ok_or_else(|| anyhow!("kernel depth is 0!"))?;
        let (_, _, h_out, w_out) = y.dims4()?;
        let y = y
            .reshape((n, depth, outputs, h_out, w_out))?
            .permute((0, 2, 1, 3, 4))?
            .contiguous()?;
        if let Some(bias) = self.bias.as_ref() {
            Ok(y.broadcast_add(&bias.reshape((1, outputs, 1, 1, 1))?)?)
        } else {
            Ok(y)
        }
    }
}

/// 2 x 2 x 2 max pooling with stride 2.
pub fn max_pool3d(x: &Tensor) -> Result<Tensor> {
    let (n, c, d, h, w) = x.dims5()?;
    ensure!(
        d % 2 == 0 && h % 2 == 0 && w % 2 == 0,
        "pooling requires even dims, found {:?}!",
        x.dims()
    );
    let x = x
        .contiguous()?
        .reshape(vec![n, c, d / 2, 2, h / 2, 2, w / 2, 2])?;
    Ok(x.max(7)?.max(5)?.max(3)?)
}

/// Nearest neighbor upsampling by 2 along depth, height and width.
pub fn upsample3d(x: &Tensor) -> Result<Tensor> {
    let (n, c, d, h, w) = x.dims5()?;
    Ok(x
        .contiguous()?
        .reshape(vec![n, c, d, 1, h, 1, w, 1])?
        .broadcast_as(vec![n, c, d, 2, h, 2, w, 2])?
        .contiguous()?
        .reshape((n, c, 2 * d, 2 * h, 2 * w))?)
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_relative_eq;
    use candle_core::{DType, Device};
    use candle_nn::VarMap;

    #[test]
    fn leaky_relu_slope() -> Result<()> {
        let x = Tensor::new(&[-2f32, 0., 3.], &Device::Cpu)?;
        let y = leaky_relu(&x, 0.2)?.to_vec1::<f32>()?;
        assert_relative_eq!(y[0], -0.4);
        assert_eq!(y[1], 0.);
        assert_eq!(y[2], 3.);
        Ok(())
    }

    #[test]
    fn log_sum_exp_large() -> Result<()> {
        let x = Tensor::new(&[[1000f32, 1000.], [0., 0.]], &Device::Cpu)?;
        let y = log_sum_exp(&x)?.to_vec2::<f32>()?;
        assert_relative_eq!(y[0][0], 1000. + 2f32.ln());
        assert_relative_eq!(y[1][0], 2f32.ln());
        Ok(())
    }

    #[test]
    fn conv3d_matches_direct() -> Result<()> {
        let device = Device::Cpu;
        let varmap = VarMap::new();
        let vb = VarBuilder::from_varmap(&varmap, DType::F32, &device);
        let conv = conv3d(2, 3, 3, 1, vb)?;
        let x = Tensor::randn(0f32, 1f32, (1, 2, 4, 5, 3), &device)?;
        let y = conv.forward(&x)?;
        assert_eq!(y.dims(), &[1, 3, 4, 5, 3]);
        // compare a few output voxels with a direct evaluation
        let x = x.flatten_all()?.to_vec1::<f32>()?;
        let weight = conv.weight().flatten_all()?.to_vec1::<f32>()?;
        let y = y.flatten_all()?.to_vec1::<f32>()?;
        let bias = conv.bias.as_ref().unwrap().to_vec1::<f32>()?;
        let (d, h, w) = (4usize, 5usize, 3usize);
        let at = |c: usize, z: isize, r: isize, s: isize| -> f32 {
            if z < 0 || r < 0 || s < 0 || z >= d as isize || r >= h as isize || s >= w as isize {
                0.
            } else {
                x[((c * d + z as usize) * h + r as usize) * w + s as usize]
            }
        };
        for (o, z, r, s) in [(0usize, 0usize, 0usize, 0usize), (2, 3, 4, 2), (1, 2, 2, 1)] {
            let mut expected = bias[o];
            for c in 0..2 {
                for kz in 0..3 {
                    for kr in 0..3 {
                        for ks in 0..3 {
                            let wi = (((o * 2 + c) * 3 + kz) * 3 + kr) * 3 + ks;
                            expected += weight[wi]
                                * at(
                                    c,
                                    z as isize + kz as isize - 1,
                                    r as isize + kr as isize - 1,
                                    s as isize + ks as isize - 1,
                                );
                        }
                    }
                }
            }
            let actual = y[((o * d + z) * h + r) * w + s];
            assert_relative_eq!(actual, expected, epsilon = 1e-4);
        }
        Ok(())
    }

    #[test]
    fn pool_upsample() -> Result<()> {
        let device = Device::Cpu;
        let x = Tensor::arange(0f32, 64., &device)?.reshape((1, 1, 4, 4, 4))?;
        let y = max_pool3d(&x)?;
        assert_eq!(y.dims(), &[1, 1, 2, 2, 2]);
        let y = y.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(y, vec![21., 23., 29., 31., 53., 55., 61., 63.]);
        let z = upsample3d(&Tensor::arange(0f32, 8., &device)?.reshape((1, 1, 2, 2, 2))?)?;
        assert_eq!(z.dims(), &[1, 1, 4, 4, 4]);
        let z = z.flatten_all()?.to_vec1::<f32>()?;
        assert_eq!(z[0], 0.);
        assert_eq!(z[1], 0.);
        assert_eq!(z[2], 1.);
        assert_eq!(z[63], 7.);
        Ok(())
    }

    #[test]
    fn pool_odd_dims() -> Result<()> {
        let x = Tensor::zeros((1, 1, 3, 4, 4), DType::F32, &Device::Cpu)?;
        assert!(max_pool3d(&x).is_err());
        Ok(())
    }
}

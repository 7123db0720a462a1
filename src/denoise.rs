use crate::{
    config::DenoiseConfig,
    nn::{
        unet3d::{UNet3d, UNet3dConfig},
        Forward, Network,
    },
    result::Result,
    volume::{self, Volume},
};
use anyhow::{bail, ensure, Context};
use candle_core::{Device, Tensor};
use ndarray::{s, Array4};
use std::{
    collections::BTreeSet,
    fs,
    path::{Path, PathBuf},
};
use tracing::{debug, info};

/// File names written to the output directory.
pub mod outputs {
    /// The padded noisy scan.
    pub const NOISY: &str = "noisy_output.nii.gz";
    /// The padded clean scan.
    pub const CLEAN: &str = "clean_output.nii.gz";
    /// The prediction of model `i`.
    pub fn model(i: usize) -> String {
        format!("model_output_{i}.nii.gz")
    }
}

/// A noisy scan and its clean reference.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Case {
    /// The shared file name prefix.
    pub prefix: String,
    /// The noisy scan.
    pub noisy: PathBuf,
    /// The clean scan.
    pub clean: PathBuf,
}

/// Lists the cases in the noisy directory.
///
/// The prefix of a file is its name up to "noise". Hidden files are skipped. Cases are sorted by
/// prefix and each prefix is listed once.
pub fn discover_cases(config: &DenoiseConfig) -> Result<Vec<Case>> {
    let dir = &config.noisy_path;
    let mut prefixes = BTreeSet::new();
    for entry in fs::read_dir(dir).with_context(|| format!("failed to read {}", dir.display()))? {
        let name = entry?.file_name();
        let name = name.to_string_lossy();
        if name.starts_with('.') {
            continue;
        }
        if let Some(prefix) = name.split("noise").next() {
            prefixes.insert(prefix.to_string());
        }
    }
    Ok(prefixes
        .into_iter()
        .map(|prefix| Case {
            noisy: config
                .noisy_path
                .join(format!("{prefix}{}", config.noisy_suffix)),
            clean: config
                .clean_path
                .join(format!("{prefix}{}", config.clean_suffix)),
            prefix,
        })
        .collect())
}

/// Loads model `index`, ie "unet3d_0.safetensors", from the checkpoint directory.
pub fn load_model(
    config: &DenoiseConfig,
    index: usize,
    device: &Device,
) -> Result<Network<UNet3d>> {
    let unet_config = UNet3dConfig::default().with_base_channels(config.base_channels);
    let mut model = Network::build(device, |vb| UNet3d::new(unet_config, vb))?;
    let path = config.ckpt_path.join(format!("unet3d_{index}.safetensors"));
    model
        .load(&path)
        .with_context(|| format!("failed to load model {}", path.display()))?;
    info!(path = %path.display(), parameters = model.parameter_count(), "loaded model");
    Ok(model)
}

/// Runs `model` in inference mode over frames (t, x, y, z), `batch_size` frames at a time.
///
/// Returns the predictions with the same shape.
pub fn predict<M: Forward>(
    model: &M,
    frames: &Array4<f32>,
    batch_size: usize,
    device: &Device,
) -> Result<Array4<f32>> {
    ensure!(batch_size > 0, "batch_size must be positive!");
    let (t, x, y, z) = frames.dim();
    let mut output = Array4::zeros((t, x, y, z));
    for start in (0..t).step_by(batch_size) {
        let end = (start + batch_size).min(t);
        let batch = frames.slice(s![start..end, .., .., ..]);
        let n = end - start;
        let input = Tensor::from_iter(batch.iter().copied(), device)?.reshape((n, 1, x, y, z))?;
        let prediction = model.forward(&input, false)?;
        ensure!(
            prediction.dims() == [n, 1, x, y, z],
            "prediction has shape {:?}, expected {:?}!",
            prediction.dims(),
            [n, 1, x, y, z]
        );
        let prediction = prediction.flatten_all()?.to_vec1::<f32>()?;
        output
            .slice_mut(s![start..end, .., .., ..])
            .assign(&Array4::from_shape_vec((n, x, y, z), prediction)?);
        debug!(frames = ?(start..end), "predicted");
    }
    Ok(output)
}

/// Pads a scan and returns it as frames (t, x, y, z).
fn load_frames(config: &DenoiseConfig, path: &Path) -> Result<(Volume, Array4<f32>)> {
    let scan = Volume::load(path)?;
    let padded = volume::pad(scan.data().view(), config.padding);
    let frames = volume::to_frames(padded, config.frame)
        .with_context(|| format!("failed to resize {}", path.display()))?;
    Ok((scan, frames))
}

/// Files written by [`run`].
#[derive(Debug, Clone)]
pub struct DenoiseOutput {
    /// The processed case.
    pub case: Case,
    /// The padded noisy scan, unless model_only.
    pub noisy: Option<PathBuf>,
    /// One prediction per model.
    pub models: Vec<PathBuf>,
    /// The padded clean scan, unless model_only.
    pub clean: Option<PathBuf>,
}

/// Denoises the selected case with each model.
///
/// All outputs are in the padded space, reuse the header of their source scan, and are written
/// to the output directory.
///
/// **Errors**
/// - `test_image` is out of range.
/// - A scan or model could not be loaded.
/// - The padded scan is not made of `frame` ^ 3 frames.
pub fn run(config: &DenoiseConfig, device: &Device) -> Result<DenoiseOutput> {
    let cases = discover_cases(config)?;
    let Some(case) = cases.get(config.test_image).cloned() else {
        bail!(
            "test_image {} is out of range, found {} cases in {}!",
            config.test_image,
            cases.len(),
            config.noisy_path.display()
        );
    };
    info!(noisy = %case.noisy.display(), clean = %case.clean.display(), "selected case");
    let output_path = &config.output_path;
    fs::create_dir_all(output_path)
        .with_context(|| format!("failed to create {}", output_path.display()))?;
    let (scan, mut frames) = load_frames(config, &case.noisy)?;
    let noisy = if config.model_only {
        None
    } else {
        let path = output_path.join(outputs::NOISY);
        scan.with_data(volume::from_frames(frames.clone())).save(&path)?;
        Some(path)
    };
    volume::normalize(&mut frames, config.scale);
    let mut models = Vec::with_capacity(config.models);
    for i in 0..config.models {
        let model = load_model(config, i, device)?;
        let mut prediction = predict(&model, &frames, config.batch_size, device)?;
        volume::unnormalize(&mut prediction, config.scale);
        let path = output_path.join(outputs::model(i));
        scan.with_data(volume::from_frames(prediction)).save(&path)?;
        info!(path = %path.display(), "saved prediction");
        models.push(path);
    }
    let clean = if config.model_only {
        None
    } else {
        let (clean_scan, clean_frames) = load_frames(config, &case.clean)?;
        let path = output_path.join(outputs::CLEAN);
        clean_scan
            .with_data(volume::from_frames(clean_frames))
            .save(&path)?;
        Some(path)
    };
    Ok(DenoiseOutput {
        case,
        noisy,
        models,
        clean,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config(dir: &Path) -> DenoiseConfig {
        DenoiseConfig {
            noisy_path: dir.join("noisy"),
            clean_path: dir.join("clean"),
            ..DenoiseConfig::default()
        }
    }

    #[test]
    fn cases_sorted_and_paired() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = config(dir.path());
        fs::create_dir_all(&config.noisy_path)?;
        for name in [
            "sub02_noise_sub2_tp300.nii.gz",
            "sub01_noise_sub2_tp300.nii.gz",
            "sub01_noise_copy.nii.gz",
            ".DS_Store",
        ] {
            fs::write(config.noisy_path.join(name), b"")?;
        }
        let cases = discover_cases(&config)?;
        let prefixes: Vec<_> = cases.iter().map(|case| case.prefix.as_str()).collect();
        assert_eq!(prefixes, ["sub01_", "sub02_"]);
        assert_eq!(
            cases[1].noisy,
            config.noisy_path.join("sub02_noise_sub2_tp300.nii.gz")
        );
        assert_eq!(
            cases[1].clean,
            config.clean_path.join("sub02_clean_sub2_tp300_v2.nii.gz")
        );
        Ok(())
    }

    #[test]
    fn out_of_range() -> Result<()> {
        let dir = tempfile::tempdir()?;
        let config = DenoiseConfig {
            test_image: 1,
            ..config(dir.path())
        };
        fs::create_dir_all(&config.noisy_path)?;
        fs::write(config.noisy_path.join("a_noise_sub2_tp300.nii.gz"), b"")?;
        let error = run(&config, &Device::Cpu).unwrap_err().to_string();
        assert!(error.contains("found 1 cases"), "{error}");
        Ok(())
    }

    struct Double;

    impl Forward for Double {
        fn forward(&self, input: &Tensor, _train: bool) -> Result<Tensor> {
            Ok(input.affine(2., 0.)?)
        }
    }

    #[test]
    fn predict_batches() -> Result<()> {
        let frames = Array4::from_shape_fn((5, 2, 3, 4), |(t, x, y, z)| {
            (t * 1000 + x * 100 + y * 10 + z) as f32
        });
        for batch_size in [1, 2, 5, 8] {
            let output = predict(&Double, &frames, batch_size, &Device::Cpu)?;
            assert_eq!(output, frames.mapv(|x| 2. * x));
        }
        Ok(())
    }
}

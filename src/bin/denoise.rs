use clap::Parser;
use ganlab::{
    config::{self, DenoiseConfig},
    denoise, device, logging,
    result::Result,
};
use std::path::PathBuf;
use tracing::info;

/// Denoises a 4-D NIfTI scan with pretrained 3-D U-Nets.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Json config, explicit flags take precedence.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Frames per model call.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Directory with noisy scans.
    #[arg(long)]
    noisy_path: Option<PathBuf>,
    /// Directory with clean scans.
    #[arg(long)]
    clean_path: Option<PathBuf>,
    /// Directory with the model weights.
    #[arg(long)]
    ckpt_path: Option<PathBuf>,
    /// Output directory.
    #[arg(long)]
    output_path: Option<PathBuf>,
    /// Only write the model predictions.
    #[arg(long)]
    model_only: bool,
    /// Index of the case to process.
    #[arg(long)]
    test_image: Option<usize>,
    /// Number of models.
    #[arg(long)]
    models: Option<usize>,
    /// Width of the first U-Net level.
    #[arg(long)]
    base_channels: Option<usize>,
    /// Run on the host even if a gpu is available.
    #[arg(long)]
    cpu: bool,
}

impl Cli {
    fn into_config(self) -> Result<DenoiseConfig> {
        let mut config: DenoiseConfig = match self.config.as_ref() {
            Some(path) => config::from_json_file(path)?,
            None => DenoiseConfig::default(),
        };
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(noisy_path) = self.noisy_path {
            config.noisy_path = noisy_path;
        }
        if let Some(clean_path) = self.clean_path {
            config.clean_path = clean_path;
        }
        if let Some(ckpt_path) = self.ckpt_path {
            config.ckpt_path = ckpt_path;
        }
        if let Some(output_path) = self.output_path {
            config.output_path = output_path;
        }
        config.model_only |= self.model_only;
        if let Some(test_image) = self.test_image {
            config.test_image = test_image;
        }
        if let Some(models) = self.models {
            config.models = models;
        }
        if let Some(base_channels) = self.base_channels {
            config.base_channels = base_channels;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    logging::init("info")?;
    let cli = Cli::parse();
    let cpu = cli.cpu;
    let config = cli.into_config()?;
    let device = device::select(cpu)?;
    let output = denoise::run(&config, &device)?;
    info!(
        case = %output.case.prefix,
        predictions = output.models.len(),
        output = %config.output_path.display(),
        "finished"
    );
    Ok(())
}

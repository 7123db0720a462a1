use clap::Parser;
use ganlab::{
    config::{self, DcganConfig},
    device,
    learn::gan::DcganTrainer,
    logging,
    result::Result,
};
use std::path::PathBuf;
use tracing::info;

/// Trains a DCGAN on MNIST digits and renders its samples.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Json config, explicit flags take precedence.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of epochs.
    #[arg(long)]
    epochs: Option<usize>,
    /// Training batch size.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Folder containing "mnist".
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Download MNIST if not found.
    #[arg(long)]
    download: bool,
    /// Directory for the rendered images and the animation.
    #[arg(long)]
    out_dir: Option<PathBuf>,
    /// Checkpoint directory.
    #[arg(long)]
    checkpoint_dir: Option<PathBuf>,
    /// Restore the latest checkpoint before training.
    #[arg(long)]
    resume: bool,
    /// Seed for shuffling.
    #[arg(long)]
    seed: Option<u64>,
    /// Run on the host even if a gpu is available.
    #[arg(long)]
    cpu: bool,
}

impl Cli {
    fn into_config(self) -> Result<DcganConfig> {
        let mut config: DcganConfig = match self.config.as_ref() {
            Some(path) => config::from_json_file(path)?,
            None => DcganConfig::default(),
        };
        if let Some(epochs) = self.epochs {
            config.epochs = epochs;
        }
        if let Some(batch_size) = self.batch_size {
            config.batch_size = batch_size;
        }
        if let Some(data_dir) = self.data_dir {
            config.mnist.data_dir.replace(data_dir);
        }
        config.mnist.download |= self.download;
        if let Some(out_dir) = self.out_dir {
            config.out_dir = out_dir;
        }
        if let Some(checkpoint_dir) = self.checkpoint_dir {
            config.checkpoint_dir = checkpoint_dir;
        }
        if self.seed.is_some() {
            config.seed = self.seed;
        }
        Ok(config)
    }
}

fn main() -> Result<()> {
    logging::init("info")?;
    let cli = Cli::parse();
    let (cpu, resume) = (cli.cpu, cli.resume);
    let config = cli.into_config()?;
    let device = device::select(cpu)?;
    let mut trainer = DcganTrainer::new(device, config)?;
    if resume {
        if let Some(checkpoint) = trainer.resume()? {
            info!(%checkpoint, "resuming");
        }
    }
    let summary = trainer.fit()?;
    info!(
        epochs = summary.epoch(),
        seconds = summary.total_time().as_secs_f32(),
        "finished"
    );
    Ok(())
}

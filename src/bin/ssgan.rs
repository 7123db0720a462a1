use clap::Parser;
use ganlab::{
    config::{self, SsganConfig},
    device,
    learn::semi_supervised::SsganTrainer,
    logging,
    result::Result,
};
use std::path::PathBuf;
use tracing::info;

/// Trains a semi-supervised GAN classifier on MNIST digits with 1000 labels.
#[derive(Parser, Debug)]
#[command(author, version, about)]
struct Cli {
    /// Json config, explicit flags take precedence.
    #[arg(long)]
    config: Option<PathBuf>,
    /// Number of epochs.
    #[arg(long)]
    epochs: Option<usize>,
    /// Batch size.
    #[arg(long)]
    batch_size: Option<usize>,
    /// Folder containing "mnist".
    #[arg(long)]
    data_dir: Option<PathBuf>,
    /// Download MNIST if not found.
    #[arg(long)]
    download: bool,
    /// Seed for subset selection and shuffling.
    #[arg(long)]
    seed: Option<u64>,
    /// Run on the host even if a gpu is available.
    #[arg(long)]
    cpu: bool,
}

impl Cli {
    fn into_config(self) -> Result<SsganConfig> {
        let mut config: SsganConfig = match self.config.as_ref() {
            Some(path) => config::from_json_file(path)?,
            None => SsganConfig::default(),
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
        if self.seed.is_some() {
            config.seed = self.seed;
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
    let mut trainer = SsganTrainer::new(device, config)?;
    let summary = trainer.fit()?;
    info!(
        epochs = summary.epoch(),
        test_accuracy = summary.stats().test.accuracy(),
        seconds = summary.total_time().as_secs_f32(),
        "finished"
    );
    Ok(())
}

use crate::result::Result;
use anyhow::anyhow;
use tracing_subscriber::{fmt, EnvFilter};

/// Installs the global [`tracing`] subscriber.
///
/// The filter is read from `RUST_LOG`, falling back to `default_filter` (ie "info").
///
/// **Errors**
/// - A global subscriber was already installed.
pub fn init(default_filter: &str) -> Result<()> {
    let filter =
        EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(default_filter))?;
    fmt()
        .with_env_filter(filter)
        .with_target(false)
        .try_init()
        .map_err(|e| anyhow!("failed to install logger: {e}"))
}

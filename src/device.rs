use crate::result::Result;
#[doc(no_inline)]
pub use candle_core::Device;
use tracing::{info, warn};

/// Selects the device to run on.
///
/// Returns the host if `cpu` is true. Otherwise returns the first CUDA device when the crate
/// was built with the "cuda" feature and one is available, falling back to the host.
pub fn select(cpu: bool) -> Result<Device> {
    if cpu {
        info!(device = "cpu", "using host");
        return Ok(Device::Cpu);
    }
    let device = Device::cuda_if_available(0)?;
    if device.is_cpu() {
        if cfg!(feature = "cuda") {
            warn!("no cuda device found, falling back to host");
        }
        info!(device = "cpu", "using host");
    } else {
        info!(device = "cuda:0", "using device");
    }
    Ok(device)
}

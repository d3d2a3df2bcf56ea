//! Compute device selection
//!
//! The device is an explicit value passed to the `Trainer` and `Evaluator`
//! rather than process-wide state.

use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceChoice {
    Cpu,
    /// First CUDA device, or CPU when no CUDA device is present.
    #[default]
    CudaIfAvailable,
    /// CUDA device with this ordinal; selection fails when it is absent.
    Cuda(usize),
}

/// Resolves a `DeviceChoice` into a candle `Device`.
pub fn select_device(choice: DeviceChoice) -> candle_core::Result<Device> {
    match choice {
        DeviceChoice::Cpu => {
            debug!("Using CPU device");
            Ok(Device::Cpu)
        }
        DeviceChoice::CudaIfAvailable => {
            let device = Device::cuda_if_available(0)?;
            if device.is_cpu() {
                warn!("CUDA device unavailable, falling back to CPU");
            }
            Ok(device)
        }
        DeviceChoice::Cuda(ordinal) => Device::new_cuda(ordinal),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_cpu_device() {
        let device = select_device(DeviceChoice::Cpu).unwrap();
        assert!(device.is_cpu());
    }

    #[test]
    fn test_default_choice_always_resolves() {
        assert_eq!(DeviceChoice::default(), DeviceChoice::CudaIfAvailable);
        assert!(select_device(DeviceChoice::default()).is_ok());
    }

    #[cfg(not(feature = "cuda"))]
    #[test]
    fn test_explicit_cuda_does_not_fall_back() {
        assert!(select_device(DeviceChoice::Cuda(0)).is_err());
    }
}

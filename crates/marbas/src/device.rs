//! Device selection and tensor placement.

use std::collections::HashMap;

use candle_core::{Device, Tensor};
use forneus_core::{DeviceType, Error, Result};

/// Resolves a [`DeviceType`] to a Candle device.
///
/// Accelerators that were not compiled in fall back to the CPU with a warning.
///
/// # Errors
///
/// Returns an error if a compiled-in accelerator cannot be opened.
pub fn select_device(device: &DeviceType) -> Result<Device> {
    match device {
        DeviceType::Cpu => Ok(Device::Cpu),
        DeviceType::Cuda {
            device_id: _device_id,
        } => {
            #[cfg(feature = "cuda")]
            {
                Device::new_cuda(*_device_id)
                    .map_err(|e| Error::internal(format!("cuda: {e}")))
            }
            #[cfg(not(feature = "cuda"))]
            {
                tracing::warn!("CUDA requested but not compiled in, falling back to CPU");
                Ok(Device::Cpu)
            }
        }
        DeviceType::Metal {
            device_id: _device_id,
        } => {
            #[cfg(feature = "metal")]
            {
                Device::new_metal(*_device_id)
                    .map_err(|e| Error::internal(format!("metal: {e}")))
            }
            #[cfg(not(feature = "metal"))]
            {
                tracing::warn!("Metal requested but not compiled in, falling back to CPU");
                Ok(Device::Cpu)
            }
        }
    }
}

/// Moves every tensor of a named batch onto `device`.
///
/// # Errors
///
/// Returns an error if a tensor cannot be copied.
pub fn to_device(batch: &HashMap<String, Tensor>, device: &Device) -> Result<HashMap<String, Tensor>> {
    batch
        .iter()
        .map(|(name, t)| {
            t.to_device(device)
                .map(|t| (name.clone(), t))
                .map_err(Error::from)
        })
        .collect()
}

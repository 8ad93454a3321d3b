//! Device, dtype and file helpers shared by the engines

use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tracing::debug;

use crate::error::{Error, Result};

/// Device selection
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceType {
    /// CUDA when available, CPU otherwise
    #[default]
    Auto,
    /// CPU device
    Cpu,
    /// CUDA GPU
    Cuda,
    /// Metal (Apple Silicon)
    Metal,
}

impl std::str::FromStr for DeviceType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_lowercase().as_str() {
            "auto" => Ok(Self::Auto),
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda),
            "metal" | "mps" => Ok(Self::Metal),
            other => Err(Error::config(format!("Unknown device type: {}", other))),
        }
    }
}

/// Resolve a device type to a concrete candle device
pub fn select_device(device_type: DeviceType, ordinal: usize) -> Result<Device> {
    let device = match device_type {
        DeviceType::Auto => Device::cuda_if_available(ordinal)?,
        DeviceType::Cpu => Device::Cpu,
        DeviceType::Cuda => Device::new_cuda(ordinal)?,
        DeviceType::Metal => Device::new_metal(ordinal)?,
    };
    debug!("Selected device: {:?}", device);
    Ok(device)
}

/// Compute and checkpoint dtype for a model loaded at full precision; its
/// variables stay in F32
pub fn default_dtype(device: &Device) -> DType {
    if device.is_cuda() {
        DType::F16
    } else {
        DType::F32
    }
}

/// Compute dtype of the mixed-precision context used by 8-bit training.
///
/// Half precision autocast only applies on CUDA; other devices compute in the
/// weights' own dtype.
pub fn autocast_dtype(device: &Device) -> Option<DType> {
    if device.is_cuda() {
        Some(DType::F16)
    } else {
        None
    }
}

/// Ensure a directory exists, creating parents as needed
pub fn ensure_dir_exists(path: &Path) -> Result<()> {
    if !path.exists() {
        std::fs::create_dir_all(path)?;
    }
    Ok(())
}

/// Format a parameter count in a human readable way
pub fn format_parameter_count(count: usize) -> String {
    if count >= 1_000_000_000 {
        format!("{:.2}B", count as f64 / 1e9)
    } else if count >= 1_000_000 {
        format!("{:.2}M", count as f64 / 1e6)
    } else if count >= 1_000 {
        format!("{:.2}K", count as f64 / 1e3)
    } else {
        count.to_string()
    }
}

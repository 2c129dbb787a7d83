//! Common types used across the Forneus toolkit.

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::Error;

/// Identifier of an experiment-tracking run.
///
/// Run ids are eight lowercase alphanumeric characters.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Ord, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(pub String);

impl RunId {
    /// Length of a generated run id.
    pub const LEN: usize = 8;

    /// Generates a new random run id.
    #[must_use]
    pub fn generate() -> Self {
        let id: String = (0..Self::LEN)
            .map(|_| fastrand::alphanumeric().to_ascii_lowercase())
            .collect();
        Self(id)
    }

    /// Returns the id as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl std::fmt::Display for RunId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// Data type for model parameters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    /// 32-bit floating point.
    #[default]
    F32,
    /// 16-bit floating point.
    F16,
    /// Brain floating point (16-bit).
    BF16,
}

impl From<DType> for candle_core::DType {
    fn from(dtype: DType) -> Self {
        match dtype {
            DType::F32 => candle_core::DType::F32,
            DType::F16 => candle_core::DType::F16,
            DType::BF16 => candle_core::DType::BF16,
        }
    }
}

impl FromStr for DType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "f32" | "float32" => Ok(Self::F32),
            "f16" | "float16" => Ok(Self::F16),
            "bf16" | "bfloat16" => Ok(Self::BF16),
            other => Err(Error::invalid_config(format!("unknown dtype `{other}`"))),
        }
    }
}

/// Device type for computation.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeviceType {
    /// CPU computation.
    #[default]
    Cpu,
    /// CUDA GPU computation.
    Cuda {
        /// GPU device index.
        device_id: usize,
    },
    /// Apple Metal GPU computation.
    Metal {
        /// GPU device index.
        device_id: usize,
    },
}

impl FromStr for DeviceType {
    type Err = Error;

    /// Parses `cpu`, `cuda`, `cuda:1`, `metal` or `metal:0`.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.to_ascii_lowercase();
        let (kind, index) = match lower.split_once(':') {
            Some((kind, idx)) => {
                let idx = idx
                    .parse::<usize>()
                    .map_err(|_| Error::invalid_config(format!("bad device index in `{s}`")))?;
                (kind.to_string(), idx)
            }
            None => (lower.clone(), 0),
        };
        match kind.as_str() {
            "cpu" => Ok(Self::Cpu),
            "cuda" | "gpu" => Ok(Self::Cuda { device_id: index }),
            "metal" | "mps" => Ok(Self::Metal { device_id: index }),
            _ => Err(Error::invalid_config(format!("unknown device `{s}`"))),
        }
    }
}

/// Options forwarded to model construction.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelOptions {
    /// Device the parameters are placed on.
    #[serde(default)]
    pub device: DeviceType,
    /// Parameter data type.
    #[serde(default)]
    pub dtype: DType,
}

impl ModelOptions {
    /// Sets the device.
    #[must_use]
    pub fn with_device(mut self, device: DeviceType) -> Self {
        self.device = device;
        self
    }

    /// Sets the data type.
    #[must_use]
    pub fn with_dtype(mut self, dtype: DType) -> Self {
        self.dtype = dtype;
        self
    }
}

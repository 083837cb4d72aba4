use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeviceKind {
    Accelerated,
    Cpu,
}

impl DeviceKind {
    pub fn is_accelerated(&self) -> bool {
        matches!(self, Self::Accelerated)
    }
}

impl From<&Device> for DeviceKind {
    fn from(device: &Device) -> Self {
        if device.is_cpu() {
            Self::Cpu
        } else {
            Self::Accelerated
        }
    }
}

/// Snapshot of what was loaded at startup. Never changes afterwards.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModelInfo {
    pub model_id: String,
    pub device: DeviceKind,
    pub dtype: String,
}

impl ModelInfo {
    pub fn new(model_id: impl Into<String>, device: &Device, dtype: DType) -> Self {
        Self {
            model_id: model_id.into(),
            device: device.into(),
            dtype: dtype.as_str().to_string(),
        }
    }
}

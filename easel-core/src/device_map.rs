use anyhow::Result;
use candle_core::utils::{cuda_is_available, metal_is_available};
use candle_core::Device;
use tracing::warn;

/// Backend feature that would have given this build an accelerator.
const ACCELERATOR_FEATURE: &str = if cfg!(all(target_os = "macos", target_arch = "aarch64")) {
    "metal"
} else {
    "cuda"
};

/// Which device the pipeline should be placed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    /// An accelerator ordinal, used if CUDA or Metal is available.
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

impl DeviceMap {
    /// Resolves to CUDA, then Metal, then the CPU.
    pub fn select(self) -> Result<Device> {
        let ordinal = match self {
            Self::ForceCpu => return Ok(Device::Cpu),
            Self::Ordinal(ordinal) => ordinal,
        };
        if cuda_is_available() {
            Ok(Device::new_cuda(ordinal)?)
        } else if metal_is_available() {
            Ok(Device::new_metal(ordinal)?)
        } else {
            warn!(
                "no accelerator available, running on CPU; build with `--features {}` to use one",
                ACCELERATOR_FEATURE
            );
            Ok(Device::Cpu)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn forced_cpu_never_touches_accelerators() {
        assert!(DeviceMap::ForceCpu.select().unwrap().is_cpu());
    }

    #[test]
    fn defaults_to_first_accelerator() {
        assert_eq!(DeviceMap::default(), DeviceMap::Ordinal(0));
    }
}

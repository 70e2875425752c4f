use candle_core::{DType, Device};
use serde::{Deserialize, Serialize};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeviceMap {
    ForceCpu,
    Ordinal(usize),
}

impl Default for DeviceMap {
    fn default() -> Self {
        Self::Ordinal(0)
    }
}

/// Weight precision requested for the resident model.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Precision {
    /// bf16 for FLUX, f16 for Stable Diffusion, f32 on CPU.
    #[default]
    Auto,
    F32,
    F16,
    Bf16,
}

impl Precision {
    pub fn parse(value: &str) -> Result<Self, serde_plain::Error> {
        serde_plain::from_str(&value.to_ascii_lowercase())
    }

    /// Resolve against a device, with `preferred` standing in for `Auto`.
    pub fn dtype(self, device: &Device, preferred: DType) -> DType {
        if device.is_cpu() {
            return DType::F32;
        }
        match self {
            Self::Auto => preferred,
            Self::F32 => DType::F32,
            Self::F16 => DType::F16,
            Self::Bf16 => DType::BF16,
        }
    }
}

impl std::fmt::Display for Precision {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&serde_plain::to_string(self).map_err(|_| std::fmt::Error)?)
    }
}

use anyhow::{Context, Result};
use candle_core::Device;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::flux::{self, FluxVariant};
use crate::loader::{LoadRequest, Loader};
use crate::stable_diffusion::{self, SdVariant};
use crate::{describe_device, select_best_device, DeviceMap, ModelLike};

/// Pipeline family and variant a registry entry runs on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModelVariant {
    Flux(FluxVariant),
    StableDiffusion(SdVariant),
}

/// Loads registry models onto a single candle device.
pub struct CandleLoader {
    device: Device,
}

impl CandleLoader {
    pub fn new(device_map: DeviceMap) -> Result<Self> {
        let device = select_best_device(device_map).context("failed to set up device")?;
        info!(device = %describe_device(&device), "inference device ready");
        Ok(Self { device })
    }
}

impl Loader for CandleLoader {
    fn load(&self, request: LoadRequest<'_>) -> Result<Box<dyn ModelLike>> {
        let descriptor = request.descriptor;
        info!(
            model = descriptor.key,
            variant = ?descriptor.variant,
            precision = %request.precision,
            optimize_memory = request.optimize_memory,
            "loading model weights"
        );

        match descriptor.variant {
            ModelVariant::Flux(variant) => {
                let model = flux::load(variant, &self.device, request)?;
                Ok(Box::new(model))
            }
            ModelVariant::StableDiffusion(variant) => {
                let model = stable_diffusion::load(variant, &self.device, request)?;
                Ok(Box::new(model))
            }
        }
    }

    fn device_name(&self) -> String {
        describe_device(&self.device)
    }

    fn reclaim(&self) -> Result<()> {
        // candle frees device buffers on drop; waiting for queued kernels is all there is to do
        self.device
            .synchronize()
            .context("failed to synchronize device")
    }
}

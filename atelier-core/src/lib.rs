pub mod config;
pub mod device_map;
pub mod dispatch;
pub mod download;
pub mod error;
pub mod fetch;
pub mod guard;
pub mod loader;
mod loader_factory;
pub mod output;
pub mod registry;
pub mod slot;
pub mod store;
pub mod style;
mod util;

mod flux;
mod stable_diffusion;

pub use config::Config;
pub use device_map::*;
pub use dispatch::{Dispatcher, GenerationResult};
pub use download::{ActiveDownloads, DownloadOrchestrator, Phase, ProgressEvent, ProgressStream};
pub use error::{LifecycleError, Result};
pub use fetch::{Fetcher, HubFetcher};
pub use flux::FluxVariant;
pub use guard::{DeleteOutcome, DeletionGuard};
use image::DynamicImage;
pub use loader::*;
pub use loader_factory::*;
pub use output::{ImageSink, SavedImage};
pub use registry::{Artifact, ModelDescriptor, Registry};
use serde::{Deserialize, Serialize};
pub use slot::{SlotManager, SlotSnapshot, SlotStatus};
pub use stable_diffusion::SdVariant;
pub use store::{DiskState, ModelStore};
pub use style::StylePreset;
pub use util::describe_device;
pub(crate) use util::{select_best_device, tensor_to_image};

/// A generation request as received from a client.
#[derive(Deserialize, Serialize, Debug, Clone, Default, PartialEq)]
pub struct GenerationRequest {
    #[serde(default)]
    pub prompt: String,
    pub negative_prompt: Option<String>,
    pub model: Option<String>,
    pub style: Option<String>,
    pub width: Option<usize>,
    pub height: Option<usize>,
    pub num_inference_steps: Option<usize>,
    pub guidance_scale: Option<f64>,
    pub seed: Option<u64>,
    /// Also return the PNG inline as base64.
    #[serde(default)]
    pub include_image: bool,
}

/// Fully resolved inputs handed to the engine.
#[derive(Serialize, Debug, Clone, PartialEq)]
pub struct InferenceParams {
    pub prompt: String,
    pub negative_prompt: String,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    pub guidance: f64,
    pub seed: Option<u64>,
}

/// A model resident on the device.
///
/// Handles are owned by the slot manager and only ever borrowed for the
/// duration of one inference.
pub trait ModelLike: Send {
    fn run(&mut self, params: &InferenceParams) -> anyhow::Result<DynamicImage>;

    /// Device memory held by the weights, in bytes.
    fn resident_bytes(&self) -> u64 {
        0
    }

    /// Frees the device memory, returning once it has been reclaimed.
    fn release(self: Box<Self>) -> anyhow::Result<()>;
}

#[cfg(test)]
pub(crate) mod testing;

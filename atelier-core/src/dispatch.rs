//! Request validation, slot-mediated inference and persistence.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use base64::Engine;
use serde::Serialize;
use tracing::{info, info_span, Instrument};

use crate::error::{LifecycleError, Result};
use crate::output::ImageSink;
use crate::registry::{ModelDescriptor, Registry};
use crate::slot::SlotManager;
use crate::style::StylePreset;
use crate::{GenerationRequest, InferenceParams, ModelVariant};

pub const MIN_DIMENSION: usize = 64;
pub const MAX_DIMENSION: usize = 2048;
pub const MAX_STEPS: usize = 150;

static REQUEST_ID: AtomicU64 = AtomicU64::new(1);

#[derive(Debug, Clone, Serialize)]
pub struct GenerationResult {
    pub filename: String,
    pub path: String,
    /// Route the image is served from.
    pub relative_path: String,
    /// Seconds, rounded to two decimals.
    pub generation_time: f64,
    pub model: String,
    pub style: String,
    pub seed: Option<u64>,
    pub width: usize,
    pub height: usize,
    pub steps: usize,
    /// A cancel was requested while this generation was in flight.
    pub cancel_requested: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
}

#[derive(Clone)]
pub struct Dispatcher {
    registry: Arc<Registry>,
    slot: SlotManager,
    sink: ImageSink,
    default_style: StylePreset,
}

impl Dispatcher {
    pub fn new(
        registry: Arc<Registry>,
        slot: SlotManager,
        sink: ImageSink,
        default_style: StylePreset,
    ) -> Self {
        Self {
            registry,
            slot,
            sink,
            default_style,
        }
    }

    pub async fn dispatch(&self, request: GenerationRequest) -> Result<GenerationResult> {
        let request_id = REQUEST_ID.fetch_add(1, Ordering::Relaxed);
        self.run(request)
            .instrument(info_span!("generate", request_id))
            .await
    }

    async fn run(&self, request: GenerationRequest) -> Result<GenerationResult> {
        let start = Instant::now();
        let descriptor = self.resolve_model(request.model.as_deref())?;
        let style = StylePreset::resolve(request.style.as_deref(), self.default_style);
        let params = build_params(descriptor, style, &request)?;
        let key = descriptor.key;
        info!(
            model = key,
            style = %style.key(),
            width = params.width,
            height = params.height,
            steps = params.steps,
            guidance = params.guidance,
            seed = ?params.seed,
            "generation requested"
        );

        let epoch = self.slot.cancel_epoch();
        let summary = params.clone();
        let image = self
            .slot
            .with_model(key, move |model| model.run(&params))
            .await?;

        let sink = self.sink.clone();
        let saved = tokio::task::spawn_blocking(move || sink.save(&image))
            .await
            .map_err(|join| LifecycleError::PersistFailed(join.to_string()))??;

        let cancel_requested = self.slot.cancel_epoch() != epoch;
        let generation_time = (start.elapsed().as_secs_f64() * 100.0).round() / 100.0;
        info!(
            model = key,
            filename = %saved.filename,
            generation_time,
            cancel_requested,
            "generation complete"
        );

        let image = request
            .include_image
            .then(|| base64::engine::general_purpose::STANDARD.encode(&saved.png));
        Ok(GenerationResult {
            relative_path: format!("/image/{}", saved.filename),
            path: saved.path.display().to_string(),
            filename: saved.filename,
            generation_time,
            model: key.to_string(),
            style: style.key(),
            seed: summary.seed,
            width: summary.width,
            height: summary.height,
            steps: summary.steps,
            cancel_requested,
            image,
        })
    }

    fn resolve_model(&self, key: Option<&str>) -> Result<&ModelDescriptor> {
        match key.map(str::trim).filter(|key| !key.is_empty()) {
            Some(key) => self.registry.resolve(key),
            None => self.registry.resolve(self.registry.default_key()),
        }
    }
}

fn build_params(
    descriptor: &ModelDescriptor,
    style: StylePreset,
    request: &GenerationRequest,
) -> Result<InferenceParams> {
    if request.prompt.trim().is_empty() {
        return Err(LifecycleError::InvalidRequest("prompt must not be empty".into()));
    }
    // FLUX packs latents into 2x2 patches on top of the 8x VAE downscale.
    let multiple = match descriptor.variant {
        ModelVariant::Flux(_) => 16,
        ModelVariant::StableDiffusion(_) => 8,
    };
    let width = request.width.unwrap_or(descriptor.default_width);
    let width = check_dimension("width", width, multiple)?;
    let height = request.height.unwrap_or(descriptor.default_height);
    let height = check_dimension("height", height, multiple)?;

    let steps = request.num_inference_steps.unwrap_or(descriptor.default_steps);
    if !(1..=MAX_STEPS).contains(&steps) {
        return Err(LifecycleError::InvalidRequest(format!(
            "num_inference_steps must be between 1 and {MAX_STEPS}, got {steps}"
        )));
    }
    let guidance = request.guidance_scale.unwrap_or(descriptor.default_guidance);
    if !guidance.is_finite() || guidance < 0.0 {
        return Err(LifecycleError::InvalidRequest(format!(
            "guidance_scale must be a non-negative number, got {guidance}"
        )));
    }

    Ok(InferenceParams {
        prompt: style.apply(&request.prompt),
        negative_prompt: request.negative_prompt.clone().unwrap_or_default(),
        width,
        height,
        steps,
        guidance,
        seed: request.seed,
    })
}

fn check_dimension(name: &str, value: usize, multiple: usize) -> Result<usize> {
    if value % multiple != 0 || !(MIN_DIMENSION..=MAX_DIMENSION).contains(&value) {
        return Err(LifecycleError::InvalidRequest(format!(
            "{name} must be a multiple of {multiple} between {MIN_DIMENSION} and {MAX_DIMENSION}, got {value}"
        )));
    }
    Ok(value)
}

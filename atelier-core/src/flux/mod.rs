use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::{
    clip::text_model::{Activation, ClipTextConfig, ClipTextTransformer},
    flux::{
        autoencoder::{self, AutoEncoder},
        model::{self, Flux},
        sampling,
    },
    t5::{self, T5EncoderModel},
};
use image::DynamicImage;
use serde::{Deserialize, Serialize};
use tokenizers::Tokenizer;
use tracing::debug;

use crate::{
    loader::{resolve_artifact, weights_size, LoadRequest},
    registry::Artifact,
    tensor_to_image, InferenceParams, ModelLike,
};

const T5_WEIGHTS: Artifact =
    Artifact::with_revision("google/t5-v1_1-xxl", "refs/pr/2", "model.safetensors");
const T5_CONFIG: Artifact =
    Artifact::with_revision("google/t5-v1_1-xxl", "refs/pr/2", "config.json");
const T5_TOKENIZER: Artifact = Artifact::new("lmz/mt5-tokenizers", "t5-v1_1-xxl.tokenizer.json");
const CLIP_WEIGHTS: Artifact = Artifact::new("openai/clip-vit-large-patch14", "model.safetensors");
const CLIP_TOKENIZER: Artifact = Artifact::new("openai/clip-vit-large-patch14", "tokenizer.json");
const SCHNELL_AE: Artifact = Artifact::new("black-forest-labs/FLUX.1-schnell", "ae.safetensors");
const SCHNELL_WEIGHTS: Artifact =
    Artifact::new("black-forest-labs/FLUX.1-schnell", "flux1-schnell.safetensors");
const DEV_AE: Artifact = Artifact::new("black-forest-labs/FLUX.1-dev", "ae.safetensors");
const DEV_WEIGHTS: Artifact = Artifact::new("black-forest-labs/FLUX.1-dev", "flux1-dev.safetensors");

pub const SCHNELL_ARTIFACTS: &[Artifact] = &[
    T5_WEIGHTS,
    T5_CONFIG,
    T5_TOKENIZER,
    CLIP_WEIGHTS,
    CLIP_TOKENIZER,
    SCHNELL_AE,
    SCHNELL_WEIGHTS,
];

pub const DEV_ARTIFACTS: &[Artifact] = &[
    T5_WEIGHTS,
    T5_CONFIG,
    T5_TOKENIZER,
    CLIP_WEIGHTS,
    CLIP_TOKENIZER,
    DEV_AE,
    DEV_WEIGHTS,
];

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FluxVariant {
    Schnell,
    Dev,
}

impl FluxVariant {
    fn weights(self) -> Artifact {
        match self {
            Self::Schnell => SCHNELL_WEIGHTS,
            Self::Dev => DEV_WEIGHTS,
        }
    }

    fn autoencoder(self) -> Artifact {
        match self {
            Self::Schnell => SCHNELL_AE,
            Self::Dev => DEV_AE,
        }
    }
}

pub struct FluxModel {
    variant: FluxVariant,
    device: Device,
    dtype: DType,
    // text encoders live here, on the CPU when memory optimization is on
    text_device: Device,
    t5_model: T5EncoderModel,
    t5_tokenizer: Tokenizer,
    clip_model: ClipTextTransformer,
    clip_tokenizer: Tokenizer,
    autoencoder: AutoEncoder,
    flux_model: Flux,
    resident_bytes: u64,
}

impl ModelLike for FluxModel {
    fn run(&mut self, params: &InferenceParams) -> Result<DynamicImage> {
        if !params.negative_prompt.is_empty() {
            debug!("FLUX ignores negative prompts");
        }

        // Optionally set seed for reproducibility.
        if let Some(seed) = params.seed {
            self.device
                .set_seed(seed)
                .context("seeded generation is not supported on this device")?;
        }

        // --- Generate noise image ---
        let noise_img = sampling::get_noise(1, params.height, params.width, &self.device)?
            .to_dtype(self.dtype)?;

        // --- Compute T5 embedding ---
        let mut t5_tokens = self
            .t5_tokenizer
            .encode(params.prompt.as_str(), true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        t5_tokens.resize(256, 0);
        let input_token_ids = Tensor::new(&*t5_tokens, &self.text_device)?.unsqueeze(0)?;
        let t5_emb = self
            .t5_model
            .forward(&input_token_ids)?
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;

        // --- Compute CLIP embedding ---
        let clip_tokens = self
            .clip_tokenizer
            .encode(params.prompt.as_str(), true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        let input_token_ids_clip = Tensor::new(&*clip_tokens, &self.text_device)?.unsqueeze(0)?;
        let clip_emb = self
            .clip_model
            .forward(&input_token_ids_clip)?
            .to_device(&self.device)?
            .to_dtype(self.dtype)?;

        // --- Create sampling state and schedule ---
        let state = sampling::State::new(&t5_emb, &clip_emb, &noise_img)?;
        let timesteps = match self.variant {
            FluxVariant::Dev => {
                let image_seq_len = state.img.dim(1)?;
                sampling::get_schedule(params.steps, Some((image_seq_len, 0.5, 1.15)))
            }
            FluxVariant::Schnell => sampling::get_schedule(params.steps, None),
        };

        let latent_img = sampling::denoise(
            &self.flux_model,
            &state.img,
            &state.img_ids,
            &state.txt,
            &state.txt_ids,
            &state.vec,
            &timesteps,
            params.guidance,
        )?;
        let unpacked = sampling::unpack(&latent_img, params.height, params.width)?;
        debug!("generated latent image");

        let decoded = self.autoencoder.decode(&unpacked)?;
        debug!("decoded image");

        // --- Postprocessing: clamp, scale, convert type ---
        let img = ((decoded.clamp(-1f32, 1f32)? + 1.0)? * 127.5)?.to_dtype(DType::U8)?;
        tensor_to_image(&img.i(0)?)
    }

    fn resident_bytes(&self) -> u64 {
        self.resident_bytes
    }

    fn release(self: Box<Self>) -> Result<()> {
        let device = self.device.clone();
        drop(self);
        device
            .synchronize()
            .context("failed to synchronize device after release")
    }
}

pub fn load(variant: FluxVariant, device: &Device, request: LoadRequest<'_>) -> Result<FluxModel> {
    let dir = request.dir;
    let dtype = request.precision.dtype(device, device.bf16_default_to_f32());
    let text_device = if request.optimize_memory {
        Device::Cpu
    } else {
        device.clone()
    };
    let text_dtype = request
        .precision
        .dtype(&text_device, text_device.bf16_default_to_f32());

    // --- Load T5 Model and Tokenizer ---
    let t5_model_file = resolve_artifact(dir, &T5_WEIGHTS)?;
    let t5_vb = unsafe {
        candle_nn::VarBuilder::from_mmaped_safetensors(&[&t5_model_file], text_dtype, &text_device)
            .context("failed to build T5 var builder")?
    };
    let config_filename = resolve_artifact(dir, &T5_CONFIG)?;
    let config_str =
        std::fs::read_to_string(&config_filename).context("failed to read T5 config")?;
    let t5_config: t5::Config =
        serde_json::from_str(&config_str).context("failed to parse T5 config")?;
    let t5_model = T5EncoderModel::load(t5_vb, &t5_config).context("failed to load T5 model")?;
    let t5_tokenizer = Tokenizer::from_file(resolve_artifact(dir, &T5_TOKENIZER)?)
        .map_err(Error::msg)
        .context("failed to load T5 tokenizer")?;

    // --- Load CLIP Model and Tokenizer ---
    let clip_model_file = resolve_artifact(dir, &CLIP_WEIGHTS)?;
    let clip_vb = unsafe {
        candle_nn::VarBuilder::from_mmaped_safetensors(&[&clip_model_file], text_dtype, &text_device)
            .context("failed to build CLIP var builder")?
    };
    let clip_config = ClipTextConfig {
        vocab_size: 49408,
        projection_dim: 768,
        activation: Activation::QuickGelu,
        intermediate_size: 3072,
        embed_dim: 768,
        max_position_embeddings: 77,
        pad_with: None,
        num_hidden_layers: 12,
        num_attention_heads: 12,
    };
    let clip_model = ClipTextTransformer::new(clip_vb.pp("text_model"), &clip_config)
        .context("failed to load CLIP model")?;
    let clip_tokenizer = Tokenizer::from_file(resolve_artifact(dir, &CLIP_TOKENIZER)?)
        .map_err(Error::msg)
        .context("failed to load CLIP tokenizer")?;

    // --- Load Autoencoder ---
    let autoencoder_model_file = resolve_artifact(dir, &variant.autoencoder())?;
    let autoencoder_vb = unsafe {
        candle_nn::VarBuilder::from_mmaped_safetensors(&[&autoencoder_model_file], dtype, device)
            .context("failed to build autoencoder var builder")?
    };
    let autoencoder_config = match variant {
        FluxVariant::Schnell => autoencoder::Config::schnell(),
        FluxVariant::Dev => autoencoder::Config::dev(),
    };
    let autoencoder = AutoEncoder::new(&autoencoder_config, autoencoder_vb)
        .context("failed to load autoencoder")?;

    // --- Load Flux Model (non-quantized) ---
    let flux_model_file = resolve_artifact(dir, &variant.weights())?;
    let flux_vb = unsafe {
        candle_nn::VarBuilder::from_mmaped_safetensors(&[&flux_model_file], dtype, device)
            .context("failed to build flux var builder")?
    };
    let flux_config = match variant {
        FluxVariant::Schnell => model::Config::schnell(),
        FluxVariant::Dev => model::Config::dev(),
    };
    let flux_model = Flux::new(&flux_config, flux_vb).context("failed to load flux model")?;

    // only weights placed on the accelerator count against the slot
    let mut on_device = vec![autoencoder_model_file.as_path(), flux_model_file.as_path()];
    if !request.optimize_memory {
        on_device.push(t5_model_file.as_path());
        on_device.push(clip_model_file.as_path());
    }
    let resident_bytes = weights_size(&on_device);

    Ok(FluxModel {
        variant,
        device: device.clone(),
        dtype,
        text_device,
        t5_model,
        t5_tokenizer,
        clip_model,
        clip_tokenizer,
        autoencoder,
        flux_model,
        resident_bytes,
    })
}

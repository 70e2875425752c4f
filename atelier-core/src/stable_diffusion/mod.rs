use anyhow::{Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor, D};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self, clip::ClipTextTransformer, schedulers::Scheduler, unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL, StableDiffusionConfig,
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

const CLIP_TOKENIZER: Artifact = Artifact::new("openai/clip-vit-large-patch14", "tokenizer.json");
const CLIP2_TOKENIZER: Artifact =
    Artifact::new("laion/CLIP-ViT-bigG-14-laion2B-39B-b160k", "tokenizer.json");
// the stock SDXL VAE overflows in f16
const VAE_FP16_FIX: Artifact =
    Artifact::new("madebyollin/sdxl-vae-fp16-fix", "diffusion_pytorch_model.safetensors");

const XL_TURBO_REPO: &str = "stabilityai/sdxl-turbo";
const XL_REPO: &str = "stabilityai/stable-diffusion-xl-base-1.0";

const TEXT_ENCODER: &str = "text_encoder/model.safetensors";
const TEXT_ENCODER_2: &str = "text_encoder_2/model.safetensors";
const UNET: &str = "unet/diffusion_pytorch_model.fp16.safetensors";

pub const XL_TURBO_ARTIFACTS: &[Artifact] = &[
    CLIP_TOKENIZER,
    CLIP2_TOKENIZER,
    Artifact::new(XL_TURBO_REPO, TEXT_ENCODER),
    Artifact::new(XL_TURBO_REPO, TEXT_ENCODER_2),
    Artifact::new(XL_TURBO_REPO, UNET),
    VAE_FP16_FIX,
];

pub const XL_ARTIFACTS: &[Artifact] = &[
    CLIP_TOKENIZER,
    CLIP2_TOKENIZER,
    Artifact::new(XL_REPO, TEXT_ENCODER),
    Artifact::new(XL_REPO, TEXT_ENCODER_2),
    Artifact::new(XL_REPO, UNET),
    VAE_FP16_FIX,
];

/// Heads processed per attention slice when memory optimization is on.
const ATTENTION_SLICE_SIZE: usize = 4;
const VAE_SCALE: f64 = 0.13025;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SdVariant {
    Xl,
    XlTurbo,
}

impl SdVariant {
    fn repo(self) -> &'static str {
        match self {
            Self::Xl => XL_REPO,
            Self::XlTurbo => XL_TURBO_REPO,
        }
    }

    fn config(self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        match self {
            Self::Xl => StableDiffusionConfig::sdxl(sliced_attention_size, None, None),
            Self::XlTurbo => StableDiffusionConfig::sdxl_turbo(sliced_attention_size, None, None),
        }
    }
}

struct TextEncoder {
    tokenizer: Tokenizer,
    model: ClipTextTransformer,
    pad_id: u32,
    max_len: usize,
}

impl TextEncoder {
    fn encode(&self, text: &str, device: &Device) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(text, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_len {
            anyhow::bail!(
                "prompt is too long, {} tokens for a maximum of {}",
                tokens.len(),
                self.max_len
            );
        }
        tokens.resize(self.max_len, self.pad_id);
        let tokens = Tensor::new(tokens.as_slice(), device)?.unsqueeze(0)?;
        Ok(self.model.forward(&tokens)?)
    }
}

pub struct SdModel {
    device: Device,
    dtype: DType,
    text_device: Device,
    config: StableDiffusionConfig,
    encoders: Vec<TextEncoder>,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    resident_bytes: u64,
}

impl SdModel {
    fn text_embeddings(&self, params: &InferenceParams, use_guidance: bool) -> Result<Tensor> {
        let mut per_encoder = Vec::with_capacity(self.encoders.len());
        for encoder in &self.encoders {
            let cond = encoder.encode(&params.prompt, &self.text_device)?;
            let embeddings = if use_guidance {
                let uncond = encoder.encode(&params.negative_prompt, &self.text_device)?;
                Tensor::cat(&[uncond, cond], 0)?
            } else {
                cond
            };
            per_encoder.push(embeddings.to_device(&self.device)?.to_dtype(self.dtype)?);
        }
        Ok(Tensor::cat(&per_encoder, D::Minus1)?)
    }
}

impl ModelLike for SdModel {
    fn run(&mut self, params: &InferenceParams) -> Result<DynamicImage> {
        let use_guidance = params.guidance > 1.0;
        let text_embeddings = self.text_embeddings(params, use_guidance)?;

        if let Some(seed) = params.seed {
            self.device
                .set_seed(seed)
                .context("seeded generation is not supported on this device")?;
        }

        let mut scheduler = self.config.build_scheduler(params.steps)?;
        let timesteps = scheduler.timesteps().to_vec();
        let latents = Tensor::randn(
            0f32,
            1f32,
            (1, 4, params.height / 8, params.width / 8),
            &self.device,
        )?;
        let mut latents = (latents * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        for (index, &timestep) in timesteps.iter().enumerate() {
            let model_input = if use_guidance {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let model_input = scheduler.scale_model_input(model_input, timestep)?;
            let noise_pred = self
                .unet
                .forward(&model_input, timestep as f64, &text_embeddings)?;
            let noise_pred = if use_guidance {
                let chunks = noise_pred.chunk(2, 0)?;
                let (uncond, cond) = (&chunks[0], &chunks[1]);
                (uncond + ((cond - uncond)? * params.guidance)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(step = index + 1, total = timesteps.len(), "denoising");
        }

        let image = self.vae.decode(&(&latents / VAE_SCALE)?)?;
        let image = ((image / 2.)? + 0.5)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let image = (image.clamp(0f32, 1.)? * 255.)?.to_dtype(DType::U8)?.i(0)?;
        tensor_to_image(&image)
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

pub fn load(variant: SdVariant, device: &Device, request: LoadRequest<'_>) -> Result<SdModel> {
    let dir = request.dir;
    let dtype = request.precision.dtype(device, DType::F16);
    let sliced_attention_size = request.optimize_memory.then_some(ATTENTION_SLICE_SIZE);
    let config = variant.config(sliced_attention_size);
    let text_device = if request.optimize_memory {
        Device::Cpu
    } else {
        device.clone()
    };

    let mut encoders = Vec::with_capacity(2);
    let mut on_device = Vec::new();
    let clip_configs = [Some(&config.clip), config.clip2.as_ref()];
    let encoder_files = [
        (TEXT_ENCODER, CLIP_TOKENIZER),
        (TEXT_ENCODER_2, CLIP2_TOKENIZER),
    ];
    for (clip_config, (weights, tokenizer)) in clip_configs.into_iter().zip(encoder_files) {
        let Some(clip_config) = clip_config else {
            continue;
        };
        let tokenizer = Tokenizer::from_file(resolve_artifact(dir, &tokenizer)?)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = clip_config.pad_with.as_deref().unwrap_or("<|endoftext|>");
        let pad_id = *tokenizer
            .get_vocab(true)
            .get(pad_token)
            .with_context(|| format!("tokenizer has no `{pad_token}` token"))?;
        let weights_file = resolve_artifact(dir, &Artifact::new(variant.repo(), weights))?;
        let model = stable_diffusion::build_clip_transformer(
            clip_config,
            &weights_file,
            &text_device,
            DType::F32,
        )
        .with_context(|| format!("failed to load {weights}"))?;
        if !request.optimize_memory {
            on_device.push(weights_file);
        }
        encoders.push(TextEncoder {
            tokenizer,
            model,
            pad_id,
            max_len: clip_config.max_position_embeddings,
        });
    }

    let vae_file = resolve_artifact(dir, &VAE_FP16_FIX)?;
    let vae = config
        .build_vae(&vae_file, device, dtype)
        .context("failed to load VAE")?;
    let unet_file = resolve_artifact(dir, &Artifact::new(variant.repo(), UNET))?;
    let unet = config
        .build_unet(&unet_file, device, 4, cfg!(feature = "flash-attn"), dtype)
        .context("failed to load UNet")?;
    on_device.push(vae_file);
    on_device.push(unet_file);

    let on_device: Vec<_> = on_device.iter().map(|path| path.as_path()).collect();
    Ok(SdModel {
        device: device.clone(),
        dtype,
        text_device,
        resident_bytes: weights_size(&on_device),
        config,
        encoders,
        unet,
        vae,
    })
}

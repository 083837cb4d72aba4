use std::sync::Arc;

use anyhow::{bail, Context, Error, Result};
use candle_core::{DType, Device, IndexOp, Tensor};
use candle_nn::Module;
use candle_transformers::models::stable_diffusion::{
    self,
    clip::ClipTextTransformer,
    schedulers::SchedulerConfig,
    unet_2d::UNet2DConditionModel,
    vae::AutoEncoderKL,
    StableDiffusionConfig,
};
use hf_hub::api::tokio::Api;
use image::DynamicImage;
use tokenizers::Tokenizer;
use tracing::{debug, info, warn};

mod scheduler;

use scheduler::{TrainingSchedule, SCHEDULER_CONFIG};

use crate::{
    latent_noise, select_dtype, tensor_to_image, DeviceKind, DeviceMap, GenerationRequest, Loader,
    ModelInfo, ModelLike, ModelVariant,
};

// https://huggingface.co/runwayml/stable-diffusion-v1-5/blob/main/vae/config.json
const VAE_SCALE: f64 = 0.18215;
const TOKENIZER_REPO: &str = "openai/clip-vit-base-patch32";
const DEFAULT_PAD_TOKEN: &str = "<|endoftext|>";
/// Pixels per latent cell along each image side.
const LATENT_SCALE: usize = 8;

/// Shape of the initial latents for an image, rejecting sizes the
/// autoencoder cannot produce exactly.
fn latent_shape(width: usize, height: usize) -> Result<(usize, usize, usize, usize)> {
    if width % LATENT_SCALE != 0 || height % LATENT_SCALE != 0 {
        bail!(
            "`height` and `width` have to be divisible by {LATENT_SCALE} \
             but are {height} and {width}."
        );
    }
    Ok((1, 4, height / LATENT_SCALE, width / LATENT_SCALE))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StableDiffusionVariant {
    V1_5,
    V2_1,
}

impl StableDiffusionVariant {
    pub fn from_name(model_name: &str) -> Self {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("STABLE-DIFFUSION-2") || name_upper.contains("SD2") {
            Self::V2_1
        } else {
            Self::V1_5
        }
    }

    fn config(&self, sliced_attention_size: Option<usize>) -> StableDiffusionConfig {
        match self {
            Self::V1_5 => StableDiffusionConfig::v1_5(sliced_attention_size, None, None),
            Self::V2_1 => StableDiffusionConfig::v2_1(sliced_attention_size, None, None),
        }
    }

    /// 768px SD2 checkpoints predict velocity, `-base` ones predict noise.
    fn default_prediction_type(&self, model_name: &str) -> &'static str {
        match self {
            Self::V2_1 if !model_name.to_uppercase().contains("BASE") => "v_prediction",
            _ => "epsilon",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ModelFile {
    Clip,
    Unet,
    Vae,
}

impl ModelFile {
    /// Path inside the checkpoint repository, picking the fp16 variant when
    /// running in half precision.
    fn path(&self, dtype: DType) -> &'static str {
        let fp16 = dtype == DType::F16;
        match (self, fp16) {
            (Self::Clip, true) => "text_encoder/model.fp16.safetensors",
            (Self::Clip, false) => "text_encoder/model.safetensors",
            (Self::Unet, true) => "unet/diffusion_pytorch_model.fp16.safetensors",
            (Self::Unet, false) => "unet/diffusion_pytorch_model.safetensors",
            (Self::Vae, true) => "vae/diffusion_pytorch_model.fp16.safetensors",
            (Self::Vae, false) => "vae/diffusion_pytorch_model.safetensors",
        }
    }
}

/// Memory-saving execution flags. Only worth the slowdown on accelerators.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryOptions {
    pub attention_slicing: bool,
    pub vae_slicing: bool,
}

impl MemoryOptions {
    pub fn for_device(device: DeviceKind) -> Self {
        let accelerated = device.is_accelerated();
        Self {
            attention_slicing: accelerated,
            vae_slicing: accelerated,
        }
    }

    /// A slice size of zero lets the UNet pick half the attention head dim.
    fn sliced_attention_size(&self) -> Option<usize> {
        self.attention_slicing.then_some(0)
    }
}

pub struct StableDiffusionModel {
    device: Device,
    dtype: DType,
    info: ModelInfo,
    memory: MemoryOptions,
    tokenizer: Tokenizer,
    pad_id: u32,
    max_tokens: usize,
    clip_model: ClipTextTransformer,
    unet: UNet2DConditionModel,
    vae: AutoEncoderKL,
    scheduler: Arc<dyn SchedulerConfig>,
}

impl StableDiffusionModel {
    fn encode_prompt(&self, prompt: &str) -> Result<Tensor> {
        let mut tokens = self
            .tokenizer
            .encode(prompt, true)
            .map_err(Error::msg)?
            .get_ids()
            .to_vec();
        if tokens.len() > self.max_tokens {
            warn!(
                tokens = tokens.len(),
                max = self.max_tokens,
                "prompt is too long for the text encoder, truncating"
            );
            let eos = tokens[tokens.len() - 1];
            tokens.truncate(self.max_tokens - 1);
            tokens.push(eos);
        }
        tokens.resize(self.max_tokens, self.pad_id);

        let tokens = Tensor::new(tokens.as_slice(), &self.device)?.unsqueeze(0)?;
        Ok(self.clip_model.forward(&tokens)?)
    }

    /// Unconditional embeddings come first when guidance is on, matching the
    /// order the noise prediction is split in.
    fn text_embeddings(&self, request: &GenerationRequest) -> Result<Tensor> {
        let cond = self.encode_prompt(&request.prompt)?;
        let embeddings = if request.uses_guidance() {
            let negative = request.negative_prompt.as_deref().unwrap_or("");
            let uncond = self.encode_prompt(negative)?;
            Tensor::cat(&[uncond, cond], 0)?
        } else {
            cond
        };
        Ok(embeddings.to_dtype(self.dtype)?)
    }

    fn decode_latents(&self, latents: &Tensor) -> Result<Tensor> {
        let latents = (latents / VAE_SCALE)?;
        let batch = latents.dim(0)?;
        if self.memory.vae_slicing && batch > 1 {
            let images = latents
                .chunk(batch, 0)?
                .iter()
                .map(|latent| self.vae.decode(latent))
                .collect::<candle_core::Result<Vec<_>>>()?;
            Ok(Tensor::cat(&images, 0)?)
        } else {
            Ok(self.vae.decode(&latents)?)
        }
    }
}

impl ModelLike for StableDiffusionModel {
    fn info(&self) -> &ModelInfo {
        &self.info
    }

    fn run(&self, request: &GenerationRequest) -> Result<DynamicImage> {
        let guided = request.uses_guidance();
        let text_embeddings = self.text_embeddings(request)?;

        // --- Initial latents, seeded per request ---
        let mut scheduler = self.scheduler.build(request.num_inference_steps)?;
        let shape = latent_shape(request.width, request.height)?;
        let noise = latent_noise(request.rng_seed(), shape, &self.device)?;
        let mut latents = (noise * scheduler.init_noise_sigma())?.to_dtype(self.dtype)?;

        // --- Denoising loop ---
        let timesteps = scheduler.timesteps().to_vec();
        for (index, &timestep) in timesteps.iter().enumerate() {
            let latent_model_input = if guided {
                Tensor::cat(&[&latents, &latents], 0)?
            } else {
                latents.clone()
            };
            let latent_model_input = scheduler.scale_model_input(latent_model_input, timestep)?;
            let noise_pred =
                self.unet
                    .forward(&latent_model_input, timestep as f64, &text_embeddings)?;

            let noise_pred = if guided {
                let noise_pred = noise_pred.chunk(2, 0)?;
                let (uncond, text) = (&noise_pred[0], &noise_pred[1]);
                (uncond + ((text - uncond)? * request.guidance_scale)?)?
            } else {
                noise_pred
            };
            latents = scheduler.step(&noise_pred, timestep, &latents)?;
            debug!(step = index + 1, total = timesteps.len(), "denoised");
        }

        // --- Decode and map [-1, 1] to u8 pixels ---
        let decoded = self.decode_latents(&latents)?;
        let img = ((decoded / 2.)? + 0.5)?
            .to_device(&Device::Cpu)?
            .to_dtype(DType::F32)?;
        let img = (img.clamp(0f32, 1f32)? * 255.)?.to_dtype(DType::U8)?;

        tensor_to_image(&img.i(0)?)
    }
}

pub struct StableDiffusionLoader;

impl Loader for StableDiffusionLoader {
    type Model = StableDiffusionModel;

    async fn load(
        model_id: String,
        variant: ModelVariant,
        api: Api,
        device_map: DeviceMap,
    ) -> Result<Self::Model> {
        let ModelVariant::StableDiffusion(variant) = variant;

        // Configure device.
        let device = device_map.select().context("failed to set up device")?;
        let dtype = select_dtype(&device);
        let info = ModelInfo::new(model_id.clone(), &device, dtype);
        let memory = MemoryOptions::for_device(info.device);
        info!(
            model = %model_id,
            device = ?info.device,
            dtype = %info.dtype,
            ?memory,
            "loading stable diffusion pipeline"
        );

        let sd_config = variant.config(memory.sliced_attention_size());
        let repo = api.model(model_id.clone());

        // --- Scheduler settings the checkpoint was trained with ---
        let schedule = match repo.get(SCHEDULER_CONFIG).await {
            Ok(path) => {
                let json = std::fs::read_to_string(&path)
                    .with_context(|| format!("failed to read {}", path.display()))?;
                TrainingSchedule::from_json(&json).context("failed to parse scheduler config")?
            }
            Err(e) => {
                let schedule = TrainingSchedule::fallback(variant, &model_id);
                warn!(
                    model = %model_id,
                    prediction_type = %schedule.prediction_type,
                    "no scheduler config ({e}), falling back to defaults"
                );
                schedule
            }
        };
        let scheduler = schedule.solver().context("unsupported scheduler config")?;
        debug!(?schedule, "scheduler configured");

        // --- Load CLIP Tokenizer ---
        let tokenizer_file = api
            .model(TOKENIZER_REPO.to_string())
            .get("tokenizer.json")
            .await
            .context("failed to get CLIP tokenizer")?;
        let tokenizer = Tokenizer::from_file(tokenizer_file)
            .map_err(Error::msg)
            .context("failed to load CLIP tokenizer")?;
        let pad_token = sd_config
            .clip
            .pad_with
            .as_deref()
            .unwrap_or(DEFAULT_PAD_TOKEN);
        let pad_id = tokenizer
            .get_vocab(true)
            .get(pad_token)
            .copied()
            .with_context(|| format!("CLIP tokenizer has no pad token {pad_token:?}"))?;

        // --- Load CLIP text encoder ---
        let clip_file = repo
            .get(ModelFile::Clip.path(dtype))
            .await
            .context("failed to get text encoder weights")?;
        let clip_model =
            stable_diffusion::build_clip_transformer(&sd_config.clip, clip_file, &device, dtype)
                .context("failed to load text encoder")?;

        // --- Load UNet ---
        let unet_file = repo
            .get(ModelFile::Unet.path(dtype))
            .await
            .context("failed to get unet weights")?;
        let unet = sd_config
            .build_unet(unet_file, &device, 4, cfg!(feature = "flash-attn"), dtype)
            .context("failed to load unet")?;

        // --- Load Autoencoder ---
        let vae_file = repo
            .get(ModelFile::Vae.path(dtype))
            .await
            .context("failed to get autoencoder weights")?;
        let vae = sd_config
            .build_vae(vae_file, &device, dtype)
            .context("failed to load autoencoder")?;

        info!(model = %model_id, "pipeline ready");

        Ok(StableDiffusionModel {
            device,
            dtype,
            info,
            memory,
            tokenizer,
            pad_id,
            max_tokens: sd_config.clip.max_position_embeddings,
            clip_model,
            unet,
            vae,
            scheduler,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variant_from_name() {
        assert_eq!(
            StableDiffusionVariant::from_name("runwayml/stable-diffusion-v1-5"),
            StableDiffusionVariant::V1_5
        );
        assert_eq!(
            StableDiffusionVariant::from_name("stabilityai/stable-diffusion-2-1"),
            StableDiffusionVariant::V2_1
        );
        assert_eq!(
            StableDiffusionVariant::from_name("stabilityai/stable-diffusion-2-1-base"),
            StableDiffusionVariant::V2_1
        );
        assert_eq!(
            StableDiffusionVariant::from_name("prompthero/openjourney"),
            StableDiffusionVariant::V1_5
        );
    }

    #[test]
    fn latent_shape_needs_multiples_of_eight() {
        assert_eq!(latent_shape(512, 768).unwrap(), (1, 4, 96, 64));
        assert_eq!(latent_shape(64, 64).unwrap(), (1, 4, 8, 8));

        let err = latent_shape(100, 512).unwrap_err().to_string();
        assert!(err.contains("divisible by 8"), "{err}");
        assert!(latent_shape(512, 100).is_err());
    }

    #[test]
    fn half_precision_uses_fp16_weights() {
        assert_eq!(
            ModelFile::Unet.path(DType::F16),
            "unet/diffusion_pytorch_model.fp16.safetensors"
        );
        assert_eq!(
            ModelFile::Clip.path(DType::F16),
            "text_encoder/model.fp16.safetensors"
        );
        assert_eq!(
            ModelFile::Vae.path(DType::F32),
            "vae/diffusion_pytorch_model.safetensors"
        );
    }

    #[test]
    fn memory_options_follow_device() {
        let gpu = MemoryOptions::for_device(DeviceKind::Accelerated);
        assert!(gpu.attention_slicing && gpu.vae_slicing);
        assert_eq!(gpu.sliced_attention_size(), Some(0));

        let cpu = MemoryOptions::for_device(DeviceKind::Cpu);
        assert!(!cpu.attention_slicing && !cpu.vae_slicing);
        assert_eq!(cpu.sliced_attention_size(), None);
    }

    #[test]
    fn v2_pads_with_exclamation_mark() {
        let config = StableDiffusionVariant::V2_1.config(None);
        assert_eq!(config.clip.pad_with.as_deref(), Some("!"));
        assert_eq!(config.clip.max_position_embeddings, 77);
        assert!(StableDiffusionVariant::V1_5.config(None).clip.pad_with.is_none());
    }
}

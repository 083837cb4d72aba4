use anyhow::{anyhow, Result};
use hf_hub::api::tokio::Api;
use tracing::info;

use crate::{DeviceMap, Loader, ModelLike, StableDiffusionLoader, StableDiffusionVariant};
use std::sync::Arc;

/// Model families, detected from the hub identifier.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum ModelType {
    StableDiffusion,
    StableDiffusionXl,
    Flux,
}

impl ModelType {
    /// Anything not recognisably SDXL or FLUX is treated as a Stable Diffusion
    /// 1.x/2.x checkpoint, which covers most community fine-tunes.
    pub fn from_name(model_name: &str) -> Self {
        let name_upper = model_name.to_uppercase();

        if name_upper.contains("FLUX") {
            ModelType::Flux
        } else if name_upper.contains("XL") {
            ModelType::StableDiffusionXl
        } else {
            ModelType::StableDiffusion
        }
    }
}

#[derive(Debug, Clone)]
pub enum ModelVariant {
    StableDiffusion(StableDiffusionVariant),
}

impl ModelVariant {
    pub fn from_name(model_name: &str) -> Option<Self> {
        match ModelType::from_name(model_name) {
            ModelType::StableDiffusion => Some(ModelVariant::StableDiffusion(
                StableDiffusionVariant::from_name(model_name),
            )),
            _ => None,
        }
    }
}

/// Load a model based on its name, automatically detecting the appropriate loader
pub async fn load_model(
    model_name: &str,
    api: Api,
    device_map: DeviceMap,
) -> Result<Arc<dyn ModelLike>> {
    let model_type = ModelType::from_name(model_name);

    match (model_type, ModelVariant::from_name(model_name)) {
        (ModelType::StableDiffusion, Some(model_variant)) => {
            info!(
                model = model_name,
                ?model_type,
                ?model_variant,
                "loading model"
            );
            let model =
                StableDiffusionLoader::load(model_name.to_string(), model_variant, api, device_map)
                    .await?;
            Ok(Arc::new(model))
        }
        _ => Err(anyhow!(
            "Model type {:?} ({}) is recognized but not yet implemented",
            model_type,
            model_name
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_model_type() {
        assert_eq!(
            ModelType::from_name("runwayml/stable-diffusion-v1-5"),
            ModelType::StableDiffusion
        );
        assert_eq!(
            ModelType::from_name("stabilityai/stable-diffusion-xl-base-1.0"),
            ModelType::StableDiffusionXl
        );
        assert_eq!(
            ModelType::from_name("black-forest-labs/FLUX.1-schnell"),
            ModelType::Flux
        );
        assert_eq!(
            ModelType::from_name("dreamlike-art/dreamlike-photoreal-2.0"),
            ModelType::StableDiffusion
        );
    }

    #[test]
    fn detects_stable_diffusion_variant() {
        assert!(matches!(
            ModelVariant::from_name("runwayml/stable-diffusion-v1-5"),
            Some(ModelVariant::StableDiffusion(StableDiffusionVariant::V1_5))
        ));
        assert!(matches!(
            ModelVariant::from_name("stabilityai/stable-diffusion-2-1"),
            Some(ModelVariant::StableDiffusion(StableDiffusionVariant::V2_1))
        ));
    }

    #[test]
    fn unsupported_families_have_no_variant() {
        assert!(ModelVariant::from_name("stabilityai/sdxl-turbo").is_none());
        assert!(ModelVariant::from_name("black-forest-labs/FLUX.1-dev").is_none());
    }
}

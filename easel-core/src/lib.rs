pub mod device_map;
pub mod info;
pub mod loader;
mod loader_factory;
pub mod request;
mod util;

mod stable_diffusion;

pub use device_map::*;
use image::DynamicImage;
pub use info::*;
pub use loader::*;
pub use loader_factory::*;
pub use request::*;
pub use stable_diffusion::{
    MemoryOptions, StableDiffusionLoader, StableDiffusionModel, StableDiffusionVariant,
};
pub use util::{encode_png, latent_noise, select_dtype, tensor_to_image};

/// A loaded text-to-image model.
///
/// `run` is synchronous and may take a long time; callers decide which thread
/// it runs on. Requests are expected to be validated already.
pub trait ModelLike: Send + Sync {
    fn info(&self) -> &ModelInfo;

    fn run(&self, request: &GenerationRequest) -> anyhow::Result<DynamicImage>;
}

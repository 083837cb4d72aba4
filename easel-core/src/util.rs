use std::io::Cursor;

use anyhow::{bail, Context, Result};
use candle_core::{DType, Device, Shape, Tensor};
use image::{DynamicImage, RgbImage};
use rand::{rngs::StdRng, Rng, SeedableRng};
use rand_distr::StandardNormal;

/// Half precision on accelerators, full precision on the CPU.
pub fn select_dtype(device: &Device) -> DType {
    if device.is_cpu() {
        DType::F32
    } else {
        DType::F16
    }
}

/// Standard normal noise for the initial latents.
///
/// Drawn on the host so that a given seed yields the same latents on every
/// device and regardless of other requests in flight.
pub fn latent_noise<S: Into<Shape>>(
    seed: Option<u64>,
    shape: S,
    device: &Device,
) -> Result<Tensor> {
    let shape = shape.into();
    let mut rng = match seed {
        Some(seed) => StdRng::seed_from_u64(seed),
        None => StdRng::from_entropy(),
    };
    let noise: Vec<f32> = (0..shape.elem_count())
        .map(|_| rng.sample(StandardNormal))
        .collect();
    Ok(Tensor::from_vec(noise, shape, device)?)
}

/// Converts a u8 tensor laid out as (3, height, width) into an RGB image.
pub fn tensor_to_image(img: &Tensor) -> Result<DynamicImage> {
    let (channels, height, width) = img.dims3()?;
    if channels != 3 {
        bail!("expected 3 colour channels, got {channels}");
    }
    let pixels = img.permute((1, 2, 0))?.flatten_all()?.to_vec1::<u8>()?;
    let image = RgbImage::from_raw(width as u32, height as u32, pixels)
        .context("pixel buffer does not match the image size")?;
    Ok(DynamicImage::ImageRgb8(image))
}

/// Encodes an image as PNG into memory.
pub fn encode_png(img: &DynamicImage) -> Result<Vec<u8>> {
    let mut bytes = Vec::new();
    img.write_to(&mut Cursor::new(&mut bytes), image::ImageFormat::Png)?;
    Ok(bytes)
}

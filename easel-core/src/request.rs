use std::ops::RangeInclusive;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const DIMENSION_RANGE: RangeInclusive<usize> = 64..=1024;
pub const STEPS_RANGE: RangeInclusive<usize> = 1..=100;
pub const GUIDANCE_RANGE: RangeInclusive<f64> = 1.0..=20.0;

#[derive(Debug, Clone, PartialEq, Error)]
pub enum ValidationError {
    #[error("{field} must be between {min} and {max}, got {value}")]
    OutOfRange {
        field: &'static str,
        min: f64,
        max: f64,
        value: f64,
    },
}

impl ValidationError {
    pub fn field(&self) -> &'static str {
        match self {
            Self::OutOfRange { field, .. } => field,
        }
    }
}

/// One text-to-image request.
///
/// Decoding only checks shape and types; call [`GenerationRequest::validate`]
/// before handing the request to a model.
#[derive(Deserialize, Serialize, Debug, Clone, PartialEq, PartialOrd)]
pub struct GenerationRequest {
    pub prompt: String,
    #[serde(default)]
    pub negative_prompt: Option<String>,
    #[serde(default = "default_dimension")]
    pub width: usize,
    #[serde(default = "default_dimension")]
    pub height: usize,
    #[serde(default = "default_steps")]
    pub num_inference_steps: usize,
    #[serde(default = "default_guidance_scale")]
    pub guidance_scale: f64,
    /// Any 64-bit integer, negative values included.
    #[serde(default)]
    pub seed: Option<i64>,
}

fn default_dimension() -> usize {
    512
}

fn default_steps() -> usize {
    50
}

fn default_guidance_scale() -> f64 {
    7.5
}

impl GenerationRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            negative_prompt: None,
            width: default_dimension(),
            height: default_dimension(),
            num_inference_steps: default_steps(),
            guidance_scale: default_guidance_scale(),
            seed: None,
        }
    }

    /// Rejects (never clamps) any value outside its declared bounds.
    pub fn validate(&self) -> Result<(), ValidationError> {
        check_range("width", &DIMENSION_RANGE, self.width)?;
        check_range("height", &DIMENSION_RANGE, self.height)?;
        check_range("num_inference_steps", &STEPS_RANGE, self.num_inference_steps)?;

        if !GUIDANCE_RANGE.contains(&self.guidance_scale) {
            return Err(ValidationError::OutOfRange {
                field: "guidance_scale",
                min: *GUIDANCE_RANGE.start(),
                max: *GUIDANCE_RANGE.end(),
                value: self.guidance_scale,
            });
        }
        Ok(())
    }

    /// Classifier-free guidance only has an effect above a scale of 1.
    pub fn uses_guidance(&self) -> bool {
        self.guidance_scale > 1.0
    }

    /// Seed for the noise generator, reinterpreting the bits of negative
    /// seeds so every distinct seed picks a distinct stream.
    pub fn rng_seed(&self) -> Option<u64> {
        self.seed.map(|seed| seed as u64)
    }
}

fn check_range(
    field: &'static str,
    range: &RangeInclusive<usize>,
    value: usize,
) -> Result<(), ValidationError> {
    if range.contains(&value) {
        Ok(())
    } else {
        Err(ValidationError::OutOfRange {
            field,
            min: *range.start() as f64,
            max: *range.end() as f64,
            value: value as f64,
        })
    }
}

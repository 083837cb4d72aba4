use std::sync::Arc;

use anyhow::{bail, Result};
use candle_transformers::models::stable_diffusion::{
    schedulers::{PredictionType, SchedulerConfig},
    uni_pc::{KarrasSigmaSchedule, SigmaSchedule, UniPCSchedulerConfig},
};
use serde::Deserialize;

use super::StableDiffusionVariant;

pub(crate) const SCHEDULER_CONFIG: &str = "scheduler/scheduler_config.json";

/// The parts of a checkpoint's `scheduler_config.json` the solver needs.
///
/// Missing keys take the Stable Diffusion 1.x training values.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(default)]
pub(crate) struct TrainingSchedule {
    pub prediction_type: String,
    pub beta_start: f64,
    pub beta_end: f64,
    pub beta_schedule: String,
    pub num_train_timesteps: usize,
}

impl Default for TrainingSchedule {
    fn default() -> Self {
        Self {
            prediction_type: "epsilon".to_string(),
            beta_start: 0.00085,
            beta_end: 0.012,
            beta_schedule: "scaled_linear".to_string(),
            num_train_timesteps: 1000,
        }
    }
}

impl TrainingSchedule {
    pub fn from_json(json: &str) -> Result<Self> {
        Ok(serde_json::from_str(json)?)
    }

    /// Used when the repository ships no scheduler config.
    pub fn fallback(variant: StableDiffusionVariant, model_name: &str) -> Self {
        Self {
            prediction_type: variant.default_prediction_type(model_name).to_string(),
            ..Default::default()
        }
    }

    pub fn prediction_type(&self) -> Result<PredictionType> {
        match self.prediction_type.as_str() {
            "epsilon" => Ok(PredictionType::Epsilon),
            "v_prediction" => Ok(PredictionType::VPrediction),
            "sample" => Ok(PredictionType::Sample),
            other => bail!("unsupported prediction type {other:?}"),
        }
    }

    /// Noise levels at the first and last training timestep.
    pub fn sigma_range(&self) -> Result<(f64, f64)> {
        let n = self.num_train_timesteps;
        if n < 2 {
            bail!("scheduler needs at least 2 training timesteps, got {n}");
        }
        let step = |start: f64, end: f64, i: usize| {
            start + (end - start) * i as f64 / (n - 1) as f64
        };
        let betas: Vec<f64> = match self.beta_schedule.as_str() {
            "scaled_linear" => (0..n)
                .map(|i| step(self.beta_start.sqrt(), self.beta_end.sqrt(), i).powi(2))
                .collect(),
            "linear" => (0..n)
                .map(|i| step(self.beta_start, self.beta_end, i))
                .collect(),
            other => bail!("unsupported beta schedule {other:?}"),
        };

        let mut alpha_cumprod = 1.0;
        let mut sigmas = betas.iter().map(|beta| {
            alpha_cumprod *= 1.0 - beta;
            ((1.0 - alpha_cumprod) / alpha_cumprod).sqrt()
        });
        let sigma_min = sigmas.next().unwrap_or_default();
        let sigma_max = sigmas.last().unwrap_or(sigma_min);
        Ok((sigma_min, sigma_max))
    }

    /// Multistep UniPC solver used in place of the checkpoint's default
    /// scheduler, over the checkpoint's own noise range. Order 2 is the
    /// recommended setting for guided sampling.
    pub fn solver_config(&self) -> Result<UniPCSchedulerConfig> {
        let (sigma_min, sigma_max) = self.sigma_range()?;
        Ok(UniPCSchedulerConfig {
            prediction_type: self.prediction_type()?,
            sigma_schedule: SigmaSchedule::Karras(KarrasSigmaSchedule {
                sigma_min,
                sigma_max,
                rho: 7.0,
            }),
            num_training_timesteps: self.num_train_timesteps,
            solver_order: 2,
            ..Default::default()
        })
    }

    pub fn solver(&self) -> Result<Arc<dyn SchedulerConfig>> {
        Ok(Arc::new(self.solver_config()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    // scheduler/scheduler_config.json from stabilityai/stable-diffusion-2-1-base
    const SD2_BASE_CONFIG: &str = r#"{
        "_class_name": "PNDMScheduler",
        "beta_end": 0.012,
        "beta_schedule": "scaled_linear",
        "beta_start": 0.00085,
        "clip_sample": false,
        "num_train_timesteps": 1000,
        "prediction_type": "epsilon",
        "set_alpha_to_one": false,
        "skip_prk_steps": true,
        "steps_offset": 1
    }"#;

    #[test]
    fn reads_checkpoint_config() {
        let schedule = TrainingSchedule::from_json(SD2_BASE_CONFIG).unwrap();
        assert_eq!(schedule, TrainingSchedule::default());
        assert!(matches!(
            schedule.prediction_type().unwrap(),
            PredictionType::Epsilon
        ));

        let v = TrainingSchedule::from_json(r#"{"prediction_type": "v_prediction"}"#).unwrap();
        assert!(matches!(
            v.prediction_type().unwrap(),
            PredictionType::VPrediction
        ));
    }

    #[test]
    fn rejects_unknown_settings() {
        let schedule = TrainingSchedule {
            prediction_type: "flow".to_string(),
            ..Default::default()
        };
        assert!(schedule.prediction_type().is_err());

        let schedule = TrainingSchedule {
            beta_schedule: "squaredcos_cap_v2".to_string(),
            ..Default::default()
        };
        assert!(schedule.sigma_range().is_err());
    }

    #[test]
    fn sigma_range_matches_stable_diffusion_training() {
        let (sigma_min, sigma_max) = TrainingSchedule::default().sigma_range().unwrap();
        assert!((sigma_min - 0.0292).abs() < 1e-3, "{sigma_min}");
        assert!((sigma_max - 14.6146).abs() < 1e-2, "{sigma_max}");
    }

    #[test]
    fn solver_spans_the_training_noise_range() {
        let config = TrainingSchedule::default().solver_config().unwrap();
        assert_eq!(config.solver_order, 2);
        assert_eq!(config.num_training_timesteps, 1000);
        match config.sigma_schedule {
            SigmaSchedule::Karras(karras) => {
                assert!((karras.sigma_min - 0.0292).abs() < 1e-3);
                assert!((karras.sigma_max - 14.6146).abs() < 1e-2);
                assert_eq!(karras.rho, 7.0);
            }
            other => panic!("unexpected sigma schedule {other:?}"),
        }
    }

    #[test]
    fn base_checkpoints_fall_back_to_epsilon() {
        let base = TrainingSchedule::fallback(
            StableDiffusionVariant::V2_1,
            "stabilityai/stable-diffusion-2-1-base",
        );
        assert_eq!(base.prediction_type, "epsilon");

        let v2 = TrainingSchedule::fallback(
            StableDiffusionVariant::V2_1,
            "stabilityai/stable-diffusion-2-1",
        );
        assert_eq!(v2.prediction_type, "v_prediction");

        let v1 = TrainingSchedule::fallback(
            StableDiffusionVariant::V1_5,
            "runwayml/stable-diffusion-v1-5",
        );
        assert_eq!(v1.prediction_type, "epsilon");
    }

    #[test]
    fn builds_one_timestep_per_step() {
        let config = TrainingSchedule::default().solver().unwrap();
        for steps in [4, 20, 50] {
            let scheduler = config.build(steps).unwrap();
            assert_eq!(scheduler.timesteps().len(), steps);
        }
    }
}

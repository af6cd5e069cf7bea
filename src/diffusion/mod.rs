//! # Gaussian diffusion
//!
//! Discrete-time Gaussian diffusion used by DiT: a fixed beta schedule over
//! the training timesteps, optionally respaced to fewer sampling steps, and
//! the ancestral reverse process driven by a [`Denoiser`](crate::dit::Denoiser).
use serde::{Deserialize, Serialize};

use crate::error::SampleError;

pub mod gaussian;
pub mod respace;

pub use gaussian::{GaussianDiffusion, MeanVariance, SampleOptions};
pub use respace::space_timesteps;

/// This represents how beta ranges from its minimum value to the maximum
/// during training.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BetaSchedule {
    /// Linear interpolation, scaled so that any step count matches the
    /// 1000-step schedule.
    Linear,
    /// Glide cosine schedule
    SquaredcosCapV2,
}

/// What the network predicts.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelMeanType {
    /// The noise added to `x_0`.
    Epsilon,
    /// `x_0` itself.
    StartX,
}

/// How the reverse process variance is obtained.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ModelVarType {
    /// The network outputs `v` in `[-1, 1]`, interpolating between the
    /// posterior variance and beta in log space.
    LearnedRange,
    FixedSmall,
    FixedLarge,
}

/// Betas for a named schedule.
pub fn get_named_beta_schedule(schedule: BetaSchedule, num_diffusion_timesteps: usize) -> Vec<f64> {
    match schedule {
        BetaSchedule::Linear => {
            let scale = 1000. / num_diffusion_timesteps as f64;
            let beta_start = scale * 0.0001;
            let beta_end = scale * 0.02;
            linspace(beta_start, beta_end, num_diffusion_timesteps)
        }
        BetaSchedule::SquaredcosCapV2 => betas_for_alpha_bar(num_diffusion_timesteps, 0.999),
    }
}

fn linspace(start: f64, end: f64, n: usize) -> Vec<f64> {
    if n == 1 {
        return vec![start];
    }
    let step = (end - start) / (n - 1) as f64;
    (0..n).map(|i| start + step * i as f64).collect()
}

/// Create a beta schedule that discretizes the given alpha_t_bar function, which defines the cumulative product of
/// `(1-beta)` over time from `t = [0,1]`.
pub(crate) fn betas_for_alpha_bar(num_diffusion_timesteps: usize, max_beta: f64) -> Vec<f64> {
    let alpha_bar = |time_step: f64| f64::cos((time_step + 0.008) / 1.008 * std::f64::consts::FRAC_PI_2).powi(2);
    (0..num_diffusion_timesteps)
        .map(|i| {
            let t1 = i as f64 / num_diffusion_timesteps as f64;
            let t2 = (i + 1) as f64 / num_diffusion_timesteps as f64;
            (1.0 - alpha_bar(t2) / alpha_bar(t1)).min(max_beta)
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiffusionConfig {
    pub noise_schedule: BetaSchedule,
    /// Number of training timesteps.
    pub diffusion_steps: usize,
    pub predict_xstart: bool,
    pub learn_sigma: bool,
    pub sigma_small: bool,
}

impl Default for DiffusionConfig {
    fn default() -> Self {
        Self {
            noise_schedule: BetaSchedule::Linear,
            diffusion_steps: 1000,
            predict_xstart: false,
            learn_sigma: true,
            sigma_small: false,
        }
    }
}

/// Builds the diffusion process sampled by DiT, respaced according to
/// `timestep_respacing` (e.g. `"250"`, `"ddim25"`, `"10,15,20"`). An empty
/// string keeps every training step.
pub fn create_diffusion(timestep_respacing: &str, config: &DiffusionConfig) -> Result<GaussianDiffusion, SampleError> {
    let betas = get_named_beta_schedule(config.noise_schedule, config.diffusion_steps);
    let mean_type = if config.predict_xstart { ModelMeanType::StartX } else { ModelMeanType::Epsilon };
    let var_type = match (config.learn_sigma, config.sigma_small) {
        (true, _) => ModelVarType::LearnedRange,
        (false, false) => ModelVarType::FixedLarge,
        (false, true) => ModelVarType::FixedSmall,
    };
    let respacing = if timestep_respacing.is_empty() {
        config.diffusion_steps.to_string()
    } else {
        timestep_respacing.to_string()
    };
    let use_timesteps = space_timesteps(config.diffusion_steps, &respacing)?;
    Ok(GaussianDiffusion::spaced(&use_timesteps, &betas, mean_type, var_type))
}

#[cfg(test)]
mod tests {
    use super::{create_diffusion, get_named_beta_schedule, BetaSchedule, DiffusionConfig, ModelVarType};

    #[test]
    fn test_linear_schedule() {
        let betas = get_named_beta_schedule(BetaSchedule::Linear, 1000);
        assert_eq!(betas.len(), 1000);
        assert!((betas[0] - 0.0001).abs() < 1e-12);
        assert!((betas[999] - 0.02).abs() < 1e-12);
    }

    #[test]
    fn test_cosine_schedule_is_capped() {
        let betas = get_named_beta_schedule(BetaSchedule::SquaredcosCapV2, 100);
        assert!(betas.iter().all(|b| *b > 0. && *b <= 0.999));
        assert_eq!(betas[99], 0.999);
    }

    #[test]
    fn test_create_default_diffusion() {
        let diffusion = create_diffusion("250", &DiffusionConfig::default()).unwrap();
        assert_eq!(diffusion.num_timesteps(), 250);
        assert_eq!(diffusion.var_type(), ModelVarType::LearnedRange);
        assert_eq!(diffusion.timestep_map()[0], 0);
        assert_eq!(*diffusion.timestep_map().last().unwrap(), 999);
        assert!(diffusion.betas().iter().all(|b| *b > 0. && *b < 1.));
    }

    #[test]
    fn test_empty_respacing_keeps_all_steps() {
        let diffusion = create_diffusion("", &DiffusionConfig::default()).unwrap();
        assert_eq!(diffusion.num_timesteps(), 1000);
    }
}

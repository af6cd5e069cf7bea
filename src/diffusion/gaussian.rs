use std::collections::BTreeSet;

use indicatif::{ProgressBar, ProgressStyle};
use tch::{Device, Kind, Tensor};
use tracing::debug;

use super::{respace::respace_betas, ModelMeanType, ModelVarType};
use crate::{conditioning::Conditioning, dit::Denoiser, error::SampleError};

/// Options of a single call to [`GaussianDiffusion::p_sample_loop`].
#[derive(Debug, Clone, Default)]
pub struct SampleOptions {
    /// Clamp the predicted `x_0` to `[-1, 1]`.
    pub clip_denoised: bool,
    /// Training timestep to start the reverse process from; the initial
    /// noise is treated as the sample at that timestep.
    pub t_start: Option<i64>,
    pub progress: bool,
}

#[derive(Debug)]
pub struct MeanVariance {
    pub mean: Tensor,
    pub log_variance: Tensor,
    pub pred_xstart: Tensor,
}

/// Schedule-derived quantities of a (possibly respaced) diffusion process.
/// All arrays are indexed by the respaced step.
#[derive(Debug, Clone)]
pub struct GaussianDiffusion {
    betas: Vec<f64>,
    timestep_map: Vec<i64>,
    original_num_steps: usize,
    sqrt_recip_alphas_cumprod: Vec<f64>,
    sqrt_recipm1_alphas_cumprod: Vec<f64>,
    posterior_variance: Vec<f64>,
    posterior_log_variance_clipped: Vec<f64>,
    posterior_mean_coef1: Vec<f64>,
    posterior_mean_coef2: Vec<f64>,
    mean_type: ModelMeanType,
    var_type: ModelVarType,
}

impl GaussianDiffusion {
    pub fn new(betas: Vec<f64>, mean_type: ModelMeanType, var_type: ModelVarType) -> Self {
        let timestep_map = (0..betas.len() as i64).collect();
        let original_num_steps = betas.len();
        Self::with_timestep_map(betas, timestep_map, original_num_steps, mean_type, var_type)
    }

    /// Diffusion over the subset `use_timesteps` of the schedule `base_betas`.
    pub fn spaced(
        use_timesteps: &BTreeSet<usize>,
        base_betas: &[f64],
        mean_type: ModelMeanType,
        var_type: ModelVarType,
    ) -> Self {
        let (betas, timestep_map) = respace_betas(use_timesteps, base_betas);
        Self::with_timestep_map(betas, timestep_map, base_betas.len(), mean_type, var_type)
    }

    fn with_timestep_map(
        betas: Vec<f64>,
        timestep_map: Vec<i64>,
        original_num_steps: usize,
        mean_type: ModelMeanType,
        var_type: ModelVarType,
    ) -> Self {
        let mut alphas_cumprod = Vec::with_capacity(betas.len());
        let mut acc = 1.0;
        for beta in betas.iter() {
            acc *= 1.0 - beta;
            alphas_cumprod.push(acc);
        }
        let alphas_cumprod_prev: Vec<f64> =
            std::iter::once(1.0).chain(alphas_cumprod.iter().copied()).take(betas.len()).collect();
        let sqrt_recip_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 / a).sqrt()).collect();
        let sqrt_recipm1_alphas_cumprod = alphas_cumprod.iter().map(|a| (1.0 / a - 1.0).sqrt()).collect();

        let posterior_variance: Vec<f64> = (0..betas.len())
            .map(|i| betas[i] * (1.0 - alphas_cumprod_prev[i]) / (1.0 - alphas_cumprod[i]))
            .collect();
        // The posterior variance is 0 at the start of the chain.
        let first = posterior_variance.get(1).copied().unwrap_or(betas[0]);
        let posterior_log_variance_clipped = std::iter::once(first)
            .chain(posterior_variance.iter().skip(1).copied())
            .map(f64::ln)
            .collect();
        let posterior_mean_coef1 = (0..betas.len())
            .map(|i| betas[i] * alphas_cumprod_prev[i].sqrt() / (1.0 - alphas_cumprod[i]))
            .collect();
        let posterior_mean_coef2 = (0..betas.len())
            .map(|i| (1.0 - alphas_cumprod_prev[i]) * (1.0 - betas[i]).sqrt() / (1.0 - alphas_cumprod[i]))
            .collect();

        Self {
            betas,
            timestep_map,
            original_num_steps,
            sqrt_recip_alphas_cumprod,
            sqrt_recipm1_alphas_cumprod,
            posterior_variance,
            posterior_log_variance_clipped,
            posterior_mean_coef1,
            posterior_mean_coef2,
            mean_type,
            var_type,
        }
    }

    pub fn num_timesteps(&self) -> usize {
        self.betas.len()
    }

    pub fn betas(&self) -> &[f64] {
        &self.betas
    }

    /// Training timestep of every respaced step.
    pub fn timestep_map(&self) -> &[i64] {
        &self.timestep_map
    }

    pub fn var_type(&self) -> ModelVarType {
        self.var_type
    }

    /// Respaced step at which sampling starts for a training timestep
    /// `t_start`: the last step whose training timestep does not exceed it.
    pub fn start_index(&self, t_start: Option<i64>) -> Result<usize, SampleError> {
        let last = self.num_timesteps() - 1;
        let Some(t_start) = t_start else {
            return Ok(last);
        };
        if t_start < 0 || t_start >= self.original_num_steps as i64 {
            return Err(SampleError::InvalidStartTimestep {
                t_start,
                num_timesteps: self.original_num_steps as i64,
            });
        }
        Ok(self.timestep_map.iter().rposition(|t| *t <= t_start).unwrap_or(0))
    }

    fn predict_xstart_from_eps(&self, x: &Tensor, step: usize, eps: &Tensor) -> Tensor {
        x * self.sqrt_recip_alphas_cumprod[step] - eps * self.sqrt_recipm1_alphas_cumprod[step]
    }

    fn q_posterior_mean(&self, x_start: &Tensor, x: &Tensor, step: usize) -> Tensor {
        x_start * self.posterior_mean_coef1[step] + x * self.posterior_mean_coef2[step]
    }

    /// Mean and log variance of `p(x_{t-1} | x_t)` at respaced step `step`.
    pub fn p_mean_variance<M: Denoiser + ?Sized>(
        &self,
        model: &M,
        x: &Tensor,
        step: usize,
        cond: &Conditioning,
        clip_denoised: bool,
    ) -> MeanVariance {
        let size = x.size();
        let (b, c) = (size[0], size[1]);
        let device = x.device();
        let timestep = self.timestep_map[step];
        let t = Tensor::full([b], timestep, (Kind::Int64, device));
        let labels = cond.labels_tensor_at(timestep, device);
        let model_output = model.forward_with_cfg(x, &t, &labels, cond.cfg_scale);

        let (model_output, log_variance) = match self.var_type {
            ModelVarType::LearnedRange => {
                let output = model_output.narrow(1, 0, c);
                let var_values = model_output.narrow(1, c, c);
                let min_log = self.posterior_log_variance_clipped[step];
                let max_log = self.betas[step].ln();
                let frac = (var_values + 1.) / 2.;
                let log_variance = &frac * max_log + (frac.ones_like() - &frac) * min_log;
                (output, log_variance)
            }
            ModelVarType::FixedLarge => {
                // Use the beta itself, except for the first step where the
                // posterior variance gives a better log-likelihood.
                let variance = if step == 0 {
                    self.posterior_variance.get(1).copied().unwrap_or(self.betas[0])
                } else {
                    self.betas[step]
                };
                (model_output.narrow(1, 0, c), x.full_like(variance.ln()))
            }
            ModelVarType::FixedSmall => {
                (model_output.narrow(1, 0, c), x.full_like(self.posterior_log_variance_clipped[step]))
            }
        };

        let pred_xstart = match self.mean_type {
            ModelMeanType::Epsilon => self.predict_xstart_from_eps(x, step, &model_output),
            ModelMeanType::StartX => model_output,
        };
        let pred_xstart = if clip_denoised { pred_xstart.clamp(-1., 1.) } else { pred_xstart };
        let mean = self.q_posterior_mean(&pred_xstart, x, step);
        MeanVariance { mean, log_variance, pred_xstart }
    }

    /// One ancestral step from `x_t` to `x_{t-1}`; no noise is added at the
    /// last step.
    pub fn p_sample<M: Denoiser + ?Sized>(
        &self,
        model: &M,
        x: &Tensor,
        step: usize,
        cond: &Conditioning,
        clip_denoised: bool,
    ) -> Tensor {
        let out = self.p_mean_variance(model, x, step, cond, clip_denoised);
        if step == 0 {
            return out.mean;
        }
        let noise = x.randn_like();
        out.mean + (out.log_variance * 0.5).exp() * noise
    }

    /// Runs the reverse process on a doubled (conditional + unconditional)
    /// batch and returns the final sample, still doubled.
    pub fn p_sample_loop<M: Denoiser + ?Sized>(
        &self,
        model: &M,
        shape: &[i64],
        noise: Option<Tensor>,
        cond: &Conditioning,
        options: &SampleOptions,
        device: Device,
    ) -> Result<Tensor, SampleError> {
        let start = self.start_index(options.t_start)?;
        if self.var_type == ModelVarType::LearnedRange && !model.learn_sigma() {
            return Err(SampleError::VarianceNotPredicted);
        }
        let mut img = match noise {
            Some(noise) => noise,
            None => Tensor::randn(shape, (Kind::Float, device)),
        };

        let pb = if options.progress { ProgressBar::new(start as u64 + 1) } else { ProgressBar::hidden() };
        pb.set_style(
            ProgressStyle::with_template("{elapsed_precise} | ETA {eta_precise} [{bar:40.cyan/blue}] {pos}/{len} | t={msg}")
                .unwrap_or_else(|_| ProgressStyle::default_bar())
                .progress_chars("=>-"),
        );
        debug!(start, timestep = self.timestep_map[start], "starting reverse process");
        for step in (0..=start).rev() {
            pb.set_message(self.timestep_map[step].to_string());
            img = self.p_sample(model, &img, step, cond, options.clip_denoised);
            pb.inc(1);
        }
        pb.finish_and_clear();
        Ok(img)
    }
}

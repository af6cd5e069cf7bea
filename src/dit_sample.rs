//! Class-conditional sampling: noise in, PNG files out.
use std::{fs, path::PathBuf, time::Instant};

use anyhow::Context;
use tch::{Device, Kind, Tensor};
use tracing::{info, warn};

use crate::{
    conditioning::Conditioning,
    diffusion::{GaussianDiffusion, SampleOptions},
    dit::Denoiser,
    utils::{count_nan, has_nan, image_filename, latents_filename, save_image},
    vae::LatentDecoder,
};

pub mod builder;
pub mod config;

pub use builder::DiTSamplerBuilder;
pub use config::SampleConfig;

pub struct DiTSampler {
    config: SampleConfig,
    model: Box<dyn Denoiser>,
    vae: Box<dyn LatentDecoder>,
    diffusion: GaussianDiffusion,
    device: Device,
}

impl DiTSampler {
    pub fn from_parts(
        config: SampleConfig,
        model: Box<dyn Denoiser>,
        vae: Box<dyn LatentDecoder>,
        diffusion: GaussianDiffusion,
        device: Device,
    ) -> Self {
        Self { config, model, vae, diffusion, device }
    }

    pub fn config(&self) -> &SampleConfig {
        &self.config
    }

    /// Resolves and validates the labels and merge times of this run.
    pub fn conditioning(&self) -> anyhow::Result<Conditioning> {
        Ok(self.config.conditioning()?)
    }

    /// Samples one latent per label and drops the unconditional half.
    pub fn sample_latents(&self, cond: &Conditioning) -> anyhow::Result<Tensor> {
        let n = cond.len() as i64;
        let latent_size = self.config.latent_size();
        let z = Tensor::randn([n, 4, latent_size, latent_size], (Kind::Float, self.device));
        let z = cond.double_noise(&z);
        let options = SampleOptions {
            clip_denoised: false,
            t_start: self.config.t_start,
            progress: self.config.progress,
        };
        let samples = self.diffusion.p_sample_loop(self.model.as_ref(), &z.size(), Some(z), cond, &options, self.device)?;
        Ok(samples.narrow(0, 0, n))
    }

    /// Runs `n_samples` rounds over the label list and writes every image,
    /// returning the written paths.
    pub fn run(&self) -> anyhow::Result<Vec<PathBuf>> {
        let _no_grad = tch::no_grad_guard();
        tch::manual_seed(self.config.seed);
        let cond = self.conditioning()?;
        let save_dir = &self.config.save_dir;
        fs::create_dir_all(save_dir).with_context(|| format!("error creating {}", save_dir.display()))?;

        let rounds = self.config.n_samples.max(1);
        let mut written = Vec::new();
        for round in 0..rounds {
            let start = Instant::now();
            info!(round = round + 1, rounds, labels = cond.len(), "sampling");
            let latents = self.sample_latents(&cond)?;
            if self.config.save_latents {
                let path = latents_filename(save_dir, round);
                latents.to_device(Device::Cpu).save(&path)?;
                written.push(path);
            }
            let images = self.vae.decode_chunked(&latents, self.config.decode_batch_size);
            if has_nan(&images) {
                warn!(round, nans = count_nan(&images), "decoded images contain NaN");
            }
            for idx in 0..images.size()[0] {
                let path = image_filename(save_dir, round, idx as usize);
                save_image(&images.get(idx), &path)?;
                written.push(path);
            }
            info!(round = round + 1, elapsed = ?start.elapsed(), "saved samples");
        }
        Ok(written)
    }
}

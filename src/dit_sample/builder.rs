use std::time::Instant;

use anyhow::Context;
use tch::{nn, Device};
use tracing::info;

use crate::{
    checkpoint::{find_model, load_state_dict, read_checkpoint},
    diffusion::{create_diffusion, DiffusionConfig},
    dit::{num_parameters, DiT},
    utils::get_device,
    vae::Vae,
};

use super::{config::SampleConfig, DiTSampler};

/// Loads the weights a [`SampleConfig`] refers to.
pub struct DiTSamplerBuilder {
    config: SampleConfig,
    device: Device,
}

impl DiTSamplerBuilder {
    pub fn new(config: SampleConfig) -> anyhow::Result<Self> {
        config.validate()?;
        let device = get_device(config.cpu);
        Ok(Self { config, device })
    }

    fn build_dit(&self) -> anyhow::Result<DiT> {
        let vs = nn::VarStore::new(self.device);
        let dit_config = self.config.model.dit_config(self.config.latent_size(), self.config.num_classes);
        let model = DiT::new(vs.root(), dit_config);
        let checkpoint = find_model(&self.config.checkpoint())?;
        let tensors = read_checkpoint(&checkpoint)?;
        load_state_dict(&vs, tensors).with_context(|| format!("error loading {}", checkpoint.display()))?;
        info!(model = %self.config.model, parameters = num_parameters(&vs), "loaded DiT");
        Ok(model)
    }

    fn build_vae(&self) -> anyhow::Result<Vae> {
        let weights = match &self.config.vae_weights {
            Some(path) => path.clone(),
            None => Vae::weights_from_hub(self.config.vae)?,
        };
        Vae::load(weights, self.device)
    }

    pub fn build(self) -> anyhow::Result<DiTSampler> {
        let start = Instant::now();
        let model = self.build_dit()?;
        let vae = self.build_vae()?;
        let diffusion =
            create_diffusion(&self.config.num_sampling_steps.to_string(), &DiffusionConfig::default())?;
        info!(elapsed = ?start.elapsed(), device = ?self.device, "models ready");
        Ok(DiTSampler::from_parts(self.config, Box::new(model), Box::new(vae), diffusion, self.device))
    }
}

#[cfg(test)]
mod tests {
    use std::path::PathBuf;

    use super::DiTSamplerBuilder;
    use crate::{dit_sample::SampleConfig, error::SampleError};

    #[test]
    fn test_bad_arguments_fail_before_loading() {
        let missing = PathBuf::from("does-not-exist/ckpt.pt");
        let config = SampleConfig {
            ckpt: Some(missing.clone()),
            classes: Some(vec![1, 2, 3]),
            tc: Some(vec![10, 20]),
            cpu: true,
            ..Default::default()
        };
        let err = DiTSamplerBuilder::new(config).err().unwrap();
        assert!(matches!(err.downcast_ref::<SampleError>(), Some(SampleError::MergeTimeCountMismatch { .. })));

        let config = SampleConfig { ckpt: Some(missing), t_start: Some(5000), cpu: true, ..Default::default() };
        let err = DiTSamplerBuilder::new(config).err().unwrap();
        assert!(matches!(err.downcast_ref::<SampleError>(), Some(SampleError::InvalidStartTimestep { .. })));
    }
}

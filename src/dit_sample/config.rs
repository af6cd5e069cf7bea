use std::{fs, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{
    checkpoint::pretrained_checkpoint_name,
    conditioning::{class_labels, Conditioning},
    diffusion::{space_timesteps, DiffusionConfig},
    error::SampleError,
    model_kind::{ModelKind, VaeKind},
};

pub const SUPPORTED_IMAGE_SIZES: [i64; 2] = [256, 512];

/// Everything a sampling run needs, as read from the command line or a TOML
/// file. Missing keys take the command line defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SampleConfig {
    pub model: ModelKind,
    pub vae: VaeKind,
    pub image_size: i64,
    pub num_classes: i64,
    pub cfg_scale: f64,
    pub num_sampling_steps: usize,
    pub seed: i64,
    /// Local DiT checkpoint; a released one is downloaded when unset.
    pub ckpt: Option<PathBuf>,
    pub t_start: Option<i64>,
    /// Per-label merge times, on the training timestep scale.
    pub tc: Option<Vec<i64>>,
    pub classes: Option<Vec<i64>>,
    pub all_classes: bool,
    pub n_samples: usize,
    pub save_dir: PathBuf,
    /// Local VAE weights; fetched from the hub when unset.
    pub vae_weights: Option<PathBuf>,
    pub decode_batch_size: i64,
    pub save_latents: bool,
    pub cpu: bool,
    pub progress: bool,
}

impl Default for SampleConfig {
    fn default() -> Self {
        Self {
            model: ModelKind::DiT_XL_2,
            vae: VaeKind::Mse,
            image_size: 256,
            num_classes: 1000,
            cfg_scale: 4.0,
            num_sampling_steps: 250,
            seed: 0,
            ckpt: None,
            t_start: None,
            tc: None,
            classes: None,
            all_classes: false,
            n_samples: 1,
            save_dir: PathBuf::from("samples"),
            vae_weights: None,
            decode_batch_size: 5,
            save_latents: true,
            cpu: false,
            progress: true,
        }
    }
}

impl SampleConfig {
    pub fn from_file<T: AsRef<std::path::Path>>(path: T) -> anyhow::Result<Self> {
        let file = fs::read_to_string(path)?;
        let cfg: SampleConfig = toml::from_str(&file)?;
        Ok(cfg)
    }

    pub fn latent_size(&self) -> i64 {
        self.image_size / 8
    }

    /// Resolves the labels and merge times of this run.
    pub fn conditioning(&self) -> Result<Conditioning, SampleError> {
        let labels = class_labels(self.classes.as_deref(), self.all_classes, self.num_classes);
        Conditioning::new(labels, self.tc.clone(), self.num_classes, self.cfg_scale)
    }

    /// Checks argument combinations that would otherwise fail half way
    /// through loading or sampling.
    pub fn validate(&self) -> Result<(), SampleError> {
        let invalid_size = || SampleError::InvalidImageSize {
            model: self.model.to_string(),
            image_size: self.image_size,
        };
        if !SUPPORTED_IMAGE_SIZES.contains(&self.image_size) {
            return Err(invalid_size());
        }
        if self.latent_size() % self.model.patch_size() != 0 {
            return Err(invalid_size());
        }
        if self.ckpt.is_none() && !self.can_auto_download() {
            return Err(SampleError::AutoDownloadUnsupported {
                model: self.model.to_string(),
                image_size: self.image_size,
                num_classes: self.num_classes,
            });
        }
        self.conditioning()?;
        let diffusion_steps = DiffusionConfig::default().diffusion_steps;
        space_timesteps(diffusion_steps, &self.num_sampling_steps.to_string())?;
        if let Some(t_start) = self.t_start {
            if !(0..diffusion_steps as i64).contains(&t_start) {
                return Err(SampleError::InvalidStartTimestep { t_start, num_timesteps: diffusion_steps as i64 });
            }
        }
        Ok(())
    }

    fn can_auto_download(&self) -> bool {
        self.model.has_pretrained_weights()
            && SUPPORTED_IMAGE_SIZES.contains(&self.image_size)
            && self.num_classes == 1000
    }

    /// Local path or released checkpoint name to hand to `find_model`.
    pub fn checkpoint(&self) -> String {
        match &self.ckpt {
            Some(path) => path.to_string_lossy().to_string(),
            None => pretrained_checkpoint_name(self.image_size),
        }
    }
}

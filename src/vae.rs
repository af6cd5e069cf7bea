//! Latent decoding through the Stable Diffusion KL autoencoder.
use std::path::{Path, PathBuf};

use diffusers::models::vae::{AutoEncoderKL, AutoEncoderKLConfig};
use tch::{nn, Device, Tensor};
use tracing::info;

use crate::model_kind::VaeKind;

/// Scale applied to VAE latents during DiT training.
pub const LATENT_SCALE: f64 = 0.18215;

const VAE_WEIGHTS_FILE: &str = "diffusion_pytorch_model.safetensors";

pub trait LatentDecoder {
    /// Decodes scaled latents `(N, 4, h, w)` into images `(N, 3, 8h, 8w)` in `[-1, 1]`.
    fn decode(&self, latents: &Tensor) -> Tensor;

    /// Decodes at most `chunk_size` latents at a time to bound memory use.
    fn decode_chunked(&self, latents: &Tensor, chunk_size: i64) -> Tensor {
        let n = latents.size()[0];
        if n <= chunk_size {
            return self.decode(latents);
        }
        let images: Vec<Tensor> = latents
            .split(chunk_size.max(1), 0)
            .iter()
            .map(|chunk| self.decode(chunk))
            .collect();
        Tensor::cat(&images, 0)
    }
}

pub struct Vae {
    model: AutoEncoderKL,
    device: Device,
}

impl Vae {
    /// Config of the sd-vae-ft-ema and sd-vae-ft-mse autoencoders.
    pub fn config() -> AutoEncoderKLConfig {
        AutoEncoderKLConfig {
            block_out_channels: vec![128, 256, 512, 512],
            layers_per_block: 2,
            latent_channels: 4,
            norm_num_groups: 32,
        }
    }

    /// Fetches the weights of `kind` from the hub, reusing the local cache.
    pub fn weights_from_hub(kind: VaeKind) -> anyhow::Result<PathBuf> {
        let api = hf_hub::api::sync::Api::new()?;
        let path = api.model(kind.hub_repo()).get(VAE_WEIGHTS_FILE)?;
        Ok(path)
    }

    pub fn load<P: AsRef<Path>>(weights: P, device: Device) -> anyhow::Result<Self> {
        let mut vs = nn::VarStore::new(device);
        let model = AutoEncoderKL::new(vs.root(), 3, 3, Self::config());
        vs.load(weights.as_ref())?;
        info!(weights = %weights.as_ref().display(), "loaded vae");
        Ok(Self { model, device })
    }
}

impl LatentDecoder for Vae {
    fn decode(&self, latents: &Tensor) -> Tensor {
        let latents = latents.to_device(self.device) / LATENT_SCALE;
        self.model.decode(&latents)
    }
}

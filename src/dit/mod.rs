//! # Diffusion Transformer
//!
//! Forward pass of the class-conditional latent diffusion transformer from
//! "Scalable Diffusion Models with Transformers". Parameter paths follow the
//! released checkpoints so they can be loaded as-is.
use serde::{Deserialize, Serialize};
use tch::{nn::{self, Module}, Tensor};

use self::{
    block::{DiTBlock, FinalLayer},
    embeddings::{sincos_pos_embed_2d, LabelEmbedder, PatchEmbed, TimestepEmbedder},
};

pub mod block;
pub mod embeddings;
pub mod types;

pub use types::{Denoiser, GUIDED_CHANNELS};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DiTConfig {
    /// Spatial size of the latent input.
    pub input_size: i64,
    pub patch_size: i64,
    pub in_channels: i64,
    pub hidden_size: i64,
    pub depth: i64,
    pub num_heads: i64,
    pub mlp_ratio: f64,
    pub num_classes: i64,
    pub learn_sigma: bool,
}

impl DiTConfig {
    pub fn out_channels(&self) -> i64 {
        if self.learn_sigma { self.in_channels * 2 } else { self.in_channels }
    }

    pub fn grid_size(&self) -> i64 {
        self.input_size / self.patch_size
    }

    pub fn num_patches(&self) -> i64 {
        self.grid_size() * self.grid_size()
    }
}

#[derive(Debug)]
pub struct DiT {
    x_embedder: PatchEmbed,
    t_embedder: TimestepEmbedder,
    y_embedder: LabelEmbedder,
    pos_embed: Tensor,
    blocks: Vec<DiTBlock>,
    final_layer: FinalLayer,
    pub config: DiTConfig,
}

impl DiT {
    pub fn new(vs: nn::Path, config: DiTConfig) -> Self {
        let x_embedder =
            PatchEmbed::new(&vs / "x_embedder", config.in_channels, config.hidden_size, config.patch_size);
        let t_embedder = TimestepEmbedder::new(&vs / "t_embedder", config.hidden_size);
        let y_embedder = LabelEmbedder::new(&vs / "y_embedder", config.num_classes, config.hidden_size);
        // Not trained, but stored in the checkpoints alongside the weights.
        let table = sincos_pos_embed_2d(config.hidden_size, config.grid_size());
        let table = Tensor::from_slice(&table).view([1, config.num_patches(), config.hidden_size]);
        let pos_embed = vs.var_copy("pos_embed", &table.to_device(vs.device()));
        let vs_blocks = &vs / "blocks";
        let blocks = (0..config.depth)
            .map(|i| DiTBlock::new(&vs_blocks / i, config.hidden_size, config.num_heads, config.mlp_ratio))
            .collect();
        let final_layer =
            FinalLayer::new(&vs / "final_layer", config.hidden_size, config.patch_size, config.out_channels());
        Self { x_embedder, t_embedder, y_embedder, pos_embed, blocks, final_layer, config }
    }

    /// `(N, T, p * p * C)` -> `(N, C, H, W)`
    fn unpatchify(&self, xs: &Tensor) -> Tensor {
        let c = self.config.out_channels();
        let p = self.config.patch_size;
        let h = self.config.grid_size();
        let n = xs.size()[0];
        xs.reshape([n, h, h, p, p, c])
            .permute([0, 5, 1, 3, 2, 4])
            .reshape([n, c, h * p, h * p])
    }
}

impl Denoiser for DiT {
    fn forward(&self, xs: &Tensor, timesteps: &Tensor, labels: &Tensor) -> Tensor {
        let mut xs = xs.apply(&self.x_embedder) + &self.pos_embed;
        let t = self.t_embedder.forward(timesteps);
        let y = self.y_embedder.forward(labels);
        let c = (t + y).to_kind(xs.kind());
        for block in self.blocks.iter() {
            xs = block.forward(&xs, &c);
        }
        let xs = self.final_layer.forward(&xs, &c);
        self.unpatchify(&xs)
    }

    fn learn_sigma(&self) -> bool {
        self.config.learn_sigma
    }
}

/// Parameter count, handy when logging what was loaded.
pub fn num_parameters(vs: &nn::VarStore) -> usize {
    vs.variables().values().map(|t| t.numel()).sum()
}

#[cfg(test)]
mod tests {
    use tch::{nn, Device, Kind, Tensor};

    use super::{DiT, DiTConfig, Denoiser};

    fn tiny_config() -> DiTConfig {
        DiTConfig {
            input_size: 8,
            patch_size: 2,
            in_channels: 4,
            hidden_size: 32,
            depth: 2,
            num_heads: 4,
            mlp_ratio: 4.0,
            num_classes: 10,
            learn_sigma: true,
        }
    }

    #[test]
    fn test_forward_shape() {
        let vs = nn::VarStore::new(Device::Cpu);
        let model = DiT::new(vs.root(), tiny_config());
        let xs = Tensor::randn([4, 4, 8, 8], (Kind::Float, Device::Cpu));
        let t = Tensor::from_slice(&[999i64, 999, 999, 999]);
        let y = Tensor::from_slice(&[1i64, 2, 10, 10]);
        let out = model.forward(&xs, &t, &y);
        assert_eq!(out.size(), vec![4, 8, 8, 8]);
        let out = model.forward_with_cfg(&xs, &t, &y, 4.0);
        assert_eq!(out.size(), vec![4, 8, 8, 8]);
    }

    #[test]
    fn test_checkpoint_paths() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _model = DiT::new(vs.root(), tiny_config());
        let variables = vs.variables();
        for name in [
            "pos_embed",
            "x_embedder.proj.weight",
            "t_embedder.mlp.0.weight",
            "t_embedder.mlp.2.bias",
            "y_embedder.embedding_table.weight",
            "blocks.1.attn.qkv.weight",
            "blocks.0.mlp.fc2.bias",
            "blocks.0.adaLN_modulation.1.weight",
            "final_layer.linear.weight",
            "final_layer.adaLN_modulation.1.bias",
        ] {
            assert!(variables.contains_key(name), "missing {name}");
        }
        assert_eq!(variables["y_embedder.embedding_table.weight"].size(), vec![11, 32]);
    }
}

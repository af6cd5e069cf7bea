use tch::{nn::{self, Module}, Kind, Tensor};

/// Splits a latent image into non-overlapping `patch_size` squares and
/// projects each of them to the hidden size.
#[derive(Debug)]
pub struct PatchEmbed {
    proj: nn::Conv2D,
}

impl PatchEmbed {
    pub fn new(vs: nn::Path, in_channels: i64, hidden_size: i64, patch_size: i64) -> Self {
        let conv_cfg = nn::ConvConfig { stride: patch_size, ..Default::default() };
        let proj = nn::conv2d(&vs / "proj", in_channels, hidden_size, patch_size, conv_cfg);
        Self { proj }
    }
}

impl Module for PatchEmbed {
    fn forward(&self, xs: &Tensor) -> Tensor {
        // (N, D, H/p, W/p) -> (N, T, D)
        xs.apply(&self.proj).flatten(2, -1).transpose(1, 2)
    }
}

#[derive(Debug)]
pub struct TimestepEmbedder {
    linear_1: nn::Linear,
    linear_2: nn::Linear,
    frequency_embedding_size: i64,
}

impl TimestepEmbedder {
    pub fn new(vs: nn::Path, hidden_size: i64) -> Self {
        let frequency_embedding_size = 256;
        let mlp = &vs / "mlp";
        let linear_1 = nn::linear(&mlp / 0, frequency_embedding_size, hidden_size, Default::default());
        let linear_2 = nn::linear(&mlp / 2, hidden_size, hidden_size, Default::default());
        Self { linear_1, linear_2, frequency_embedding_size }
    }

    /// Sinusoidal embedding of (possibly fractional) timesteps, cosines first.
    pub fn timestep_embedding(t: &Tensor, dim: i64, max_period: f64) -> Tensor {
        let half = dim / 2;
        let freqs = (Tensor::arange(half, (Kind::Float, t.device())) * (-max_period.ln() / half as f64)).exp();
        let args = t.to_kind(Kind::Float).unsqueeze(-1) * freqs.unsqueeze(0);
        let embedding = Tensor::cat(&[args.cos(), args.sin()], -1);
        if dim % 2 == 1 {
            let pad = embedding.zeros_like().narrow(-1, 0, 1);
            Tensor::cat(&[embedding, pad], -1)
        } else {
            embedding
        }
    }
}

impl Module for TimestepEmbedder {
    fn forward(&self, t: &Tensor) -> Tensor {
        let freq = Self::timestep_embedding(t, self.frequency_embedding_size, 10000.);
        freq.apply(&self.linear_1).silu().apply(&self.linear_2)
    }
}

/// Class label embedding with one extra row for the null class.
#[derive(Debug)]
pub struct LabelEmbedder {
    embedding_table: nn::Embedding,
}

impl LabelEmbedder {
    pub fn new(vs: nn::Path, num_classes: i64, hidden_size: i64) -> Self {
        let embedding_table =
            nn::embedding(&vs / "embedding_table", num_classes + 1, hidden_size, Default::default());
        Self { embedding_table }
    }
}

impl Module for LabelEmbedder {
    fn forward(&self, labels: &Tensor) -> Tensor {
        labels.to_kind(Kind::Int64).apply(&self.embedding_table)
    }
}

/// Fixed 2D sin-cos position table of shape `(grid_size * grid_size, embed_dim)`.
pub fn sincos_pos_embed_2d(embed_dim: i64, grid_size: i64) -> Vec<f32> {
    let half = embed_dim / 2;
    let quarter = half / 2;
    let omega: Vec<f64> = (0..quarter)
        .map(|i| 1. / 10000f64.powf(i as f64 / quarter as f64))
        .collect();
    let mut table = Vec::with_capacity((grid_size * grid_size * embed_dim) as usize);
    for row in 0..grid_size {
        for col in 0..grid_size {
            // first half follows the column, second half the row
            for pos in [col, row] {
                let angles = omega.iter().map(|w| pos as f64 * w);
                table.extend(angles.clone().map(|a| a.sin() as f32));
                table.extend(angles.map(|a| a.cos() as f32));
            }
        }
    }
    table
}

#[cfg(test)]
mod tests {
    use tch::{Device, Kind, Tensor};

    use super::{sincos_pos_embed_2d, TimestepEmbedder};

    #[test]
    fn test_timestep_embedding_at_zero() {
        let t = Tensor::zeros([3], (Kind::Int64, Device::Cpu));
        let emb = TimestepEmbedder::timestep_embedding(&t, 8, 10000.);
        assert_eq!(emb.size(), vec![3, 8]);
        // cos(0) = 1 for the first half, sin(0) = 0 for the second
        assert_eq!(emb.narrow(1, 0, 4).sum(Kind::Float).double_value(&[]), 12.);
        assert_eq!(emb.narrow(1, 4, 4).abs().sum(Kind::Float).double_value(&[]), 0.);
    }

    #[test]
    fn test_pos_embed_layout() {
        let table = sincos_pos_embed_2d(8, 2);
        assert_eq!(table.len(), 4 * 8);
        // position (row 0, col 1): column half has sin(1) first
        let second = &table[8..16];
        assert!((second[0] - 1f32.sin()).abs() < 1e-6);
        // row half for row 0 is sin(0) = 0, cos(0) = 1
        assert_eq!(second[4], 0.);
        assert_eq!(second[6], 1.);
    }
}

use tch::{nn::{self, Module}, Tensor};

fn layer_norm(vs: nn::Path, hidden_size: i64) -> nn::LayerNorm {
    let cfg = nn::LayerNormConfig { elementwise_affine: false, eps: 1e-6, ..Default::default() };
    nn::layer_norm(vs, vec![hidden_size], cfg)
}

fn modulate(xs: &Tensor, shift: &Tensor, scale: &Tensor) -> Tensor {
    xs * (scale.unsqueeze(1) + 1.) + shift.unsqueeze(1)
}

#[derive(Debug)]
struct Attention {
    qkv: nn::Linear,
    proj: nn::Linear,
    num_heads: i64,
    scale: f64,
}

impl Attention {
    fn new(vs: nn::Path, dim: i64, num_heads: i64) -> Self {
        let qkv = nn::linear(&vs / "qkv", dim, dim * 3, Default::default());
        let proj = nn::linear(&vs / "proj", dim, dim, Default::default());
        let head_dim = dim / num_heads;
        Self { qkv, proj, num_heads, scale: (head_dim as f64).powf(-0.5) }
    }
}

impl Module for Attention {
    fn forward(&self, xs: &Tensor) -> Tensor {
        let size = xs.size();
        let (b, n, c) = (size[0], size[1], size[2]);
        let qkv = xs
            .apply(&self.qkv)
            .reshape([b, n, 3, self.num_heads, c / self.num_heads])
            .permute([2, 0, 3, 1, 4]);
        let (q, k, v) = (qkv.get(0), qkv.get(1), qkv.get(2));
        let attn = (q.matmul(&k.transpose(-2, -1)) * self.scale).softmax(-1, q.kind());
        attn.matmul(&v).transpose(1, 2).reshape([b, n, c]).apply(&self.proj)
    }
}

#[derive(Debug)]
struct Mlp {
    fc1: nn::Linear,
    fc2: nn::Linear,
}

impl Mlp {
    fn new(vs: nn::Path, dim: i64, hidden_dim: i64) -> Self {
        let fc1 = nn::linear(&vs / "fc1", dim, hidden_dim, Default::default());
        let fc2 = nn::linear(&vs / "fc2", hidden_dim, dim, Default::default());
        Self { fc1, fc2 }
    }
}

impl Module for Mlp {
    fn forward(&self, xs: &Tensor) -> Tensor {
        xs.apply(&self.fc1).gelu("tanh").apply(&self.fc2)
    }
}

/// Transformer block with adaptive layer norm zero conditioning.
#[derive(Debug)]
pub struct DiTBlock {
    norm1: nn::LayerNorm,
    attn: Attention,
    norm2: nn::LayerNorm,
    mlp: Mlp,
    ada_ln_modulation: nn::Linear,
}

impl DiTBlock {
    pub fn new(vs: nn::Path, hidden_size: i64, num_heads: i64, mlp_ratio: f64) -> Self {
        let norm1 = layer_norm(&vs / "norm1", hidden_size);
        let attn = Attention::new(&vs / "attn", hidden_size, num_heads);
        let norm2 = layer_norm(&vs / "norm2", hidden_size);
        let mlp_hidden_dim = (hidden_size as f64 * mlp_ratio) as i64;
        let mlp = Mlp::new(&vs / "mlp", hidden_size, mlp_hidden_dim);
        let ada_ln_modulation =
            nn::linear(&vs / "adaLN_modulation" / 1, hidden_size, 6 * hidden_size, Default::default());
        Self { norm1, attn, norm2, mlp, ada_ln_modulation }
    }

    pub fn forward(&self, xs: &Tensor, c: &Tensor) -> Tensor {
        let m = c.silu().apply(&self.ada_ln_modulation).chunk(6, 1);
        let (shift_msa, scale_msa, gate_msa) = (&m[0], &m[1], &m[2]);
        let (shift_mlp, scale_mlp, gate_mlp) = (&m[3], &m[4], &m[5]);
        let h = modulate(&xs.apply(&self.norm1), shift_msa, scale_msa).apply(&self.attn);
        let xs = xs + gate_msa.unsqueeze(1) * h;
        let h = modulate(&xs.apply(&self.norm2), shift_mlp, scale_mlp).apply(&self.mlp);
        &xs + gate_mlp.unsqueeze(1) * h
    }
}

#[derive(Debug)]
pub struct FinalLayer {
    norm_final: nn::LayerNorm,
    linear: nn::Linear,
    ada_ln_modulation: nn::Linear,
}

impl FinalLayer {
    pub fn new(vs: nn::Path, hidden_size: i64, patch_size: i64, out_channels: i64) -> Self {
        let norm_final = layer_norm(&vs / "norm_final", hidden_size);
        let linear = nn::linear(
            &vs / "linear",
            hidden_size,
            patch_size * patch_size * out_channels,
            Default::default(),
        );
        let ada_ln_modulation =
            nn::linear(&vs / "adaLN_modulation" / 1, hidden_size, 2 * hidden_size, Default::default());
        Self { norm_final, linear, ada_ln_modulation }
    }

    pub fn forward(&self, xs: &Tensor, c: &Tensor) -> Tensor {
        let m = c.silu().apply(&self.ada_ln_modulation).chunk(2, 1);
        modulate(&xs.apply(&self.norm_final), &m[0], &m[1]).apply(&self.linear)
    }
}

use std::{fmt, str::FromStr};

use serde::{Deserialize, Serialize};

use crate::{dit::DiTConfig, error::SampleError};

/// The DiT variants released with the paper, named `DiT-{size}/{patch}`.
#[allow(non_camel_case_types)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum ModelKind {
    DiT_XL_2,
    DiT_XL_4,
    DiT_XL_8,
    DiT_L_2,
    DiT_L_4,
    DiT_L_8,
    DiT_B_2,
    DiT_B_4,
    DiT_B_8,
    DiT_S_2,
    DiT_S_4,
    DiT_S_8,
}

impl ModelKind {
    pub const ALL: [ModelKind; 12] = [
        ModelKind::DiT_XL_2,
        ModelKind::DiT_XL_4,
        ModelKind::DiT_XL_8,
        ModelKind::DiT_L_2,
        ModelKind::DiT_L_4,
        ModelKind::DiT_L_8,
        ModelKind::DiT_B_2,
        ModelKind::DiT_B_4,
        ModelKind::DiT_B_8,
        ModelKind::DiT_S_2,
        ModelKind::DiT_S_4,
        ModelKind::DiT_S_8,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            ModelKind::DiT_XL_2 => "DiT-XL/2",
            ModelKind::DiT_XL_4 => "DiT-XL/4",
            ModelKind::DiT_XL_8 => "DiT-XL/8",
            ModelKind::DiT_L_2 => "DiT-L/2",
            ModelKind::DiT_L_4 => "DiT-L/4",
            ModelKind::DiT_L_8 => "DiT-L/8",
            ModelKind::DiT_B_2 => "DiT-B/2",
            ModelKind::DiT_B_4 => "DiT-B/4",
            ModelKind::DiT_B_8 => "DiT-B/8",
            ModelKind::DiT_S_2 => "DiT-S/2",
            ModelKind::DiT_S_4 => "DiT-S/4",
            ModelKind::DiT_S_8 => "DiT-S/8",
        }
    }

    pub fn patch_size(&self) -> i64 {
        match self {
            ModelKind::DiT_XL_2 | ModelKind::DiT_L_2 | ModelKind::DiT_B_2 | ModelKind::DiT_S_2 => 2,
            ModelKind::DiT_XL_4 | ModelKind::DiT_L_4 | ModelKind::DiT_B_4 | ModelKind::DiT_S_4 => 4,
            ModelKind::DiT_XL_8 | ModelKind::DiT_L_8 | ModelKind::DiT_B_8 | ModelKind::DiT_S_8 => 8,
        }
    }

    /// (depth, hidden size, attention heads)
    fn dims(&self) -> (i64, i64, i64) {
        match self {
            ModelKind::DiT_XL_2 | ModelKind::DiT_XL_4 | ModelKind::DiT_XL_8 => (28, 1152, 16),
            ModelKind::DiT_L_2 | ModelKind::DiT_L_4 | ModelKind::DiT_L_8 => (24, 1024, 16),
            ModelKind::DiT_B_2 | ModelKind::DiT_B_4 | ModelKind::DiT_B_8 => (12, 768, 12),
            ModelKind::DiT_S_2 | ModelKind::DiT_S_4 | ModelKind::DiT_S_8 => (12, 384, 6),
        }
    }

    /// Only DiT-XL/2 has public pretrained checkpoints.
    pub fn has_pretrained_weights(&self) -> bool {
        matches!(self, ModelKind::DiT_XL_2)
    }

    pub fn dit_config(&self, input_size: i64, num_classes: i64) -> DiTConfig {
        let (depth, hidden_size, num_heads) = self.dims();
        DiTConfig {
            input_size,
            patch_size: self.patch_size(),
            in_channels: 4,
            hidden_size,
            depth,
            num_heads,
            mlp_ratio: 4.0,
            num_classes,
            learn_sigma: true,
        }
    }
}

impl fmt::Display for ModelKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ModelKind {
    type Err = SampleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ModelKind::ALL
            .into_iter()
            .find(|kind| kind.name() == s)
            .ok_or_else(|| SampleError::UnknownModel(s.to_string()))
    }
}

impl TryFrom<String> for ModelKind {
    type Error = SampleError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<ModelKind> for String {
    fn from(kind: ModelKind) -> Self {
        kind.name().to_string()
    }
}

/// Fine-tuned Stable Diffusion VAE decoders usable with DiT latents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum VaeKind {
    Ema,
    Mse,
}

impl VaeKind {
    pub fn hub_repo(&self) -> String {
        format!("stabilityai/sd-vae-ft-{self}")
    }
}

impl fmt::Display for VaeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            VaeKind::Ema => f.write_str("ema"),
            VaeKind::Mse => f.write_str("mse"),
        }
    }
}

impl FromStr for VaeKind {
    type Err = SampleError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "ema" => Ok(VaeKind::Ema),
            "mse" => Ok(VaeKind::Mse),
            _ => Err(SampleError::UnknownVae(s.to_string())),
        }
    }
}

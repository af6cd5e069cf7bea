//! Locating, downloading and reading DiT checkpoints.
use std::{
    collections::HashMap,
    fs,
    path::{Path, PathBuf},
};

use anyhow::Context;
use safetensors::{Dtype, SafeTensors};
use tch::{nn::VarStore, Kind, Tensor};
use tracing::{debug, info};

use crate::error::SampleError;

const DOWNLOAD_URL: &str = "https://dl.fbaipublicfiles.com/DiT/models";
pub const PRETRAINED_DIR: &str = "pretrained_models";
pub const PRETRAINED_MODELS: [&str; 2] = ["DiT-XL-2-256x256.pt", "DiT-XL-2-512x512.pt"];

/// File name of the released DiT-XL/2 checkpoint for `image_size`.
pub fn pretrained_checkpoint_name(image_size: i64) -> String {
    format!("DiT-XL-2-{image_size}x{image_size}.pt")
}

/// Resolves `name_or_path` to a local file, downloading it to
/// `pretrained_models/` when it names a released checkpoint.
pub fn find_model(name_or_path: &str) -> anyhow::Result<PathBuf> {
    if PRETRAINED_MODELS.contains(&name_or_path) {
        return download_model(name_or_path, Path::new(PRETRAINED_DIR));
    }
    let path = PathBuf::from(name_or_path);
    if !path.is_file() {
        anyhow::bail!("could not find DiT checkpoint at {}", path.display());
    }
    Ok(path)
}

/// Downloads a released checkpoint unless it is already present in `dir`.
pub fn download_model(name: &str, dir: &Path) -> anyhow::Result<PathBuf> {
    let local_path = dir.join(name);
    if local_path.is_file() {
        debug!(path = %local_path.display(), "using cached checkpoint");
        return Ok(local_path);
    }
    fs::create_dir_all(dir).with_context(|| format!("error creating {}", dir.display()))?;
    let url = format!("{DOWNLOAD_URL}/{name}");
    info!(%url, "downloading pretrained checkpoint");
    let response = ureq::get(&url)
        .call()
        .map_err(|e| SampleError::Download { url: url.clone(), reason: e.to_string() })?;
    let partial = local_path.with_extension("part");
    let mut file = fs::File::create(&partial).with_context(|| format!("error creating {}", partial.display()))?;
    std::io::copy(&mut response.into_reader(), &mut file)
        .map_err(|e| SampleError::Download { url, reason: e.to_string() })?;
    fs::rename(&partial, &local_path)?;
    Ok(local_path)
}

fn safetensors_kind(dtype: Dtype) -> anyhow::Result<Kind> {
    let kind = match dtype {
        Dtype::F16 => Kind::Half,
        Dtype::BF16 => Kind::BFloat16,
        Dtype::F32 => Kind::Float,
        Dtype::F64 => Kind::Double,
        Dtype::I64 => Kind::Int64,
        other => anyhow::bail!("unsupported safetensors dtype {other:?}"),
    };
    Ok(kind)
}

fn read_safetensors(path: &Path) -> anyhow::Result<Vec<(String, Tensor)>> {
    let data = fs::read(path).with_context(|| format!("error opening {:?}", path.to_string_lossy()))?;
    let safetensors = SafeTensors::deserialize(&data)?;
    safetensors
        .tensors()
        .into_iter()
        .map(|(name, view)| {
            let shape: Vec<i64> = view.shape().iter().map(|&d| d as i64).collect();
            let tensor = Tensor::f_from_data_size(view.data(), &shape, safetensors_kind(view.dtype())?)?;
            Ok((name, tensor))
        })
        .collect()
}

/// Reads a `torch.save` pickle. Training checkpoints hold several state
/// dicts, the EMA weights are the ones to sample with.
fn read_pickle(path: &Path) -> anyhow::Result<Vec<(String, Tensor)>> {
    let tensors = match candle_core::pickle::read_all_with_key(path, Some("ema")) {
        Ok(tensors) => tensors,
        Err(_) => candle_core::pickle::read_all(path)?,
    };
    tensors
        .into_iter()
        .map(|(name, tensor)| {
            let dims: Vec<i64> = tensor.dims().iter().map(|&d| d as i64).collect();
            let values = tensor.to_dtype(candle_core::DType::F32)?.flatten_all()?.to_vec1::<f32>()?;
            Ok((name, Tensor::from_slice(&values).reshape(dims)))
        })
        .collect()
}

/// Reads every named tensor of a checkpoint, picking the format from the
/// file extension.
pub fn read_checkpoint(path: &Path) -> anyhow::Result<Vec<(String, Tensor)>> {
    let extension = path.extension().and_then(|e| e.to_str()).unwrap_or_default();
    let tensors = match extension {
        "safetensors" => read_safetensors(path)?,
        "pt" | "pth" | "bin" => read_pickle(path)?,
        _ => Tensor::load_multi(path)?,
    };
    info!(path = %path.display(), tensors = tensors.len(), "read checkpoint");
    Ok(tensors)
}

/// Copies checkpoint tensors into the variables of `vs`. Every variable must
/// be present with the same shape; unused checkpoint entries are ignored.
pub fn load_state_dict(vs: &VarStore, tensors: Vec<(String, Tensor)>) -> anyhow::Result<()> {
    let mut tensors: HashMap<String, Tensor> = tensors.into_iter().collect();
    let mut variables: Vec<(String, Tensor)> = vs.variables().into_iter().collect();
    variables.sort_by(|a, b| a.0.cmp(&b.0));
    for (name, mut var) in variables {
        let src = tensors
            .remove(&name)
            .ok_or_else(|| SampleError::MissingCheckpointTensor(name.clone()))?;
        if src.size() != var.size() {
            return Err(SampleError::CheckpointShapeMismatch { name, expected: var.size(), found: src.size() }.into());
        }
        tch::no_grad(|| var.f_copy_(&src.to_kind(var.kind()).to_device(var.device())))?;
    }
    if !tensors.is_empty() {
        let mut unused: Vec<&String> = tensors.keys().collect();
        unused.sort();
        debug!(?unused, "checkpoint entries without a matching parameter");
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tch::{nn, Device, Kind, Tensor};

    use super::{find_model, load_state_dict, pretrained_checkpoint_name, read_checkpoint, PRETRAINED_MODELS};
    use crate::error::SampleError;

    fn scratch_dir(name: &str) -> std::path::PathBuf {
        let dir = std::env::temp_dir().join(format!("dit-sample-{name}-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_pretrained_names() {
        assert!(PRETRAINED_MODELS.contains(&pretrained_checkpoint_name(256).as_str()));
        assert!(PRETRAINED_MODELS.contains(&pretrained_checkpoint_name(512).as_str()));
        assert!(!PRETRAINED_MODELS.contains(&pretrained_checkpoint_name(128).as_str()));
    }

    #[test]
    fn test_missing_local_checkpoint() {
        assert!(find_model("does/not/exist.pt").is_err());
    }

    #[test]
    fn test_load_state_dict_from_ot() {
        let dir = scratch_dir("ot");
        let path = dir.join("weights.ot");
        let weight = Tensor::ones([3, 2], (Kind::Float, Device::Cpu));
        let bias = Tensor::zeros([3], (Kind::Float, Device::Cpu));
        Tensor::save_multi(&[("lin.weight", &weight), ("lin.bias", &bias), ("extra", &bias)], &path).unwrap();

        let vs = nn::VarStore::new(Device::Cpu);
        let _lin = nn::linear(vs.root() / "lin", 2, 3, Default::default());
        load_state_dict(&vs, read_checkpoint(Path::new(&path)).unwrap()).unwrap();
        let loaded = &vs.variables()["lin.weight"];
        assert_eq!(loaded.sum(Kind::Float).double_value(&[]), 6.);
        std::fs::remove_dir_all(dir).unwrap();
    }

    #[test]
    fn test_load_state_dict_reports_problems() {
        let vs = nn::VarStore::new(Device::Cpu);
        let _lin = nn::linear(vs.root() / "lin", 2, 3, Default::default());
        let weight = Tensor::ones([3, 2], (Kind::Float, Device::Cpu));
        let err = load_state_dict(&vs, vec![("lin.weight".to_string(), weight)]).unwrap_err();
        assert!(matches!(err.downcast_ref::<SampleError>(), Some(SampleError::MissingCheckpointTensor(_))));

        let weight = Tensor::ones([2, 2], (Kind::Float, Device::Cpu));
        let bias = Tensor::zeros([3], (Kind::Float, Device::Cpu));
        let err = load_state_dict(&vs, vec![("lin.weight".to_string(), weight), ("lin.bias".to_string(), bias)])
            .unwrap_err();
        assert!(matches!(err.downcast_ref::<SampleError>(), Some(SampleError::CheckpointShapeMismatch { .. })));
    }
}

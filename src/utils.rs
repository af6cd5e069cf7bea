use std::path::{Path, PathBuf};

use tch::{Device, Kind, Tensor};

pub fn get_device(cpu: bool) -> Device {
    if cpu {
        return Device::Cpu;
    }
    if tch::Cuda::is_available() {
        Device::Cuda(0)
    } else if tch::utils::has_mps() {
        Device::Mps
    } else {
        Device::Cpu
    }
}

/// `{save_dir}/{sample_idx}_{label_idx}.png`
pub fn image_filename(save_dir: &Path, sample_idx: usize, label_idx: usize) -> PathBuf {
    save_dir.join(format!("{sample_idx}_{label_idx}.png"))
}

/// `{save_dir}/{sample_idx}_latents.pt`
pub fn latents_filename(save_dir: &Path, sample_idx: usize) -> PathBuf {
    save_dir.join(format!("{sample_idx}_latents.pt"))
}

/// Maps an image in `[-1, 1]` to `u8` pixels on the CPU, clamping values
/// outside the range.
pub fn to_u8_image(image: &Tensor) -> Tensor {
    let image = (image.to_kind(Kind::Float).clamp(-1., 1.) + 1.) / 2.;
    (image * 255.).round().to_device(Device::Cpu).to_kind(Kind::Uint8)
}

/// Writes a `(3, H, W)` image in `[-1, 1]`; the format follows the extension.
pub fn save_image<P: AsRef<Path>>(image: &Tensor, path: P) -> anyhow::Result<()> {
    tch::vision::image::save(&to_u8_image(image), path)?;
    Ok(())
}

pub fn has_nan(xs: &Tensor) -> bool {
    xs.isnan().any().int64_value(&[]) != 0
}

pub fn count_nan(xs: &Tensor) -> i64 {
    xs.isnan().sum(Kind::Int64).int64_value(&[])
}

#[cfg(test)]
mod tests {
    use std::path::Path;

    use tch::{Device, Kind, Tensor};

    use super::{count_nan, has_nan, image_filename, latents_filename, to_u8_image};

    #[test]
    fn test_filenames() {
        let dir = Path::new("out");
        assert_eq!(image_filename(dir, 3, 12), Path::new("out/3_12.png"));
        assert_eq!(latents_filename(dir, 0), Path::new("out/0_latents.pt"));
    }

    #[test]
    fn test_u8_image_range() {
        let image = Tensor::from_slice(&[-2f32, -1., 0., 1., 3.]).view([1, 1, 5]);
        let pixels: Vec<u8> = Vec::<u8>::try_from(&to_u8_image(&image).view([5])).unwrap();
        assert_eq!(pixels, vec![0, 0, 128, 255, 255]);
    }

    #[test]
    fn test_nan_helpers() {
        let xs = Tensor::from_slice(&[1f32, f32::NAN, 2., f32::NAN]);
        assert!(has_nan(&xs));
        assert_eq!(count_nan(&xs), 2);
        assert!(!has_nan(&Tensor::zeros([3], (Kind::Float, Device::Cpu))));
    }
}

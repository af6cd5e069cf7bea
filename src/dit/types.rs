use tch::Tensor;

/// Number of output channels that classifier-free guidance is applied to.
/// The released DiT samples were produced guiding only the first three
/// latent channels, the remaining ones are passed through unchanged.
pub const GUIDED_CHANNELS: i64 = 3;

/// A class-conditional noise predictor.
///
/// `forward` takes a latent batch `(N, C, H, W)`, the diffusion timesteps
/// `(N,)` on the training scale and class labels `(N,)`, and returns
/// `(N, C_out, H, W)` where `C_out` is `2 * C` when the model also predicts
/// its variance.
pub trait Denoiser {
    fn forward(&self, xs: &Tensor, timesteps: &Tensor, labels: &Tensor) -> Tensor;

    fn learn_sigma(&self) -> bool;

    /// Runs the model on a batch whose second half holds the unconditional
    /// copies of the first half and mixes the two predictions.
    fn forward_with_cfg(
        &self,
        xs: &Tensor,
        timesteps: &Tensor,
        labels: &Tensor,
        cfg_scale: f64,
    ) -> Tensor {
        let half = xs.size()[0] / 2;
        let half_xs = xs.narrow(0, 0, half);
        let combined = Tensor::cat(&[&half_xs, &half_xs], 0);
        let model_out = self.forward(&combined, timesteps, labels);
        let channels = model_out.size()[1];
        let guided = GUIDED_CHANNELS.min(channels);
        let eps = model_out.narrow(1, 0, guided);
        let rest = model_out.narrow(1, guided, channels - guided);
        let cond_eps = eps.narrow(0, 0, half);
        let uncond_eps = eps.narrow(0, half, half);
        let half_eps = &uncond_eps + (&cond_eps - &uncond_eps) * cfg_scale;
        let eps = Tensor::cat(&[&half_eps, &half_eps], 0);
        Tensor::cat(&[eps, rest], 1)
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use tch::{Device, Kind, Tensor};

    use super::Denoiser;

    /// Predicts `label / 1000` everywhere, which makes conditional and
    /// unconditional outputs easy to tell apart.
    pub(crate) struct LabelEcho {
        pub channels: i64,
    }

    impl Denoiser for LabelEcho {
        fn forward(&self, xs: &Tensor, _timesteps: &Tensor, labels: &Tensor) -> Tensor {
            let size = xs.size();
            let labels = labels.to_kind(Kind::Float).view([size[0], 1, 1, 1]) / 1000.;
            Tensor::ones([size[0], self.channels, size[2], size[3]], (Kind::Float, Device::Cpu))
                * labels
        }

        fn learn_sigma(&self) -> bool {
            self.channels == 8
        }
    }

    #[test]
    fn test_cfg_scale_one_is_conditional() {
        let model = LabelEcho { channels: 8 };
        let xs = Tensor::zeros([4, 4, 2, 2], (Kind::Float, Device::Cpu));
        let t = Tensor::zeros([4], (Kind::Int64, Device::Cpu));
        let labels = Tensor::from_slice(&[207i64, 360, 1000, 1000]);
        let out = model.forward_with_cfg(&xs, &t, &labels, 1.0);
        assert_eq!(out.size(), vec![4, 8, 2, 2]);
        let first = out.double_value(&[0, 0, 0, 0]);
        assert!((first - 0.207).abs() < 1e-6);
        // guided channels are mirrored onto the unconditional half
        let mirrored = out.double_value(&[2, 0, 0, 0]);
        assert!((mirrored - 0.207).abs() < 1e-6);
        // variance channels pass through
        let rest = out.double_value(&[2, 5, 0, 0]);
        assert!((rest - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cfg_scale_extrapolates() {
        let model = LabelEcho { channels: 8 };
        let xs = Tensor::zeros([2, 4, 1, 1], (Kind::Float, Device::Cpu));
        let t = Tensor::zeros([2], (Kind::Int64, Device::Cpu));
        let labels = Tensor::from_slice(&[500i64, 1000]);
        let out = model.forward_with_cfg(&xs, &t, &labels, 4.0);
        // 1.0 + 4 * (0.5 - 1.0)
        let v = out.double_value(&[0, 1, 0, 0]);
        assert!((v + 1.0).abs() < 1e-6);
    }
}

use std::collections::BTreeSet;

use crate::error::SampleError;

/// Picks which training timesteps to keep when sampling with fewer steps.
///
/// `section_counts` is either `"ddimN"`, which keeps a fixed stride giving
/// exactly `N` steps, or a comma separated list of counts: the timesteps are
/// split into that many equal sections and each section is strided evenly
/// with the requested number of steps, e.g. `"10,15,20"` over 300 timesteps
/// keeps 10 of the first 100, 15 of the next 100 and 20 of the last 100.
pub fn space_timesteps(num_timesteps: usize, section_counts: &str) -> Result<BTreeSet<usize>, SampleError> {
    let invalid = || SampleError::InvalidRespacing(section_counts.to_string());
    if let Some(desired) = section_counts.strip_prefix("ddim") {
        let desired: usize = desired.parse().map_err(|_| invalid())?;
        for stride in 1..num_timesteps {
            if (0..num_timesteps).step_by(stride).count() == desired {
                return Ok((0..num_timesteps).step_by(stride).collect());
            }
        }
        return Err(invalid());
    }

    let counts = section_counts
        .split(',')
        .map(|c| c.trim().parse::<usize>())
        .collect::<Result<Vec<_>, _>>()
        .map_err(|_| invalid())?;
    if counts.is_empty() || counts.contains(&0) {
        return Err(invalid());
    }

    let size_per = num_timesteps / counts.len();
    let extra = num_timesteps % counts.len();
    let mut start_idx = 0;
    let mut all_steps = BTreeSet::new();
    for (i, &section_count) in counts.iter().enumerate() {
        let size = size_per + usize::from(i < extra);
        if size < section_count {
            return Err(invalid());
        }
        let frac_stride = if section_count <= 1 {
            1.
        } else {
            (size - 1) as f64 / (section_count - 1) as f64
        };
        let mut cur_idx: f64 = 0.;
        for _ in 0..section_count {
            all_steps.insert(start_idx + cur_idx.round_ties_even() as usize);
            cur_idx += frac_stride;
        }
        start_idx += size;
    }
    Ok(all_steps)
}

/// Betas for the subset `use_timesteps` of a schedule, so that the respaced
/// process has the same cumulative alphas at the kept timesteps.
pub(crate) fn respace_betas(use_timesteps: &BTreeSet<usize>, base_betas: &[f64]) -> (Vec<f64>, Vec<i64>) {
    let mut last_alpha_cumprod = 1.0;
    let mut alpha_cumprod = 1.0;
    let mut betas = Vec::with_capacity(use_timesteps.len());
    let mut timestep_map = Vec::with_capacity(use_timesteps.len());
    for (i, beta) in base_betas.iter().enumerate() {
        alpha_cumprod *= 1.0 - beta;
        if use_timesteps.contains(&i) {
            betas.push(1.0 - alpha_cumprod / last_alpha_cumprod);
            last_alpha_cumprod = alpha_cumprod;
            timestep_map.push(i as i64);
        }
    }
    (betas, timestep_map)
}

#[cfg(test)]
mod tests {
    use super::{respace_betas, space_timesteps};

    #[test]
    fn test_even_spacing() {
        let steps = space_timesteps(1000, "250").unwrap();
        assert_eq!(steps.len(), 250);
        assert_eq!(steps.first(), Some(&0));
        assert_eq!(steps.last(), Some(&999));
    }

    #[test]
    fn test_sections() {
        let steps = space_timesteps(300, "10,15,20").unwrap();
        assert_eq!(steps.len(), 45);
        assert_eq!(steps.iter().filter(|s| **s < 100).count(), 10);
        assert_eq!(steps.iter().filter(|s| **s >= 200).count(), 20);
    }

    #[test]
    fn test_ddim_spacing() {
        let steps = space_timesteps(1000, "ddim50").unwrap();
        assert_eq!(steps.len(), 50);
        assert!(steps.contains(&980));
        assert!(space_timesteps(1000, "ddim999").is_err());
    }

    #[test]
    fn test_rejects_bad_counts() {
        assert!(space_timesteps(1000, "abc").is_err());
        assert!(space_timesteps(10, "20").is_err());
        assert!(space_timesteps(10, "0").is_err());
    }

    #[test]
    fn test_respacing_keeps_all_steps() {
        let betas = vec![0.1, 0.2, 0.3];
        let keep = space_timesteps(3, "3").unwrap();
        let (respaced, map) = respace_betas(&keep, &betas);
        assert_eq!(map, vec![0, 1, 2]);
        for (a, b) in respaced.iter().zip(betas.iter()) {
            assert!((a - b).abs() < 1e-12);
        }
    }
}

use tch::{Device, Tensor};

use crate::error::SampleError;

/// Labels used when neither a class list nor all classes are requested.
pub const DEFAULT_CLASS_LABELS: [i64; 8] = [207, 360, 387, 974, 88, 979, 417, 279];

/// Resolves the class labels to sample, `all_classes` taking priority over
/// an explicit list.
pub fn class_labels(classes: Option<&[i64]>, all_classes: bool, num_classes: i64) -> Vec<i64> {
    if all_classes {
        return (0..num_classes).collect();
    }
    match classes {
        Some(classes) => classes.to_vec(),
        None => DEFAULT_CLASS_LABELS.to_vec(),
    }
}

/// Per-call conditioning for classifier-free guided sampling.
///
/// The batch seen by the model is always `2n` long: the `n` requested labels
/// followed by `n` copies of the null class.
#[derive(Debug, Clone)]
pub struct Conditioning {
    labels: Vec<i64>,
    null_class: i64,
    merge_times: Option<Vec<i64>>,
    pub cfg_scale: f64,
}

impl Conditioning {
    pub fn new(
        labels: Vec<i64>,
        merge_times: Option<Vec<i64>>,
        num_classes: i64,
        cfg_scale: f64,
    ) -> Result<Self, SampleError> {
        let null_class = num_classes;
        if let Some(&label) = labels.iter().find(|l| !(0..=null_class).contains(*l)) {
            return Err(SampleError::InvalidClassLabel { label, null_class });
        }
        if let Some(merge_times) = &merge_times {
            if merge_times.len() != labels.len() {
                return Err(SampleError::MergeTimeCountMismatch {
                    labels: labels.len(),
                    merge_times: merge_times.len(),
                });
            }
        }
        Ok(Self { labels, null_class, merge_times, cfg_scale })
    }

    pub fn len(&self) -> usize {
        self.labels.len()
    }

    pub fn is_empty(&self) -> bool {
        self.labels.is_empty()
    }

    /// Conditional labels followed by as many null labels.
    pub fn doubled_labels(&self) -> Vec<i64> {
        let n = self.labels.len();
        self.labels.iter().copied().chain(std::iter::repeat(self.null_class).take(n)).collect()
    }

    pub fn labels_tensor(&self, device: Device) -> Tensor {
        Tensor::from_slice(&self.doubled_labels()).to_device(device)
    }

    /// Labels to condition on at training timestep `timestep`: a sample whose
    /// merge time has not been reached yet is conditioned on the null class.
    pub fn labels_at(&self, timestep: i64) -> Vec<i64> {
        let mut labels = self.doubled_labels();
        if let Some(merge_times) = &self.merge_times {
            for (label, &t_c) in labels.iter_mut().zip(merge_times.iter()) {
                if timestep >= t_c {
                    *label = self.null_class;
                }
            }
        }
        labels
    }

    pub fn labels_tensor_at(&self, timestep: i64, device: Device) -> Tensor {
        Tensor::from_slice(&self.labels_at(timestep)).to_device(device)
    }

    /// Duplicates the initial noise so both halves of the batch start equal.
    pub fn double_noise(&self, z: &Tensor) -> Tensor {
        Tensor::cat(&[z, z], 0)
    }
}

#[cfg(test)]
mod tests {
    use tch::{Device, Kind, Tensor};

    use super::{class_labels, Conditioning, DEFAULT_CLASS_LABELS};
    use crate::error::SampleError;

    #[test]
    fn test_label_sources() {
        assert_eq!(class_labels(None, false, 1000), DEFAULT_CLASS_LABELS.to_vec());
        assert_eq!(class_labels(Some(&[1, 2]), false, 1000), vec![1, 2]);
        let all = class_labels(Some(&[1, 2]), true, 1000);
        assert_eq!(all.len(), 1000);
        assert_eq!(all[999], 999);
    }

    #[test]
    fn test_doubled_batch() {
        for n in 1..6 {
            let labels: Vec<i64> = (0..n).collect();
            let cond = Conditioning::new(labels.clone(), None, 1000, 4.0).unwrap();
            let y = cond.labels_tensor(Device::Cpu);
            assert_eq!(y.size(), vec![2 * n]);
            let y: Vec<i64> = Vec::<i64>::try_from(&y).unwrap();
            assert_eq!(&y[..n as usize], &labels[..]);
            assert!(y[n as usize..].iter().all(|l| *l == 1000));
        }
    }

    #[test]
    fn test_merge_time_count_must_match() {
        let err = Conditioning::new(vec![1, 2, 3], Some(vec![100, 200]), 1000, 4.0).unwrap_err();
        assert!(matches!(err, SampleError::MergeTimeCountMismatch { labels: 3, merge_times: 2 }));
        assert!(Conditioning::new(vec![1, 2], Some(vec![100, 200]), 1000, 4.0).is_ok());
    }

    #[test]
    fn test_rejects_out_of_range_labels() {
        assert!(Conditioning::new(vec![1000], None, 1000, 4.0).is_ok());
        let err = Conditioning::new(vec![5, 1001], None, 1000, 4.0).unwrap_err();
        assert!(matches!(err, SampleError::InvalidClassLabel { label: 1001, .. }));
        assert!(Conditioning::new(vec![-1], None, 1000, 4.0).is_err());
    }

    #[test]
    fn test_labels_before_merge_time_are_null() {
        let cond = Conditioning::new(vec![7, 8], Some(vec![500, 100]), 1000, 4.0).unwrap();
        assert_eq!(cond.labels_at(999), vec![1000, 1000, 1000, 1000]);
        assert_eq!(cond.labels_at(300), vec![7, 1000, 1000, 1000]);
        assert_eq!(cond.labels_at(0), vec![7, 8, 1000, 1000]);
    }

    #[test]
    fn test_double_noise() {
        let cond = Conditioning::new(vec![1, 2], None, 1000, 4.0).unwrap();
        let z = Tensor::randn([2, 4, 2, 2], (Kind::Float, Device::Cpu));
        let zz = cond.double_noise(&z);
        assert_eq!(zz.size(), vec![4, 4, 2, 2]);
        assert!(zz.narrow(0, 2, 2).equal(&z));
    }
}

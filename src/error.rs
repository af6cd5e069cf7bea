use thiserror::Error;

/// Errors raised while validating a sampling request or loading its weights.
#[derive(Debug, Error)]
pub enum SampleError {
    #[error("only DiT-XL/2 at 256 or 512 pixels with 1000 classes can be auto-downloaded, got {model} at {image_size} with {num_classes} classes")]
    AutoDownloadUnsupported { model: String, image_size: i64, num_classes: i64 },

    #[error("got {labels} class labels but {merge_times} merge times")]
    MergeTimeCountMismatch { labels: usize, merge_times: usize },

    #[error("class label {label} is outside 0..={null_class}")]
    InvalidClassLabel { label: i64, null_class: i64 },

    #[error("unknown model {0}, expected one of DiT-{{XL,L,B,S}}/{{2,4,8}}")]
    UnknownModel(String),

    #[error("unknown vae {0}, expected ema or mse")]
    UnknownVae(String),

    #[error("image size {image_size} is not supported by {model}")]
    InvalidImageSize { model: String, image_size: i64 },

    #[error("start timestep {t_start} is outside 0..{num_timesteps}")]
    InvalidStartTimestep { t_start: i64, num_timesteps: i64 },

    #[error("the diffusion expects a learned variance but the model predicts only the noise")]
    VarianceNotPredicted,

    #[error("invalid timestep respacing {0:?}")]
    InvalidRespacing(String),

    #[error("checkpoint has no tensor named {0}")]
    MissingCheckpointTensor(String),

    #[error("checkpoint tensor {name} has shape {found:?}, expected {expected:?}")]
    CheckpointShapeMismatch { name: String, expected: Vec<i64>, found: Vec<i64> },

    #[error("failed to download {url}: {reason}")]
    Download { url: String, reason: String },
}

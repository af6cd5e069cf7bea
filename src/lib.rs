pub mod checkpoint;
pub mod conditioning;
pub mod diffusion;
pub mod dit;
pub mod dit_sample;
pub mod error;
pub mod model_kind;
pub mod utils;
pub mod vae;

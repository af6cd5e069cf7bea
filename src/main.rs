use std::path::PathBuf;

use clap::{ArgAction, Parser};
use dit_sample::{
    dit_sample::{DiTSamplerBuilder, SampleConfig},
    model_kind::{ModelKind, VaeKind},
};
use tracing::info;
use tracing_chrome::ChromeLayerBuilder;
use tracing_subscriber::{prelude::*, EnvFilter};

/// Sample new images from a pre-trained DiT.
#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Args {
    #[arg(long, default_value = "DiT-XL/2")]
    model: ModelKind,

    #[arg(long, default_value = "mse")]
    vae: VaeKind,

    #[arg(long, default_value_t = 256)]
    image_size: i64,

    #[arg(long, default_value_t = 1000)]
    num_classes: i64,

    #[arg(long, default_value_t = 4.0)]
    cfg_scale: f64,

    #[arg(long, default_value_t = 250)]
    num_sampling_steps: usize,

    #[arg(long, default_value_t = 0)]
    seed: i64,

    /// Optional path to a DiT checkpoint (default: auto-download a pre-trained DiT-XL/2 model).
    #[arg(long, value_name = "FILE")]
    ckpt: Option<PathBuf>,

    /// Training timestep to start the reverse process from.
    #[arg(long)]
    t_start: Option<i64>,

    /// Class smallest merge times, one per class label.
    #[arg(long, num_args = 1..)]
    tc: Option<Vec<i64>>,

    /// Class labels to sample.
    #[arg(long, num_args = 1..)]
    classes: Option<Vec<i64>>,

    /// Sample every class.
    #[arg(long)]
    all_classes: bool,

    /// Number of sampling rounds over the class list.
    #[arg(long, default_value_t = 1)]
    n_samples: usize,

    #[arg(long, default_value = "samples")]
    save_dir: PathBuf,

    /// Local VAE weights in .safetensors format (default: fetch from the hub).
    #[arg(long, value_name = "FILE")]
    vae_weights: Option<PathBuf>,

    /// Maximum number of latents decoded at once.
    #[arg(long, default_value_t = 5)]
    decode_batch_size: i64,

    /// Write the sampled latents next to the images.
    #[arg(long, default_value_t = true, action = ArgAction::Set)]
    save_latents: bool,

    #[arg(long)]
    no_progress: bool,

    /// Run on CPU rather than on GPU.
    #[arg(long)]
    cpu: bool,

    /// Read all sampling options from this TOML file instead.
    #[arg(long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Enable tracing (generates a trace-timestamp.json file).
    #[arg(long)]
    tracing: bool,
}

impl From<Args> for SampleConfig {
    fn from(args: Args) -> Self {
        SampleConfig {
            model: args.model,
            vae: args.vae,
            image_size: args.image_size,
            num_classes: args.num_classes,
            cfg_scale: args.cfg_scale,
            num_sampling_steps: args.num_sampling_steps,
            seed: args.seed,
            ckpt: args.ckpt,
            t_start: args.t_start,
            tc: args.tc,
            classes: args.classes,
            all_classes: args.all_classes,
            n_samples: args.n_samples,
            save_dir: args.save_dir,
            vae_weights: args.vae_weights,
            decode_batch_size: args.decode_batch_size,
            save_latents: args.save_latents,
            cpu: args.cpu,
            progress: !args.no_progress,
        }
    }
}

fn run(args: Args) -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let registry = tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr));
    let _guard = if args.tracing {
        let (chrome_layer, guard) = ChromeLayerBuilder::new().build();
        registry.with(chrome_layer).init();
        Some(guard)
    } else {
        registry.init();
        None
    };

    let config = match args.config.clone() {
        Some(path) => SampleConfig::from_file(path)?,
        None => SampleConfig::from(args),
    };
    let sampler = DiTSamplerBuilder::new(config)?.build()?;
    let written = sampler.run()?;
    info!(files = written.len(), save_dir = %sampler.config().save_dir.display(), "done");
    Ok(())
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    run(args)
}

#[cfg(test)]
mod tests {
    use clap::Parser;

    use super::{Args, SampleConfig};
    use dit_sample::model_kind::ModelKind;

    #[test]
    fn test_parse_lists() {
        let args = Args::parse_from([
            "dit-sample", "--model", "DiT-B/2", "--classes", "1", "2", "3", "--tc", "10", "20", "30",
            "--n-samples", "4", "--all-classes",
        ]);
        let cfg = SampleConfig::from(args);
        assert_eq!(cfg.model, ModelKind::DiT_B_2);
        assert_eq!(cfg.classes, Some(vec![1, 2, 3]));
        assert_eq!(cfg.tc, Some(vec![10, 20, 30]));
        assert_eq!(cfg.n_samples, 4);
        assert!(cfg.all_classes);
        assert!(cfg.save_latents);
    }

    #[test]
    fn test_defaults_match_config_defaults() {
        let cfg = SampleConfig::from(Args::parse_from(["dit-sample"]));
        let default = SampleConfig::default();
        assert_eq!(cfg.model, default.model);
        assert_eq!(cfg.vae, default.vae);
        assert_eq!(cfg.image_size, default.image_size);
        assert_eq!(cfg.num_sampling_steps, default.num_sampling_steps);
        assert_eq!(cfg.save_dir, default.save_dir);
        assert_eq!(cfg.decode_batch_size, default.decode_batch_size);
    }

    #[test]
    fn test_save_latents_flag() {
        assert!(SampleConfig::from(Args::parse_from(["dit-sample"])).save_latents);
        let args = Args::parse_from(["dit-sample", "--save-latents", "false"]);
        assert!(!SampleConfig::from(args).save_latents);
        let args = Args::parse_from(["dit-sample", "--save-latents", "true"]);
        assert!(SampleConfig::from(args).save_latents);
    }

    #[test]
    fn test_rejects_unknown_model() {
        assert!(Args::try_parse_from(["dit-sample", "--model", "DiT-H/2"]).is_err());
    }
}

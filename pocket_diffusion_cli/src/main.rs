use cliclack::input;
use std::{path::PathBuf, sync::Arc, time::Instant};

use anyhow::Context;
use clap::{Parser, Subcommand};
use image::DynamicImage;
use pocket_diffusion_backend::loader_from_config;
use pocket_diffusion_common::{AssetSource, BundledAssets, DirAssets};
use pocket_diffusion_core::{
    GenerationSettings, ModelManager, ModelManagerConfig, Pipeline, SizeTier,
};
use tracing::{debug, level_filters::LevelFilter};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Subcommand)]
pub enum Command {
    /// List the model files in a directory which could be used as a custom model.
    ListModels {
        /// Directory to scan
        #[arg(short, long)]
        dir: PathBuf,
    },

    /// Delete imported and converted models from the cache directory.
    ClearCache,
}

#[derive(Parser)]
struct Args {
    #[clap(subcommand)]
    command: Option<Command>,

    /// Bundled models: a zip archive or a directory containing `{role}_{tier}` blobs.
    #[arg(short, long)]
    assets: PathBuf,

    /// Where blobs from a zip bundle are extracted. Defaults to `<cache dir>/files`.
    #[arg(long)]
    files_dir: Option<PathBuf>,

    /// Cache directory for imported models. Defaults to the platform cache directory.
    #[arg(long)]
    cache_dir: Option<PathBuf>,

    /// JSON settings file. Command line options override its values.
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Size tier of the bundled models.
    #[arg(long, value_enum)]
    size_tier: Option<SizeTier>,

    /// Import this model file into the cache and use it as the custom model.
    #[arg(long)]
    custom_model: Option<PathBuf>,

    /// Number of denoising steps, between 5 and 50.
    #[arg(short, long)]
    num_steps: Option<usize>,

    /// Guidance scale, between 1.0 and 20.0.
    #[arg(short, long)]
    scale: Option<f64>,

    /// Output image size: 256, 384 or 512.
    #[arg(long)]
    image_size: Option<usize>,

    /// Seed. Zero or negative picks a random seed per image.
    #[arg(long, allow_negative_numbers = true)]
    seed: Option<i64>,

    /// Negative prompt used for every image.
    #[arg(long, default_value = "")]
    negative_prompt: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut settings = match &args.settings {
        Some(path) => GenerationSettings::from_file(path)?,
        None => GenerationSettings::default(),
    };
    if let Some(size_tier) = args.size_tier {
        settings.size_tier = size_tier;
    }
    if let Some(num_steps) = args.num_steps {
        settings.steps = num_steps;
    }
    if let Some(scale) = args.scale {
        settings.guidance_scale = scale;
    }
    if let Some(image_size) = args.image_size {
        settings.image_size = image_size;
    }
    if let Some(seed) = args.seed {
        settings.seed = seed;
    }

    let cache_dir = args
        .cache_dir
        .or_else(|| dirs::cache_dir().map(|dir| dir.join("pocket_diffusion")))
        .context("No cache directory available, pass `--cache-dir`.")?;
    let assets: Arc<dyn AssetSource> = if args.assets.is_dir() {
        Arc::new(DirAssets::new(&args.assets))
    } else {
        let files_dir = args.files_dir.unwrap_or_else(|| cache_dir.join("files"));
        Arc::new(BundledAssets::open(&args.assets, files_dir)?)
    };

    let mut config =
        ModelManagerConfig::new(loader_from_config(&settings.runtime), assets, &cache_dir);
    config.size_tier = settings.size_tier;
    config.custom_model_path = settings.custom_model_path.clone();
    let manager = ModelManager::new(config);

    match args.command {
        Some(Command::ListModels { dir }) => {
            for model in manager.list_available_custom_models(&dir)? {
                println!(
                    "{:<32} {:<12} {:>10.1} MiB{}",
                    model.name,
                    model.format,
                    model.size_in_mb,
                    if model.is_format_supported() {
                        ""
                    } else {
                        " (unsupported)"
                    }
                );
            }
            return Ok(());
        }
        Some(Command::ClearCache) => {
            if manager.clear_model_cache()? {
                println!("Cleared {}.", manager.models_dir().display());
            } else {
                println!("Nothing to clear.");
            }
            return Ok(());
        }
        None => {}
    }

    let outcome = match &args.custom_model {
        Some(path) => manager.load_model_from_file(path)?,
        None => manager.ensure_loaded()?,
    };
    println!("Using {outcome}.");

    let pipeline = Pipeline::new(manager, false);

    loop {
        let prompt: String = input("Prompt:")
            .validate(|input: &String| {
                if input.is_empty() {
                    Err("Prompt is required!")
                } else {
                    Ok(())
                }
            })
            .interact()?;

        let request = settings.request(prompt.as_str(), args.negative_prompt.as_str());
        let start = Instant::now();

        let result = pipeline.forward(&request, &|progress: f32, message: &str| {
            debug!("{:>3.0}% {message}", progress * 100.);
        })?;

        let end = Instant::now();
        println!(
            "Image generation took: {:.2}s (seed {})",
            end.duration_since(start).as_secs_f32(),
            result.seed
        );

        let out_file: String = input("Save image to:")
            .validate(|input: &String| {
                if input.is_empty() {
                    Err("Image path is required!")
                } else {
                    let path = PathBuf::from(input);
                    let ext = path.extension().ok_or("Extension is required!")?;
                    if ext.to_str().is_some_and(|ext| ["png", "jpg"].contains(&ext)) {
                        Ok(())
                    } else {
                        Err(".png or .jpg extension is required!")
                    }
                }
            })
            .interact()?;

        // JPEG has no alpha channel.
        DynamicImage::ImageRgb8(result.image.to_rgb8()).save(out_file)?;
    }
}

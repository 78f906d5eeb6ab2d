use std::{path::PathBuf, sync::Arc, time::Instant};

use pocket_diffusion_backend::{loader_from_config, RuntimeConfig};
use pocket_diffusion_common::BundledAssets;
use pocket_diffusion_core::{
    GenerationRequest, ModelManager, ModelManagerConfig, Pipeline, SizeTier,
};

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// Zip bundle with the default models
    #[arg(long)]
    bundle: PathBuf,

    /// Which model size to use
    #[arg(long, value_enum, default_value = "small")]
    size_tier: SizeTier,

    /// Prompt to use
    #[arg(short, long)]
    prompt: String,

    /// Seed to use
    #[arg(long, default_value_t = 42)]
    seed: i64,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let work_dir = std::env::temp_dir().join("pocket_diffusion");
    let assets = BundledAssets::open(&args.bundle, work_dir.join("files"))?;

    let mut config = ModelManagerConfig::new(
        loader_from_config(&RuntimeConfig::default()),
        Arc::new(assets),
        work_dir.join("cache"),
    );
    config.size_tier = args.size_tier;
    let manager = ModelManager::new(config);
    manager.ensure_loaded()?;

    let pipeline = Pipeline::new(manager, false);

    let start = Instant::now();

    let result = pipeline.forward(
        &GenerationRequest::new(args.prompt)
            .with_steps(20)
            .with_guidance_scale(7.5)
            .with_image_size(512)
            .with_seed(args.seed),
        &|progress: f32, message: &str| println!("[{:>3.0}%] {message}", progress * 100.),
    )?;

    let end = Instant::now();
    println!("Took: {:.2}s", end.duration_since(start).as_secs_f32());

    result.image.save("image.png")?;

    Ok(())
}

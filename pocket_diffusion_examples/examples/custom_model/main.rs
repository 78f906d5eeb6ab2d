use std::{path::PathBuf, sync::Arc};

use pocket_diffusion_backend::ConstantLoader;
use pocket_diffusion_common::DirAssets;
use pocket_diffusion_core::{GenerationRequest, ModelManager, ModelManagerConfig, Pipeline};

use clap::Parser;
use tracing::level_filters::LevelFilter;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
struct Args {
    /// Directory with the default `{role}_{tier}.ptl` models
    #[arg(long)]
    assets: PathBuf,

    /// Directory to look for custom models in
    #[arg(long)]
    models: PathBuf,

    /// Prompt to use
    #[arg(short, long)]
    prompt: String,
}

fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let filter = EnvFilter::builder()
        .with_default_directive(LevelFilter::INFO.into())
        .from_env_lossy();
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let manager = ModelManager::new(ModelManagerConfig::new(
        Arc::new(ConstantLoader::default()),
        Arc::new(DirAssets::new(&args.assets)),
        std::env::temp_dir().join("pocket_diffusion_cache"),
    ));

    let models = manager.list_available_custom_models(&args.models)?;
    let Some(model) = models.iter().find(|m| m.is_format_supported()) else {
        anyhow::bail!("No usable model in {}.", args.models.display());
    };
    println!("Found {} ({}, {:.1} MiB)", model.name, model.format, model.size_in_mb);

    // Formats without a runtime resolve to the bundled models; the outcome says which happened.
    let outcome = manager.load_model_from_file(&model.path)?;
    if outcome.is_fallback() {
        println!("Custom model not usable, generating with {outcome}.");
    } else {
        println!("Loaded {outcome}.");
    }

    let pipeline = Pipeline::new(manager.clone(), false);
    let result = pipeline.forward(
        &GenerationRequest::new(&args.prompt).with_seed(7),
        &|_: f32, _: &str| {},
    )?;
    result.image.save(format!("{}.png", model.name))?;

    manager.unload();
    manager.clear_model_cache()?;

    Ok(())
}

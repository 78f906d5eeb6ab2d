//! Core crate of pocket_diffusion: model lifecycle and the text-to-image pipeline.
//!
//! Models are owned by a [`ModelManager`] which is created explicitly and shared by cloning. A [`Pipeline`]
//! leases the loaded models for the duration of a generation.
//!
//! ```rust,no_run
//! use std::{sync::Arc, time::Instant};
//!
//! use pocket_diffusion_backend::{loader_from_config, RuntimeConfig};
//! use pocket_diffusion_common::BundledAssets;
//! use pocket_diffusion_core::{GenerationRequest, ModelManager, ModelManagerConfig, Pipeline};
//!
//! let assets = BundledAssets::open("models.zip", "files")?;
//! let manager = ModelManager::new(ModelManagerConfig::new(
//!     loader_from_config(&RuntimeConfig::default()),
//!     Arc::new(assets),
//!     "cache",
//! ));
//! manager.ensure_loaded()?;
//!
//! let pipeline = Pipeline::new(manager, false);
//! let start = Instant::now();
//!
//! let result = pipeline.forward(
//!     &GenerationRequest::new("a red fox in the snow")
//!         .with_steps(20)
//!         .with_guidance_scale(7.5)
//!         .with_seed(42),
//!     &|progress: f32, message: &str| println!("{:>3.0}% {message}", progress * 100.),
//! )?;
//!
//! let end = Instant::now();
//! println!("Took: {:.2}s", end.duration_since(start).as_secs_f32());
//!
//! result.image.save("image.png")?;
//!
//! # Ok::<(), anyhow::Error>(())
//! ```

mod error;
mod models;
mod pipelines;
mod util;

pub use error::{DiffusionError, Result};
pub use models::{
    asset_name, FallbackReason, FormatConverter, LoadOutcome, LoadedModules, ModelManager,
    ModelManagerConfig, ModuleLease, ModuleProvider, PlaceholderConverter, MODEL_CACHE_DIR,
};
pub use pipelines::{
    apply_guidance, get_noise, resolve_seed, to_channel, DenoisingStepEngine, EmbeddingEncoder,
    GenerationPhase, GenerationRequest, GenerationResult, GuidanceEmbeddings, LatentDecoder,
    LinearPlaceholderScheduler, Pipeline, PlaceholderTokenizer, ProgressSink, Scheduler,
    Tokenizer, BOS_TOKEN_ID, EOS_TOKEN_ID, LATENT_SCALING_FACTOR, NUM_TRAIN_TIMESTEPS,
};
pub use util::{GenerationSettings, SizeTier};

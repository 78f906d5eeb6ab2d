mod decoder;
mod denoise;
mod encoder;
mod sampling;

use std::{fmt::Display, sync::Arc};

use image::DynamicImage;
use pocket_diffusion_common::NiceProgressBar;
use tracing::{debug, error, info};

pub use decoder::{to_channel, LatentDecoder, LATENT_SCALING_FACTOR};
pub use denoise::{
    apply_guidance, DenoisingStepEngine, LinearPlaceholderScheduler, Scheduler,
    NUM_TRAIN_TIMESTEPS,
};
pub use encoder::{
    EmbeddingEncoder, GuidanceEmbeddings, PlaceholderTokenizer, Tokenizer, BOS_TOKEN_ID,
    EOS_TOKEN_ID,
};
pub use sampling::{get_noise, resolve_seed};

use crate::{DiffusionError, ModelManager, Result};

/// Generation parameters. Every setter clamps its value into the supported range.
#[derive(Debug, Clone, PartialEq)]
pub struct GenerationRequest {
    prompt: String,
    negative_prompt: String,
    steps: usize,
    guidance_scale: f64,
    image_size: usize,
    seed: i64,
}

impl GenerationRequest {
    pub const MIN_STEPS: usize = 5;
    pub const MAX_STEPS: usize = 50;
    pub const MIN_GUIDANCE_SCALE: f64 = 1.0;
    pub const MAX_GUIDANCE_SCALE: f64 = 20.0;
    pub const SUPPORTED_IMAGE_SIZES: [usize; 3] = [256, 384, 512];

    pub const DEFAULT_STEPS: usize = 20;
    pub const DEFAULT_GUIDANCE_SCALE: f64 = 7.5;
    pub const DEFAULT_IMAGE_SIZE: usize = 256;

    pub fn new<S: ToString>(prompt: S) -> Self {
        Self {
            prompt: prompt.to_string(),
            negative_prompt: String::new(),
            steps: Self::DEFAULT_STEPS,
            guidance_scale: Self::DEFAULT_GUIDANCE_SCALE,
            image_size: Self::DEFAULT_IMAGE_SIZE,
            seed: -1,
        }
    }

    pub fn with_negative_prompt<S: ToString>(mut self, negative_prompt: S) -> Self {
        self.negative_prompt = negative_prompt.to_string();
        self
    }

    /// The number of denoising steps, clamped to 5..=50. More steps usually give a cleaner image at the
    /// expense of slower inference.
    pub fn with_steps(mut self, steps: usize) -> Self {
        self.steps = steps.clamp(Self::MIN_STEPS, Self::MAX_STEPS);
        self
    }

    /// Higher guidance scale encourages images that follow the prompt closely, clamped to 1.0..=20.0.
    pub fn with_guidance_scale(mut self, guidance_scale: f64) -> Self {
        self.guidance_scale = if guidance_scale.is_nan() {
            Self::DEFAULT_GUIDANCE_SCALE
        } else {
            guidance_scale.clamp(Self::MIN_GUIDANCE_SCALE, Self::MAX_GUIDANCE_SCALE)
        };
        self
    }

    /// Square output size. Unsupported sizes fall back to 256.
    pub fn with_image_size(mut self, image_size: usize) -> Self {
        self.image_size = if Self::SUPPORTED_IMAGE_SIZES.contains(&image_size) {
            image_size
        } else {
            Self::DEFAULT_IMAGE_SIZE
        };
        self
    }

    /// A seed of zero or below picks a random one.
    pub fn with_seed(mut self, seed: i64) -> Self {
        self.seed = seed;
        self
    }

    pub fn prompt(&self) -> &str {
        &self.prompt
    }

    pub fn negative_prompt(&self) -> &str {
        &self.negative_prompt
    }

    pub fn steps(&self) -> usize {
        self.steps
    }

    pub fn guidance_scale(&self) -> f64 {
        self.guidance_scale
    }

    pub fn image_size(&self) -> usize {
        self.image_size
    }

    pub fn seed(&self) -> i64 {
        self.seed
    }
}

/// A finished image together with what produced it.
#[derive(Debug, Clone)]
pub struct GenerationResult {
    pub image: DynamicImage,
    /// The seed actually used, useful to reproduce a randomly seeded image.
    pub seed: u64,
    pub prompt: String,
}

/// Receives `(progress in [0, 1], message)` updates from the generation thread.
pub trait ProgressSink {
    fn report(&self, progress: f32, message: &str);
}

impl<F: Fn(f32, &str)> ProgressSink for F {
    fn report(&self, progress: f32, message: &str) {
        self(progress, message)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GenerationPhase {
    Idle,
    EnsuringModel,
    Encoding,
    Denoising { step: usize, total: usize },
    Decoding,
    Done,
    Failed,
}

impl Display for GenerationPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Idle => write!(f, "idle"),
            Self::EnsuringModel => write!(f, "acquiring models"),
            Self::Encoding => write!(f, "encoding"),
            Self::Denoising { step, total } => write!(f, "denoising {step}/{total}"),
            Self::Decoding => write!(f, "decoding"),
            Self::Done => write!(f, "done"),
            Self::Failed => write!(f, "failed"),
        }
    }
}

fn advance(phase: &mut GenerationPhase, next: GenerationPhase) {
    debug!("generation phase: {phase} -> {next}");
    *phase = next;
}

/// Drives one generation: encode the prompts, denoise seeded noise, decode the result.
///
/// The pipeline never loads models itself; call [`ModelManager::ensure_loaded`] first.
pub struct Pipeline {
    manager: ModelManager,
    encoder: EmbeddingEncoder,
    engine: DenoisingStepEngine,
    decoder: LatentDecoder,
    silent: bool,
}

impl Pipeline {
    pub fn new(manager: ModelManager, silent: bool) -> Self {
        Self {
            manager,
            encoder: EmbeddingEncoder::default(),
            engine: DenoisingStepEngine::default(),
            decoder: LatentDecoder,
            silent,
        }
    }

    pub fn with_tokenizer(mut self, tokenizer: Arc<dyn Tokenizer>) -> Self {
        self.encoder = EmbeddingEncoder::new(tokenizer);
        self
    }

    pub fn with_scheduler(mut self, scheduler: Arc<dyn Scheduler>) -> Self {
        self.engine = DenoisingStepEngine::new(scheduler);
        self
    }

    pub fn manager(&self) -> &ModelManager {
        &self.manager
    }

    /// Generate an image for `request`.
    ///
    /// The loaded modules are leased for the whole call, so an `unload` issued meanwhile waits for it.
    /// Failures are reported to `progress` as `"Error: ..."` at progress 0 before being returned.
    pub fn forward(
        &self,
        request: &GenerationRequest,
        progress: &dyn ProgressSink,
    ) -> Result<GenerationResult> {
        let mut phase = GenerationPhase::Idle;
        progress.report(0.0, "Starting generation...");
        match self.run(request, progress, &mut phase) {
            Ok(result) => Ok(result),
            Err(e) => {
                error!("generation failed while {phase}: {e}");
                advance(&mut phase, GenerationPhase::Failed);
                progress.report(0.0, &format!("Error: {e}"));
                Err(e)
            }
        }
    }

    #[allow(clippy::cast_precision_loss, clippy::cast_possible_truncation)]
    fn run(
        &self,
        request: &GenerationRequest,
        progress: &dyn ProgressSink,
        phase: &mut GenerationPhase,
    ) -> Result<GenerationResult> {
        advance(phase, GenerationPhase::EnsuringModel);
        let modules = self.manager.lease()?;

        let seed = resolve_seed(request.seed());
        if !self.silent {
            info!(
                "generating {0}x{0} image, {1} steps, guidance {2}, seed {seed}",
                request.image_size(),
                request.steps(),
                request.guidance_scale()
            );
        }

        advance(phase, GenerationPhase::Encoding);
        progress.report(0.05, "Encoding prompt...");
        let embeddings =
            self.encoder
                .encode(&modules, request.prompt(), request.negative_prompt())?;

        progress.report(0.1, "Initializing noise...");
        let mut latent = get_noise(seed, request.image_size()).map_err(DiffusionError::Noise)?;
        let timesteps = self.engine.scheduler().timesteps(request.steps());
        let total = timesteps.len();
        let guidance_scale = request.guidance_scale() as f32;

        for (i, &timestep) in NiceProgressBar::<_, 'g'>(
            timesteps.iter().enumerate(),
            "Denoise loop",
            self.silent,
        ) {
            let step = i + 1;
            advance(phase, GenerationPhase::Denoising { step, total });
            latent = self
                .engine
                .step(&modules, latent, timestep, &embeddings, guidance_scale)?;
            progress.report(
                0.1 + 0.8 * step as f32 / total as f32,
                &format!("Denoising: step {step}/{total}"),
            );
        }

        advance(phase, GenerationPhase::Decoding);
        progress.report(0.9, "Decoding image...");
        let image = self
            .decoder
            .decode(&modules, latent, request.image_size() as u32)?;
        drop(modules);

        advance(phase, GenerationPhase::Done);
        progress.report(1.0, "Generation complete!");
        Ok(GenerationResult {
            image,
            seed,
            prompt: request.prompt().to_string(),
        })
    }
}

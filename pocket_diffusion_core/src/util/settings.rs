use std::{
    fmt::Display,
    path::{Path, PathBuf},
    str::FromStr,
};

use anyhow::Result;
use pocket_diffusion_backend::RuntimeConfig;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::{GenerationRequest, ModelManager};

#[derive(Clone, Copy, Default, Debug, Deserialize, Serialize, PartialEq, Eq, Hash, clap::ValueEnum)]
/// Capacity preset selecting which bundled module variants are loaded.
pub enum SizeTier {
    #[default]
    #[serde(rename = "small")]
    Small,
    #[serde(rename = "medium")]
    Medium,
    #[serde(rename = "large")]
    Large,
}

impl Display for SizeTier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Small => write!(f, "small"),
            Self::Medium => write!(f, "medium"),
            Self::Large => write!(f, "large"),
        }
    }
}

impl FromStr for SizeTier {
    type Err = serde_plain::Error;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        serde_plain::from_str(s)
    }
}

/// Persisted user settings, usually read from a `settings.json`.
///
/// ```json
/// { "size_tier": "medium", "steps": 30, "guidance_scale": 8.0, "image_size": 384, "seed": 42 }
/// ```
#[derive(Clone, Debug, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct GenerationSettings {
    pub size_tier: SizeTier,
    pub custom_model_path: Option<PathBuf>,
    pub steps: usize,
    pub guidance_scale: f64,
    pub image_size: usize,
    pub seed: i64,
    pub runtime: RuntimeConfig,
}

impl Default for GenerationSettings {
    fn default() -> Self {
        Self {
            size_tier: SizeTier::default(),
            custom_model_path: None,
            steps: GenerationRequest::DEFAULT_STEPS,
            guidance_scale: GenerationRequest::DEFAULT_GUIDANCE_SCALE,
            image_size: GenerationRequest::DEFAULT_IMAGE_SIZE,
            seed: -1,
            runtime: RuntimeConfig::default(),
        }
    }
}

impl GenerationSettings {
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let settings: Self = serde_json::from_str(&std::fs::read_to_string(path.as_ref())?)?;
        info!("settings loaded from {}", path.as_ref().display());
        Ok(settings)
    }

    pub fn save<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    /// Build a request for `prompt`. Out-of-range values are clamped by the request.
    pub fn request<S: ToString>(&self, prompt: S, negative_prompt: S) -> GenerationRequest {
        GenerationRequest::new(prompt)
            .with_negative_prompt(negative_prompt)
            .with_steps(self.steps)
            .with_guidance_scale(self.guidance_scale)
            .with_image_size(self.image_size)
            .with_seed(self.seed)
    }

    /// Push the model selection into the manager. Unchanged values leave loaded models alone.
    pub fn apply_to(&self, manager: &ModelManager) {
        manager.set_size_tier(self.size_tier);
        manager.set_custom_model_path(self.custom_model_path.clone());
    }
}

use std::{
    fmt::Display,
    path::{Path, PathBuf},
};

use pocket_diffusion_common::{inspect_safetensors, ModelFormat, Result, Role};
use tracing::info;

/// What `ensure_loaded` actually put in place.
#[derive(Debug, Clone, PartialEq)]
pub enum LoadOutcome {
    /// The bundled modules for the current size tier; no custom model was requested.
    Default,
    /// The custom model was loaded into `roles`, the remaining roles come from the bundled set.
    CustomOverride { path: PathBuf, roles: Vec<Role> },
    /// A custom model was requested but the bundled modules were loaded instead.
    SubstitutedDefaults { path: PathBuf, reason: FallbackReason },
}

impl LoadOutcome {
    pub fn is_fallback(&self) -> bool {
        matches!(self, Self::SubstitutedDefaults { .. })
    }
}

impl Display for LoadOutcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Default => write!(f, "bundled models"),
            Self::CustomOverride { path, roles } => {
                let roles = roles.iter().map(ToString::to_string).collect::<Vec<_>>();
                write!(f, "{} as {}", path.display(), roles.join(", "))
            }
            Self::SubstitutedDefaults { path, reason } => {
                write!(f, "bundled models instead of {} ({reason})", path.display())
            }
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FallbackReason {
    /// Binary or unrecognised formats have no loader.
    UnsupportedFormat(ModelFormat),
    /// The safetensors file could not be converted for the interchange runtime.
    ConversionUnavailable,
    /// The checkpoint runtime rejected the file.
    CheckpointLoadFailed(String),
    /// There is no interchange runtime to run `.onnx` models with.
    InterchangeUnavailable,
}

impl Display for FallbackReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnsupportedFormat(format) => write!(f, "unsupported format `{format}`"),
            Self::ConversionUnavailable => write!(f, "safetensors conversion unavailable"),
            Self::CheckpointLoadFailed(e) => write!(f, "checkpoint failed to load: {e}"),
            Self::InterchangeUnavailable => write!(f, "no interchange runtime"),
        }
    }
}

/// Converts a safetensors checkpoint into a file the interchange runtime can load.
pub trait FormatConverter: Send + Sync {
    /// Returns the converted file, or `None` when conversion is not possible.
    fn convert(&self, source: &Path, cache_dir: &Path) -> Result<Option<PathBuf>>;
}

/// Stand-in converter: validates the safetensors header and reports where the converted model would go,
/// but never produces one.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderConverter;

impl FormatConverter for PlaceholderConverter {
    fn convert(&self, source: &Path, cache_dir: &Path) -> Result<Option<PathBuf>> {
        let summary = inspect_safetensors(source)?;
        let stem = source
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned())
            .unwrap_or_else(|| "model".to_string());
        let target = cache_dir.join(format!("{stem}.onnx"));
        info!(
            "conversion placeholder: {} tensors ({} bytes), would create {}",
            summary.tensor_count,
            summary.data_bytes,
            target.display()
        );
        Ok(None)
    }
}

use std::{fmt::Display, path::Path};

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Token sequence length of the text encoder.
pub const MAX_TOKEN_LENGTH: usize = 77;
/// Hidden size of one text embedding vector.
pub const TEXT_EMBED_DIM: usize = 768;
/// Channels of the latent space.
pub const LATENT_CHANNELS: usize = 4;
/// Spatial downsampling factor between pixel space and latent space.
pub const VAE_SCALE_FACTOR: usize = 8;

pub const INPUT_IDS: &str = "input_ids";
pub const SAMPLE: &str = "sample";
pub const TIMESTEP: &str = "timestep";
pub const ENCODER_HIDDEN_STATES: &str = "encoder_hidden_states";
pub const LATENT_SAMPLE: &str = "latent_sample";

/// The functional slot a loaded module fills.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Role {
    #[serde(rename = "text_encoder")]
    TextEncoder,
    #[serde(rename = "unet")]
    Denoiser,
    #[serde(rename = "vae_decoder")]
    Decoder,
}

impl Role {
    pub const ALL: [Role; 3] = [Role::TextEncoder, Role::Denoiser, Role::Decoder];
}

impl Display for Role {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::TextEncoder => write!(f, "text_encoder"),
            Self::Denoiser => write!(f, "unet"),
            Self::Decoder => write!(f, "vae_decoder"),
        }
    }
}

/// Named input tensors for a single forward call.
#[derive(Debug, Default, Clone)]
pub struct ModuleInputs(Vec<(&'static str, Tensor)>);

impl ModuleInputs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: &'static str, tensor: Tensor) -> Self {
        self.0.push((name, tensor));
        self
    }

    pub fn get(&self, name: &'static str) -> Result<&Tensor> {
        self.0
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, t)| t)
            .ok_or(Error::MissingInput(name))
    }
}

/// Error out unless `tensor` has exactly the given shape.
pub fn expect_shape(tensor: &Tensor, expected: &[usize]) -> Result<()> {
    if tensor.dims() != expected {
        return Err(Error::UnexpectedShape {
            expected: expected.to_vec(),
            got: tensor.dims().to_vec(),
        });
    }
    Ok(())
}

pub fn expect_dtype(tensor: &Tensor, expected: DType) -> Result<()> {
    if tensor.dtype() != expected {
        return Err(Error::UnexpectedDType {
            expected,
            got: tensor.dtype(),
        });
    }
    Ok(())
}

/// A loaded network. The forward pass is entirely up to the runtime which produced it.
///
/// I/O contract per role:
/// - text encoder: `input_ids` `[1, 77]` (i64) -> `[1, 77, 768]`
/// - denoiser: `sample` `[2, 4, h, w]`, `timestep` `[1]` (i64), `encoder_hidden_states` `[2, 77, 768]` -> `[2, 4, h, w]`
/// - decoder: `latent_sample` `[1, 4, h, w]` -> `[1, 3, 8h, 8w]`
pub trait InferenceModule: Send + Sync {
    fn forward(&self, inputs: ModuleInputs) -> Result<Tensor>;
}

/// Turns a module blob on disk into a live [`InferenceModule`].
pub trait ModuleLoader: Send + Sync {
    fn name(&self) -> &'static str;

    /// Extension of the bundled module blobs this runtime reads, without the dot.
    fn asset_extension(&self) -> &'static str {
        "ptl"
    }

    /// Load the blob at `path` for the given role. Allocation failures should be reported as
    /// [`Error::OutOfMemory`] so callers can release memory before retrying.
    fn load(&self, role: Role, path: &Path) -> Result<Box<dyn InferenceModule>>;

    /// Best-effort request to return freed module memory to the system.
    fn trim_memory(&self) {}
}

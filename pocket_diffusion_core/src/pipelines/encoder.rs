use std::sync::Arc;

use candle_core::{Device, Tensor};
use pocket_diffusion_common::{
    expect_shape, ModuleInputs, Role, INPUT_IDS, MAX_TOKEN_LENGTH, TEXT_EMBED_DIM,
};
use tracing::debug;

use crate::{
    models::{require, ModuleProvider},
    DiffusionError, Result,
};

/// Start-of-text marker of the CLIP vocabulary.
pub const BOS_TOKEN_ID: i64 = 49406;
/// End-of-text marker of the CLIP vocabulary.
pub const EOS_TOKEN_ID: i64 = 49407;

/// Turns a prompt into exactly [`MAX_TOKEN_LENGTH`] token ids.
pub trait Tokenizer: Send + Sync {
    fn tokenize(&self, text: &str) -> Vec<i64>;
}

/// Stand-in tokenizer: every prompt becomes `[BOS, 0, .., 0, EOS]`. The text is ignored.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlaceholderTokenizer;

impl Tokenizer for PlaceholderTokenizer {
    fn tokenize(&self, _text: &str) -> Vec<i64> {
        let mut ids = vec![0; MAX_TOKEN_LENGTH];
        ids[0] = BOS_TOKEN_ID;
        ids[MAX_TOKEN_LENGTH - 1] = EOS_TOKEN_ID;
        ids
    }
}

/// Unconditional and conditional prompt embeddings batched as `[2, 77, 768]`, unconditional first.
#[derive(Debug, Clone)]
pub struct GuidanceEmbeddings(Tensor);

impl GuidanceEmbeddings {
    pub fn new(
        unconditional: Tensor,
        conditional: Tensor,
    ) -> pocket_diffusion_common::Result<Self> {
        Ok(Self(Tensor::cat(&[&unconditional, &conditional], 0)?))
    }

    pub fn batched(&self) -> &Tensor {
        &self.0
    }
}

pub struct EmbeddingEncoder {
    tokenizer: Arc<dyn Tokenizer>,
}

impl Default for EmbeddingEncoder {
    fn default() -> Self {
        Self::new(Arc::new(PlaceholderTokenizer))
    }
}

impl EmbeddingEncoder {
    pub fn new(tokenizer: Arc<dyn Tokenizer>) -> Self {
        Self { tokenizer }
    }

    /// Run the text encoder once per prompt. An empty negative prompt is encoded like any other text.
    pub fn encode(
        &self,
        modules: &dyn ModuleProvider,
        prompt: &str,
        negative_prompt: &str,
    ) -> Result<GuidanceEmbeddings> {
        let text_encoder = require(modules, Role::TextEncoder)?;
        let embed = |text: &str| -> pocket_diffusion_common::Result<Tensor> {
            let ids = Tensor::from_vec(
                self.tokenizer.tokenize(text),
                (1, MAX_TOKEN_LENGTH),
                &Device::Cpu,
            )?;
            let embedding = text_encoder.forward(ModuleInputs::new().with(INPUT_IDS, ids))?;
            expect_shape(&embedding, &[1, MAX_TOKEN_LENGTH, TEXT_EMBED_DIM])?;
            Ok(embedding)
        };

        let unconditional = embed(negative_prompt).map_err(DiffusionError::Encode)?;
        let conditional = embed(prompt).map_err(DiffusionError::Encode)?;
        debug!("prompt encoded");
        GuidanceEmbeddings::new(unconditional, conditional).map_err(DiffusionError::Encode)
    }
}

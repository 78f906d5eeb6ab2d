use std::sync::Arc;

use candle_core::Tensor;
use pocket_diffusion_common::{
    expect_shape, Error, ModuleInputs, Role, ENCODER_HIDDEN_STATES, LATENT_CHANNELS, SAMPLE,
    TIMESTEP,
};
use tracing::debug;

use super::encoder::GuidanceEmbeddings;
use crate::{
    models::{require, ModuleProvider},
    DiffusionError, Result,
};

/// Number of training timesteps the schedule is drawn from.
pub const NUM_TRAIN_TIMESTEPS: usize = 1000;

/// Timestep schedule and per-step latent update.
pub trait Scheduler: Send + Sync {
    /// `num_steps` strictly decreasing timesteps in `[0, 999]`.
    fn timesteps(&self, num_steps: usize) -> Vec<i64>;

    /// Apply the guided noise prediction to `latent`.
    fn step(
        &self,
        latent: Tensor,
        guided_noise: &[f32],
        timestep: i64,
    ) -> pocket_diffusion_common::Result<Tensor>;
}

/// Stand-in scheduler: evenly spaced timesteps from 999 and `x - 0.02 * (t / 1000) * noise`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LinearPlaceholderScheduler;

impl Scheduler for LinearPlaceholderScheduler {
    fn timesteps(&self, num_steps: usize) -> Vec<i64> {
        if num_steps == 0 {
            return Vec::new();
        }
        let step_size = NUM_TRAIN_TIMESTEPS / num_steps;
        (0..num_steps)
            .map(|i| (NUM_TRAIN_TIMESTEPS - 1 - i * step_size) as i64)
            .collect()
    }

    #[allow(clippy::cast_precision_loss)]
    fn step(
        &self,
        latent: Tensor,
        guided_noise: &[f32],
        timestep: i64,
    ) -> pocket_diffusion_common::Result<Tensor> {
        let shape = latent.dims().to_vec();
        let mut data = latent.flatten_all()?.to_vec1::<f32>()?;
        if data.len() != guided_noise.len() {
            return Err(Error::ShapeMismatchBinaryOp {
                op: "step",
                lhs: shape,
                rhs: vec![guided_noise.len()],
            });
        }
        let alpha = timestep as f32 / NUM_TRAIN_TIMESTEPS as f32;
        for (x, noise) in data.iter_mut().zip(guided_noise) {
            *x -= 0.02f32 * alpha * noise;
        }
        Ok(Tensor::from_vec(data, shape, latent.device())?)
    }
}

/// Classifier-free guidance: `uncond + scale * (cond - uncond)`, element-wise.
pub fn apply_guidance(unconditional: &[f32], conditional: &[f32], scale: f32) -> Vec<f32> {
    unconditional
        .iter()
        .zip(conditional)
        .map(|(u, c)| u + scale * (c - u))
        .collect()
}

pub struct DenoisingStepEngine {
    scheduler: Arc<dyn Scheduler>,
}

impl Default for DenoisingStepEngine {
    fn default() -> Self {
        Self::new(Arc::new(LinearPlaceholderScheduler))
    }
}

impl DenoisingStepEngine {
    pub fn new(scheduler: Arc<dyn Scheduler>) -> Self {
        Self { scheduler }
    }

    pub fn scheduler(&self) -> &dyn Scheduler {
        self.scheduler.as_ref()
    }

    /// Run one guided denoising step on a `[4, h, w]` latent and return the updated latent.
    pub fn step(
        &self,
        modules: &dyn ModuleProvider,
        latent: Tensor,
        timestep: i64,
        embeddings: &GuidanceEmbeddings,
        guidance_scale: f32,
    ) -> Result<Tensor> {
        let denoiser = require(modules, Role::Denoiser)?;
        let run = || -> pocket_diffusion_common::Result<Tensor> {
            let (c, h, w) = latent.dims3()?;
            if c != LATENT_CHANNELS {
                return Err(Error::UnexpectedShape {
                    expected: vec![LATENT_CHANNELS, h, w],
                    got: latent.dims().to_vec(),
                });
            }
            let sample = Tensor::stack(&[&latent, &latent], 0)?;
            let noise = denoiser.forward(
                ModuleInputs::new()
                    .with(SAMPLE, sample)
                    .with(TIMESTEP, Tensor::new(&[timestep], latent.device())?)
                    .with(ENCODER_HIDDEN_STATES, embeddings.batched().clone()),
            )?;
            expect_shape(&noise, &[2, LATENT_CHANNELS, h, w])?;

            let halves = noise.chunk(2, 0)?;
            let unconditional = halves[0].flatten_all()?.to_vec1::<f32>()?;
            let conditional = halves[1].flatten_all()?.to_vec1::<f32>()?;
            let guided = apply_guidance(&unconditional, &conditional, guidance_scale);
            self.scheduler.step(latent.clone(), &guided, timestep)
        };
        let latent = run().map_err(|source| DiffusionError::Denoising { timestep, source })?;
        debug!("denoised timestep {timestep}");
        Ok(latent)
    }
}

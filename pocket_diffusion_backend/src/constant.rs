use std::{fs, path::Path};

use candle_core::{DType, Tensor};
use pocket_diffusion_common::{
    expect_dtype, Error, InferenceModule, ModuleInputs, ModuleLoader, Result, Role,
    ENCODER_HIDDEN_STATES, INPUT_IDS, LATENT_CHANNELS, LATENT_SAMPLE, SAMPLE, TEXT_EMBED_DIM,
    TIMESTEP, VAE_SCALE_FACTOR,
};
use tracing::debug;

/// A module that validates its inputs against the role's I/O contract and answers with a tensor of the
/// contracted output shape filled with `value`.
#[derive(Debug, Clone)]
pub struct ConstantModule {
    role: Role,
    value: f32,
}

impl ConstantModule {
    pub fn new(role: Role, value: f32) -> Self {
        Self { role, value }
    }
}

impl InferenceModule for ConstantModule {
    fn forward(&self, inputs: ModuleInputs) -> Result<Tensor> {
        let out = match self.role {
            Role::TextEncoder => {
                let ids = inputs.get(INPUT_IDS)?;
                expect_dtype(ids, DType::I64)?;
                let (b, seq) = match *ids.dims() {
                    [b, seq] => (b, seq),
                    _ => {
                        return Err(Error::UnexpectedRank {
                            expected: 2,
                            shape: ids.dims().to_vec(),
                        })
                    }
                };
                Tensor::full(self.value, (b, seq, TEXT_EMBED_DIM), ids.device())?
            }
            Role::Denoiser => {
                let sample = inputs.get(SAMPLE)?;
                let (b, c, h, w) = sample.dims4()?;
                if c != LATENT_CHANNELS {
                    return Err(Error::UnexpectedShape {
                        expected: vec![b, LATENT_CHANNELS, h, w],
                        got: sample.dims().to_vec(),
                    });
                }
                expect_dtype(inputs.get(TIMESTEP)?, DType::I64)?;
                let (eb, _, _) = inputs.get(ENCODER_HIDDEN_STATES)?.dims3()?;
                if eb != b {
                    return Err(Error::ShapeMismatchBinaryOp {
                        op: "denoise",
                        lhs: sample.dims().to_vec(),
                        rhs: inputs.get(ENCODER_HIDDEN_STATES)?.dims().to_vec(),
                    });
                }
                Tensor::full(self.value, (b, c, h, w), sample.device())?
            }
            Role::Decoder => {
                let latent = inputs.get(LATENT_SAMPLE)?;
                let (b, _, h, w) = latent.dims4()?;
                Tensor::full(
                    self.value,
                    (b, 3, h * VAE_SCALE_FACTOR, w * VAE_SCALE_FACTOR),
                    latent.device(),
                )?
            }
        };
        Ok(out)
    }
}

/// Loader for [`ConstantModule`]s. The blob has to exist and be readable but its contents are ignored.
#[derive(Debug, Clone, Default)]
pub struct ConstantLoader {
    value: f32,
}

impl ConstantLoader {
    pub fn new(value: f32) -> Self {
        Self { value }
    }
}

impl ModuleLoader for ConstantLoader {
    fn name(&self) -> &'static str {
        "constant"
    }

    fn load(&self, role: Role, path: &Path) -> Result<Box<dyn InferenceModule>> {
        let meta = fs::metadata(path)?;
        if !meta.is_file() {
            return Err(Error::ModelFileNotFound(path.to_path_buf()));
        }
        debug!("constant runtime loaded {role} from {}", path.display());
        Ok(Box::new(ConstantModule::new(role, self.value)))
    }
}

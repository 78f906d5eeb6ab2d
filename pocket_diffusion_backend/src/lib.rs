use std::{fmt::Display, sync::Arc};

use pocket_diffusion_common::ModuleLoader;
use serde::{Deserialize, Serialize};

mod constant;

pub use constant::{ConstantLoader, ConstantModule};

/// Which module runtime backs a pipeline.
#[derive(Debug, Clone, Copy, Deserialize, Serialize, Default, PartialEq, Eq)]
pub enum RuntimeType {
    /// Every module emits a tensor of the contracted output shape filled with one value.
    #[default]
    #[serde(rename = "constant")]
    Constant,
}

impl Display for RuntimeType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Constant => write!(f, "constant"),
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
#[serde(default)]
pub struct RuntimeConfig {
    pub runtime: RuntimeType,
    /// Output fill value used by the constant runtime.
    pub fill_value: f32,
}

pub fn loader_from_config(config: &RuntimeConfig) -> Arc<dyn ModuleLoader> {
    match config.runtime {
        RuntimeType::Constant => Arc::new(ConstantLoader::new(config.fill_value)),
    }
}

mod custom;
mod manager;

use pocket_diffusion_common::{InferenceModule, Role};

pub use custom::{FallbackReason, FormatConverter, LoadOutcome, PlaceholderConverter};
pub use manager::{
    asset_name, LoadedModules, ModelManager, ModelManagerConfig, ModuleLease, MODEL_CACHE_DIR,
};

use crate::{DiffusionError, Result};

/// Access to loaded modules by role.
pub trait ModuleProvider {
    fn module(&self, role: Role) -> Option<&dyn InferenceModule>;
}

pub(crate) fn require<P: ModuleProvider + ?Sized>(
    modules: &P,
    role: Role,
) -> Result<&dyn InferenceModule> {
    modules
        .module(role)
        .ok_or(DiffusionError::ModelNotLoaded(Some(role)))
}

use pocket_diffusion_common::Role;

fn missing_role(role: &Option<Role>) -> String {
    match role {
        Some(role) => format!(" (`{role}` is not loaded)"),
        None => String::new(),
    }
}

/// Errors surfaced by the model lifecycle and the generation pipeline.
#[derive(thiserror::Error, Debug)]
pub enum DiffusionError {
    /// A required module is absent, or nothing is loaded at all when `None`.
    #[error("models are not loaded{}", missing_role(.0))]
    ModelNotLoaded(Option<Role>),

    /// Loading failed. The manager is left fully unloaded when this is returned.
    #[error("failed to load models: {0}")]
    ModelLoad(#[source] pocket_diffusion_common::Error),

    #[error("failed to encode prompt: {0}")]
    Encode(#[source] pocket_diffusion_common::Error),

    #[error("failed to initialize latents: {0}")]
    Noise(#[source] pocket_diffusion_common::Error),

    #[error("denoising failed at timestep {timestep}: {source}")]
    Denoising {
        timestep: i64,
        #[source]
        source: pocket_diffusion_common::Error,
    },

    #[error("failed to decode latents: {0}")]
    Decode(#[source] pocket_diffusion_common::Error),

    /// Unload was refused because generations still hold the modules.
    #[error("models are in use by {leases} running generation(s)")]
    ModulesInUse { leases: usize },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, DiffusionError>;

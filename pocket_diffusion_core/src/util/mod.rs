mod settings;

pub use settings::{GenerationSettings, SizeTier};

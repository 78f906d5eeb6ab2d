mod error;
mod model_file;
mod model_source;
mod module;
mod progress;
mod safetensors_header;

pub use error::{Error, Result};
pub use model_file::{find_models_in_directory, ModelFileInfo, ModelFormat, DISCOVERABLE_EXTENSIONS};
pub use model_source::{AssetSource, BundledAssets, DirAssets};
pub use module::*;
pub use progress::NiceProgressBar;
pub use safetensors_header::{inspect_safetensors, SafetensorsSummary};

use std::{
    fmt::Display,
    fs,
    path::{Path, PathBuf},
};

use serde::{Deserialize, Serialize};

use crate::Result;

/// Extensions picked up when scanning a directory for user supplied models.
pub const DISCOVERABLE_EXTENSIONS: [&str; 6] = ["safetensors", "ckpt", "pt", "pth", "bin", "onnx"];

/// Format of a user supplied model file, inferred from its extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ModelFormat {
    /// `.safetensors`
    #[serde(rename = "safetensors")]
    Safetensors,
    /// `.pt` / `.pth`, loadable directly by the module runtime.
    #[serde(rename = "checkpoint")]
    NativeCheckpoint,
    /// `.ckpt`. Discovered and listed, but no runtime reads it, so loading resolves to the bundled models.
    #[serde(rename = "ckpt")]
    Checkpoint,
    /// `.onnx`
    #[serde(rename = "interchange")]
    Interchange,
    /// `.bin`
    #[serde(rename = "binary")]
    Binary,
    #[serde(rename = "unknown")]
    Unknown,
}

impl ModelFormat {
    pub fn from_path(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(str::to_ascii_lowercase);
        match ext.as_deref() {
            Some("safetensors") => Self::Safetensors,
            Some("pt" | "pth") => Self::NativeCheckpoint,
            Some("ckpt") => Self::Checkpoint,
            Some("onnx") => Self::Interchange,
            Some("bin") => Self::Binary,
            _ => Self::Unknown,
        }
    }

    /// Whether a custom model path of this format goes through custom loading at all.
    pub fn is_supported(&self) -> bool {
        !matches!(self, Self::Unknown)
    }
}

impl Display for ModelFormat {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Safetensors => write!(f, "safetensors"),
            Self::NativeCheckpoint => write!(f, "checkpoint"),
            Self::Checkpoint => write!(f, "ckpt"),
            Self::Interchange => write!(f, "interchange"),
            Self::Binary => write!(f, "binary"),
            Self::Unknown => write!(f, "unknown"),
        }
    }
}

/// A model file found on disk.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ModelFileInfo {
    pub name: String,
    pub path: PathBuf,
    pub format: ModelFormat,
    pub size_in_mb: f32,
    pub is_built_in: bool,
}

impl ModelFileInfo {
    pub fn from_path<P: Into<PathBuf>>(path: P) -> Result<Self> {
        let path = path.into();
        let size = fs::metadata(&path)?.len();
        Ok(Self {
            name: path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_default(),
            format: ModelFormat::from_path(&path),
            size_in_mb: size as f32 / (1024. * 1024.),
            is_built_in: false,
            path,
        })
    }

    pub fn exists(&self) -> bool {
        self.path.exists()
    }

    pub fn is_format_supported(&self) -> bool {
        self.format.is_supported()
    }
}

/// List the model files directly inside `dir`. A missing directory yields an empty list.
pub fn find_models_in_directory(dir: &Path) -> Result<Vec<ModelFileInfo>> {
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut models = Vec::new();
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        let discoverable = path
            .extension()
            .and_then(|e| e.to_str())
            .is_some_and(|e| DISCOVERABLE_EXTENSIONS.contains(&e.to_ascii_lowercase().as_str()));
        if path.is_file() && discoverable {
            models.push(ModelFileInfo::from_path(path)?);
        }
    }
    models.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(models)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_from_extension() {
        let cases = [
            ("a.safetensors", ModelFormat::Safetensors),
            ("a.PT", ModelFormat::NativeCheckpoint),
            ("a.pth", ModelFormat::NativeCheckpoint),
            ("a.onnx", ModelFormat::Interchange),
            ("a.bin", ModelFormat::Binary),
            ("a.ckpt", ModelFormat::Checkpoint),
            ("a.xyz", ModelFormat::Unknown),
            ("no_extension", ModelFormat::Unknown),
        ];
        for (file, format) in cases {
            assert_eq!(ModelFormat::from_path(Path::new(file)), format, "{file}");
        }
    }

    #[test]
    fn discovery_filters_by_extension() -> Result<()> {
        let dir = std::env::temp_dir().join(format!("pocket_diffusion_discovery_{}", std::process::id()));
        let _ = fs::remove_dir_all(&dir);
        fs::create_dir_all(&dir)?;
        fs::write(dir.join("anime.safetensors"), [0u8; 16])?;
        fs::write(dir.join("legacy.ckpt"), [0u8; 16])?;
        fs::write(dir.join("notes.txt"), b"not a model")?;

        let found = find_models_in_directory(&dir)?;
        let names = found.iter().map(|m| m.name.as_str()).collect::<Vec<_>>();
        assert_eq!(names, ["anime", "legacy"]);
        assert!(found[0].is_format_supported());
        assert_eq!(found[1].format, ModelFormat::Checkpoint);
        assert!(found[1].is_format_supported());
        assert!(found.iter().all(ModelFileInfo::exists));

        assert!(find_models_in_directory(&dir.join("nope"))?.is_empty());
        Ok(())
    }
}

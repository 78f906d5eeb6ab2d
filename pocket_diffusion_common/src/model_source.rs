use std::{
    fmt::{Debug, Display},
    fs::{self, File},
    io::{self, Cursor},
    path::{Path, PathBuf},
    sync::Mutex,
};

use memmap2::Mmap;
use tracing::debug;
use zip::{result::ZipError, ZipArchive};

use crate::{Error, Result};

/// Where the default module blobs come from. Implementations hand back a local file for a named blob,
/// extracting it first if the blob is packaged.
pub trait AssetSource: Send + Sync + Display {
    fn fetch(&self, name: &str) -> Result<PathBuf>;
}

/// Blobs stored as plain files in a directory.
pub struct DirAssets {
    root: PathBuf,
}

impl DirAssets {
    pub fn new<P: Into<PathBuf>>(root: P) -> Self {
        Self { root: root.into() }
    }
}

impl Display for DirAssets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "asset directory: {}", self.root.display())
    }
}

impl AssetSource for DirAssets {
    fn fetch(&self, name: &str) -> Result<PathBuf> {
        let path = self.root.join(name);
        if !path.is_file() {
            return Err(Error::AssetNotFound(name.to_string()));
        }
        Ok(path)
    }
}

/// Blobs packaged in a zip bundle. A blob is extracted into `files_dir` the first time it is requested and
/// the extracted copy is reused afterwards.
pub struct BundledAssets {
    archive: Mutex<ZipArchive<Cursor<Mmap>>>,
    name: String,
    files_dir: PathBuf,
}

impl BundledAssets {
    pub fn open<P: AsRef<Path>, Q: Into<PathBuf>>(bundle: P, files_dir: Q) -> Result<Self> {
        let file = File::open(bundle.as_ref())?;
        let mmap = unsafe { Mmap::map(&file)? };
        let archive = ZipArchive::new(Cursor::new(mmap))?;
        Ok(Self {
            archive: Mutex::new(archive),
            name: bundle.as_ref().display().to_string(),
            files_dir: files_dir.into(),
        })
    }

    /// Names of all blobs in the bundle.
    pub fn list_files(&self) -> Vec<String> {
        let archive = self
            .archive
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        archive.file_names().map(ToString::to_string).collect()
    }

    fn extract(&self, name: &str, target: &Path) -> Result<()> {
        let mut archive = self
            .archive
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner);
        let mut entry = match archive.by_name(name) {
            Ok(entry) => entry,
            Err(ZipError::FileNotFound) => return Err(Error::AssetNotFound(name.to_string())),
            Err(e) => return Err(e.into()),
        };

        fs::create_dir_all(&self.files_dir)?;
        // Write next to the target first so an interrupted copy never looks like a finished one.
        let partial = target.with_extension("partial");
        let mut out = File::create(&partial)?;
        io::copy(&mut entry, &mut out)?;
        out.sync_all()?;
        fs::rename(&partial, target)?;
        Ok(())
    }
}

impl Display for BundledAssets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "asset bundle: {}", self.name)
    }
}

impl Debug for BundledAssets {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "BundledAssets {{ bundle: {}, files_dir: {} }}",
            self.name,
            self.files_dir.display()
        )
    }
}

impl AssetSource for BundledAssets {
    fn fetch(&self, name: &str) -> Result<PathBuf> {
        let target = self.files_dir.join(name);
        if target.is_file() {
            return Ok(target);
        }
        debug!("extracting `{name}` to {}", target.display());
        self.extract(name, &target)?;
        Ok(target)
    }
}

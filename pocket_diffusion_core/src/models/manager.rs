use std::{
    fs, io,
    ops::Deref,
    path::{Path, PathBuf},
    sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError},
    time::Instant,
};

use pocket_diffusion_common::{
    find_models_in_directory, AssetSource, Error, InferenceModule, ModelFileInfo, ModelFormat,
    ModuleLoader, Role,
};
use tracing::{error, info, warn};

use super::custom::{FallbackReason, FormatConverter, LoadOutcome, PlaceholderConverter};
use super::ModuleProvider;
use crate::{DiffusionError, Result, SizeTier};

/// Subdirectory of the cache directory holding imported and converted models.
pub const MODEL_CACHE_DIR: &str = "models";

/// File name of a bundled module blob: `{role}_{tier}.{ext}`.
pub fn asset_name(role: Role, tier: SizeTier, extension: &str) -> String {
    format!("{role}_{tier}.{extension}")
}

/// One module per role. A value of this type is always complete.
pub struct LoadedModules {
    text_encoder: Box<dyn InferenceModule>,
    denoiser: Box<dyn InferenceModule>,
    decoder: Box<dyn InferenceModule>,
}

impl LoadedModules {
    pub fn new(
        text_encoder: Box<dyn InferenceModule>,
        denoiser: Box<dyn InferenceModule>,
        decoder: Box<dyn InferenceModule>,
    ) -> Self {
        Self {
            text_encoder,
            denoiser,
            decoder,
        }
    }

    pub fn get(&self, role: Role) -> &dyn InferenceModule {
        match role {
            Role::TextEncoder => self.text_encoder.as_ref(),
            Role::Denoiser => self.denoiser.as_ref(),
            Role::Decoder => self.decoder.as_ref(),
        }
    }
}

impl ModuleProvider for LoadedModules {
    fn module(&self, role: Role) -> Option<&dyn InferenceModule> {
        Some(self.get(role))
    }
}

/// Lifecycle state. Loading happens while the manager lock is held, so it is never observed from outside.
enum ModelState {
    Unloaded,
    Loaded {
        modules: Arc<LoadedModules>,
        outcome: LoadOutcome,
    },
}

/// Everything needed to build a [`ModelManager`].
pub struct ModelManagerConfig {
    pub loader: Arc<dyn ModuleLoader>,
    pub assets: Arc<dyn AssetSource>,
    pub converter: Arc<dyn FormatConverter>,
    /// Imported and converted models are kept in `<cache_dir>/models`.
    pub cache_dir: PathBuf,
    pub size_tier: SizeTier,
    pub custom_model_path: Option<PathBuf>,
    pub silent: bool,
}

impl ModelManagerConfig {
    pub fn new<P: Into<PathBuf>>(
        loader: Arc<dyn ModuleLoader>,
        assets: Arc<dyn AssetSource>,
        cache_dir: P,
    ) -> Self {
        Self {
            loader,
            assets,
            converter: Arc::new(PlaceholderConverter),
            cache_dir: cache_dir.into(),
            size_tier: SizeTier::default(),
            custom_model_path: None,
            silent: false,
        }
    }
}

struct Inner {
    state: ModelState,
    size_tier: SizeTier,
    custom_model_path: Option<PathBuf>,
    leases: usize,
    /// Number of `unload` calls waiting for leases. No new leases are handed out while this is nonzero.
    pending_unloads: usize,
}

struct Shared {
    inner: Mutex<Inner>,
    released: Condvar,
    loader: Arc<dyn ModuleLoader>,
    assets: Arc<dyn AssetSource>,
    converter: Arc<dyn FormatConverter>,
    cache_dir: PathBuf,
    silent: bool,
}

/// Owner of the loaded text encoder, denoiser and decoder.
///
/// The handle is cheap to clone; all clones share one lock, so at most one load or unload runs at a time.
/// Generations take a [`ModuleLease`] for their whole duration: [`ModelManager::unload`] waits for leases to
/// be returned and [`ModelManager::try_unload`] refuses while any are outstanding.
#[derive(Clone)]
pub struct ModelManager {
    shared: Arc<Shared>,
}

/// A read reservation on a loaded module set.
pub struct ModuleLease {
    modules: Arc<LoadedModules>,
    shared: Arc<Shared>,
}

impl Deref for ModuleLease {
    type Target = LoadedModules;

    fn deref(&self) -> &Self::Target {
        &self.modules
    }
}

impl ModuleProvider for ModuleLease {
    fn module(&self, role: Role) -> Option<&dyn InferenceModule> {
        Some(self.modules.get(role))
    }
}

impl Drop for ModuleLease {
    fn drop(&mut self) {
        let mut inner = self.shared.lock();
        inner.leases = inner.leases.saturating_sub(1);
        drop(inner);
        self.shared.released.notify_all();
    }
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn models_dir(&self) -> PathBuf {
        self.cache_dir.join(MODEL_CACHE_DIR)
    }

    /// Drop the manager's module set and ask the runtime to give the memory back.
    fn release(&self, inner: &mut Inner) {
        let was_loaded = matches!(inner.state, ModelState::Loaded { .. });
        inner.state = ModelState::Unloaded;
        self.loader.trim_memory();
        if was_loaded && !self.silent {
            info!("models unloaded");
        }
    }

    fn load_default_role(
        &self,
        role: Role,
        tier: SizeTier,
    ) -> pocket_diffusion_common::Result<Box<dyn InferenceModule>> {
        let file = self
            .assets
            .fetch(&asset_name(role, tier, self.loader.asset_extension()))?;
        let module = self.loader.load(role, &file)?;
        if !self.silent {
            info!("{role} loaded");
        }
        Ok(module)
    }

    fn load_defaults(&self, tier: SizeTier) -> pocket_diffusion_common::Result<LoadedModules> {
        if !self.silent {
            info!(
                "loading {tier} models from {} with the {} runtime",
                self.assets,
                self.loader.name()
            );
        }
        Ok(LoadedModules::new(
            self.load_default_role(Role::TextEncoder, tier)?,
            self.load_default_role(Role::Denoiser, tier)?,
            self.load_default_role(Role::Decoder, tier)?,
        ))
    }

    fn substitute_defaults(
        &self,
        path: &Path,
        tier: SizeTier,
        reason: FallbackReason,
    ) -> pocket_diffusion_common::Result<(LoadedModules, LoadOutcome)> {
        warn!(
            "using bundled models instead of {}: {reason}",
            path.display()
        );
        let modules = self.load_defaults(tier)?;
        Ok((
            modules,
            LoadOutcome::SubstitutedDefaults {
                path: path.to_path_buf(),
                reason,
            },
        ))
    }

    /// There is no interchange runtime yet, so interchange models always resolve to the bundled set.
    fn load_interchange(
        &self,
        model: &Path,
        requested: &Path,
        tier: SizeTier,
    ) -> pocket_diffusion_common::Result<(LoadedModules, LoadOutcome)> {
        if !self.silent {
            info!("interchange model at {}", model.display());
        }
        self.substitute_defaults(requested, tier, FallbackReason::InterchangeUnavailable)
    }

    fn load_custom(
        &self,
        path: &Path,
        tier: SizeTier,
    ) -> pocket_diffusion_common::Result<(LoadedModules, LoadOutcome)> {
        if !path.is_file() {
            return Err(Error::ModelFileNotFound(path.to_path_buf()));
        }
        let format = ModelFormat::from_path(path);
        if !self.silent {
            info!("loading custom {format} model from {}", path.display());
        }
        let models_dir = self.models_dir();
        fs::create_dir_all(&models_dir)?;

        match format {
            ModelFormat::Safetensors => {
                let converted = match self.converter.convert(path, &models_dir) {
                    Ok(converted) => converted,
                    Err(e) => {
                        warn!("safetensors conversion failed: {e}");
                        None
                    }
                };
                match converted {
                    Some(converted) => self.load_interchange(&converted, path, tier),
                    None => {
                        self.substitute_defaults(path, tier, FallbackReason::ConversionUnavailable)
                    }
                }
            }
            // The checkpoint only ever fills the text encoder slot; denoiser and decoder come from the bundle.
            ModelFormat::NativeCheckpoint => match self.loader.load(Role::TextEncoder, path) {
                Ok(text_encoder) => {
                    if !self.silent {
                        info!("checkpoint loaded as {}", Role::TextEncoder);
                    }
                    let modules = LoadedModules::new(
                        text_encoder,
                        self.load_default_role(Role::Denoiser, tier)?,
                        self.load_default_role(Role::Decoder, tier)?,
                    );
                    Ok((
                        modules,
                        LoadOutcome::CustomOverride {
                            path: path.to_path_buf(),
                            roles: vec![Role::TextEncoder],
                        },
                    ))
                }
                Err(e) if e.is_out_of_memory() => Err(e),
                Err(e) => self.substitute_defaults(
                    path,
                    tier,
                    FallbackReason::CheckpointLoadFailed(e.to_string()),
                ),
            },
            ModelFormat::Interchange => self.load_interchange(path, path, tier),
            ModelFormat::Checkpoint | ModelFormat::Binary | ModelFormat::Unknown => {
                self.substitute_defaults(path, tier, FallbackReason::UnsupportedFormat(format))
            }
        }
    }
}

impl ModelManager {
    pub fn new(config: ModelManagerConfig) -> Self {
        let ModelManagerConfig {
            loader,
            assets,
            converter,
            cache_dir,
            size_tier,
            custom_model_path,
            silent,
        } = config;
        Self {
            shared: Arc::new(Shared {
                inner: Mutex::new(Inner {
                    state: ModelState::Unloaded,
                    size_tier,
                    custom_model_path,
                    leases: 0,
                    pending_unloads: 0,
                }),
                released: Condvar::new(),
                loader,
                assets,
                converter,
                cache_dir,
                silent,
            }),
        }
    }

    /// Load the modules for the current size tier and custom model, unless they are already loaded.
    ///
    /// On failure nothing stays loaded. Custom models that cannot be used are replaced by the bundled
    /// modules, which is reported through [`LoadOutcome::SubstitutedDefaults`] rather than as an error.
    pub fn ensure_loaded(&self) -> Result<LoadOutcome> {
        let mut inner = self.shared.lock();
        if let ModelState::Loaded { outcome, .. } = &inner.state {
            return Ok(outcome.clone());
        }

        let tier = inner.size_tier;
        let start = Instant::now();
        if !self.shared.silent {
            info!("loading models: {tier} size");
        }
        let loaded = match inner.custom_model_path.clone() {
            Some(path) if ModelFormat::from_path(&path).is_supported() => {
                self.shared.load_custom(&path, tier)
            }
            Some(path) => {
                let format = ModelFormat::from_path(&path);
                self.shared
                    .substitute_defaults(&path, tier, FallbackReason::UnsupportedFormat(format))
            }
            None => self
                .shared
                .load_defaults(tier)
                .map(|modules| (modules, LoadOutcome::Default)),
        };

        match loaded {
            Ok((modules, outcome)) => {
                if !self.shared.silent {
                    info!(
                        "models loaded in {:.2}s: {outcome}",
                        start.elapsed().as_secs_f32()
                    );
                }
                inner.state = ModelState::Loaded {
                    modules: Arc::new(modules),
                    outcome: outcome.clone(),
                };
                Ok(outcome)
            }
            Err(e) => {
                if e.is_out_of_memory() {
                    error!("out of memory loading models: {e}");
                } else {
                    error!("error loading models: {e}");
                }
                self.shared.release(&mut inner);
                Err(DiffusionError::ModelLoad(e))
            }
        }
    }

    /// Release all modules, waiting for outstanding leases first. New leases are refused while waiting.
    /// Calling this when nothing is loaded is a no-op apart from the memory trim request.
    pub fn unload(&self) {
        let mut inner = self.shared.lock();
        inner.pending_unloads += 1;
        while inner.leases > 0 {
            if !self.shared.silent {
                info!("waiting for {} generation(s) before unloading", inner.leases);
            }
            inner = self
                .shared
                .released
                .wait(inner)
                .unwrap_or_else(PoisonError::into_inner);
        }
        inner.pending_unloads -= 1;
        self.shared.release(&mut inner);
    }

    /// Like [`ModelManager::unload`] but refuses instead of waiting while leases are outstanding.
    pub fn try_unload(&self) -> Result<()> {
        let mut inner = self.shared.lock();
        if inner.leases > 0 {
            return Err(DiffusionError::ModulesInUse {
                leases: inner.leases,
            });
        }
        self.shared.release(&mut inner);
        Ok(())
    }

    /// Reserve the loaded modules. Fails with [`DiffusionError::ModelNotLoaded`] when nothing is loaded or
    /// a call to [`ModelManager::unload`] is waiting for the modules to be returned.
    pub fn lease(&self) -> Result<ModuleLease> {
        let mut inner = self.shared.lock();
        if inner.pending_unloads > 0 {
            return Err(DiffusionError::ModelNotLoaded(None));
        }
        let modules = match &inner.state {
            ModelState::Loaded { modules, .. } => modules.clone(),
            ModelState::Unloaded => return Err(DiffusionError::ModelNotLoaded(None)),
        };
        inner.leases += 1;
        Ok(ModuleLease {
            modules,
            shared: self.shared.clone(),
        })
    }

    /// Returns `true` if the tier changed, in which case the next `ensure_loaded` reloads.
    pub fn set_size_tier(&self, tier: SizeTier) -> bool {
        let mut inner = self.shared.lock();
        if inner.size_tier == tier {
            return false;
        }
        inner.size_tier = tier;
        inner.state = ModelState::Unloaded;
        true
    }

    /// Returns `true` if the path changed, in which case the next `ensure_loaded` reloads.
    pub fn set_custom_model_path(&self, path: Option<PathBuf>) -> bool {
        let mut inner = self.shared.lock();
        if inner.custom_model_path == path {
            return false;
        }
        inner.custom_model_path = path;
        inner.state = ModelState::Unloaded;
        true
    }

    pub fn size_tier(&self) -> SizeTier {
        self.shared.lock().size_tier
    }

    pub fn custom_model_path(&self) -> Option<PathBuf> {
        self.shared.lock().custom_model_path.clone()
    }

    pub fn is_loaded(&self) -> bool {
        matches!(self.shared.lock().state, ModelState::Loaded { .. })
    }

    /// What the current module set was loaded from, if anything is loaded.
    pub fn load_outcome(&self) -> Option<LoadOutcome> {
        match &self.shared.lock().state {
            ModelState::Loaded { outcome, .. } => Some(outcome.clone()),
            ModelState::Unloaded => None,
        }
    }

    pub fn lease_count(&self) -> usize {
        self.shared.lock().leases
    }

    /// Whether a call to [`ModelManager::unload`] is waiting for leases.
    pub fn is_unload_pending(&self) -> bool {
        self.shared.lock().pending_unloads > 0
    }

    pub fn models_dir(&self) -> PathBuf {
        self.shared.models_dir()
    }

    /// Import an external model file into the model cache, select it and load it.
    pub fn load_model_from_file(&self, source: &Path) -> Result<LoadOutcome> {
        let models_dir = self.models_dir();
        fs::create_dir_all(&models_dir)?;
        let file_name = source.file_name().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("{} has no file name", source.display()),
            )
        })?;
        let target = models_dir.join(file_name);
        if source != target {
            fs::copy(source, &target)?;
        }
        {
            // The file may have changed even if the path did not, so always reload.
            let mut inner = self.shared.lock();
            inner.custom_model_path = Some(target);
            inner.state = ModelState::Unloaded;
        }
        self.ensure_loaded()
    }

    /// Delete the imported and converted models. Returns `false` if there was no cache to clear.
    pub fn clear_model_cache(&self) -> Result<bool> {
        let dir = self.models_dir();
        if !dir.is_dir() {
            return Ok(false);
        }
        for entry in fs::read_dir(&dir)? {
            let path = entry?.path();
            if path.is_file() {
                fs::remove_file(path)?;
            }
        }
        if !self.shared.silent {
            info!("model cache cleared");
        }
        Ok(true)
    }

    pub fn list_available_custom_models(
        &self,
        dir: &Path,
    ) -> pocket_diffusion_common::Result<Vec<ModelFileInfo>> {
        find_models_in_directory(dir)
    }
}

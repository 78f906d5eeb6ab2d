#![allow(dead_code)]

use std::{
    fs, io,
    path::{Path, PathBuf},
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex,
    },
};

use candle_core::Tensor;
use pocket_diffusion_backend::ConstantLoader;
use pocket_diffusion_common::{
    DirAssets, Error, InferenceModule, ModuleInputs, ModuleLoader, Result, Role,
};
use pocket_diffusion_core::{asset_name, ModelManager, ModelManagerConfig, SizeTier};

pub fn temp_dir(name: &str) -> PathBuf {
    static COUNTER: AtomicUsize = AtomicUsize::new(0);
    let dir = std::env::temp_dir().join(format!(
        "pocket_diffusion_{name}_{}_{}",
        std::process::id(),
        COUNTER.fetch_add(1, Ordering::Relaxed)
    ));
    let _ = fs::remove_dir_all(&dir);
    fs::create_dir_all(&dir).unwrap();
    dir
}

/// Write a blob for every role and tier.
pub fn write_bundled_assets(dir: &Path) {
    for tier in [SizeTier::Small, SizeTier::Medium, SizeTier::Large] {
        for role in Role::ALL {
            fs::write(dir.join(asset_name(role, tier, "ptl")), b"blob").unwrap();
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub enum Failure {
    Io,
    OutOfMemory,
    Runtime,
}

impl Failure {
    fn error(self) -> Error {
        match self {
            Self::Io => Error::Io(io::Error::new(io::ErrorKind::Other, "read failed")),
            Self::OutOfMemory => Error::OutOfMemory("module buffers".to_string()),
            Self::Runtime => Error::Runtime("unsupported operator".to_string()),
        }
    }
}

struct Rule {
    role: Option<Role>,
    suffix: Option<&'static str>,
    failure: Failure,
}

struct BrokenModule(Role);

impl InferenceModule for BrokenModule {
    fn forward(&self, _inputs: ModuleInputs) -> Result<Tensor> {
        Err(Error::Runtime(format!("{} exploded", self.0)))
    }
}

/// Constant-output loader which counts loads and memory trims and can be told to fail.
pub struct TestLoader {
    inner: ConstantLoader,
    loads: AtomicUsize,
    trims: AtomicUsize,
    rules: Mutex<Vec<Rule>>,
    broken: Mutex<Option<Role>>,
}

impl TestLoader {
    pub fn new(value: f32) -> Arc<Self> {
        Arc::new(Self {
            inner: ConstantLoader::new(value),
            loads: AtomicUsize::new(0),
            trims: AtomicUsize::new(0),
            rules: Mutex::new(Vec::new()),
            broken: Mutex::new(None),
        })
    }

    pub fn fail_role(&self, role: Role, failure: Failure) {
        self.rules.lock().unwrap().push(Rule {
            role: Some(role),
            suffix: None,
            failure,
        });
    }

    pub fn fail_path(&self, suffix: &'static str, failure: Failure) {
        self.rules.lock().unwrap().push(Rule {
            role: None,
            suffix: Some(suffix),
            failure,
        });
    }

    pub fn heal(&self) {
        self.rules.lock().unwrap().clear();
    }

    /// Modules loaded for `role` from now on fail every forward call.
    pub fn break_forward(&self, role: Role) {
        *self.broken.lock().unwrap() = Some(role);
    }

    pub fn loads(&self) -> usize {
        self.loads.load(Ordering::SeqCst)
    }

    pub fn trims(&self) -> usize {
        self.trims.load(Ordering::SeqCst)
    }
}

impl ModuleLoader for TestLoader {
    fn name(&self) -> &'static str {
        "test"
    }

    fn load(&self, role: Role, path: &Path) -> Result<Box<dyn InferenceModule>> {
        self.loads.fetch_add(1, Ordering::SeqCst);
        let path_str = path.to_string_lossy();
        for rule in self.rules.lock().unwrap().iter() {
            let role_matches = rule.role.map_or(true, |r| r == role);
            let path_matches = rule.suffix.map_or(true, |s| path_str.ends_with(s));
            if role_matches && path_matches {
                return Err(rule.failure.error());
            }
        }
        if *self.broken.lock().unwrap() == Some(role) {
            return Ok(Box::new(BrokenModule(role)));
        }
        self.inner.load(role, path)
    }

    fn trim_memory(&self) {
        self.trims.fetch_add(1, Ordering::SeqCst);
    }
}

/// Collects formatted log output so tests can inspect what was logged.
#[derive(Clone, Default)]
pub struct LogCapture(Arc<Mutex<Vec<u8>>>);

impl LogCapture {
    /// Run `f` with a subscriber writing into this capture.
    pub fn run<T>(&self, f: impl FnOnce() -> T) -> T {
        let writer = self.clone();
        let subscriber = tracing_subscriber::fmt()
            .with_writer(move || writer.clone())
            .with_max_level(tracing::Level::DEBUG)
            .with_ansi(false)
            .finish();
        tracing::subscriber::with_default(subscriber, f)
    }

    pub fn output(&self) -> String {
        String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
    }
}

impl io::Write for LogCapture {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.0.lock().unwrap().extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct Fixture {
    pub root: PathBuf,
    pub assets: PathBuf,
    pub cache: PathBuf,
    pub loader: Arc<TestLoader>,
    pub manager: ModelManager,
}

impl Fixture {
    pub fn new(name: &str) -> Self {
        Self::with_fill(name, 0.)
    }

    pub fn with_fill(name: &str, value: f32) -> Self {
        let root = temp_dir(name);
        let assets = root.join("assets");
        let cache = root.join("cache");
        fs::create_dir_all(&assets).unwrap();
        write_bundled_assets(&assets);
        let loader = TestLoader::new(value);
        let mut config = ModelManagerConfig::new(
            loader.clone(),
            Arc::new(DirAssets::new(&assets)),
            &cache,
        );
        config.silent = true;
        Self {
            root,
            assets,
            cache,
            loader,
            manager: ModelManager::new(config),
        }
    }

    /// Create a file under the fixture root.
    pub fn file(&self, name: &str, contents: &[u8]) -> PathBuf {
        let path = self.root.join(name);
        fs::write(&path, contents).unwrap();
        path
    }
}

impl Drop for Fixture {
    fn drop(&mut self) {
        let _ = fs::remove_dir_all(&self.root);
    }
}

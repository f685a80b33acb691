#![allow(dead_code)]

use async_trait::async_trait;
use kiln::core::*;
use kiln::infrastructure::WorkerContext;
use kiln::utils::{normalize_path, KilnError, Result};
use parking_lot::{Mutex, RwLock};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;

pub fn p(path: &str) -> PathBuf {
    PathBuf::from(path)
}

struct FakeFile {
    content: String,
    deps: Vec<Dependency>,
    fail: Option<String>,
}

/// In-memory source tree acting as both resolver and compiler
#[derive(Default)]
pub struct Project {
    files: RwLock<HashMap<PathBuf, FakeFile>>,
    compiles: Mutex<HashMap<PathBuf, usize>>,
    hook: Mutex<Option<CompileHook>>,
}

type CompileHook = Arc<dyn Fn(&Path) + Send + Sync>;

impl Project {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn file(&self, path: &str, content: &str, deps: Vec<Dependency>) {
        self.files.write().insert(
            p(path),
            FakeFile {
                content: content.to_string(),
                deps,
                fail: None,
            },
        );
    }

    pub fn edit(&self, path: &str, content: &str) {
        if let Some(file) = self.files.write().get_mut(&p(path)) {
            file.content = content.to_string();
        }
    }

    pub fn set_deps(&self, path: &str, deps: Vec<Dependency>) {
        if let Some(file) = self.files.write().get_mut(&p(path)) {
            file.deps = deps;
        }
    }

    pub fn fail(&self, path: &str, message: Option<&str>) {
        if let Some(file) = self.files.write().get_mut(&p(path)) {
            file.fail = message.map(str::to_string);
        }
    }

    pub fn compile_count(&self, path: &str) -> usize {
        self.compiles.lock().get(&p(path)).copied().unwrap_or(0)
    }

    /// Run `hook` after every compile has read its source
    pub fn on_compile(&self, hook: impl Fn(&Path) + Send + Sync + 'static) {
        *self.hook.lock() = Some(Arc::new(hook));
    }

    pub fn total_compiles(&self) -> usize {
        self.compiles.lock().values().sum()
    }
}

fn kind_of(path: &Path) -> AssetKind {
    match path.extension().and_then(|e| e.to_str()) {
        Some("css") | Some("less") => AssetKind::css(),
        _ => AssetKind::js(),
    }
}

#[async_trait]
impl Resolver for Project {
    async fn resolve(&self, specifier: &str, from: Option<&Path>) -> Result<ResolvedModule> {
        let path = match from.and_then(Path::parent) {
            Some(dir) if !specifier.starts_with('/') => normalize_path(&dir.join(specifier)),
            _ => p(specifier),
        };

        if self.files.read().contains_key(&path) {
            Ok(ResolvedModule {
                path,
                package: Arc::new(PackageMetadata::default()),
            })
        } else {
            Err(KilnError::module_not_found(specifier, from.unwrap_or(Path::new("/"))))
        }
    }
}

impl Compiler for Project {
    fn compile(&self, path: &Path, _package: &PackageMetadata, _options: &BuildOptions) -> Result<CompiledUnit> {
        *self.compiles.lock().entry(path.to_path_buf()).or_insert(0) += 1;

        let (content, deps) = {
            let files = self.files.read();
            let file = files
                .get(path)
                .ok_or_else(|| KilnError::compile("file vanished", path))?;
            if let Some(message) = &file.fail {
                return Err(KilnError::compile(message.clone(), path));
            }
            (file.content.clone(), file.deps.clone())
        };

        let hook = self.hook.lock().clone();
        if let Some(hook) = hook {
            hook(path);
        }

        let mut generated = BTreeMap::new();
        generated.insert(kind_of(path), content.clone());
        Ok(CompiledUnit {
            generated,
            hash: blake3::hash(content.as_bytes()).to_hex().to_string(),
            dependencies: deps,
        })
    }
}

#[derive(Default)]
pub struct RecordingWatcher {
    watched: Mutex<HashSet<PathBuf>>,
    closed: Mutex<bool>,
}

impl RecordingWatcher {
    pub fn is_watching(&self, path: &str) -> bool {
        self.watched.lock().contains(&p(path))
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.lock()
    }
}

impl FileWatcher for RecordingWatcher {
    fn add(&self, path: &Path) -> Result<()> {
        self.watched.lock().insert(path.to_path_buf());
        Ok(())
    }

    fn unwatch(&self, path: &Path) -> Result<()> {
        self.watched.lock().remove(path);
        Ok(())
    }

    fn close(&self) {
        *self.closed.lock() = true;
    }
}

#[derive(Default)]
pub struct RecordingPackager {
    written: Mutex<Vec<PackagedBundle>>,
}

impl RecordingPackager {
    /// Bundles written since the last call
    pub fn take(&self) -> Vec<PackagedBundle> {
        std::mem::take(&mut *self.written.lock())
    }
}

#[async_trait]
impl Packager for RecordingPackager {
    async fn package(&self, bundle: &PackagedBundle) -> Result<()> {
        self.written.lock().push(bundle.clone());
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingHmr {
    pub updates: Mutex<Vec<Vec<PathBuf>>>,
    pub errors: Mutex<Vec<String>>,
}

#[async_trait]
impl HmrNotifier for RecordingHmr {
    async fn emit_update(&self, assets: Vec<HmrAsset>) {
        self.updates.lock().push(assets.into_iter().map(|a| a.id).collect());
    }

    async fn emit_error(&self, error: &KilnError) {
        self.errors.lock().push(error.to_string());
    }

    fn stop(&self) {}
}

pub struct Harness {
    pub bundler: Bundler,
    pub project: Arc<Project>,
    pub packager: Arc<RecordingPackager>,
    pub watcher: Arc<RecordingWatcher>,
    pub out_dir: tempfile::TempDir,
}

impl Harness {
    pub fn out(&self, name: &str) -> PathBuf {
        self.out_dir.path().join(name)
    }
}

/// Bundler over `project` with recording collaborators, no persistent cache
/// and a watcher attached so workers survive between passes
pub fn harness(project: &Arc<Project>, entry: &str) -> Harness {
    let out_dir = tempfile::tempdir().unwrap();
    let packager = Arc::new(RecordingPackager::default());
    let watcher = Arc::new(RecordingWatcher::default());

    let options = BundlerOptions {
        out_dir: Some(out_dir.path().to_path_buf()),
        cache: Some(false),
        log_level: Some(0),
        ..Default::default()
    };

    let bundler = Bundler::new(entry, options)
        .with_resolver(project.clone())
        .with_compiler(project.clone())
        .with_default_packager(packager.clone())
        .with_watcher(watcher.clone())
        .with_worker_context(Arc::new(WorkerContext::with_workers(2)));
    bundler.add_packager(AssetKind::css(), packager.clone()).unwrap();

    Harness {
        bundler,
        project: project.clone(),
        packager,
        watcher,
        out_dir,
    }
}

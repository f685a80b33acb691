//! Build orchestration and lifecycle.
//!
//! A pass drains the rebuild queue (loading newly discovered assets as it
//! goes), rebuilds the bundle tree from the entry asset, packages the bundles
//! whose content changed and drops assets no bundle references any more.
//! Passes never overlap; change notifications are debounced into passes.

use crate::core::asset::{AssetGraph, AssetId};
use crate::core::bundle::BuildReport;
use crate::core::interfaces::*;
use crate::core::models::*;
use crate::core::registry::{PackagerRegistry, ParserRegistry};
use crate::core::tree_builder::BundleTreeBuilder;
use crate::infrastructure::{
    ConcatPackager, CssPackager, MemoryCache, NodeResolver, PersistentCache, SourceCompiler,
    TokioFileSystemService, WorkerContext, WorkerFarm,
};
use crate::utils::{normalize_path, ErrorContext, KilnError, Logger, Result, StatusLine, Timer};
use futures::future::{join_all, try_join_all, BoxFuture};
use futures::FutureExt;
use indexmap::IndexSet;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{broadcast, mpsc::UnboundedReceiver};

/// Quiet period after the last change notification before a rebuild starts
pub const REBUILD_DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Default)]
struct BuildState {
    graph: AssetGraph,
    /// Assets waiting to be (re)loaded
    queue: IndexSet<AssetId>,
    main_asset: Option<AssetId>,
    bundle_hashes: Option<HashMap<PathBuf, String>>,
}

pub struct Bundler {
    entry: PathBuf,
    options: Arc<BuildOptions>,
    resolver: Arc<dyn Resolver>,
    cache: Option<Arc<dyn ContentCache>>,
    watcher: Option<Arc<dyn FileWatcher>>,
    hmr: Option<Arc<dyn HmrNotifier>>,
    delegate: Option<Arc<dyn BuildDelegate>>,
    parsers: RwLock<ParserRegistry>,
    packagers: RwLock<PackagerRegistry>,
    /// Set by the first pass; freezes both registries
    started: AtomicBool,
    farm: Mutex<Option<Arc<WorkerFarm>>>,
    workers: Arc<WorkerContext>,
    state: Mutex<BuildState>,
    build_lock: tokio::sync::Mutex<()>,
    pending: AtomicBool,
    errored: AtomicBool,
    events: broadcast::Sender<BuildEvent>,
    rebuild_generation: AtomicU64,
    status: StatusLine,
}

impl Bundler {
    pub fn new(entry: impl AsRef<Path>, options: BundlerOptions) -> Self {
        let options = Arc::new(BuildOptions::normalize(options));
        let entry = absolute(entry.as_ref());
        let root = entry.parent().map(Path::to_path_buf).unwrap_or_else(|| PathBuf::from("/"));

        let cache: Option<Arc<dyn ContentCache>> = if options.cache {
            match PersistentCache::open(&options.cache_dir) {
                Ok(cache) => Some(Arc::new(cache)),
                Err(e) => {
                    Logger::warn(&format!("{}; falling back to an in-memory cache", e));
                    Some(Arc::new(MemoryCache::new()))
                }
            }
        } else {
            None
        };

        let fs: Arc<dyn FileSystemService> = Arc::new(TokioFileSystemService);
        let mut packagers = PackagerRegistry::new(Arc::new(ConcatPackager::new(fs.clone())));
        packagers.register(AssetKind::css(), Arc::new(CssPackager::new(fs)));

        let (events, _) = broadcast::channel(64);

        Self {
            entry,
            status: StatusLine::new(options.log_level),
            options,
            resolver: Arc::new(NodeResolver::new(root)),
            cache,
            watcher: None,
            hmr: None,
            delegate: None,
            parsers: RwLock::new(ParserRegistry::new(Arc::new(SourceCompiler::new()))),
            packagers: RwLock::new(packagers),
            started: AtomicBool::new(false),
            farm: Mutex::new(None),
            workers: Arc::new(WorkerContext::new()),
            state: Mutex::new(BuildState::default()),
            build_lock: tokio::sync::Mutex::new(()),
            pending: AtomicBool::new(false),
            errored: AtomicBool::new(false),
            events,
            rebuild_generation: AtomicU64::new(0),
        }
    }

    pub fn with_resolver(mut self, resolver: Arc<dyn Resolver>) -> Self {
        self.resolver = resolver;
        self
    }

    /// Replace the default compiler for every extension without a custom one
    pub fn with_compiler(mut self, compiler: Arc<dyn Compiler>) -> Self {
        self.parsers.get_mut().set_fallback(compiler);
        self
    }

    pub fn with_cache(mut self, cache: Option<Arc<dyn ContentCache>>) -> Self {
        self.cache = cache;
        self
    }

    pub fn with_watcher(mut self, watcher: Arc<dyn FileWatcher>) -> Self {
        self.watcher = Some(watcher);
        self
    }

    pub fn with_hmr(mut self, hmr: Arc<dyn HmrNotifier>) -> Self {
        self.hmr = Some(hmr);
        self
    }

    pub fn with_delegate(mut self, delegate: Arc<dyn BuildDelegate>) -> Self {
        self.delegate = Some(delegate);
        self
    }

    /// Packager for kinds without a registered one
    pub fn with_default_packager(mut self, packager: Arc<dyn Packager>) -> Self {
        self.packagers.get_mut().set_fallback(packager);
        self
    }

    pub fn with_worker_context(mut self, workers: Arc<WorkerContext>) -> Self {
        self.workers = workers;
        self
    }

    pub fn add_asset_type(&self, extension: &str, kind: AssetKind, compiler: Arc<dyn Compiler>) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(KilnError::config("Asset types must be added before bundling."));
        }
        self.parsers.write().register(extension, kind, compiler);
        Ok(())
    }

    pub fn add_packager(&self, kind: AssetKind, packager: Arc<dyn Packager>) -> Result<()> {
        if self.started.load(Ordering::SeqCst) {
            return Err(KilnError::config("Packagers must be added before bundling."));
        }
        self.packagers.write().register(kind, packager);
        Ok(())
    }

    pub fn subscribe(&self) -> broadcast::Receiver<BuildEvent> {
        self.events.subscribe()
    }

    pub fn entry(&self) -> &Path {
        &self.entry
    }

    pub fn options(&self) -> &BuildOptions {
        &self.options
    }

    pub fn is_pending(&self) -> bool {
        self.pending.load(Ordering::SeqCst)
    }

    pub fn is_errored(&self) -> bool {
        self.errored.load(Ordering::SeqCst)
    }

    /// Identities of every asset currently in the graph, sorted
    pub fn asset_paths(&self) -> Vec<PathBuf> {
        let state = self.state.lock();
        let mut paths: Vec<PathBuf> = state.graph.iter().map(|n| n.identity.clone()).collect();
        paths.sort();
        paths
    }

    /// Identities of the assets waiting for the next pass, in queue order
    pub fn queued_assets(&self) -> Vec<PathBuf> {
        let state = self.state.lock();
        state
            .queue
            .iter()
            .filter_map(|id| state.graph.get(*id))
            .map(|n| n.identity.clone())
            .collect()
    }

    /// Run one build pass. A call made while another pass is running waits
    /// for it and then runs a fresh pass of its own.
    pub async fn bundle(&self) -> Result<BuildReport> {
        let _flight = self.build_lock.lock().await;

        let initial = self.state.lock().main_asset.is_none();
        let started_at = Instant::now();
        self.pending.store(true, Ordering::SeqCst);
        self.errored.store(false, Ordering::SeqCst);
        let _ = self.events.send(BuildEvent::BuildStart);
        self.status.building(None);

        let result = self.run_pass(initial).await;

        match &result {
            Ok(report) => {
                self.status.built(started_at.elapsed());
                Logger::pass_complete(self.state.lock().graph.len(), report.bundles.len(), started_at.elapsed());
                let _ = self.events.send(BuildEvent::Bundled {
                    bundles: report.bundles.iter().map(|b| b.name.clone()).collect(),
                });
            }
            Err(e) => {
                self.errored.store(true, Ordering::SeqCst);
                Logger::error(&e.format_detailed());
                self.status.failed(&e.to_string());
                if let Some(hmr) = &self.hmr {
                    hmr.emit_error(e).await;
                }
            }
        }

        self.pending.store(false, Ordering::SeqCst);
        let _ = self.events.send(BuildEvent::BuildEnd {
            errored: result.is_err(),
        });

        // One-shot builds must not keep worker threads alive
        if self.watcher.is_none() && self.options.kill_workers {
            self.stop();
        }

        result
    }

    async fn run_pass(&self, initial: bool) -> Result<BuildReport> {
        self.start();

        if initial {
            Logger::build_start(&self.entry.display().to_string(), &self.options.out_dir.display().to_string());
            tokio::fs::create_dir_all(&self.options.out_dir).await?;

            let entry = self.entry.to_string_lossy().to_string();
            let module = self.resolver.resolve(&entry, None).await?;
            let mut state = self.state.lock();
            let (id, _) = self.insert_asset(&mut state.graph, module);
            state.main_asset = Some(id);
            state.queue.insert(id);
        }

        self.build_queued_assets(initial).await
    }

    /// Start the worker farm. Runs once; later calls are no-ops.
    pub fn start(&self) {
        if self.started.swap(true, Ordering::SeqCst) {
            return;
        }

        let compiler: Arc<dyn Compiler> = Arc::new(self.parsers.read().clone());
        let farm = self.workers.get_shared(compiler, self.options.clone());
        *self.farm.lock() = Some(farm);
    }

    /// Tear down the worker farm, the watcher and the HMR notifier.
    /// Compiles issued afterwards run on the calling task.
    pub fn stop(&self) {
        if self.farm.lock().is_some() {
            self.workers.end();
        }
        if let Some(watcher) = &self.watcher {
            watcher.close();
        }
        if let Some(hmr) = &self.hmr {
            hmr.stop();
        }
    }

    async fn build_queued_assets(&self, initial: bool) -> Result<BuildReport> {
        let _timer = Timer::start("build queued assets");
        let mut loaded: IndexSet<AssetId> = IndexSet::new();

        loop {
            // Changes queued while this batch compiles land in the next one
            let batch: Vec<(AssetId, PathBuf)> = {
                let mut guard = self.state.lock();
                let BuildState { graph, queue, .. } = &mut *guard;
                queue
                    .drain(..)
                    .filter_map(|id| {
                        let node = graph.get_mut(id)?;
                        if !initial {
                            node.invalidate();
                        }
                        Some((id, node.identity.clone()))
                    })
                    .collect()
            };

            if batch.is_empty() {
                break;
            }

            if !initial {
                if let Some(cache) = &self.cache {
                    for (_, identity) in &batch {
                        if let Err(e) = cache.invalidate(identity).await {
                            Logger::debug(&format!("Cache invalidation failed: {}", e));
                        }
                    }
                }
            }

            loaded.extend(batch.iter().map(|(id, _)| *id));
            let results = join_all(batch.iter().map(|(id, _)| self.load_asset(*id))).await;
            first_error(results)?;
        }

        if let Some(hmr) = &self.hmr {
            if !initial {
                let assets = {
                    let state = self.state.lock();
                    let mut changed: IndexSet<AssetId> = state.graph.orphans().into_iter().collect();
                    changed.extend(loaded.iter().copied());
                    changed
                        .into_iter()
                        .filter_map(|id| state.graph.to_hmr_asset(id))
                        .collect::<Vec<_>>()
                };
                hmr.emit_update(assets).await;
            }
        }

        let (tree, plan) = {
            let mut guard = self.state.lock();
            let state = &mut *guard;
            let main = state
                .main_asset
                .ok_or_else(|| KilnError::build("Entry asset is not loaded"))?;

            for node in state.graph.iter_mut() {
                node.invalidate_bundle();
            }
            let tree = BundleTreeBuilder::new(&mut state.graph, &self.options.out_dir).build(main);
            let plan = tree.plan_packaging(&state.graph, state.bundle_hashes.as_ref());
            (tree, plan)
        };

        let packagers = self.packagers.read().clone();
        packagers.package_all(&plan.changed).await?;
        let packaged: Vec<PathBuf> = plan.changed.iter().map(|b| b.name.clone()).collect();

        let mut guard = self.state.lock();
        let state = &mut *guard;
        state.bundle_hashes = Some(plan.hashes);
        self.unload_orphans(state);

        Ok(BuildReport::new(&tree, &state.graph, packaged))
    }

    fn unload_orphans(&self, state: &mut BuildState) {
        for id in state.graph.orphans() {
            if let Some(node) = state.graph.get(id) {
                Logger::debug(&format!("Unloading {}", node.identity.display()));
            }
            for path in state.graph.remove(id) {
                self.unwatch(&path);
            }
            state.queue.shift_remove(&id);
        }
    }

    fn load_asset(&self, id: AssetId) -> BoxFuture<'_, Result<()>> {
        async move {
            let claimed = {
                let mut guard = self.state.lock();
                let state = &mut *guard;
                match state.graph.get_mut(id) {
                    Some(node) if node.dirty => {
                        // Claimed before the first await: one compile per pass
                        node.dirty = false;
                        Some((node.identity.clone(), node.package.clone(), node.kind.clone()))
                    }
                    _ => None,
                }
            };

            let Some((identity, package, kind)) = claimed else {
                return Ok(());
            };

            if !self.is_errored() {
                self.status.building(Some(&crate::utils::basename(&identity)));
            }

            match self.process_asset(id, &identity, package, &kind).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    // Retry on the next pass
                    let mut guard = self.state.lock();
                    let state = &mut *guard;
                    if let Some(node) = state.graph.get_mut(id) {
                        node.dirty = true;
                    }
                    state.queue.insert(id);
                    Err(e)
                }
            }
        }
        .boxed()
    }

    async fn process_asset(
        &self,
        id: AssetId,
        identity: &Path,
        package: Arc<PackageMetadata>,
        kind: &AssetKind,
    ) -> Result<()> {
        Logger::loading_asset(&identity.display().to_string());

        let (unit, fresh) = match self.read_cache(identity).await {
            Some(unit) => {
                Logger::cache_hit(&identity.display().to_string());
                (unit, false)
            }
            None => {
                let farm = self
                    .farm
                    .lock()
                    .clone()
                    .ok_or_else(|| KilnError::build("Worker farm is not running"))?;
                let unit = farm
                    .run(CompileRequest {
                        path: identity.to_path_buf(),
                        package,
                        options: self.options.clone(),
                    })
                    .await?;
                (unit, true)
            }
        };

        let mut dependencies = unit.dependencies.clone();
        if let Some(delegate) = &self.delegate {
            if let Some(implicit) = delegate.implicit_dependencies(identity, kind).await? {
                dependencies.extend(implicit);
            }
        }

        {
            let mut state = self.state.lock();
            if let Some(node) = state.graph.get_mut(id) {
                node.compiled = Some(unit.generated.clone());
                node.content_hash = Some(unit.hash.clone());
            }
        }

        let resolved = try_join_all(dependencies.iter().map(|dep| self.resolve_dep(identity, dep))).await?;

        if fresh {
            let inlined: Vec<PathBuf> = dependencies
                .iter()
                .zip(&resolved)
                .filter(|(dep, _)| dep.included_in_parent)
                .map(|(_, module)| module.path.clone())
                .collect();
            self.write_cache(identity, &unit, &inlined).await;
        }

        // Record edges in declaration order so bundle placement is stable
        let mut children = Vec::new();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            for (dep, module) in dependencies.into_iter().zip(resolved) {
                if dep.included_in_parent {
                    // Already inlined: route its changes to this asset instead
                    if state.graph.alias(&module.path, id) {
                        self.watch(&module.path);
                    }
                    continue;
                }

                let (dep_id, _) = self.insert_asset(&mut state.graph, module);
                if let Some(node) = state.graph.get_mut(id) {
                    node.resolved.insert(dep.specifier.clone(), dep_id);
                    node.dependencies.insert(dep.specifier.clone(), dep);
                }
                children.push(dep_id);
            }
        }

        first_error(join_all(children.into_iter().map(|child| self.load_asset(child))).await)
    }

    async fn write_cache(&self, identity: &Path, unit: &CompiledUnit, inlined: &[PathBuf]) {
        if let Some(cache) = &self.cache {
            if let Err(e) = cache.write(identity, unit, inlined).await {
                Logger::debug(&format!("Cache write failed: {}", e));
            }
        }
    }

    async fn read_cache(&self, identity: &Path) -> Option<CompiledUnit> {
        let cache = self.cache.as_ref()?;
        match cache.read(identity).await {
            Ok(unit) => unit,
            Err(e) => {
                Logger::debug(&format!("Cache read failed for {}: {}", identity.display(), e));
                None
            }
        }
    }

    /// Resolve `dep` relative to `from`, turning a missing module into a
    /// resolution error that points at the import
    async fn resolve_dep(&self, from: &Path, dep: &Dependency) -> Result<ResolvedModule> {
        match self.resolver.resolve(&dep.specifier, Some(from)).await {
            Err(KilnError::ModuleNotFound { specifier, .. }) if specifier == dep.specifier => {
                let mut context = ErrorContext::new().with_file(from);
                if let Some(loc) = dep.loc {
                    context = context.with_location(loc);
                    if let Ok(source) = tokio::fs::read_to_string(from).await {
                        context = context.with_source(&source);
                    }
                }
                Err(KilnError::Resolution { specifier, context })
            }
            other => other,
        }
    }

    fn insert_asset(&self, graph: &mut AssetGraph, module: ResolvedModule) -> (AssetId, bool) {
        let kind = self.parsers.read().kind_for(&module.path);
        let (id, created) = graph.get_or_insert(&module.path, kind, module.package);
        if created {
            self.watch(&module.path);
        }
        (id, created)
    }

    fn watch(&self, path: &Path) {
        if let Some(watcher) = &self.watcher {
            if let Err(e) = watcher.add(path) {
                Logger::warn(&format!("Cannot watch {}: {}", path.display(), e));
            }
        }
    }

    fn unwatch(&self, path: &Path) {
        if let Some(watcher) = &self.watcher {
            if let Err(e) = watcher.unwatch(path) {
                Logger::debug(&format!("Cannot unwatch {}: {}", path.display(), e));
            }
        }
    }

    /// Queue the asset that should be rebuilt when `path` changes (its own
    /// identity or a file inlined into it). Returns false for unknown paths.
    pub fn queue_change(&self, path: &Path) -> bool {
        let name = {
            let mut state = self.state.lock();
            let Some(id) = state.graph.id_for_path(path) else {
                return false;
            };
            state.queue.insert(id);
            state.graph.get(id).map(|n| n.basename())
        };
        self.status.building(name.as_deref());
        true
    }

    /// Queue the asset owning `path` and schedule a rebuild after the
    /// debounce window. Paths outside the graph are ignored.
    pub fn on_change(self: &Arc<Self>, path: &Path) {
        if !self.queue_change(path) {
            return;
        }

        let generation = self.rebuild_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let bundler = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(REBUILD_DEBOUNCE).await;
            if bundler.rebuild_generation.load(Ordering::SeqCst) != generation {
                return;
            }
            // Failures were already reported by the pass
            let _ = bundler.bundle().await;
        });
    }

    /// Feed change notifications into `on_change` until the channel closes
    pub async fn watch_changes(self: Arc<Self>, mut changes: UnboundedReceiver<PathBuf>) {
        while let Some(path) = changes.recv().await {
            self.on_change(&path);
        }
    }
}

fn first_error(results: Vec<Result<()>>) -> Result<()> {
    results.into_iter().collect()
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_path(path)
    } else {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        normalize_path(&cwd.join(path))
    }
}

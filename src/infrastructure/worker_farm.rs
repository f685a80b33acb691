//! Worker farm for per-asset compilation.
//!
//! Compiles run inline on the caller until the rayon pool has been built and
//! every worker acknowledged the current options; from then on they are
//! shipped to the pool. The switch happens exactly once per (re)init.

use crate::core::interfaces::Compiler;
use crate::core::models::{BuildOptions, CompileRequest, CompiledUnit};
use crate::utils::{KilnError, Logger, Result};
use async_trait::async_trait;
use parking_lot::{Mutex, RwLock};
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::oneshot;

/// Something that can run a compile request
#[async_trait]
pub trait Executor: Send + Sync {
    async fn run(&self, request: CompileRequest) -> Result<CompiledUnit>;
}

/// Runs the compiler on the calling task
pub struct LocalExecutor {
    compiler: Arc<dyn Compiler>,
}

impl LocalExecutor {
    pub fn new(compiler: Arc<dyn Compiler>) -> Self {
        Self { compiler }
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn run(&self, request: CompileRequest) -> Result<CompiledUnit> {
        compile_guarded(self.compiler.as_ref(), &request)
    }
}

/// Ships compile requests to a rayon thread pool
pub struct PooledExecutor {
    pool: rayon::ThreadPool,
    compiler: Arc<dyn Compiler>,
}

impl PooledExecutor {
    pub fn new(workers: usize, compiler: Arc<dyn Compiler>) -> Result<Self> {
        let pool = rayon::ThreadPoolBuilder::new()
            .num_threads(workers)
            .thread_name(|i| format!("kiln-worker-{i}"))
            .build()
            .map_err(|e| KilnError::pool(e.to_string()))?;

        Ok(Self { pool, compiler })
    }

    /// Run `init` on every worker thread, blocking until all of them finished
    fn init_workers(&self, options: &BuildOptions) {
        let compiler = &self.compiler;
        self.pool.broadcast(|_| compiler.init(options));
    }

    pub fn workers(&self) -> usize {
        self.pool.current_num_threads()
    }
}

#[async_trait]
impl Executor for PooledExecutor {
    async fn run(&self, request: CompileRequest) -> Result<CompiledUnit> {
        let (tx, rx) = oneshot::channel();
        let compiler = self.compiler.clone();

        self.pool.spawn(move || {
            let _ = tx.send(compile_guarded(compiler.as_ref(), &request));
        });

        rx.await
            .map_err(|_| KilnError::pool("worker dropped a compile request"))?
    }
}

fn compile_guarded(compiler: &dyn Compiler, request: &CompileRequest) -> Result<CompiledUnit> {
    catch_unwind(AssertUnwindSafe(|| {
        compiler.compile(&request.path, &request.package, &request.options)
    }))
    .unwrap_or_else(|payload| {
        Err(KilnError::compile(
            format!("worker crashed: {}", panic_message(payload.as_ref())),
            &request.path,
        ))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_string()
    }
}

struct PoolState {
    pool: Option<Arc<PooledExecutor>>,
    generation: u64,
}

pub struct WorkerFarm {
    local: LocalExecutor,
    state: Mutex<PoolState>,
    started: AtomicBool,
    ended: AtomicBool,
    options: RwLock<Arc<BuildOptions>>,
    workers: usize,
    compiler: Arc<dyn Compiler>,
}

impl WorkerFarm {
    /// Create a farm and start building its pool on a background thread.
    /// Calls issued before the pool is warm run locally.
    pub fn new(compiler: Arc<dyn Compiler>, options: Arc<BuildOptions>, workers: usize) -> Arc<Self> {
        compiler.init(&options);

        let farm = Arc::new(Self {
            local: LocalExecutor::new(compiler.clone()),
            state: Mutex::new(PoolState {
                pool: None,
                generation: 0,
            }),
            started: AtomicBool::new(false),
            ended: AtomicBool::new(false),
            options: RwLock::new(options),
            workers: workers.max(1),
            compiler,
        });

        let startup = farm.clone();
        let spawned = std::thread::Builder::new()
            .name("kiln-farm-startup".into())
            .spawn(move || startup.start_pool());
        if let Err(e) = spawned {
            Logger::warn(&format!("Could not start worker pool, compiling locally: {}", e));
        }

        farm
    }

    fn start_pool(self: Arc<Self>) {
        let pool = match PooledExecutor::new(self.workers, self.compiler.clone()) {
            Ok(pool) => Arc::new(pool),
            Err(e) => {
                Logger::warn(&format!("{}; compiling locally", e));
                return;
            }
        };

        let generation = {
            let mut state = self.state.lock();
            if self.ended.load(Ordering::SeqCst) {
                return;
            }
            state.pool = Some(pool.clone());
            state.generation
        };

        self.warm(pool, generation);
    }

    /// Send the current options to every worker; flip `started` unless the
    /// farm was re-initialized or ended in the meantime
    fn warm(&self, pool: Arc<PooledExecutor>, generation: u64) {
        let options = self.options.read().clone();
        pool.init_workers(&options);

        let state = self.state.lock();
        if state.generation == generation && !self.ended.load(Ordering::SeqCst) {
            self.started.store(true, Ordering::SeqCst);
            Logger::debug(&format!("Worker pool ready with {} workers", pool.workers()));
        }
    }

    /// Re-initialize with new options. Runs go local until every worker has
    /// seen them.
    pub fn init(self: &Arc<Self>, options: Arc<BuildOptions>) {
        *self.options.write() = options.clone();
        self.compiler.init(&options);

        let (pool, generation) = {
            let mut state = self.state.lock();
            state.generation += 1;
            self.started.store(false, Ordering::SeqCst);
            (state.pool.clone(), state.generation)
        };

        if let Some(pool) = pool {
            let farm = self.clone();
            let spawned = std::thread::Builder::new()
                .name("kiln-farm-init".into())
                .spawn(move || farm.warm(pool, generation));
            if let Err(e) = spawned {
                Logger::warn(&format!("Could not re-initialize workers: {}", e));
            }
        }
    }

    pub async fn run(&self, request: CompileRequest) -> Result<CompiledUnit> {
        if self.started.load(Ordering::SeqCst) {
            let pool = self.state.lock().pool.clone();
            if let Some(pool) = pool {
                return pool.run(request).await;
            }
        }

        self.local.run(request).await
    }

    /// Tear down the pool. Later runs keep working on the local executor.
    pub fn end(&self) {
        let pool = {
            let mut state = self.state.lock();
            self.ended.store(true, Ordering::SeqCst);
            self.started.store(false, Ordering::SeqCst);
            state.pool.take()
        };
        // Threads exit once in-flight runs release their handles
        drop(pool);
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    pub fn is_ended(&self) -> bool {
        self.ended.load(Ordering::SeqCst)
    }

    pub fn options(&self) -> Arc<BuildOptions> {
        self.options.read().clone()
    }
}

/// Holds the farm shared by every bundler of one driver.
///
/// The first `get_shared` builds the farm; later calls re-initialize it with
/// the caller's options. `end` tears it down and clears the slot.
pub struct WorkerContext {
    shared: Mutex<Option<Arc<WorkerFarm>>>,
    workers: usize,
}

impl WorkerContext {
    pub fn new() -> Self {
        Self::with_workers(num_cpus::get_physical().max(1))
    }

    pub fn with_workers(workers: usize) -> Self {
        Self {
            shared: Mutex::new(None),
            workers: workers.max(1),
        }
    }

    pub fn get_shared(&self, compiler: Arc<dyn Compiler>, options: Arc<BuildOptions>) -> Arc<WorkerFarm> {
        let mut shared = self.shared.lock();

        match shared.as_ref() {
            Some(farm) => {
                farm.init(options);
                farm.clone()
            }
            None => {
                let farm = WorkerFarm::new(compiler, options, self.workers);
                *shared = Some(farm.clone());
                farm
            }
        }
    }

    pub fn end(&self) {
        if let Some(farm) = self.shared.lock().take() {
            farm.end();
        }
    }

    pub fn current(&self) -> Option<Arc<WorkerFarm>> {
        self.shared.lock().clone()
    }

    pub fn workers(&self) -> usize {
        self.workers
    }
}

impl Default for WorkerContext {
    fn default() -> Self {
        Self::new()
    }
}

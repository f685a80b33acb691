use crate::core::bundle::PackagedBundle;
use crate::core::models::*;
use crate::utils::{KilnError, Result};
use async_trait::async_trait;
use std::path::{Path, PathBuf};

/// File system operations interface
#[async_trait]
pub trait FileSystemService: Send + Sync {
    async fn read_file(&self, path: &Path) -> Result<String>;
    async fn write_file(&self, path: &Path, content: &str) -> Result<()>;
    async fn create_directory(&self, path: &Path) -> Result<()>;
    fn file_exists(&self, path: &Path) -> bool;
}

/// Turns an import specifier into a canonical path.
///
/// `from` is the importing file, or `None` for the entry point. Implementations
/// must fail with [`KilnError::ModuleNotFound`] when nothing matches so the
/// bundler can annotate the failure with the importer's location.
#[async_trait]
pub trait Resolver: Send + Sync {
    async fn resolve(&self, specifier: &str, from: Option<&Path>) -> Result<ResolvedModule>;
}

/// Pure compile function run inside the worker farm.
///
/// Gets nothing but the path, its package and the build options; it must not
/// reach back into the graph.
pub trait Compiler: Send + Sync {
    /// Called once per execution context whenever the farm is (re)initialized
    fn init(&self, _options: &BuildOptions) {}

    fn compile(
        &self,
        path: &Path,
        package: &PackageMetadata,
        options: &BuildOptions,
    ) -> Result<CompiledUnit>;
}

/// Compiled-unit cache keyed by asset identity
#[async_trait]
pub trait ContentCache: Send + Sync {
    async fn read(&self, identity: &Path) -> Result<Option<CompiledUnit>>;
    /// `inlined` holds the resolved paths of files compiled into the unit
    /// (included-in-parent imports); edits to them invalidate the entry too
    async fn write(&self, identity: &Path, unit: &CompiledUnit, inlined: &[PathBuf]) -> Result<()>;
    async fn invalidate(&self, identity: &Path) -> Result<()>;
}

/// Watch-set bookkeeping. Change notifications travel separately, as paths
/// fed to `Bundler::watch_changes`.
pub trait FileWatcher: Send + Sync {
    fn add(&self, path: &Path) -> Result<()>;
    fn unwatch(&self, path: &Path) -> Result<()>;
    fn close(&self);
}

/// Serializes one bundle to durable storage
#[async_trait]
pub trait Packager: Send + Sync {
    async fn package(&self, bundle: &PackagedBundle) -> Result<()>;
}

/// Receives live-update notifications after non-initial passes
#[async_trait]
pub trait HmrNotifier: Send + Sync {
    async fn emit_update(&self, assets: Vec<HmrAsset>);
    async fn emit_error(&self, error: &KilnError);
    fn stop(&self);
}

/// Hook for injecting dependencies the compiler cannot see
#[async_trait]
pub trait BuildDelegate: Send + Sync {
    async fn implicit_dependencies(
        &self,
        asset: &Path,
        kind: &AssetKind,
    ) -> Result<Option<Vec<Dependency>>>;
}

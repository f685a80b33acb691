use crate::utils::{normalize_path, SourceLocation};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Asset type tag (`js`, `css`, `html`, ...). Drives bundle partitioning and
/// packager selection, and doubles as the output file extension.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct AssetKind(String);

impl AssetKind {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn js() -> Self {
        Self::new("js")
    }

    pub fn css() -> Self {
        Self::new("css")
    }

    pub fn html() -> Self {
        Self::new("html")
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for AssetKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for AssetKind {
    fn from(tag: &str) -> Self {
        Self::new(tag)
    }
}

/// The subset of `package.json` the engine cares about
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PackageMetadata {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub main: Option<String>,
    #[serde(default)]
    pub module: Option<String>,
    /// Location of the `package.json` this was read from
    #[serde(skip)]
    pub pkg_file: Option<PathBuf>,
}

impl PackageMetadata {
    /// Absolute path of the package's `main` entry, if both are known
    pub fn main_path(&self) -> Option<PathBuf> {
        let main = self.main.as_ref()?;
        let dir = self.pkg_file.as_ref()?.parent()?;
        Some(normalize_path(&dir.join(main)))
    }
}

/// One import edge as declared by the compiled source
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Dependency {
    pub specifier: String,
    #[serde(default)]
    pub dynamic: bool,
    /// Output already inlined into the importer (e.g. a LESS `@import`)
    #[serde(default)]
    pub included_in_parent: bool,
    #[serde(default)]
    pub loc: Option<SourceLocation>,
    #[serde(default)]
    pub media: Option<String>,
}

impl Dependency {
    pub fn new(specifier: impl Into<String>) -> Self {
        Self {
            specifier: specifier.into(),
            dynamic: false,
            included_in_parent: false,
            loc: None,
            media: None,
        }
    }

    pub fn dynamic(mut self) -> Self {
        self.dynamic = true;
        self
    }

    pub fn included_in_parent(mut self) -> Self {
        self.included_in_parent = true;
        self
    }

    pub fn at(mut self, loc: SourceLocation) -> Self {
        self.loc = Some(loc);
        self
    }

    pub fn with_media(mut self, media: impl Into<String>) -> Self {
        self.media = Some(media.into());
        self
    }
}

/// Result of compiling one asset. Pure data: safe to cache and to send
/// across worker threads.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct CompiledUnit {
    pub generated: BTreeMap<AssetKind, String>,
    pub hash: String,
    pub dependencies: Vec<Dependency>,
}

/// What the resolver hands back for a specifier
#[derive(Debug, Clone)]
pub struct ResolvedModule {
    pub path: PathBuf,
    pub package: Arc<PackageMetadata>,
}

/// Unit of work submitted to the worker farm
#[derive(Debug, Clone)]
pub struct CompileRequest {
    pub path: PathBuf,
    pub package: Arc<PackageMetadata>,
    pub options: Arc<BuildOptions>,
}

/// Options as supplied by the caller; `None` means "pick the default"
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BundlerOptions {
    #[serde(default)]
    pub out_dir: Option<PathBuf>,
    #[serde(default)]
    pub public_url: Option<String>,
    #[serde(default)]
    pub watch: Option<bool>,
    #[serde(default)]
    pub cache: Option<bool>,
    #[serde(default)]
    pub cache_dir: Option<PathBuf>,
    #[serde(default)]
    pub kill_workers: Option<bool>,
    #[serde(default)]
    pub minify: Option<bool>,
    #[serde(default)]
    pub hmr: Option<bool>,
    #[serde(default)]
    pub log_level: Option<u8>,
    #[serde(default)]
    pub production: Option<bool>,
}

impl BundlerOptions {
    /// Fill unset fields from `fallback` (used to layer CLI flags over a config file)
    pub fn or(self, fallback: BundlerOptions) -> BundlerOptions {
        BundlerOptions {
            out_dir: self.out_dir.or(fallback.out_dir),
            public_url: self.public_url.or(fallback.public_url),
            watch: self.watch.or(fallback.watch),
            cache: self.cache.or(fallback.cache),
            cache_dir: self.cache_dir.or(fallback.cache_dir),
            kill_workers: self.kill_workers.or(fallback.kill_workers),
            minify: self.minify.or(fallback.minify),
            hmr: self.hmr.or(fallback.hmr),
            log_level: self.log_level.or(fallback.log_level),
            production: self.production.or(fallback.production),
        }
    }
}

/// Normalized options every part of the engine reads
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BuildOptions {
    pub out_dir: PathBuf,
    pub public_url: String,
    pub watch: bool,
    pub cache: bool,
    pub cache_dir: PathBuf,
    pub kill_workers: bool,
    pub minify: bool,
    pub hmr: bool,
    pub log_level: u8,
    pub production: bool,
}

impl BuildOptions {
    /// Apply defaults. Production is on when requested or when
    /// `NODE_ENV=production`; watch and HMR default to the opposite of production.
    pub fn normalize(options: BundlerOptions) -> Self {
        let env_production = std::env::var("NODE_ENV")
            .map(|v| v == "production")
            .unwrap_or(false);
        Self::normalize_with_env(options, env_production)
    }

    pub fn normalize_with_env(options: BundlerOptions, env_production: bool) -> Self {
        let production = options.production.unwrap_or(false) || env_production;
        let out_dir = absolute(&options.out_dir.unwrap_or_else(|| PathBuf::from("dist")));
        let public_url = options.public_url.unwrap_or_else(|| {
            let base = out_dir
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_default();
            format!("/{}", base)
        });
        let watch = options.watch.unwrap_or(!production);

        Self {
            out_dir,
            public_url,
            watch,
            cache: options.cache.unwrap_or(true),
            cache_dir: absolute(&options.cache_dir.unwrap_or_else(|| PathBuf::from(".kiln-cache"))),
            kill_workers: options.kill_workers.unwrap_or(true),
            minify: options.minify.unwrap_or(production),
            hmr: options.hmr.unwrap_or(watch),
            log_level: options.log_level.unwrap_or(3),
            production,
        }
    }
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self::normalize_with_env(BundlerOptions::default(), false)
    }
}

fn absolute(path: &Path) -> PathBuf {
    if path.is_absolute() {
        normalize_path(path)
    } else {
        let cwd = std::env::current_dir().unwrap_or_else(|_| PathBuf::from("/"));
        normalize_path(&cwd.join(path))
    }
}

/// One changed or newly created asset as reported to the HMR notifier
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HmrAsset {
    pub id: PathBuf,
    pub kind: AssetKind,
    pub generated: BTreeMap<AssetKind, String>,
    /// Specifier -> identity of the resolved dependency
    pub deps: BTreeMap<String, PathBuf>,
}

/// Lifecycle notifications broadcast by the bundler
#[derive(Debug, Clone, PartialEq)]
pub enum BuildEvent {
    BuildStart,
    /// A pass produced a bundle tree; carries the output names
    Bundled { bundles: Vec<PathBuf> },
    /// Fired after every pass, successful or not
    BuildEnd { errored: bool },
}

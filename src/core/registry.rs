use crate::core::bundle::PackagedBundle;
use crate::core::interfaces::{Compiler, Packager};
use crate::core::models::*;
use crate::utils::Result;
use futures::future::try_join_all;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;

/// Kind and compiler registered for one file extension
#[derive(Clone)]
pub struct AssetType {
    pub kind: AssetKind,
    pub compiler: Arc<dyn Compiler>,
}

const BUILTIN_TYPES: &[(&str, &str)] = &[
    ("js", "js"),
    ("jsx", "js"),
    ("mjs", "js"),
    ("cjs", "js"),
    ("ts", "js"),
    ("tsx", "js"),
    ("json", "js"),
    ("css", "css"),
    ("less", "css"),
    ("scss", "css"),
    ("sass", "css"),
    ("styl", "css"),
    ("html", "html"),
    ("htm", "html"),
];

/// Maps file extensions to an asset kind and the compiler that handles them.
///
/// Unknown extensions fall back to the default compiler and use the extension
/// itself as their kind. The registry doubles as the compile function handed
/// to the worker farm, dispatching on the path it is given.
#[derive(Clone)]
pub struct ParserRegistry {
    extensions: HashMap<String, AssetType>,
    fallback: Arc<dyn Compiler>,
}

impl ParserRegistry {
    pub fn new(fallback: Arc<dyn Compiler>) -> Self {
        let extensions = BUILTIN_TYPES
            .iter()
            .map(|(ext, kind)| {
                (
                    ext.to_string(),
                    AssetType {
                        kind: AssetKind::new(*kind),
                        compiler: fallback.clone(),
                    },
                )
            })
            .collect();

        Self {
            extensions,
            fallback,
        }
    }

    pub fn register(&mut self, extension: &str, kind: AssetKind, compiler: Arc<dyn Compiler>) {
        let extension = extension.trim_start_matches('.').to_lowercase();
        self.extensions.insert(extension, AssetType { kind, compiler });
    }

    /// Swap the default compiler, including for every built-in extension
    /// that still uses it
    pub fn set_fallback(&mut self, compiler: Arc<dyn Compiler>) {
        for asset_type in self.extensions.values_mut() {
            if Arc::ptr_eq(&asset_type.compiler, &self.fallback) {
                asset_type.compiler = compiler.clone();
            }
        }
        self.fallback = compiler;
    }

    pub fn asset_type(&self, path: &Path) -> AssetType {
        let extension = extension_of(path);
        self.extensions
            .get(&extension)
            .cloned()
            .unwrap_or_else(|| AssetType {
                kind: AssetKind::new(if extension.is_empty() { "raw".to_string() } else { extension }),
                compiler: self.fallback.clone(),
            })
    }

    pub fn kind_for(&self, path: &Path) -> AssetKind {
        self.asset_type(path).kind
    }

    fn compilers(&self) -> Vec<Arc<dyn Compiler>> {
        let mut unique: Vec<Arc<dyn Compiler>> = vec![self.fallback.clone()];
        for asset_type in self.extensions.values() {
            if !unique.iter().any(|c| Arc::ptr_eq(c, &asset_type.compiler)) {
                unique.push(asset_type.compiler.clone());
            }
        }
        unique
    }
}

impl Compiler for ParserRegistry {
    fn init(&self, options: &BuildOptions) {
        for compiler in self.compilers() {
            compiler.init(options);
        }
    }

    fn compile(
        &self,
        path: &Path,
        package: &PackageMetadata,
        options: &BuildOptions,
    ) -> Result<CompiledUnit> {
        self.asset_type(path).compiler.compile(path, package, options)
    }
}

/// Packager per bundle kind, with a fallback for kinds nobody registered
#[derive(Clone)]
pub struct PackagerRegistry {
    packagers: HashMap<AssetKind, Arc<dyn Packager>>,
    fallback: Arc<dyn Packager>,
}

impl PackagerRegistry {
    pub fn new(fallback: Arc<dyn Packager>) -> Self {
        Self {
            packagers: HashMap::new(),
            fallback,
        }
    }

    pub fn register(&mut self, kind: AssetKind, packager: Arc<dyn Packager>) {
        self.packagers.insert(kind, packager);
    }

    pub fn set_fallback(&mut self, packager: Arc<dyn Packager>) {
        self.fallback = packager;
    }

    pub fn get(&self, kind: &AssetKind) -> Arc<dyn Packager> {
        self.packagers
            .get(kind)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone())
    }

    /// Write every bundle through the packager registered for its kind
    pub async fn package_all(&self, bundles: &[PackagedBundle]) -> Result<()> {
        try_join_all(bundles.iter().map(|bundle| {
            let packager = self.get(&bundle.kind);
            async move { packager.package(bundle).await }
        }))
        .await?;
        Ok(())
    }
}

fn extension_of(path: &Path) -> String {
    path.extension()
        .map(|ext| ext.to_string_lossy().to_lowercase())
        .unwrap_or_default()
}

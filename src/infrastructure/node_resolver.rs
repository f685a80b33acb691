use crate::core::interfaces::Resolver;
use crate::core::models::{PackageMetadata, ResolvedModule};
use crate::utils::{normalize_path, ConfigLoader, KilnError, Logger, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::sync::Arc;

const DEFAULT_EXTENSIONS: &[&str] = &[
    "js", "jsx", "mjs", "cjs", "ts", "tsx", "json", "css", "less", "scss", "sass", "styl", "html",
];

/// Node.js-style module resolution
pub struct NodeResolver {
    root: PathBuf,
    extensions: Vec<String>,
    /// Parsed package.json files by path
    packages: DashMap<PathBuf, Arc<PackageMetadata>>,
}

impl NodeResolver {
    /// `root` anchors the entry point and `/`-prefixed specifiers
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            extensions: DEFAULT_EXTENSIONS.iter().map(|e| e.to_string()).collect(),
            packages: DashMap::new(),
        }
    }

    pub fn with_extensions(mut self, extensions: &[&str]) -> Self {
        self.extensions = extensions
            .iter()
            .map(|e| e.trim_start_matches('.').to_string())
            .collect();
        self
    }

    async fn locate(&self, specifier: &str, from: Option<&Path>) -> Option<PathBuf> {
        let base_dir = from
            .and_then(|f| f.parent())
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());

        if specifier.starts_with("./") || specifier.starts_with("../") || specifier == "." {
            return self.resolve_file_or_directory(&base_dir.join(specifier)).await;
        }

        if let Some(rooted) = specifier.strip_prefix('/') {
            // Absolute on disk wins, then relative to the project root
            let direct = Path::new(specifier);
            if let Some(found) = self.resolve_file_or_directory(direct).await {
                return Some(found);
            }
            return self.resolve_file_or_directory(&self.root.join(rooted)).await;
        }

        if from.is_none() {
            // Bare entry points are files, not packages
            if let Some(found) = self.resolve_file_or_directory(&base_dir.join(specifier)).await {
                return Some(found);
            }
        }

        self.resolve_node_module(specifier, &base_dir).await
    }

    async fn resolve_node_module(&self, specifier: &str, start: &Path) -> Option<PathBuf> {
        let (package_name, subpath) = parse_package_specifier(specifier);
        let mut dir = Some(start);

        while let Some(current) = dir {
            if current.file_name().map(|n| n != "node_modules").unwrap_or(true) {
                let package_dir = current.join("node_modules").join(&package_name);
                if is_dir(&package_dir).await {
                    if let Some(entry) = self.resolve_package_entry(&package_dir, subpath.as_deref()).await {
                        return Some(entry);
                    }
                }
            }
            dir = current.parent();
        }

        None
    }

    async fn resolve_package_entry(&self, package_dir: &Path, subpath: Option<&str>) -> Option<PathBuf> {
        if let Some(subpath) = subpath {
            return self.resolve_file_or_directory(&package_dir.join(subpath)).await;
        }
        self.resolve_directory(package_dir).await
    }

    async fn resolve_file_or_directory(&self, path: &Path) -> Option<PathBuf> {
        let path = normalize_path(path);
        if let Some(file) = self.resolve_as_file(&path).await {
            return Some(file);
        }
        if is_dir(&path).await {
            return self.resolve_directory(&path).await;
        }
        None
    }

    /// Package entry (`module`, then `main`) or an index file
    async fn resolve_directory(&self, dir: &Path) -> Option<PathBuf> {
        let manifest = dir.join("package.json");
        if is_file(&manifest).await {
            if let Some(package) = self.read_package(&manifest).await {
                for entry in [&package.module, &package.main].into_iter().flatten() {
                    if let Some(found) = self.resolve_as_file(&normalize_path(&dir.join(entry))).await {
                        return Some(found);
                    }
                }
            }
        }

        self.resolve_as_file(&dir.join("index")).await
    }

    async fn resolve_as_file(&self, path: &Path) -> Option<PathBuf> {
        if is_file(path).await {
            return Some(path.to_path_buf());
        }

        for ext in &self.extensions {
            let mut candidate = OsString::from(path.as_os_str());
            candidate.push(".");
            candidate.push(ext);
            let candidate = PathBuf::from(candidate);
            if is_file(&candidate).await {
                return Some(candidate);
            }
        }

        None
    }

    async fn read_package(&self, manifest: &Path) -> Option<Arc<PackageMetadata>> {
        if let Some(cached) = self.packages.get(manifest) {
            return Some(cached.clone());
        }

        let content = tokio::fs::read_to_string(manifest).await.ok()?;
        let mut package: PackageMetadata = match serde_json::from_str(&content) {
            Ok(package) => package,
            Err(e) => {
                Logger::warn(&format!("Ignoring malformed {}: {}", manifest.display(), e));
                return None;
            }
        };
        package.pkg_file = Some(manifest.to_path_buf());

        let package = Arc::new(package);
        self.packages.insert(manifest.to_path_buf(), package.clone());
        Some(package)
    }

    /// Metadata of the package owning `path`
    async fn package_for(&self, path: &Path) -> Arc<PackageMetadata> {
        match ConfigLoader::resolve(path, &["package.json"]) {
            Some(manifest) => self.read_package(&manifest).await.unwrap_or_default(),
            None => Arc::new(PackageMetadata::default()),
        }
    }
}

#[async_trait]
impl Resolver for NodeResolver {
    async fn resolve(&self, specifier: &str, from: Option<&Path>) -> Result<ResolvedModule> {
        let found = self
            .locate(specifier, from)
            .await
            .ok_or_else(|| KilnError::module_not_found(specifier, from.unwrap_or(&self.root)))?;

        let path = tokio::fs::canonicalize(&found).await?;
        let package = self.package_for(&path).await;

        Ok(ResolvedModule { path, package })
    }
}

/// Split `@scope/name/sub/path` or `name/sub/path` into package and subpath
fn parse_package_specifier(specifier: &str) -> (String, Option<String>) {
    let mut parts = specifier.splitn(if specifier.starts_with('@') { 3 } else { 2 }, '/');
    let package = if specifier.starts_with('@') {
        match (parts.next(), parts.next()) {
            (Some(scope), Some(name)) => format!("{}/{}", scope, name),
            (Some(scope), None) => scope.to_string(),
            _ => specifier.to_string(),
        }
    } else {
        parts.next().unwrap_or(specifier).to_string()
    };

    (package, parts.next().map(str::to_string))
}

async fn is_file(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_file())
        .unwrap_or(false)
}

async fn is_dir(path: &Path) -> bool {
    tokio::fs::metadata(path)
        .await
        .map(|m| m.is_dir())
        .unwrap_or(false)
}

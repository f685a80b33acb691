use crate::core::models::BundlerOptions;
use crate::utils::{KilnError, Logger, Result};
use dashmap::DashMap;
use once_cell::sync::Lazy;
use serde::de::DeserializeOwned;
use std::path::{Path, PathBuf};

pub const CONFIG_FILE_NAME: &str = "kiln.config.json";

// Existence checks are repeated for every asset of a package, so memoize them
static EXISTS_CACHE: Lazy<DashMap<PathBuf, bool>> = Lazy::new(DashMap::new);

/// Config loader that finds config files next to or above a source file
pub struct ConfigLoader;

impl ConfigLoader {
    /// Find the nearest of `filenames` in the directories above `filepath`.
    ///
    /// The search stops at the file-system root and never continues past a
    /// `node_modules` directory, so a package never picks up its host's config.
    pub fn resolve(filepath: &Path, filenames: &[&str]) -> Option<PathBuf> {
        let mut dir = filepath.parent();

        while let Some(current) = dir {
            if current.file_name().map(|n| n == "node_modules").unwrap_or(false) {
                return None;
            }

            for filename in filenames {
                let candidate = current.join(filename);
                if Self::exists(&candidate) {
                    return Some(candidate);
                }
            }

            dir = current.parent();
        }

        None
    }

    /// Resolve and parse the nearest JSON config, returning it with its path
    pub fn load<T: DeserializeOwned>(filepath: &Path, filenames: &[&str]) -> Result<Option<(T, PathBuf)>> {
        let Some(config_path) = Self::resolve(filepath, filenames) else {
            return Ok(None);
        };

        let content = std::fs::read_to_string(&config_path)?;
        let parsed = serde_json::from_str(&content).map_err(|e| {
            KilnError::config(format!("Failed to parse {}: {}", config_path.display(), e))
        })?;

        Ok(Some((parsed, config_path)))
    }

    /// Load `kiln.config.json` for an entry file, if one exists above it
    pub fn load_for_entry(entry: &Path) -> Result<Option<BundlerOptions>> {
        match Self::load::<BundlerOptions>(entry, &[CONFIG_FILE_NAME])? {
            Some((mut options, path)) => {
                Logger::debug(&format!("Loaded config from {}", path.display()));
                // Relative paths in the file are relative to the file
                if let Some(dir) = path.parent() {
                    options.out_dir = options.out_dir.map(|d| dir.join(d));
                    options.cache_dir = options.cache_dir.map(|d| dir.join(d));
                }
                Ok(Some(options))
            }
            None => {
                Logger::debug(&format!("No {} found, using defaults", CONFIG_FILE_NAME));
                Ok(None)
            }
        }
    }

    /// Drop memoized existence checks (after files were created or deleted)
    pub fn clear_cache() {
        EXISTS_CACHE.clear();
    }

    fn exists(path: &Path) -> bool {
        if let Some(known) = EXISTS_CACHE.get(path) {
            return *known;
        }
        let exists = path.is_file();
        EXISTS_CACHE.insert(path.to_path_buf(), exists);
        exists
    }
}

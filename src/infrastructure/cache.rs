use crate::core::interfaces::ContentCache;
use crate::core::models::CompiledUnit;
use crate::utils::{KilnError, Logger, Result};
use async_trait::async_trait;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

/// In-process cache, lost when the bundler exits
#[derive(Default)]
pub struct MemoryCache {
    entries: DashMap<PathBuf, CompiledUnit>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[async_trait]
impl ContentCache for MemoryCache {
    async fn read(&self, identity: &Path) -> Result<Option<CompiledUnit>> {
        Ok(self.entries.get(identity).map(|entry| entry.clone()))
    }

    async fn write(&self, identity: &Path, unit: &CompiledUnit, _inlined: &[PathBuf]) -> Result<()> {
        self.entries.insert(identity.to_path_buf(), unit.clone());
        Ok(())
    }

    async fn invalidate(&self, identity: &Path) -> Result<()> {
        self.entries.remove(identity);
        Ok(())
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct CacheRecord {
    /// Modification times (ns since epoch) of the source and of every file
    /// inlined into it, as seen when the entry was written
    inputs: Vec<(PathBuf, u64)>,
    unit: CompiledUnit,
}

/// On-disk cache backed by sled. Survives restarts; an entry is only served
/// while none of its inputs were modified after it was written.
pub struct PersistentCache {
    db: sled::Db,
    dir: PathBuf,
}

impl PersistentCache {
    pub fn open(dir: &Path) -> Result<Self> {
        std::fs::create_dir_all(dir)?;
        let db = sled::open(dir.join("units"))
            .map_err(|e| KilnError::cache(format!("Failed to open cache at {}: {}", dir.display(), e)))?;
        Logger::debug(&format!("Opened cache at {}", dir.display()));

        Ok(Self {
            db,
            dir: dir.to_path_buf(),
        })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn clear(&self) -> Result<()> {
        self.db.clear().map_err(|e| KilnError::cache(e.to_string()))
    }

    fn key(identity: &Path) -> Vec<u8> {
        identity.to_string_lossy().as_bytes().to_vec()
    }
}

async fn modified(path: &Path) -> Option<u64> {
    let metadata = tokio::fs::metadata(path).await.ok()?;
    let since_epoch = metadata.modified().ok()?.duration_since(UNIX_EPOCH).ok()?;
    Some(since_epoch.as_nanos() as u64)
}

#[async_trait]
impl ContentCache for PersistentCache {
    async fn read(&self, identity: &Path) -> Result<Option<CompiledUnit>> {
        let Some(bytes) = self
            .db
            .get(Self::key(identity))
            .map_err(|e| KilnError::cache(e.to_string()))?
        else {
            return Ok(None);
        };

        let record: CacheRecord = bincode::deserialize(&bytes)
            .map_err(|e| KilnError::cache(format!("Corrupt entry for {}: {}", identity.display(), e)))?;

        for (input, recorded) in &record.inputs {
            match modified(input).await {
                Some(current) if current <= *recorded => {}
                _ => return Ok(None),
            }
        }

        Ok(Some(record.unit))
    }

    async fn write(&self, identity: &Path, unit: &CompiledUnit, inlined: &[PathBuf]) -> Result<()> {
        let mut inputs = Vec::with_capacity(inlined.len() + 1);
        for input in std::iter::once(identity).chain(inlined.iter().map(PathBuf::as_path)) {
            let mtime = modified(input).await.ok_or_else(|| {
                KilnError::cache(format!("Cannot stat cache input {}", input.display()))
            })?;
            inputs.push((input.to_path_buf(), mtime));
        }

        let record = CacheRecord {
            inputs,
            unit: unit.clone(),
        };
        let bytes = bincode::serialize(&record).map_err(|e| KilnError::cache(e.to_string()))?;
        self.db
            .insert(Self::key(identity), bytes)
            .map_err(|e| KilnError::cache(e.to_string()))?;
        Ok(())
    }

    async fn invalidate(&self, identity: &Path) -> Result<()> {
        self.db
            .remove(Self::key(identity))
            .map_err(|e| KilnError::cache(e.to_string()))?;
        Ok(())
    }
}

//! Persistent OGC-structured tile cache: `{root}/{provider}/{date}/{z}/{x}/{y}.jpg`
//! with a crash-safe `cache_index.json` sidecar (spec §4.9).
//!
//! Multiple readers may fetch payloads concurrently; the index itself is
//! guarded by a single async `RwLock` so writers serialize against each
//! other while reads proceed freely. Tile bytes are written to a temporary
//! file and atomically renamed into place so a crash mid-write never leaves
//! a torn file behind — and never leaves the index ahead of what's actually
//! on disk.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use chrono::Utc;
use tokio::sync::RwLock;

use crate::error::{CacheError, Result};

use super::index::{CacheIndex, IndexEntry};
use super::key::CacheKey;

/// Tunables for the persistent cache, mirroring `ServerConfig` /
/// `SeedingConfig` elsewhere in the crate: constructed in code, no
/// serde-from-disk loader (that belongs to the out-of-scope config loader).
#[derive(Debug, Clone)]
pub struct CacheConfig {
    /// Cache root directory. Overridable; defaults to
    /// `{home}/.walkthru-earth/imagery-desktop/cache/` (spec §6).
    pub root: PathBuf,
    /// Total byte budget before LRU eviction kicks in.
    pub budget_bytes: u64,
    /// Age after which a periodic sweep removes an entry regardless of
    /// access recency.
    pub ttl: Duration,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let root = dirs_cache_root();
        Self {
            root,
            budget_bytes: 2 * 1024 * 1024 * 1024,
            ttl: Duration::from_secs(30 * 24 * 3600),
        }
    }
}

fn dirs_cache_root() -> PathBuf {
    let home = std::env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("."));
    home.join(".walkthru-earth/imagery-desktop/cache")
}

/// Aggregate cache statistics, mirroring the teacher's `server::cache::CacheStats`
/// shape with the fields the desktop storage panel additionally needs.
#[derive(Debug, Clone)]
pub struct CacheStats {
    pub entry_count: u64,
    pub total_bytes: u64,
    pub budget_bytes: u64,
    pub root: PathBuf,
}

/// The persistent tile cache (C9).
pub struct PersistentCache {
    config: CacheConfig,
    index: Arc<RwLock<CacheIndex>>,
}

impl PersistentCache {
    pub fn new(config: CacheConfig) -> Result<Self> {
        std::fs::create_dir_all(&config.root).map_err(|e| CacheError::Io(e.to_string()))?;
        let index = CacheIndex::load_or_rebuild(&config.root);
        Ok(Self {
            config,
            index: Arc::new(RwLock::new(index)),
        })
    }

    fn validate_coords(z: u8, x: u32, y: u32) -> Result<()> {
        if z > 30 {
            return Err(CacheError::InvalidCoords { z, x, y }.into());
        }
        let span = 1u32 << z;
        if x >= span || y >= span {
            return Err(CacheError::InvalidCoords { z, x, y }.into());
        }
        Ok(())
    }

    /// The on-disk path for a key, validated to resolve inside the cache
    /// root (spec §4.9 path-traversal guard, §8 testable property).
    fn tile_path(&self, key: &CacheKey) -> Result<PathBuf> {
        Self::validate_coords(key.z, key.x, key.y)?;

        let relative = PathBuf::from(key.provider.as_str())
            .join(key.date_dir())
            .join(key.z.to_string())
            .join(key.x.to_string())
            .join(format!("{}.jpg", key.y));
        let candidate = self.config.root.join(&relative);

        let canonical_root = self
            .config
            .root
            .canonicalize()
            .map_err(|e| CacheError::Io(e.to_string()))?;
        // The target file need not exist yet; canonicalize its parent and
        // re-attach the filename so the traversal check still applies to a
        // not-yet-created path.
        let parent = candidate
            .parent()
            .ok_or_else(|| CacheError::PathTraversal(relative.display().to_string()))?;
        std::fs::create_dir_all(parent).map_err(|e| CacheError::Io(e.to_string()))?;
        let canonical_parent = parent
            .canonicalize()
            .map_err(|e| CacheError::Io(e.to_string()))?;

        if canonical_parent
            .strip_prefix(&canonical_root)
            .is_err()
        {
            return Err(CacheError::PathTraversal(relative.display().to_string()).into());
        }

        Ok(canonical_parent.join(candidate.file_name().unwrap()))
    }

    /// Fetch cached bytes for `key`, bumping its last-access time. Missing
    /// is not an error — callers branch on `Ok(None)`. Returns `Bytes` so
    /// a cache hit can be hand off to the HTTP response body and, on a
    /// miss that gets re-fetched and re-cached, handed to `set` again
    /// without a second deep copy.
    pub async fn get(&self, key: &CacheKey) -> Result<Option<Bytes>> {
        let index_key = key.index_key();
        let path = {
            let index = self.index.read().await;
            match index.get(&index_key) {
                Some(entry) => entry.path.clone(),
                None => return Ok(None),
            }
        };

        match tokio::fs::read(&path).await {
            Ok(bytes) => {
                let mut index = self.index.write().await;
                index.touch(&index_key, Utc::now());
                let _ = index.save(&self.config.root);
                Ok(Some(Bytes::from(bytes)))
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                // Index and disk disagree; degrade to a miss rather than failing.
                let mut index = self.index.write().await;
                index.remove(&index_key);
                Ok(None)
            }
            Err(e) => {
                tracing::warn!("cache read io error, treating as bypass: {e}");
                Ok(None)
            }
        }
    }

    pub async fn is_cached(&self, key: &CacheKey) -> bool {
        let index = self.index.read().await;
        index.get(&key.index_key()).is_some()
    }

    /// Store `data` under `key`, writing to a temp file and renaming into
    /// place, then evicting by LRU if the projected total exceeds budget.
    /// I/O failures degrade to a no-op (spec §7: cache I/O errors bypass the
    /// cache rather than failing the fetch).
    pub async fn set(&self, key: &CacheKey, data: Bytes) -> Result<()> {
        let path = match self.tile_path(key) {
            Ok(p) => p,
            Err(e @ crate::error::Error::Cache(CacheError::InvalidCoords { .. })) => return Err(e),
            Err(e @ crate::error::Error::Cache(CacheError::PathTraversal(_))) => return Err(e),
            Err(e) => {
                tracing::warn!("cache path resolution failed, bypassing cache: {e}");
                return Ok(());
            }
        };

        let tmp_path = path.with_extension("jpg.tmp");
        if let Err(e) = tokio::fs::write(&tmp_path, &data).await {
            tracing::warn!("cache write failed, bypassing cache: {e}");
            return Ok(());
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, &path).await {
            tracing::warn!("cache rename failed, bypassing cache: {e}");
            let _ = tokio::fs::remove_file(&tmp_path).await;
            return Ok(());
        }

        let now = Utc::now();
        let entry = IndexEntry {
            path: path.clone(),
            bytes: data.len() as u64,
            written_at: now,
            last_access_at: now,
        };

        let mut index = self.index.write().await;
        index.insert(key.index_key(), entry);
        self.evict_over_budget(&mut index).await;
        let _ = index.save(&self.config.root);
        Ok(())
    }

    async fn evict_over_budget(&self, index: &mut CacheIndex) {
        if index.total_bytes() <= self.config.budget_bytes {
            return;
        }
        for key in index.keys_by_last_access() {
            if index.total_bytes() <= self.config.budget_bytes {
                break;
            }
            if let Some(entry) = index.remove(&key) {
                if let Err(e) = std::fs::remove_file(&entry.path) {
                    if e.kind() != std::io::ErrorKind::NotFound {
                        tracing::warn!("failed to evict cache file {:?}: {e}", entry.path);
                    }
                }
            }
        }
    }

    /// Periodic TTL sweep: remove entries older than `config.ttl` regardless
    /// of access recency.
    pub async fn sweep_ttl(&self) -> Result<u64> {
        let cutoff = Utc::now() - chrono::Duration::from_std(self.config.ttl).unwrap_or_default();
        let mut index = self.index.write().await;
        let stale = index.keys_older_than(cutoff);
        let removed = stale.len() as u64;
        for key in stale {
            if let Some(entry) = index.remove(&key) {
                let _ = std::fs::remove_file(&entry.path);
            }
        }
        index.save(&self.config.root)?;
        Ok(removed)
    }

    pub async fn stats(&self) -> CacheStats {
        let index = self.index.read().await;
        CacheStats {
            entry_count: index.len() as u64,
            total_bytes: index.total_bytes(),
            budget_bytes: self.config.budget_bytes,
            root: self.config.root.clone(),
        }
    }

    pub async fn clear(&self) -> Result<()> {
        let mut index = self.index.write().await;
        for (_, entry) in index.iter() {
            let _ = std::fs::remove_file(&entry.path);
        }
        index.clear();
        index.save(&self.config.root)?;
        Ok(())
    }

    pub fn root(&self) -> &Path {
        &self.config.root
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::key::Provider;

    fn config_at(dir: &Path) -> CacheConfig {
        CacheConfig {
            root: dir.to_path_buf(),
            budget_bytes: 10_000,
            ttl: Duration::from_secs(3600),
        }
    }

    #[tokio::test]
    async fn set_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::new(config_at(dir.path())).unwrap();
        let key = CacheKey::new(Provider::GoogleEarth, 10, 1, 2, Some("2024-05-01".into()));

        cache.set(&key, Bytes::from_static(&[1, 2, 3])).await.unwrap();
        assert!(cache.is_cached(&key).await);
        let data = cache.get(&key).await.unwrap();
        assert_eq!(data, Some(Bytes::from_static(&[1, 2, 3])));
    }

    #[tokio::test]
    async fn miss_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::new(config_at(dir.path())).unwrap();
        let key = CacheKey::new(Provider::EsriWayback, 5, 0, 0, None);
        assert_eq!(cache.get(&key).await.unwrap(), None);
    }

    #[tokio::test]
    async fn rejects_invalid_coords() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::new(config_at(dir.path())).unwrap();
        let key = CacheKey::new(Provider::GoogleEarth, 40, 0, 0, None);
        assert!(cache.set(&key, Bytes::from_static(&[1])).await.is_err());
    }

    #[tokio::test]
    async fn lru_eviction_keeps_total_under_budget() {
        let dir = tempfile::tempdir().unwrap();
        let mut config = config_at(dir.path());
        config.budget_bytes = 15; // tiny budget forces eviction
        let cache = PersistentCache::new(config).unwrap();

        for i in 0..5u32 {
            let key = CacheKey::new(Provider::GoogleEarth, 5, i, 0, None);
            cache.set(&key, Bytes::from(vec![0u8; 10])).await.unwrap();
        }

        let stats = cache.stats().await;
        assert!(stats.total_bytes <= 15);
    }

    #[tokio::test]
    async fn index_survives_reload_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let key = CacheKey::new(Provider::GoogleEarth, 8, 3, 4, None);
        {
            let cache = PersistentCache::new(config_at(dir.path())).unwrap();
            cache.set(&key, Bytes::from_static(&[9, 9, 9])).await.unwrap();
        }
        let cache = PersistentCache::new(config_at(dir.path())).unwrap();
        assert!(cache.is_cached(&key).await);
    }

    #[tokio::test]
    async fn clear_removes_all_entries() {
        let dir = tempfile::tempdir().unwrap();
        let cache = PersistentCache::new(config_at(dir.path())).unwrap();
        let key = CacheKey::new(Provider::GoogleEarth, 3, 1, 1, None);
        cache.set(&key, Bytes::from_static(&[1, 2])).await.unwrap();
        cache.clear().await.unwrap();
        assert!(!cache.is_cached(&key).await);
        assert_eq!(cache.stats().await.entry_count, 0);
    }
}

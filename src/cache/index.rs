//! On-disk index for the persistent tile cache (spec §4.9).
//!
//! The index is a single `cache_index.json` file mapping a cache key string
//! to `{bytes, written_at, last_access_at}`. It is rebuilt by walking the
//! OGC directory tree whenever the file is missing or fails to parse, so a
//! crash between a tile write and an index flush never loses track of bytes
//! already on disk.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{CacheError, Result};

use super::key::{CacheKey, Provider, CURRENT_DATE_DIR};

/// One entry in the index: everything about a cached tile except its bytes,
/// which live only on disk.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct IndexEntry {
    pub path: PathBuf,
    pub bytes: u64,
    pub written_at: DateTime<Utc>,
    pub last_access_at: DateTime<Utc>,
}

/// The in-memory (and serializable) index: key string -> entry.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CacheIndex {
    entries: HashMap<String, IndexEntry>,
}

impl CacheIndex {
    pub fn load_or_rebuild(root: &Path) -> Self {
        let index_path = root.join("cache_index.json");
        match std::fs::read(&index_path) {
            Ok(bytes) => match serde_json::from_slice::<CacheIndex>(&bytes) {
                Ok(index) => return index,
                Err(e) => {
                    tracing::warn!("cache index corrupt, rebuilding from disk: {e}");
                }
            },
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!("no cache index found at {:?}, rebuilding from disk", index_path);
            }
            Err(e) => {
                tracing::warn!("failed to read cache index, rebuilding from disk: {e}");
            }
        }
        Self::rebuild(root)
    }

    /// Walk `{root}/{provider}/{date}/{z}/{x}/{y}.jpg` and reconstruct an
    /// index entry per file found. Timestamps come from filesystem metadata;
    /// `last_access_at` starts out equal to `written_at`.
    fn rebuild(root: &Path) -> Self {
        let mut entries = HashMap::new();
        for provider in [Provider::GoogleEarth, Provider::EsriWayback] {
            let provider_dir = root.join(provider.as_str());
            let Ok(dates) = std::fs::read_dir(&provider_dir) else {
                continue;
            };
            for date_entry in dates.flatten() {
                let date_dir = date_entry.path();
                let date_name = date_entry.file_name().to_string_lossy().to_string();
                let date = if date_name == CURRENT_DATE_DIR {
                    None
                } else {
                    Some(date_name.clone())
                };
                walk_zxy(&date_dir, provider, date.as_deref(), &mut entries);
            }
        }
        tracing::info!("rebuilt cache index with {} entries", entries.len());
        CacheIndex { entries }
    }

    pub fn save(&self, root: &Path) -> Result<()> {
        let index_path = root.join("cache_index.json");
        let tmp_path = root.join("cache_index.json.tmp");
        let bytes = serde_json::to_vec_pretty(self)
            .map_err(|e| CacheError::IndexCorrupt(e.to_string()))?;
        std::fs::write(&tmp_path, bytes).map_err(|e| CacheError::Io(e.to_string()))?;
        std::fs::rename(&tmp_path, &index_path).map_err(|e| CacheError::Io(e.to_string()))?;
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<&IndexEntry> {
        self.entries.get(key)
    }

    pub fn touch(&mut self, key: &str, now: DateTime<Utc>) {
        if let Some(entry) = self.entries.get_mut(key) {
            entry.last_access_at = now;
        }
    }

    pub fn insert(&mut self, key: String, entry: IndexEntry) {
        self.entries.insert(key, entry);
    }

    pub fn remove(&mut self, key: &str) -> Option<IndexEntry> {
        self.entries.remove(key)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn total_bytes(&self) -> u64 {
        self.entries.values().map(|e| e.bytes).sum()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys ordered oldest-accessed first, for LRU eviction.
    pub fn keys_by_last_access(&self) -> Vec<String> {
        let mut pairs: Vec<(&String, &IndexEntry)> = self.entries.iter().collect();
        pairs.sort_by_key(|(_, e)| e.last_access_at);
        pairs.into_iter().map(|(k, _)| k.clone()).collect()
    }

    /// Keys whose `written_at` is older than `cutoff`, for TTL eviction.
    pub fn keys_older_than(&self, cutoff: DateTime<Utc>) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, e)| e.written_at < cutoff)
            .map(|(k, _)| k.clone())
            .collect()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &IndexEntry)> {
        self.entries.iter()
    }
}

fn walk_zxy(
    date_dir: &Path,
    provider: Provider,
    date: Option<&str>,
    out: &mut HashMap<String, IndexEntry>,
) {
    let Ok(zs) = std::fs::read_dir(date_dir) else {
        return;
    };
    for z_entry in zs.flatten() {
        let Ok(z) = z_entry.file_name().to_string_lossy().parse::<u8>() else {
            continue;
        };
        let Ok(xs) = std::fs::read_dir(z_entry.path()) else {
            continue;
        };
        for x_entry in xs.flatten() {
            let Ok(x) = x_entry.file_name().to_string_lossy().parse::<u32>() else {
                continue;
            };
            let Ok(ys) = std::fs::read_dir(x_entry.path()) else {
                continue;
            };
            for y_entry in ys.flatten() {
                let name = y_entry.file_name().to_string_lossy().to_string();
                let Some(y_str) = name.strip_suffix(".jpg") else {
                    continue;
                };
                let Ok(y) = y_str.parse::<u32>() else {
                    continue;
                };
                let Ok(metadata) = y_entry.metadata() else {
                    continue;
                };
                let written_at = metadata
                    .modified()
                    .map(DateTime::<Utc>::from)
                    .unwrap_or_else(|_| Utc::now());

                let key = CacheKey::new(provider, z, x, y, date.map(|d| d.to_string()));
                out.insert(
                    key.index_key(),
                    IndexEntry {
                        path: y_entry.path(),
                        bytes: metadata.len(),
                        written_at,
                        last_access_at: written_at,
                    },
                );
            }
        }
    }
}

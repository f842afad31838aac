use std::collections::HashMap;
use std::fs;
use std::path::PathBuf;
use std::sync::Mutex;
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::Result;

const CACHE_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct CacheFile {
    version: u32,
    entries: HashMap<String, CacheEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct CacheEntry {
    body: String,
    fetched_at: u64,
}

/// Fetched-payload cache handed to sources explicitly. Entries older than the TTL
/// are treated as absent; nothing is evicted until `invalidate*` or a newer `put`.
#[derive(Debug)]
pub struct FetchCache {
    ttl: Duration,
    path: Option<PathBuf>,
    inner: Mutex<CacheFile>,
}

impl FetchCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            path: None,
            inner: Mutex::new(CacheFile {
                version: CACHE_VERSION,
                entries: HashMap::new(),
            }),
        }
    }

    /// Backed by a JSON file; an unreadable or outdated file starts empty.
    pub fn with_file(path: PathBuf, ttl: Duration) -> Self {
        let loaded = fs::read_to_string(&path)
            .ok()
            .and_then(|raw| serde_json::from_str::<CacheFile>(&raw).ok())
            .filter(|c| c.version == CACHE_VERSION)
            .unwrap_or(CacheFile {
                version: CACHE_VERSION,
                entries: HashMap::new(),
            });
        Self {
            ttl,
            path: Some(path),
            inner: Mutex::new(loaded),
        }
    }

    pub fn get(&self, key: &str) -> Option<String> {
        self.get_at(key, SystemTime::now())
    }

    pub fn get_at(&self, key: &str, now: SystemTime) -> Option<String> {
        let guard = self.inner.lock().ok()?;
        let entry = guard.entries.get(key)?;
        let now_secs = system_time_to_secs(now).unwrap_or_default();
        if now_secs.saturating_sub(entry.fetched_at) > self.ttl.as_secs() {
            debug!(key, "cache entry expired");
            return None;
        }
        Some(entry.body.clone())
    }

    pub fn put(&self, key: &str, body: String) {
        self.put_at(key, body, SystemTime::now());
    }

    pub fn put_at(&self, key: &str, body: String, at: SystemTime) {
        let Ok(mut guard) = self.inner.lock() else {
            return;
        };
        guard.entries.insert(
            key.to_string(),
            CacheEntry {
                body,
                fetched_at: system_time_to_secs(at).unwrap_or_default(),
            },
        );
    }

    pub fn invalidate(&self, key: &str) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.entries.remove(key);
        }
    }

    pub fn invalidate_all(&self) {
        if let Ok(mut guard) = self.inner.lock() {
            guard.entries.clear();
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|g| g.entries.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Writes the cache file atomically (tmp + rename). No-op for in-memory caches.
    pub fn persist(&self) -> Result<()> {
        let Some(path) = self.path.as_ref() else {
            return Ok(());
        };
        let json = {
            let Ok(guard) = self.inner.lock() else {
                warn!("fetch cache lock poisoned; skipping persist");
                return Ok(());
            };
            serde_json::to_string(&*guard)?
        };
        if let Some(dir) = path.parent() {
            fs::create_dir_all(dir).ok();
        }
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, json)?;
        fs::rename(&tmp, path)?;
        Ok(())
    }
}

fn system_time_to_secs(time: SystemTime) -> Option<u64> {
    time.duration_since(UNIX_EPOCH).ok().map(|d| d.as_secs())
}

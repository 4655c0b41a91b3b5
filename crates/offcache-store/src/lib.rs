//! # Offcache Store
//!
//! Versioned request/response cache storage for the Offcache caching proxy.
//!
//! One [`Cache`] holds the entries of a single cache generation; its name is
//! the version tag of the deployment that populated it. [`CacheStorage`] is
//! the set of all generations currently on disk-equivalent storage, keyed by
//! name.
//!
//! ```text
//! CacheStorage
//!     └── Cache ("SW0021")
//!             └── "GET https://app.example/index.html" → CacheEntry
//! ```
//!
//! The structures here are plain in-memory maps; callers that share them
//! across tasks wrap them in their own synchronization.

use hashbrown::HashMap;
use serde::{Deserialize, Serialize};
use std::time::{SystemTime, UNIX_EPOCH};

/// Build the identity key for a request: method plus full URL.
///
/// Two requests are the same cache entry exactly when their methods and URLs
/// are equal.
pub fn request_key(method: &str, url: &str) -> String {
    format!("{} {}", method, url)
}

/// A cached request/response pair.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Request URL.
    pub url: String,

    /// Request method.
    pub method: String,

    /// Response status.
    pub status: u16,

    /// Response headers.
    pub headers: HashMap<String, String>,

    /// Response body.
    pub body: Vec<u8>,

    /// Cached at timestamp (ms since epoch).
    pub cached_at: u64,
}

impl CacheEntry {
    /// Create an entry for a GET response.
    pub fn new(url: &str, method: &str, status: u16, body: Vec<u8>) -> Self {
        Self {
            url: url.to_string(),
            method: method.to_string(),
            status,
            headers: HashMap::new(),
            body,
            cached_at: now_ms(),
        }
    }

    /// The identity key this entry is stored under.
    pub fn key(&self) -> String {
        request_key(&self.method, &self.url)
    }
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

/// A single cache generation.
#[derive(Debug, Default, Clone)]
pub struct Cache {
    /// Generation name (the version tag that created it).
    pub name: String,

    entries: HashMap<String, CacheEntry>,
}

impl Cache {
    /// Create an empty generation.
    pub fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
            entries: HashMap::new(),
        }
    }

    /// Match a request by method and URL.
    pub fn match_request(&self, method: &str, url: &str) -> Option<&CacheEntry> {
        self.entries.get(&request_key(method, url))
    }

    /// Store an entry under its identity key, replacing any previous one.
    pub fn put(&mut self, entry: CacheEntry) {
        self.entries.insert(entry.key(), entry);
    }

    /// Remove the entry for a request. Returns whether one existed.
    pub fn delete(&mut self, method: &str, url: &str) -> bool {
        self.entries.remove(&request_key(method, url)).is_some()
    }

    /// All identity keys in this generation.
    pub fn keys(&self) -> Vec<&str> {
        self.entries.keys().map(|s| s.as_str()).collect()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the generation holds no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// All cache generations, keyed by name.
#[derive(Debug, Default)]
pub struct CacheStorage {
    caches: HashMap<String, Cache>,
}

impl CacheStorage {
    /// Create empty storage.
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a generation, creating it if absent.
    pub fn open(&mut self, name: &str) -> &mut Cache {
        self.caches
            .entry(name.to_string())
            .or_insert_with(|| Cache::new(name))
    }

    /// Check whether a generation exists.
    pub fn has(&self, name: &str) -> bool {
        self.caches.contains_key(name)
    }

    /// Delete a generation in full. Returns whether it existed.
    pub fn delete(&mut self, name: &str) -> bool {
        self.caches.remove(name).is_some()
    }

    /// All generation names.
    pub fn keys(&self) -> Vec<&str> {
        self.caches.keys().map(|s| s.as_str()).collect()
    }

    /// Match a request across all generations.
    pub fn match_request(&self, method: &str, url: &str) -> Option<&CacheEntry> {
        self.caches
            .values()
            .find_map(|cache| cache.match_request(method, url))
    }

    /// Match a request within one named generation.
    pub fn match_in(&self, name: &str, method: &str, url: &str) -> Option<&CacheEntry> {
        self.caches.get(name)?.match_request(method, url)
    }

    /// Insert a batch of entries into a generation, creating it if absent.
    ///
    /// The batch is applied in one step; install-time population goes through
    /// here so a generation never becomes visible half-filled.
    pub fn put_batch(&mut self, name: &str, entries: Vec<CacheEntry>) {
        let cache = self.open(name);
        for entry in entries {
            cache.put(entry);
        }
    }
}

//! # Router Cache
//!
//! TTL-bounded map from `(tenant, peer name)` to the URL of the target that
//! serves the peer. Entries expire lazily: an expired entry is dropped the
//! next time it is read or listed.
//!
//! Keys are stored as `encode(tenant) ":" encode(name)` with percent
//! encoding, so identifiers that themselves contain `:` (or any other
//! separator) can never collide or leak into another tenant's listing.
//!
//! A full resync is `reset()` followed by one `set()` per entry. The pair is
//! not atomic; readers may briefly see fewer entries than expected.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::time::Instant;

use crate::configs::RouterCacheConfig;

const KEY_SEPARATOR: char = ':';

struct CacheEntry {
    server_url: String,
    expires_at: Instant,
}

/// # Router Cache
pub struct RouterCache {
    ttl: Duration,
    capacity: Option<usize>,
    entries: Mutex<HashMap<String, CacheEntry>>,
}

impl RouterCache {
    /// Creates an empty cache from its configuration section.
    pub fn new(config: &RouterCacheConfig) -> Self {
        Self::with_ttl(config.ttl(), config.capacity)
    }

    /// Creates an empty cache with an explicit TTL and optional capacity.
    pub fn with_ttl(ttl: Duration, capacity: Option<usize>) -> Self {
        Self {
            ttl,
            capacity,
            entries: Mutex::new(HashMap::new()),
        }
    }

    fn key(tenant_id: &str, name: &str) -> String {
        format!(
            "{}{}{}",
            urlencoding::encode(tenant_id),
            KEY_SEPARATOR,
            urlencoding::encode(name)
        )
    }

    fn split_key(key: &str) -> Option<(String, String)> {
        let (tenant, name) = key.split_once(KEY_SEPARATOR)?;
        Some((
            urlencoding::decode(tenant).ok()?.into_owned(),
            urlencoding::decode(name).ok()?.into_owned(),
        ))
    }

    /// Resolves `(tenant_id, name)`; `None` when absent or expired.
    pub fn get(&self, tenant_id: &str, name: &str) -> Option<String> {
        let key = Self::key(tenant_id, name);
        let mut entries = self.entries.lock().expect("Router cache lock poisoned");
        match entries.get(&key) {
            Some(entry) if entry.expires_at > Instant::now() => Some(entry.server_url.clone()),
            Some(_) => {
                entries.remove(&key);
                None
            }
            None => None,
        }
    }

    /// Stores `(tenant_id, name) -> server_url` with a fresh TTL.
    pub fn set(&self, tenant_id: &str, name: &str, server_url: &str) {
        let key = Self::key(tenant_id, name);
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("Router cache lock poisoned");

        if let Some(capacity) = self.capacity {
            if !entries.contains_key(&key) && entries.len() >= capacity {
                entries.retain(|_, e| e.expires_at > now);
                if entries.len() >= capacity {
                    let oldest = entries
                        .iter()
                        .min_by_key(|(_, e)| e.expires_at)
                        .map(|(k, _)| k.clone());
                    if let Some(oldest) = oldest {
                        entries.remove(&oldest);
                    }
                }
            }
        }

        entries.insert(
            key,
            CacheEntry {
                server_url: server_url.to_string(),
                expires_at: now + self.ttl,
            },
        );
    }

    /// Lists live `(tenant_id, name)` keys, optionally for a single tenant.
    pub fn keys(&self, tenant_id: Option<&str>) -> Vec<(String, String)> {
        let now = Instant::now();
        let mut entries = self.entries.lock().expect("Router cache lock poisoned");
        entries.retain(|_, e| e.expires_at > now);

        let mut keys: Vec<(String, String)> = entries
            .keys()
            .filter_map(|k| Self::split_key(k))
            .filter(|(tenant, _)| tenant_id.map_or(true, |t| t == tenant))
            .collect();
        keys.sort();
        keys
    }

    /// Server URLs currently cached for `tenant_id`, deduplicated.
    pub fn urls(&self, tenant_id: &str) -> Vec<String> {
        let mut urls: Vec<String> = self
            .keys(Some(tenant_id))
            .into_iter()
            .filter_map(|(tenant, name)| self.get(&tenant, &name))
            .collect();
        urls.sort();
        urls.dedup();
        urls
    }

    /// Drops every entry.
    pub fn reset(&self) {
        self.entries.lock().expect("Router cache lock poisoned").clear();
    }

    /// Number of stored entries, expired ones included until they are read.
    pub fn len(&self) -> usize {
        self.entries.lock().expect("Router cache lock poisoned").len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

//! `Cache` (spec §4, §9): whole-file cache with per-entry TTL and access
//! counters, grounded on `manage_cache.py`'s `FileCache.is_file_cached` /
//! `cache_file`. `stats()` is a supplement — the original command mentions
//! cache stats only as "a demo implementation" — filled in here with the
//! counters a real operator would want.

use std::collections::HashMap;
use std::time::Instant;

use bytes::Bytes;
use parking_lot::Mutex;
use uuid::Uuid;

use crate::config::Config;

struct Entry {
    data: Bytes,
    cached_at: Instant,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct CacheStats {
    pub entries: usize,
    pub total_bytes: u64,
    pub hits: u64,
    pub misses: u64,
}

struct State {
    entries: HashMap<Uuid, Entry>,
    access_counts: HashMap<Uuid, (u64, Instant)>,
    hits: u64,
    misses: u64,
}

pub struct Cache {
    config: Config,
    state: Mutex<State>,
}

impl Cache {
    pub fn new(config: Config) -> Self {
        Self {
            config,
            state: Mutex::new(State {
                entries: HashMap::new(),
                access_counts: HashMap::new(),
                hits: 0,
                misses: 0,
            }),
        }
    }

    /// Returns the cached bytes for `file_id` if present and not expired,
    /// recording a hit or miss and bumping the access counter either way.
    pub fn get(&self, file_id: Uuid) -> Option<Bytes> {
        let mut state = self.state.lock();
        self.bump_access(&mut state, file_id);

        let expired = state
            .entries
            .get(&file_id)
            .map(|e| e.cached_at.elapsed() >= self.config.cache_file_ttl())
            .unwrap_or(true);
        if expired {
            state.entries.remove(&file_id);
            state.misses += 1;
            return None;
        }
        state.hits += 1;
        state.entries.get(&file_id).map(|e| e.data.clone())
    }

    /// Caches `data` for `file_id` unless it exceeds `cache_file_max_size`.
    pub fn put(&self, file_id: Uuid, data: Bytes) {
        if data.len() as u64 > self.config.cache_file_max_size {
            return;
        }
        self.state.lock().entries.insert(file_id, Entry { data, cached_at: Instant::now() });
    }

    /// Drops `file_id`'s cached entry, if any. Called on a structural change
    /// to the file's chunks (repair rewrites an object key) so a later read
    /// doesn't serve stale bytes out of cache — not called for replica
    /// creation, which changes nothing the reassembled file depends on.
    pub fn invalidate(&self, file_id: Uuid) {
        self.state.lock().entries.remove(&file_id);
    }

    pub fn is_cached(&self, file_id: Uuid) -> bool {
        let state = self.state.lock();
        state
            .entries
            .get(&file_id)
            .map(|e| e.cached_at.elapsed() < self.config.cache_file_ttl())
            .unwrap_or(false)
    }

    fn bump_access(&self, state: &mut State, file_id: Uuid) {
        let ttl = self.config.access_count_ttl();
        let entry = state.access_counts.entry(file_id).or_insert((0, Instant::now()));
        if entry.1.elapsed() >= ttl {
            *entry = (0, Instant::now());
        }
        entry.0 += 1;
    }

    pub fn access_count(&self, file_id: Uuid) -> u64 {
        self.state.lock().access_counts.get(&file_id).map(|(count, _)| *count).unwrap_or(0)
    }

    pub fn stats(&self) -> CacheStats {
        let state = self.state.lock();
        CacheStats {
            entries: state.entries.len(),
            total_bytes: state.entries.values().map(|e| e.data.len() as u64).sum(),
            hits: state.hits,
            misses: state.misses,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn oversized_files_are_never_cached() {
        let mut config = Config::default();
        config.cache_file_max_size = 4;
        let cache = Cache::new(config);
        let id = Uuid::new_v4();
        cache.put(id, Bytes::from_static(b"too big"));
        assert!(!cache.is_cached(id));
    }

    #[test]
    fn invalidate_forces_a_miss() {
        let cache = Cache::new(Config::default());
        let id = Uuid::new_v4();
        cache.put(id, Bytes::from_static(b"x"));
        assert!(cache.is_cached(id));
        cache.invalidate(id);
        assert!(!cache.is_cached(id));
        assert!(cache.get(id).is_none());
    }

    #[test]
    fn hit_then_miss_after_ttl() {
        let mut config = Config::default();
        config.cache_file_ttl_secs = 0;
        let cache = Cache::new(config);
        let id = Uuid::new_v4();
        cache.put(id, Bytes::from_static(b"x"));
        std::thread::sleep(std::time::Duration::from_millis(5));
        assert!(cache.get(id).is_none());
        assert_eq!(cache.stats().misses, 1);
    }
}

//! KV-prefix cache: lets two requests that share a prompt prefix reuse the
//! same KV state instead of recomputing it. Keyed by an FNV-1a hash of the
//! prefix text; a simple non-cryptographic hash is enough here since
//! collisions only cost a cache miss, never correctness (the engine still
//! validates the KV state matches before reusing it).

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

/// 64-bit FNV-1a, rendered as 16 lowercase hex digits.
pub fn compute_prefix_hash(prefix: &str) -> String {
    const FNV_OFFSET: u64 = 0xcbf29ce484222325;
    const FNV_PRIME: u64 = 0x100000001b3;

    let mut hash = FNV_OFFSET;
    for byte in prefix.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(FNV_PRIME);
    }
    format!("{hash:016x}")
}

#[derive(Debug, Clone)]
pub struct Entry {
    pub kv_state: Vec<u8>,
    pub token_count: usize,
    pub vram_bytes: u64,
}

#[derive(Debug, Clone, Default)]
pub struct Stats {
    pub hit_count: u64,
    pub miss_count: u64,
    pub entry_count: usize,
    pub current_vram_bytes: u64,
    pub vram_limit_bytes: u64,
}

struct Inner {
    entries: HashMap<String, Entry>,
    /// Front = most recently used. Kept as a separate order list rather
    /// than an ordered map since entries are moved to front far more
    /// often than the map itself is iterated.
    order: VecDeque<String>,
    vram_limit_bytes: u64,
    current_vram_bytes: u64,
    hit_count: u64,
    miss_count: u64,
}

impl Inner {
    fn touch(&mut self, hash: &str) {
        if let Some(pos) = self.order.iter().position(|h| h == hash) {
            let h = self.order.remove(pos).unwrap();
            self.order.push_front(h);
        }
    }

    fn evict_if_needed(&mut self) {
        while self.vram_limit_bytes > 0 && self.current_vram_bytes > self.vram_limit_bytes {
            let Some(oldest) = self.order.pop_back() else {
                break;
            };
            if let Some(entry) = self.entries.remove(&oldest) {
                self.current_vram_bytes = self.current_vram_bytes.saturating_sub(entry.vram_bytes);
            }
        }
    }
}

/// LRU cache of KV-prefix state, bounded by a VRAM budget rather than an
/// entry count since entries vary wildly in size.
pub struct PrefixCache {
    inner: Mutex<Inner>,
}

impl Default for PrefixCache {
    fn default() -> Self {
        Self::new()
    }
}

impl PrefixCache {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                entries: HashMap::new(),
                order: VecDeque::new(),
                vram_limit_bytes: 0,
                current_vram_bytes: 0,
                hit_count: 0,
                miss_count: 0,
            }),
        }
    }

    pub fn set_vram_limit(&self, bytes: u64) {
        let mut inner = self.inner.lock().unwrap();
        inner.vram_limit_bytes = bytes;
        inner.evict_if_needed();
    }

    pub fn vram_limit(&self) -> u64 {
        self.inner.lock().unwrap().vram_limit_bytes
    }

    pub fn current_usage(&self) -> u64 {
        self.inner.lock().unwrap().current_vram_bytes
    }

    pub fn get(&self, prefix_hash: &str) -> Option<Entry> {
        let mut inner = self.inner.lock().unwrap();
        if let Some(entry) = inner.entries.get(prefix_hash).cloned() {
            inner.hit_count += 1;
            inner.touch(prefix_hash);
            Some(entry)
        } else {
            inner.miss_count += 1;
            None
        }
    }

    pub fn put(&self, prefix_hash: String, kv_state: Vec<u8>, token_count: usize, vram_bytes: u64) {
        let mut inner = self.inner.lock().unwrap();
        if let Some(existing) = inner.entries.remove(&prefix_hash) {
            inner.current_vram_bytes = inner.current_vram_bytes.saturating_sub(existing.vram_bytes);
            if let Some(pos) = inner.order.iter().position(|h| h == &prefix_hash) {
                inner.order.remove(pos);
            }
        }

        inner.order.push_front(prefix_hash.clone());
        inner.entries.insert(
            prefix_hash,
            Entry {
                kv_state,
                token_count,
                vram_bytes,
            },
        );
        inner.current_vram_bytes += vram_bytes;
        inner.evict_if_needed();
    }

    pub fn clear(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.entries.clear();
        inner.order.clear();
        inner.current_vram_bytes = 0;
    }

    pub fn entry_count(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn stats(&self) -> Stats {
        let inner = self.inner.lock().unwrap();
        Stats {
            hit_count: inner.hit_count,
            miss_count: inner.miss_count,
            entry_count: inner.entries.len(),
            current_vram_bytes: inner.current_vram_bytes,
            vram_limit_bytes: inner.vram_limit_bytes,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hash_is_stable_and_16_hex_chars() {
        let h1 = compute_prefix_hash("hello world");
        let h2 = compute_prefix_hash("hello world");
        assert_eq!(h1, h2);
        assert_eq!(h1.len(), 16);
        assert!(h1.chars().all(|c| c.is_ascii_hexdigit()));
    }

    #[test]
    fn different_prefixes_hash_differently() {
        assert_ne!(compute_prefix_hash("a"), compute_prefix_hash("b"));
    }

    #[test]
    fn get_records_hit_and_miss() {
        let cache = PrefixCache::new();
        assert!(cache.get("missing").is_none());
        cache.put("h1".into(), vec![1, 2, 3], 10, 100);
        assert!(cache.get("h1").is_some());

        let stats = cache.stats();
        assert_eq!(stats.hit_count, 1);
        assert_eq!(stats.miss_count, 1);
    }

    #[test]
    fn evicts_lru_entry_when_over_vram_limit() {
        let cache = PrefixCache::new();
        cache.set_vram_limit(150);
        cache.put("old".into(), vec![], 1, 100);
        cache.put("new".into(), vec![], 1, 100);

        // Inserting "new" pushed usage to 200 > 150, so "old" (least
        // recently used) is evicted.
        assert!(cache.get("old").is_none());
        assert!(cache.entry_count() <= 1);
    }

    #[test]
    fn get_moves_entry_to_front_protecting_it_from_eviction() {
        let cache = PrefixCache::new();
        cache.set_vram_limit(150);
        cache.put("a".into(), vec![], 1, 100);
        cache.put("b".into(), vec![], 1, 0);
        // touch "a" so "b" becomes the LRU candidate instead
        cache.get("a");
        cache.put("c".into(), vec![], 1, 100);

        assert!(cache.get("a").is_some());
    }

    #[test]
    fn clear_resets_usage_and_entries() {
        let cache = PrefixCache::new();
        cache.put("a".into(), vec![], 1, 50);
        cache.clear();
        assert_eq!(cache.entry_count(), 0);
        assert_eq!(cache.current_usage(), 0);
    }
}

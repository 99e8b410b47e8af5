// src/pac/cache.rs
use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use super::directive::ProxyDirective;
use crate::config::CacheKeyMode;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct CacheKey {
    url: Option<String>,
    host: String,
}

impl CacheKey {
    pub fn new(mode: CacheKeyMode, url: &str, host: &str) -> Self {
        let url = match mode {
            CacheKeyMode::UrlAndHost => Some(url.to_string()),
            CacheKeyMode::HostOnly => None,
        };
        Self {
            url,
            host: host.to_string(),
        }
    }
}

/// Stamp identifying which script and which invalidation round a result belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStamp {
    generation: u64,
    epoch: u64,
}

impl CacheStamp {
    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[derive(Debug)]
struct Slot {
    directive: ProxyDirective,
    stored_at: Instant,
    tick: u64,
}

/// LRU map of successful evaluations with an optional time-to-live.
#[derive(Debug)]
pub struct ResultCache {
    capacity: usize,
    ttl: Option<Duration>,
    generation: u64,
    epoch: u64,
    tick: u64,
    entries: HashMap<CacheKey, Slot>,
    recency: BTreeMap<u64, CacheKey>,
}

impl ResultCache {
    pub fn new(capacity: usize, ttl: Option<Duration>) -> Self {
        Self {
            capacity,
            ttl,
            generation: 0,
            epoch: 0,
            tick: 0,
            entries: HashMap::new(),
            recency: BTreeMap::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Stamp to hand back to [`ResultCache::insert`] once a result computed now is ready.
    pub fn stamp(&self) -> CacheStamp {
        CacheStamp {
            generation: self.generation,
            epoch: self.epoch,
        }
    }

    pub fn get(&mut self, generation: u64, key: &CacheKey, now: Instant) -> Option<ProxyDirective> {
        if generation != self.generation {
            return None;
        }
        let expired = {
            let slot = self.entries.get(key)?;
            self.ttl
                .is_some_and(|ttl| now.saturating_duration_since(slot.stored_at) >= ttl)
        };
        if expired {
            self.remove(key);
            return None;
        }

        self.tick += 1;
        let tick = self.tick;
        let slot = self.entries.get_mut(key)?;
        self.recency.remove(&slot.tick);
        slot.tick = tick;
        self.recency.insert(tick, key.clone());
        Some(slot.directive.clone())
    }

    /// Stores `directive` unless the cache moved on since `stamp` was taken.
    pub fn insert(
        &mut self,
        stamp: CacheStamp,
        key: CacheKey,
        directive: ProxyDirective,
        now: Instant,
    ) -> bool {
        if self.capacity == 0 || stamp != self.stamp() {
            return false;
        }
        self.remove(&key);
        while self.entries.len() >= self.capacity {
            let Some((_, oldest)) = self.recency.pop_first() else {
                break;
            };
            self.entries.remove(&oldest);
        }

        self.tick += 1;
        self.recency.insert(self.tick, key.clone());
        self.entries.insert(
            key,
            Slot {
                directive,
                stored_at: now,
                tick: self.tick,
            },
        );
        true
    }

    /// Drops everything; results computed before this call are refused later.
    pub fn clear(&mut self) {
        self.entries.clear();
        self.recency.clear();
        self.epoch += 1;
    }

    /// Clears and binds the cache to a new script generation.
    pub fn reset(&mut self, generation: u64) {
        self.clear();
        self.generation = generation;
    }

    fn remove(&mut self, key: &CacheKey) {
        if let Some(slot) = self.entries.remove(key) {
            self.recency.remove(&slot.tick);
        }
    }
}

//! Two-tier model cache.
//!
//! Entries live in exactly one of two tiers:
//!
//! - **active**: in use; refreshed by every [`ModelCache::get`].
//! - **pending release**: idle for longer than the idle TTL. A `get` on a
//!   pending entry moves it back to active without reloading anything.
//!
//! All tier transitions happen in [`ModelCache::tick`], in this order:
//!
//! 1. active entries idle for longer than the idle TTL move to pending;
//! 2. pending entries older than the pending TTL are disposed;
//! 3. while both tiers together exceed the capacity, the least recently
//!    used pending entry is disposed. Active entries are never evicted for
//!    capacity.
//!
//! Disposers run outside the cache lock. A failing or panicking disposer is
//! logged for its key and never stops the rest of the pass.

mod clock;

use std::collections::HashMap;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

use parking_lot::Mutex;

use crate::config::CacheConfig;
use crate::error::DisposeError;
use crate::profiling::profile_function;

pub use clock::{Clock, ManualClock, SystemClock};

struct CacheEntry<T> {
    value: T,
    last_access: Instant,
    /// Set while the entry is pending release.
    pending_since: Option<Instant>,
}

struct Tiers<T> {
    active: HashMap<String, CacheEntry<T>>,
    pending: HashMap<String, CacheEntry<T>>,
}

impl<T> Tiers<T> {
    fn remove(&mut self, key: &str) -> Option<CacheEntry<T>> {
        self.active.remove(key).or_else(|| self.pending.remove(key))
    }
}

/// Transitions made by one [`ModelCache::tick`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Active entries moved to pending release.
    pub idled: usize,
    /// Pending entries disposed after the pending TTL.
    pub expired: usize,
    /// Pending entries disposed for capacity.
    pub evicted: usize,
}

/// Counters of a [`ModelCache`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub active: usize,
    pub pending: usize,
    pub hits: u64,
    pub misses: u64,
    /// Hits served from the pending tier.
    pub promotions: u64,
    pub disposed: u64,
    pub dispose_failures: u64,
}

/// Two-tier cache of loaded models keyed by string.
///
/// # Example
///
/// ```ignore
/// let cache = ModelCache::new("models", CacheConfig::default(), Arc::new(SystemClock));
/// cache.put("hero", Arc::new(model));
///
/// // Once per frame, on the render thread:
/// cache.tick(|_key, model| pool.dispose(model));
/// ```
pub struct ModelCache<T> {
    name: String,
    config: CacheConfig,
    clock: Arc<dyn Clock>,
    tiers: Mutex<Tiers<T>>,
    hits: AtomicU64,
    misses: AtomicU64,
    promotions: AtomicU64,
    disposed: AtomicU64,
    dispose_failures: AtomicU64,
}

impl<T: Clone> ModelCache<T> {
    pub fn new(name: impl Into<String>, config: CacheConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            name: name.into(),
            config,
            clock,
            tiers: Mutex::new(Tiers {
                active: HashMap::new(),
                pending: HashMap::new(),
            }),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
            promotions: AtomicU64::new(0),
            disposed: AtomicU64::new(0),
            dispose_failures: AtomicU64::new(0),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    /// Look up `key` in either tier and refresh its access time.
    ///
    /// A pending entry is moved back to active.
    pub fn get(&self, key: &str) -> Option<T> {
        let now = self.clock.now();
        let mut tiers = self.tiers.lock();

        if let Some(entry) = tiers.active.get_mut(key) {
            entry.last_access = now;
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Some(entry.value.clone());
        }

        let Some(mut entry) = tiers.pending.remove(key) else {
            self.misses.fetch_add(1, Ordering::Relaxed);
            return None;
        };
        entry.last_access = now;
        entry.pending_since = None;
        let value = entry.value.clone();
        tiers.active.insert(key.to_string(), entry);
        self.hits.fetch_add(1, Ordering::Relaxed);
        self.promotions.fetch_add(1, Ordering::Relaxed);
        log::debug!("[{}] {} returned to active", self.name, key);
        Some(value)
    }

    /// Insert `value` as active. Returns the value previously stored under
    /// `key` in either tier; the caller owns it.
    pub fn put(&self, key: impl Into<String>, value: T) -> Option<T> {
        let key = key.into();
        let now = self.clock.now();
        let mut tiers = self.tiers.lock();
        let previous = tiers.remove(&key).map(|entry| entry.value);
        log::debug!("[{}] put {}", self.name, key);
        tiers.active.insert(
            key,
            CacheEntry {
                value,
                last_access: now,
                pending_since: None,
            },
        );
        previous
    }

    /// Remove `key` without disposing it.
    pub fn take(&self, key: &str) -> Option<T> {
        self.tiers.lock().remove(key).map(|entry| entry.value)
    }

    /// Remove `key` and dispose it. Returns whether it was present.
    pub fn remove<F>(&self, key: &str, mut disposer: F) -> bool
    where
        F: FnMut(&str, T) -> Result<(), DisposeError>,
    {
        let Some(entry) = self.tiers.lock().remove(key) else {
            return false;
        };
        self.dispose(vec![(key.to_string(), entry.value)], &mut disposer, "removed");
        true
    }

    /// Remove and dispose every entry matching `predicate`, in both tiers.
    pub fn remove_matching<P, F>(&self, mut predicate: P, mut disposer: F) -> usize
    where
        P: FnMut(&str, &T) -> bool,
        F: FnMut(&str, T) -> Result<(), DisposeError>,
    {
        let victims = {
            let mut tiers = self.tiers.lock();
            let tiers = &mut *tiers;
            let mut victims = Vec::new();
            for tier in [&mut tiers.active, &mut tiers.pending] {
                let keys: Vec<String> = tier
                    .iter()
                    .filter(|(key, entry)| predicate(key.as_str(), &entry.value))
                    .map(|(key, _)| key.clone())
                    .collect();
                for key in keys {
                    if let Some(entry) = tier.remove(&key) {
                        victims.push((key, entry.value));
                    }
                }
            }
            victims
        };
        let count = victims.len();
        self.dispose(victims, &mut disposer, "removed");
        count
    }

    /// Dispose every entry.
    pub fn clear<F>(&self, mut disposer: F) -> usize
    where
        F: FnMut(&str, T) -> Result<(), DisposeError>,
    {
        let victims: Vec<(String, T)> = {
            let mut tiers = self.tiers.lock();
            let tiers = &mut *tiers;
            tiers
                .active
                .drain()
                .chain(tiers.pending.drain())
                .map(|(key, entry)| (key, entry.value))
                .collect()
        };
        let count = victims.len();
        self.dispose(victims, &mut disposer, "cleared");
        count
    }

    /// Apply idle promotion, TTL expiry and capacity eviction, in that order.
    pub fn tick<F>(&self, mut disposer: F) -> TickReport
    where
        F: FnMut(&str, T) -> Result<(), DisposeError>,
    {
        profile_function!();
        let now = self.clock.now();
        let idle_ttl = self.config.idle_ttl();
        let pending_ttl = self.config.pending_ttl();
        let mut report = TickReport::default();

        let (expired, evicted) = {
            let mut tiers = self.tiers.lock();

            let idle: Vec<String> = tiers
                .active
                .iter()
                .filter(|(_, entry)| now.saturating_duration_since(entry.last_access) > idle_ttl)
                .map(|(key, _)| key.clone())
                .collect();
            for key in idle {
                if let Some(mut entry) = tiers.active.remove(&key) {
                    entry.pending_since = Some(now);
                    log::debug!("[{}] {} idle, pending release", self.name, key);
                    tiers.pending.insert(key, entry);
                    report.idled += 1;
                }
            }

            let stale: Vec<String> = tiers
                .pending
                .iter()
                .filter(|(_, entry)| {
                    entry
                        .pending_since
                        .is_some_and(|since| now.saturating_duration_since(since) > pending_ttl)
                })
                .map(|(key, _)| key.clone())
                .collect();
            let expired: Vec<(String, T)> = stale
                .into_iter()
                .filter_map(|key| tiers.pending.remove(&key).map(|entry| (key, entry.value)))
                .collect();

            let mut evicted = Vec::new();
            let total = tiers.active.len() + tiers.pending.len();
            if total > self.config.capacity {
                let mut candidates: Vec<(Instant, String)> = tiers
                    .pending
                    .iter()
                    .map(|(key, entry)| (entry.last_access, key.clone()))
                    .collect();
                candidates.sort();
                let excess = total - self.config.capacity;
                for (_, key) in candidates.into_iter().take(excess) {
                    if let Some(entry) = tiers.pending.remove(&key) {
                        evicted.push((key, entry.value));
                    }
                }
                if tiers.active.len() > self.config.capacity {
                    log::warn!(
                        "[{}] {} active entries exceed capacity {}",
                        self.name,
                        tiers.active.len(),
                        self.config.capacity
                    );
                }
            }
            (expired, evicted)
        };

        report.expired = expired.len();
        report.evicted = evicted.len();
        self.dispose(expired, &mut disposer, "expired");
        self.dispose(evicted, &mut disposer, "evicted for capacity");
        report
    }

    fn dispose<F>(&self, victims: Vec<(String, T)>, disposer: &mut F, reason: &str)
    where
        F: FnMut(&str, T) -> Result<(), DisposeError>,
    {
        for (key, value) in victims {
            let outcome = std::panic::catch_unwind(AssertUnwindSafe(|| disposer(&key, value)));
            match outcome {
                Ok(Ok(())) => {
                    self.disposed.fetch_add(1, Ordering::Relaxed);
                    log::info!("[{}] disposed {} ({})", self.name, key, reason);
                }
                Ok(Err(e)) => {
                    self.dispose_failures.fetch_add(1, Ordering::Relaxed);
                    log::error!("[{}] failed to dispose {}: {}", self.name, key, e);
                }
                Err(_) => {
                    self.dispose_failures.fetch_add(1, Ordering::Relaxed);
                    log::error!("[{}] disposer panicked for {}", self.name, key);
                }
            }
        }
    }

    pub fn contains(&self, key: &str) -> bool {
        let tiers = self.tiers.lock();
        tiers.active.contains_key(key) || tiers.pending.contains_key(key)
    }

    /// Whether `key` is pending release.
    pub fn is_pending(&self, key: &str) -> bool {
        self.tiers.lock().pending.contains_key(key)
    }

    /// Entries in both tiers.
    pub fn len(&self) -> usize {
        let tiers = self.tiers.lock();
        tiers.active.len() + tiers.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn active_len(&self) -> usize {
        self.tiers.lock().active.len()
    }

    pub fn pending_len(&self) -> usize {
        self.tiers.lock().pending.len()
    }

    /// Visit every active entry. The cache is locked during the visit.
    pub fn for_each_active(&self, mut visit: impl FnMut(&str, &T)) {
        for (key, entry) in self.tiers.lock().active.iter() {
            visit(key, &entry.value);
        }
    }

    /// Visit every entry of both tiers in one consistent view.
    ///
    /// The flag is `true` for pending entries. The cache stays locked for
    /// the whole visit, so a concurrent promotion is seen either before or
    /// after, never halfway.
    pub fn for_each_entry(&self, mut visit: impl FnMut(&str, &T, bool)) {
        let tiers = self.tiers.lock();
        for (key, entry) in tiers.active.iter() {
            visit(key, &entry.value, false);
        }
        for (key, entry) in tiers.pending.iter() {
            visit(key, &entry.value, true);
        }
    }

    pub fn stats(&self) -> CacheStats {
        let (active, pending) = {
            let tiers = self.tiers.lock();
            (tiers.active.len(), tiers.pending.len())
        };
        CacheStats {
            active,
            pending,
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            promotions: self.promotions.load(Ordering::Relaxed),
            disposed: self.disposed.load(Ordering::Relaxed),
            dispose_failures: self.dispose_failures.load(Ordering::Relaxed),
        }
    }
}

impl<T> std::fmt::Debug for ModelCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let tiers = self.tiers.lock();
        f.debug_struct("ModelCache")
            .field("name", &self.name)
            .field("active", &tiers.active.len())
            .field("pending", &tiers.pending.len())
            .field("config", &self.config)
            .finish()
    }
}

static_assertions::assert_impl_all!(ModelCache<Arc<u32>>: Send, Sync);

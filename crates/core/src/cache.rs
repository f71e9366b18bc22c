//! Named TTL caches with lazy, single-flight refresh.
//!
//! A cache maps string keys to JSON values. Each entry carries a refresh
//! function and a time-to-live; `get` returns the cached value while it is
//! fresh and otherwise awaits one refresh. Concurrent readers of a stale key
//! coalesce onto a single refresh: the entry's refresh lock serialises them
//! and late arrivals re-check freshness after acquiring it, so the refresh
//! function runs at most once per staleness window.
//!
//! Caching can be disabled process-wide (config `CACHING=false`), in which
//! case every `get` refreshes.

use crate::error::{CoreError, CoreResult};
use futures::future::BoxFuture;
use rand::Rng;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, LazyLock, Mutex};
use std::time::{Duration, Instant};

/// Error type produced by refresh functions. The cause is logged; callers
/// of `get` only ever observe [`CoreError::CacheRefresh`].
pub type RefreshError = Box<dyn std::error::Error + Send + Sync>;

/// Refresh a single key.
pub type RefreshFn =
    Arc<dyn Fn(String) -> BoxFuture<'static, Result<Value, RefreshError>> + Send + Sync>;

/// Refresh a batch of keys at once. Must return one value per requested
/// key, in the same order.
pub type RefreshManyFn =
    Arc<dyn Fn(Vec<String>) -> BoxFuture<'static, Result<Vec<Value>, RefreshError>> + Send + Sync>;

static ENABLED: AtomicBool = AtomicBool::new(true);

/// Enable or disable caching process-wide.
pub fn set_enabled(enabled: bool) {
    ENABLED.store(enabled, Ordering::Relaxed);
}

/// Whether caching is enabled process-wide.
pub fn enabled() -> bool {
    ENABLED.load(Ordering::Relaxed)
}

struct EntryState {
    value: Value,
    last_update: Option<Instant>,
}

struct Entry {
    ttl: Duration,
    /// `None` when the entry is served by the cache's `add_all` fallback.
    refresh: Option<RefreshFn>,
    state: Mutex<EntryState>,
    /// Single-flight guard: held for the duration of a refresh.
    refresh_lock: Arc<tokio::sync::Mutex<()>>,
}

impl Entry {
    fn new(ttl: Duration, refresh: Option<RefreshFn>) -> Arc<Self> {
        Arc::new(Self {
            ttl,
            refresh,
            state: Mutex::new(EntryState {
                value: Value::Null,
                last_update: None,
            }),
            refresh_lock: Arc::new(tokio::sync::Mutex::new(())),
        })
    }

    /// Fresh = refreshed within the ttl and caching enabled.
    fn fresh_value(&self, enabled: bool) -> Option<Value> {
        if !enabled {
            return None;
        }
        let state = self.state.lock().expect("cache entry lock poisoned");
        match state.last_update {
            Some(at) if at.elapsed() < self.ttl => Some(state.value.clone()),
            _ => None,
        }
    }

    fn store(&self, value: Value) {
        let mut state = self.state.lock().expect("cache entry lock poisoned");
        state.value = value;
        state.last_update = Some(Instant::now());
    }
}

struct Fallback {
    ttl: Duration,
    refresh: RefreshManyFn,
}

/// A named cache of key → JSON value.
pub struct Cache {
    name: String,
    entries: Mutex<HashMap<String, Arc<Entry>>>,
    fallback: Mutex<Option<Fallback>>,
    /// Test hook; production caches follow the process-wide flag.
    enabled_override: Option<bool>,
}

impl Cache {
    /// Create a cache without a sweeper (entries persist until invalidated).
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            entries: Mutex::new(HashMap::new()),
            fallback: Mutex::new(None),
            enabled_override: None,
        }
    }

    fn enabled(&self) -> bool {
        self.enabled_override.unwrap_or_else(enabled)
    }

    /// Create a cache with a background sweeper removing fully expired
    /// entries every `sweep_period`. The first sweep is jittered uniformly
    /// in `[0, sweep_period)` so workers do not sweep in lockstep.
    pub fn create(name: impl Into<String>, sweep_period: Duration) -> Arc<Self> {
        let cache = Arc::new(Self::new(name));
        let sweeper = Arc::downgrade(&cache);
        tokio::spawn(async move {
            let jitter = rand::rng().random_range(Duration::ZERO..sweep_period);
            tokio::time::sleep(jitter).await;
            let mut interval = tokio::time::interval(sweep_period);
            loop {
                interval.tick().await;
                // Stop sweeping once the cache itself is gone.
                let Some(cache) = sweeper.upgrade() else { break };
                cache.sweep_expired();
            }
        });
        cache
    }

    /// The cache name (used in logs).
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Register a key with its own refresh function and ttl. Re-registering
    /// a key replaces the previous registration and clears its value.
    pub fn add(&self, key: impl Into<String>, ttl: Duration, refresh: RefreshFn) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.insert(key.into(), Entry::new(ttl, Some(refresh)));
    }

    /// Register a fallback serving every key that was not individually
    /// added. The fallback also powers [`Cache::get_multiple`].
    pub fn add_all(&self, ttl: Duration, refresh: RefreshManyFn) {
        let mut fallback = self.fallback.lock().expect("cache lock poisoned");
        *fallback = Some(Fallback { ttl, refresh });
    }

    fn entry(&self, key: &str) -> CoreResult<Arc<Entry>> {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        if let Some(entry) = entries.get(key) {
            return Ok(entry.clone());
        }
        let fallback = self.fallback.lock().expect("cache lock poisoned");
        match fallback.as_ref() {
            Some(fb) => {
                let entry = Entry::new(fb.ttl, None);
                entries.insert(key.to_string(), entry.clone());
                Ok(entry)
            }
            None => Err(CoreError::CacheMissing(key.to_string())),
        }
    }

    fn fallback_refresh(&self) -> Option<RefreshManyFn> {
        self.fallback
            .lock()
            .expect("cache lock poisoned")
            .as_ref()
            .map(|fb| fb.refresh.clone())
    }

    /// Fetch `key`, refreshing when stale or when caching is disabled.
    /// On refresh failure the prior value is retained and a generic error
    /// is returned; the cause is logged at warn level.
    pub async fn get(&self, key: &str) -> CoreResult<Value> {
        let entry = self.entry(key)?;

        if let Some(value) = entry.fresh_value(self.enabled()) {
            return Ok(value);
        }

        let _guard = entry.refresh_lock.lock().await;
        // Someone else may have refreshed while we waited for the lock.
        if let Some(value) = entry.fresh_value(self.enabled()) {
            return Ok(value);
        }

        let result = match (&entry.refresh, self.fallback_refresh()) {
            (Some(refresh), _) => refresh(key.to_string()).await,
            (None, Some(refresh_many)) => refresh_many(vec![key.to_string()])
                .await
                .and_then(|mut values| {
                    if values.len() == 1 {
                        Ok(values.remove(0))
                    } else {
                        Err(format!("fallback returned {} values for 1 key", values.len()).into())
                    }
                }),
            (None, None) => return Err(CoreError::CacheMissing(key.to_string())),
        };

        match result {
            Ok(value) => {
                entry.store(value.clone());
                Ok(value)
            }
            Err(cause) => {
                tracing::warn!(cache = %self.name, key, error = %cause, "Cache refresh failed");
                Err(CoreError::CacheRefresh)
            }
        }
    }

    /// Fetch several keys, refreshing every missing or stale one with a
    /// single fallback invocation. Results are returned in request order.
    pub async fn get_multiple(&self, keys: &[&str]) -> CoreResult<Vec<Value>> {
        let mut entries = Vec::with_capacity(keys.len());
        for key in keys {
            entries.push(self.entry(key)?);
        }

        // Collect the distinct stale keys, sorted so refresh locks are
        // always taken in the same order.
        let mut stale: Vec<(String, Arc<Entry>)> = Vec::new();
        for (key, entry) in keys.iter().zip(&entries) {
            if entry.fresh_value(self.enabled()).is_none() && !stale.iter().any(|(k, _)| k == key) {
                stale.push((key.to_string(), entry.clone()));
            }
        }
        stale.sort_by(|a, b| a.0.cmp(&b.0));

        let mut guards = Vec::with_capacity(stale.len());
        let mut to_refresh: Vec<(String, Arc<Entry>)> = Vec::new();
        for (key, entry) in stale {
            let guard = entry.refresh_lock.clone().lock_owned().await;
            if entry.fresh_value(self.enabled()).is_none() {
                guards.push(guard);
                to_refresh.push((key, entry));
            }
        }

        if !to_refresh.is_empty() {
            // Keys with their own refresh function update individually; the
            // rest go to the fallback in one batch.
            let mut batch: Vec<(String, Arc<Entry>)> = Vec::new();
            for (key, entry) in to_refresh {
                if let Some(refresh) = entry.refresh.clone() {
                    match refresh(key.clone()).await {
                        Ok(value) => entry.store(value),
                        Err(cause) => {
                            tracing::warn!(cache = %self.name, key = %key, error = %cause, "Cache refresh failed");
                            return Err(CoreError::CacheRefresh);
                        }
                    }
                } else {
                    batch.push((key, entry));
                }
            }

            if !batch.is_empty() {
                let refresh_many = self
                    .fallback_refresh()
                    .ok_or_else(|| CoreError::CacheMissing(batch[0].0.clone()))?;
                let batch_keys: Vec<String> = batch.iter().map(|(k, _)| k.clone()).collect();
                match refresh_many(batch_keys).await {
                    Ok(values) if values.len() == batch.len() => {
                        for ((_, entry), value) in batch.iter().zip(values) {
                            entry.store(value);
                        }
                    }
                    Ok(values) => {
                        tracing::warn!(
                            cache = %self.name,
                            expected = batch.len(),
                            got = values.len(),
                            "Cache fallback returned wrong number of values"
                        );
                        return Err(CoreError::CacheRefresh);
                    }
                    Err(cause) => {
                        tracing::warn!(cache = %self.name, error = %cause, "Cache refresh failed");
                        return Err(CoreError::CacheRefresh);
                    }
                }
            }
        }
        drop(guards);

        let mut values = Vec::with_capacity(keys.len());
        for entry in &entries {
            let state = entry.state.lock().expect("cache entry lock poisoned");
            values.push(state.value.clone());
        }
        Ok(values)
    }

    /// Clear a key's timestamp (forcing a refresh on the next get), or
    /// replace its value and mark it fresh.
    pub fn invalidate(&self, key: &str, new_value: Option<Value>) {
        let entries = self.entries.lock().expect("cache lock poisoned");
        if let Some(entry) = entries.get(key) {
            let mut state = entry.state.lock().expect("cache entry lock poisoned");
            match new_value {
                Some(value) => {
                    state.value = value;
                    state.last_update = Some(Instant::now());
                }
                None => state.last_update = None,
            }
        }
    }

    /// Clear every key's timestamp.
    pub fn invalidate_all(&self) {
        let entries = self.entries.lock().expect("cache lock poisoned");
        for entry in entries.values() {
            let mut state = entry.state.lock().expect("cache entry lock poisoned");
            state.last_update = None;
        }
    }

    /// Remove entries whose ttl has fully elapsed. Entries that were never
    /// refreshed are kept; they hold a registration, not a value.
    pub fn sweep_expired(&self) {
        let mut entries = self.entries.lock().expect("cache lock poisoned");
        entries.retain(|_, entry| {
            let state = entry.state.lock().expect("cache entry lock poisoned");
            match state.last_update {
                Some(at) => at.elapsed() < entry.ttl,
                None => true,
            }
        });
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.entries.lock().expect("cache lock poisoned").len()
    }

    #[cfg(test)]
    fn with_caching_disabled(name: impl Into<String>) -> Self {
        let mut cache = Self::new(name);
        cache.enabled_override = Some(false);
        cache
    }
}

/// The process-global cache namespace. Never swept.
pub fn global() -> &'static Cache {
    static GLOBAL: LazyLock<Cache> = LazyLock::new(|| Cache::new("global"));
    &GLOBAL
}

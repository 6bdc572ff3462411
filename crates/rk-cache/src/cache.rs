//! Capacity- and age-bounded durable map.
//!
//! A [`PersistentCache`] keeps its whole model in memory and mirrors it to a
//! single key of a [`KeyValueStore`] as one JSON document. Opening a cache
//! restores the stored document, purges it against the [`CachePolicy`] and
//! writes the result back.
//!
//! Purging never happens silently: every eviction is returned in a
//! [`PurgeReport`] and logged.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rk_common::{AgentConfig, SharedClock};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::store::{KeyValueStore, StoreError};

/// Errors from cache persistence.
#[derive(Error, Debug)]
pub enum CacheError {
    #[error("cache {name}: {source}")]
    Store {
        name: String,
        #[source]
        source: StoreError,
    },

    #[error("cache {name}: serialization failed: {source}")]
    Serialize {
        name: String,
        #[source]
        source: serde_json::Error,
    },
}

impl CacheError {
    /// Whether the failed write may succeed on retry.
    pub fn is_recoverable(&self) -> bool {
        matches!(self, CacheError::Store { .. })
    }
}

impl From<CacheError> for rk_common::Error {
    fn from(err: CacheError) -> Self {
        match err {
            CacheError::Store { .. } => rk_common::Error::Storage(err.to_string()),
            CacheError::Serialize { source, .. } => rk_common::Error::Json(source),
        }
    }
}

/// Bounds applied by [`PersistentCache::purge`].
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CachePolicy {
    /// Max number of entries. `None` is unbounded.
    pub capacity: Option<usize>,
    /// Max age of an entry since its last update. `None` keeps forever.
    pub max_lifetime: Option<Duration>,
}

impl CachePolicy {
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn with_capacity(mut self, capacity: usize) -> Self {
        self.capacity = Some(capacity);
        self
    }

    pub fn with_max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    /// Bounds for general-purpose module caches.
    pub fn from_agent_config(config: &AgentConfig) -> Self {
        Self {
            capacity: config.cache_capacity,
            max_lifetime: config.cache_max_lifetime(),
        }
    }
}

/// A stored value and the time it was last changed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry<T> {
    pub value: T,
    pub updated_at: DateTime<Utc>,
}

/// Why an entry was evicted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EvictionReason {
    /// Older than the max lifetime.
    Expired,
    /// Among the oldest entries beyond capacity.
    OverCapacity,
}

/// Result of a purge pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PurgeReport {
    pub evicted: Vec<(String, EvictionReason)>,
}

impl PurgeReport {
    pub fn is_empty(&self) -> bool {
        self.evicted.is_empty()
    }

    pub fn count(&self, reason: EvictionReason) -> usize {
        self.evicted.iter().filter(|(_, r)| *r == reason).count()
    }
}

struct CacheModel<T> {
    entries: HashMap<String, CacheEntry<T>>,
    restored: bool,
}

/// Durable bounded key/value map.
pub struct PersistentCache<T> {
    name: String,
    policy: CachePolicy,
    store: Arc<dyn KeyValueStore>,
    clock: SharedClock,
    model: Mutex<CacheModel<T>>,
}

impl<T> std::fmt::Debug for PersistentCache<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PersistentCache")
            .field("name", &self.name)
            .field("policy", &self.policy)
            .finish_non_exhaustive()
    }
}

impl<T> PersistentCache<T>
where
    T: Serialize + DeserializeOwned + Clone + PartialEq + Send,
{
    /// Restore the cache stored under `name`, purge it and write it back.
    ///
    /// An unreadable or corrupt stored document is logged and replaced by an
    /// empty cache. Only the final write can fail.
    pub fn open(
        name: impl Into<String>,
        store: Arc<dyn KeyValueStore>,
        clock: SharedClock,
        policy: CachePolicy,
    ) -> Result<Self, CacheError> {
        let name = name.into();
        let entries = restore_entries::<T>(&name, store.as_ref());

        let cache = Self {
            name,
            policy,
            store,
            clock,
            model: Mutex::new(CacheModel {
                entries,
                restored: true,
            }),
        };

        {
            let mut model = cache.lock();
            let report = cache.purge_locked(&mut model);
            log_purge(&cache.name, &report);
            cache.sync_locked(&model)?;
        }

        debug!(
            cache = %cache.name,
            entries = cache.len(),
            "persistent cache opened"
        );
        Ok(cache)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn policy(&self) -> CachePolicy {
        self.policy
    }

    pub fn is_restored(&self) -> bool {
        self.lock().restored
    }

    pub fn value_for_key(&self, key: &str) -> Option<T> {
        self.lock().entries.get(key).map(|e| e.value.clone())
    }

    pub fn entry(&self, key: &str) -> Option<CacheEntry<T>> {
        self.lock().entries.get(key).cloned()
    }

    /// Store `value` under `key` and sync.
    ///
    /// Returns `false` without touching the store when the key already
    /// holds an equal value. A failed sync restores the previous entry.
    pub fn update(&self, value: T, key: &str) -> Result<bool, CacheError> {
        let mut model = self.lock();
        if model.entries.get(key).map(|e| &e.value) == Some(&value) {
            return Ok(false);
        }
        let updated_at = self.clock.now();
        let previous = model
            .entries
            .insert(key.to_string(), CacheEntry { value, updated_at });
        if let Err(e) = self.sync_locked(&model) {
            match previous {
                Some(entry) => model.entries.insert(key.to_string(), entry),
                None => model.entries.remove(key),
            };
            return Err(e);
        }
        Ok(true)
    }

    /// Remove `key` and sync. Returns the removed value.
    ///
    /// On a failed sync the entry is put back, so memory never runs ahead
    /// of the store.
    pub fn remove(&self, key: &str) -> Result<Option<T>, CacheError> {
        let mut model = self.lock();
        let Some(entry) = model.entries.remove(key) else {
            return Ok(None);
        };
        if let Err(e) = self.sync_locked(&model) {
            model.entries.insert(key.to_string(), entry);
            return Err(e);
        }
        Ok(Some(entry.value))
    }

    /// Entries whose `updated_at` lies within `[from, to]`. Either bound
    /// may be open.
    pub fn elements(
        &self,
        from: Option<DateTime<Utc>>,
        to: Option<DateTime<Utc>>,
    ) -> BTreeMap<String, T> {
        self.lock()
            .entries
            .iter()
            .filter(|(_, e)| from.map_or(true, |f| e.updated_at >= f))
            .filter(|(_, e)| to.map_or(true, |t| e.updated_at <= t))
            .map(|(k, e)| (k.clone(), e.value.clone()))
            .collect()
    }

    /// All keys, sorted.
    pub fn keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.lock().entries.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// All values, ordered by key.
    pub fn values(&self) -> Vec<T> {
        let model = self.lock();
        let mut pairs: Vec<(&String, &CacheEntry<T>)> = model.entries.iter().collect();
        pairs.sort_by(|a, b| a.0.cmp(b.0));
        pairs.into_iter().map(|(_, e)| e.value.clone()).collect()
    }

    pub fn len(&self) -> usize {
        self.lock().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the full model to the store.
    pub fn sync(&self) -> Result<(), CacheError> {
        let model = self.lock();
        self.sync_locked(&model)
    }

    /// Apply the policy. Syncs only if something was evicted.
    pub fn purge(&self) -> Result<PurgeReport, CacheError> {
        let mut model = self.lock();
        let report = self.purge_locked(&mut model);
        log_purge(&self.name, &report);
        if !report.is_empty() {
            self.sync_locked(&model)?;
        }
        Ok(report)
    }

    fn lock(&self) -> MutexGuard<'_, CacheModel<T>> {
        match self.model.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn purge_locked(&self, model: &mut CacheModel<T>) -> PurgeReport {
        let mut report = PurgeReport::default();

        // Phase 1: age
        if let Some(lifetime) = self.policy.max_lifetime {
            let lifetime = chrono::Duration::from_std(lifetime).unwrap_or(chrono::Duration::MAX);
            let cutoff = self
                .clock
                .now()
                .checked_sub_signed(lifetime)
                .unwrap_or(DateTime::<Utc>::MIN_UTC);
            let mut expired: Vec<String> = model
                .entries
                .iter()
                .filter(|(_, e)| e.updated_at < cutoff)
                .map(|(k, _)| k.clone())
                .collect();
            expired.sort();
            for key in expired {
                model.entries.remove(&key);
                report.evicted.push((key, EvictionReason::Expired));
            }
        }

        // Phase 2: capacity, oldest first
        if let Some(capacity) = self.policy.capacity {
            if model.entries.len() > capacity {
                let mut by_age: Vec<(String, DateTime<Utc>)> = model
                    .entries
                    .iter()
                    .map(|(k, e)| (k.clone(), e.updated_at))
                    .collect();
                by_age.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
                let excess = by_age.len() - capacity;
                for (key, _) in by_age.into_iter().take(excess) {
                    model.entries.remove(&key);
                    report.evicted.push((key, EvictionReason::OverCapacity));
                }
            }
        }

        report
    }

    fn sync_locked(&self, model: &CacheModel<T>) -> Result<(), CacheError> {
        let ordered: BTreeMap<&String, &CacheEntry<T>> = model.entries.iter().collect();
        let bytes = serde_json::to_vec(&ordered).map_err(|source| CacheError::Serialize {
            name: self.name.clone(),
            source,
        })?;
        self.store
            .write(&self.name, &bytes)
            .map_err(|source| CacheError::Store {
                name: self.name.clone(),
                source,
            })
    }
}

fn restore_entries<T: DeserializeOwned>(
    name: &str,
    store: &dyn KeyValueStore,
) -> HashMap<String, CacheEntry<T>> {
    let bytes = match store.read(name) {
        Ok(Some(bytes)) => bytes,
        Ok(None) => return HashMap::new(),
        Err(e) => {
            warn!(cache = %name, error = %e, "failed to read stored cache, starting empty");
            return HashMap::new();
        }
    };
    match serde_json::from_slice(&bytes) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(cache = %name, error = %e, "stored cache is corrupted, starting empty");
            HashMap::new()
        }
    }
}

fn log_purge(name: &str, report: &PurgeReport) {
    if report.is_empty() {
        return;
    }
    for (key, reason) in &report.evicted {
        debug!(cache = %name, key = %key, reason = ?reason, "cache entry evicted");
    }
    info!(
        cache = %name,
        expired = report.count(EvictionReason::Expired),
        over_capacity = report.count(EvictionReason::OverCapacity),
        "cache purged"
    );
}

//! Document cache.
//!
//! Holds the current [`TenantBundle`] per (tenant, bundle) and revalidates it
//! on every resolve with a conditional fetch. A changed revision replaces the
//! whole bundle in one map write, so readers see either the old generation
//! or the new one, never a mix.
//!
//! # Eviction
//!
//! Entries carry a last-access timestamp. On every insert, entries idle for
//! longer than [`CacheConfig::idle_ttl`] are dropped, then the least recently
//! used entries are dropped until at most [`CacheConfig::max_bundles`] remain.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, PoisonError, RwLock};
use std::time::Instant;

use actionhost_client::{DocumentStore, FetchOutcome};
use actionhost_common::{ActionError, BundleKey, Credentials, Result};

use crate::bundle::TenantBundle;
use crate::config::CacheConfig;

/// Result of [`DocumentCache::resolve`].
#[derive(Debug, Clone)]
pub enum CacheOutcome {
    /// The cached generation is still current.
    Unchanged(Arc<TenantBundle>),
    /// A new generation was fetched and installed.
    Fresh(Arc<TenantBundle>),
    NotFound,
}

impl CacheOutcome {
    pub fn bundle(&self) -> Option<&Arc<TenantBundle>> {
        match self {
            CacheOutcome::Unchanged(bundle) | CacheOutcome::Fresh(bundle) => Some(bundle),
            CacheOutcome::NotFound => None,
        }
    }
}

struct CacheEntry {
    bundle: Arc<TenantBundle>,
    last_access_ms: AtomicU64,
}

pub struct DocumentCache {
    store: Arc<dyn DocumentStore>,
    entries: RwLock<HashMap<BundleKey, CacheEntry>>,
    config: CacheConfig,
    epoch: Instant,
}

impl DocumentCache {
    pub fn new(store: Arc<dyn DocumentStore>, config: CacheConfig) -> Self {
        Self {
            store,
            entries: RwLock::new(HashMap::new()),
            config,
            epoch: Instant::now(),
        }
    }

    fn now_ms(&self) -> u64 {
        self.epoch.elapsed().as_millis() as u64
    }

    /// The cached generation for `key`, if any. Counts as an access.
    pub fn get(&self, key: &BundleKey) -> Option<Arc<TenantBundle>> {
        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        entries.get(key).map(|entry| {
            entry.last_access_ms.store(self.now_ms(), Ordering::Relaxed);
            Arc::clone(&entry.bundle)
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read().unwrap_or_else(PoisonError::into_inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Revalidates `key` against the store using the cached revision.
    ///
    /// The fetch runs with the caller's credentials, so a caller who may not
    /// read the bundle document gets an upstream error even when the bundle
    /// is cached.
    pub async fn resolve(&self, key: &BundleKey, credentials: &Credentials) -> Result<CacheOutcome> {
        let known = self.get(key);
        let outcome = self
            .store
            .fetch_with_revision(
                credentials,
                &key.tenant,
                &key.bundle.doc_id(),
                known.as_ref().map(|b| b.revision()),
            )
            .await?;

        match outcome {
            FetchOutcome::NotModified => match known {
                Some(bundle) => {
                    tracing::debug!("bundle {} unchanged at {}", key, bundle.revision());
                    Ok(CacheOutcome::Unchanged(bundle))
                }
                None => Err(ActionError::Upstream(format!(
                    "store reported {} unmodified without a known revision",
                    key
                ))),
            },
            FetchOutcome::NotFound => {
                self.remove(key);
                Ok(CacheOutcome::NotFound)
            }
            FetchOutcome::Document { revision, fields } => {
                let bundle = Arc::new(TenantBundle::from_document(key.clone(), revision, &fields));
                tracing::info!(
                    "loaded bundle {} at revision {} (generation {})",
                    key,
                    bundle.revision(),
                    bundle.generation()
                );
                self.insert(Arc::clone(&bundle));
                Ok(CacheOutcome::Fresh(bundle))
            }
        }
    }

    fn insert(&self, bundle: Arc<TenantBundle>) {
        let now = self.now_ms();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        entries.insert(
            bundle.key().clone(),
            CacheEntry {
                bundle,
                last_access_ms: AtomicU64::new(now),
            },
        );
        self.evict_locked(&mut entries, now);
    }

    pub fn remove(&self, key: &BundleKey) -> Option<Arc<TenantBundle>> {
        self.entries
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key)
            .map(|entry| entry.bundle)
    }

    /// Drops idle entries and enforces the size bound. Returns how many
    /// bundles were evicted.
    pub fn evict(&self) -> usize {
        let now = self.now_ms();
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        self.evict_locked(&mut entries, now)
    }

    fn evict_locked(&self, entries: &mut HashMap<BundleKey, CacheEntry>, now: u64) -> usize {
        let before = entries.len();
        let ttl_ms = self.config.idle_ttl.as_millis() as u64;

        entries.retain(|key, entry| {
            let idle = now.saturating_sub(entry.last_access_ms.load(Ordering::Relaxed));
            let keep = idle <= ttl_ms;
            if !keep {
                tracing::debug!("evicting idle bundle {}", key);
            }
            keep
        });

        if entries.len() > self.config.max_bundles {
            let mut by_age: Vec<(BundleKey, u64)> = entries
                .iter()
                .map(|(key, entry)| (key.clone(), entry.last_access_ms.load(Ordering::Relaxed)))
                .collect();
            by_age.sort_by_key(|(_, last)| *last);

            let excess = entries.len() - self.config.max_bundles;
            for (key, _) in by_age.into_iter().take(excess) {
                tracing::warn!("bundle cache full, evicting {}", key);
                entries.remove(&key);
            }
        }

        before - entries.len()
    }
}

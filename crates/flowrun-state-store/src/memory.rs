//! In-memory state store
//!
//! Expired records are dropped when touched and by `purge_expired`, which
//! `spawn_purger` runs periodically. Uses the tokio clock so paused-time
//! tests see TTLs. A TTL too large for the clock means no expiry.

use crate::error::Result;
use crate::metrics::OperationTimer;
use crate::state_store::{scoped_key, StateStore};
use async_trait::async_trait;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::debug;

const BACKEND: &str = "memory";

struct Entry {
    value: Value,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_expired(&self, now: Instant) -> bool {
        self.expires_at.map_or(false, |at| at <= now)
    }
}

#[derive(Default)]
pub struct MemoryStore {
    entries: Mutex<HashMap<String, Entry>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_entries<T>(&self, f: impl FnOnce(&mut HashMap<String, Entry>) -> T) -> T {
        let mut entries = self.entries.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut entries)
    }

    /// Drop every expired record, returning how many were removed
    pub fn purge_expired(&self) -> usize {
        let now = Instant::now();
        let removed = self.with_entries(|entries| {
            let before = entries.len();
            entries.retain(|_, e| !e.is_expired(now));
            before - entries.len()
        });
        if removed > 0 {
            debug!(removed, "Purged expired records");
        }
        removed
    }

    /// Purge expired records every `period` until the store is dropped
    pub fn spawn_purger(self: &Arc<Self>, period: Duration) -> JoinHandle<()> {
        let store = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.purge_expired();
                    }
                    None => break,
                }
            }
            debug!("Memory store purger stopped");
        })
    }

    /// Live records across all namespaces
    pub fn len(&self) -> usize {
        let now = Instant::now();
        self.with_entries(|entries| entries.values().filter(|e| !e.is_expired(now)).count())
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl StateStore for MemoryStore {
    fn backend(&self) -> &'static str {
        BACKEND
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        let _timer = OperationTimer::new("set", BACKEND);
        let entry = Entry {
            value: value.clone(),
            expires_at: ttl.and_then(|ttl| Instant::now().checked_add(ttl)),
        };
        self.with_entries(|entries| entries.insert(scoped_key(namespace, key), entry));
        Ok(())
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let _timer = OperationTimer::new("get", BACKEND);
        let full_key = scoped_key(namespace, key);
        let now = Instant::now();
        Ok(self.with_entries(|entries| match entries.get(&full_key) {
            Some(e) if e.is_expired(now) => {
                entries.remove(&full_key);
                None
            }
            Some(e) => Some(e.value.clone()),
            None => None,
        }))
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        let _timer = OperationTimer::new("delete", BACKEND);
        let now = Instant::now();
        Ok(self.with_entries(|entries| {
            entries
                .remove(&scoped_key(namespace, key))
                .map_or(false, |e| !e.is_expired(now))
        }))
    }

    async fn exists(&self, namespace: &str, key: &str) -> Result<bool> {
        Ok(self.get(namespace, key).await?.is_some())
    }

    async fn keys(&self, namespace: &str, pattern: &str) -> Result<Vec<String>> {
        let _timer = OperationTimer::new("keys", BACKEND);
        let pattern = glob::Pattern::new(pattern)?;
        let prefix = scoped_key(namespace, "");
        let now = Instant::now();
        let mut keys: Vec<String> = self.with_entries(|entries| {
            entries
                .iter()
                .filter(|(_, e)| !e.is_expired(now))
                .filter_map(|(k, _)| k.strip_prefix(&prefix))
                .filter(|k| pattern.matches(k))
                .map(str::to_string)
                .collect()
        });
        keys.sort();
        Ok(keys)
    }

    async fn take(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        let _timer = OperationTimer::new("take", BACKEND);
        let now = Instant::now();
        Ok(self.with_entries(|entries| {
            entries
                .remove(&scoped_key(namespace, key))
                .filter(|e| !e.is_expired(now))
                .map(|e| e.value)
        }))
    }
}

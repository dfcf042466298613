use crate::error::Result;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::time::Duration;

/// Namespaced key-value store.
///
/// Every key lives under a namespace (a tenant id, or the engine namespace
/// for records that are not tenant scoped). `keys` patterns are glob
/// patterns relative to the namespace and return relative keys.
#[async_trait]
pub trait StateStore: Send + Sync {
    /// Backend label used in logs and metrics
    fn backend(&self) -> &'static str;

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<()>;

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>>;

    /// Returns whether a record was removed
    async fn delete(&self, namespace: &str, key: &str) -> Result<bool>;

    async fn exists(&self, namespace: &str, key: &str) -> Result<bool>;

    async fn keys(&self, namespace: &str, pattern: &str) -> Result<Vec<String>>;

    /// Atomically read and remove a record. Of several concurrent callers
    /// at most one observes the value.
    async fn take(&self, namespace: &str, key: &str) -> Result<Option<Value>>;
}

/// Full key as stored by the backend
pub fn scoped_key(namespace: &str, key: &str) -> String {
    format!("{}:{}", namespace, key)
}

/// Read and deserialize a record
pub async fn load<T: DeserializeOwned>(
    store: &dyn StateStore,
    namespace: &str,
    key: &str,
) -> Result<Option<T>> {
    match store.get(namespace, key).await? {
        Some(value) => Ok(Some(serde_json::from_value(value)?)),
        None => Ok(None),
    }
}

/// Serialize and write a record
pub async fn save<T: Serialize + ?Sized>(
    store: &dyn StateStore,
    namespace: &str,
    key: &str,
    value: &T,
    ttl: Option<Duration>,
) -> Result<()> {
    let value = serde_json::to_value(value)?;
    store.set(namespace, key, &value, ttl).await
}

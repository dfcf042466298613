//! Retry wrapper for any state store
//!
//! Transient failures are retried with linear backoff (`attempt * min_delay`,
//! capped at `max_delay`). When retries run out the error is reported as the
//! store being unavailable.

use crate::error::{Result, StoreError};
use crate::metrics::{record_retry, record_store_error};
use crate::state_store::StateStore;
use async_trait::async_trait;
use flowrun_core::config::StoreRetryConfig;
use serde_json::Value;
use std::future::Future;
use std::time::Duration;
use tracing::{error, warn};

pub struct RetryingStore<S> {
    inner: S,
    config: StoreRetryConfig,
}

impl<S: StateStore> RetryingStore<S> {
    pub fn new(inner: S, config: StoreRetryConfig) -> Self {
        Self { inner, config }
    }

    pub fn inner(&self) -> &S {
        &self.inner
    }

    fn backoff(&self, attempt: u32) -> Duration {
        self.config
            .min_delay
            .saturating_mul(attempt)
            .min(self.config.max_delay)
    }

    async fn with_retry<T, F, Fut>(&self, operation: &'static str, f: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut attempt = 0;
        loop {
            attempt += 1;
            match f().await {
                Ok(value) => return Ok(value),
                Err(e) if !e.is_transient() => return Err(e),
                Err(e) if attempt > self.config.max_retries => {
                    error!(
                        operation,
                        backend = self.inner.backend(),
                        attempts = attempt,
                        error = %e,
                        "State store operation failed"
                    );
                    record_store_error(operation, self.inner.backend(), "exhausted");
                    return Err(StoreError::Unavailable {
                        backend: self.inner.backend().to_string(),
                        attempts: attempt,
                        message: e.to_string(),
                    });
                }
                Err(e) => {
                    let delay = self.backoff(attempt);
                    warn!(
                        operation,
                        backend = self.inner.backend(),
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "State store operation failed, retrying"
                    );
                    record_retry(operation, self.inner.backend());
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

#[async_trait]
impl<S: StateStore> StateStore for RetryingStore<S> {
    fn backend(&self) -> &'static str {
        self.inner.backend()
    }

    async fn set(
        &self,
        namespace: &str,
        key: &str,
        value: &Value,
        ttl: Option<Duration>,
    ) -> Result<()> {
        self.with_retry("set", || self.inner.set(namespace, key, value, ttl))
            .await
    }

    async fn get(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        self.with_retry("get", || self.inner.get(namespace, key)).await
    }

    async fn delete(&self, namespace: &str, key: &str) -> Result<bool> {
        self.with_retry("delete", || self.inner.delete(namespace, key))
            .await
    }

    async fn exists(&self, namespace: &str, key: &str) -> Result<bool> {
        self.with_retry("exists", || self.inner.exists(namespace, key))
            .await
    }

    async fn keys(&self, namespace: &str, pattern: &str) -> Result<Vec<String>> {
        self.with_retry("keys", || self.inner.keys(namespace, pattern))
            .await
    }

    async fn take(&self, namespace: &str, key: &str) -> Result<Option<Value>> {
        self.with_retry("take", || self.inner.take(namespace, key))
            .await
    }
}

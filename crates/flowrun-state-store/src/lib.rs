//! flowrun state store - namespaced key-value records with TTL
//!
//! Holds the records that must survive a suspension: waiting state for
//! callbacks and events, timer job definitions and run snapshots.
//!
//! Features:
//! - In-memory store (single process, tests)
//! - Redis store (shared between replicas)
//! - Retry wrapper with linear backoff
//! - Prometheus metrics

pub mod error;
pub mod memory;
pub mod metrics;
pub mod redis_store;
pub mod retry;
pub mod state_store;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
pub use retry::RetryingStore;
pub use state_store::{load, save, scoped_key, StateStore};

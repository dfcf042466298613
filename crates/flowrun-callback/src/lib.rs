//! Callback coordination for nodes waiting on an external system
//!
//! `CallbackCoordinator` issues callback ids, persists the waiting state
//! under `http_callback:<id>` and pairs inbound callbacks with waiters.
//! Waiters are woken through a `CallbackNotifier`, which is in-process by
//! default and Redis pub/sub when several replicas share one store.

pub mod coordinator;
pub mod notifier;

pub use coordinator::{callback_key, generate_callback_url, CallbackCoordinator, CallbackOutcome};
pub use notifier::{CallbackNotifier, CallbackSubscription, LocalNotifier, RedisNotifier};

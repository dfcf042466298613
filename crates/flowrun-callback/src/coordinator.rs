//! Callback coordinator
//!
//! The waiting state of a callback node is written once by
//! `setup_callback` and consumed exactly once, either by `handle_callback`
//! (through the store's atomic `take`) or by the timeout path of
//! `wait_for_callback`. A second inbound callback finds nothing and is a
//! logged no-op.

use chrono::Utc;
use flowrun_core::{
    deadline_after, EngineConfig, Error, FlowDefinition, FlowRun, NodeDefinition, Result,
    WaitingState,
};
use flowrun_state_store::{save, StateStore};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::{debug, info, warn};
use url::Url;
use uuid::Uuid;

use crate::notifier::{CallbackNotifier, CallbackSubscription};

/// Store key of a callback's waiting state
pub fn callback_key(callback_id: &str) -> String {
    format!("http_callback:{}", callback_id)
}

/// Append `callbackId=<id>` to `base_url`.
///
/// Existing query parameters are kept. A base that does not parse as a URL
/// gets the parameter appended textually.
pub fn generate_callback_url(base_url: &str, callback_id: &str) -> String {
    match Url::parse(base_url) {
        Ok(mut url) => {
            url.query_pairs_mut().append_pair("callbackId", callback_id);
            url.to_string()
        }
        Err(_) => {
            let separator = if base_url.contains('?') { '&' } else { '?' };
            format!("{}{}callbackId={}", base_url, separator, callback_id)
        }
    }
}

/// Result of an inbound callback
#[derive(Debug, Clone, PartialEq)]
pub enum CallbackOutcome {
    /// A waiter received the payload and resumes the node
    Delivered(Box<WaitingState>),
    /// The waiting state was consumed but nobody was listening (restart,
    /// or a replica without the waiter); the caller must resume the node
    Orphaned(Box<WaitingState>),
    /// No waiting state: duplicate, late or unknown callback
    Ignored,
}

pub struct CallbackCoordinator {
    store: Arc<dyn StateStore>,
    notifier: Arc<dyn CallbackNotifier>,
    namespace: String,
    default_timeout: Duration,
    subscriptions: Mutex<HashMap<String, CallbackSubscription>>,
}

impl CallbackCoordinator {
    pub fn new(
        store: Arc<dyn StateStore>,
        notifier: Arc<dyn CallbackNotifier>,
        config: &EngineConfig,
    ) -> Self {
        Self {
            store,
            notifier,
            namespace: config.namespace.clone(),
            default_timeout: config.callback_timeout(None),
            subscriptions: Mutex::new(HashMap::new()),
        }
    }

    fn subscriptions(&self) -> MutexGuard<'_, HashMap<String, CallbackSubscription>> {
        self.subscriptions.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Node override, else the global default
    pub fn effective_timeout(&self, node_def: &NodeDefinition) -> Duration {
        node_def
            .callback
            .as_ref()
            .and_then(|c| c.timeout_secs)
            .map(Duration::from_secs)
            .unwrap_or(self.default_timeout)
    }

    /// Persist the waiting state of `node_def` and start listening for its
    /// callback. Returns the new callback id.
    pub async fn setup_callback(
        &self,
        flow: &FlowDefinition,
        flow_run: &FlowRun,
        node_def: &NodeDefinition,
    ) -> Result<String> {
        let callback_id = Uuid::new_v4().to_string();
        let timeout = self.effective_timeout(node_def);
        let state = WaitingState::new(flow, flow_run, node_def)
            .with_deadline(deadline_after(Utc::now(), timeout));

        save(
            self.store.as_ref(),
            &self.namespace,
            &callback_key(&callback_id),
            &state,
            Some(timeout),
        )
        .await?;

        // Subscribe before returning so an early callback is not lost
        let subscription = match self.notifier.subscribe(&callback_id).await {
            Ok(sub) => sub,
            Err(e) => {
                self.store
                    .delete(&self.namespace, &callback_key(&callback_id))
                    .await?;
                return Err(e);
            }
        };
        self.subscriptions()
            .insert(callback_id.clone(), subscription);

        info!(
            callback_id = %callback_id,
            run_id = %flow_run.run_id,
            node_id = %node_def.id,
            timeout_secs = timeout.as_secs(),
            "Callback registered"
        );
        Ok(callback_id)
    }

    /// Consume the waiting state of `callback_id` and wake its waiter.
    pub async fn handle_callback(&self, callback_id: &str, data: Value) -> Result<CallbackOutcome> {
        let Some(raw) = self
            .store
            .take(&self.namespace, &callback_key(callback_id))
            .await?
        else {
            warn!(callback_id = %callback_id, "No waiting state for callback, ignoring");
            return Ok(CallbackOutcome::Ignored);
        };

        let mut state: WaitingState = serde_json::from_value(raw)?;
        state.node_state.complete(data.clone());
        state.node_state.log("Callback received");

        let delivered = match self.notifier.notify(callback_id, &data).await {
            Ok(delivered) => delivered,
            Err(e) => {
                warn!(
                    callback_id = %callback_id,
                    notifier = self.notifier.name(),
                    error = %e,
                    "Callback notification failed"
                );
                false
            }
        };

        info!(
            callback_id = %callback_id,
            run_id = %state.run_id(),
            node_id = %state.node_id(),
            delivered,
            "Callback handled"
        );
        Ok(if delivered {
            CallbackOutcome::Delivered(Box::new(state))
        } else {
            CallbackOutcome::Orphaned(Box::new(state))
        })
    }

    /// Wait for the payload of `callback_id`.
    ///
    /// After `timeout` the waiting state and the listener are removed and
    /// `Error::Timeout` is returned.
    pub async fn wait_for_callback(&self, callback_id: &str, timeout: Duration) -> Result<Value> {
        let subscription = self.subscriptions().remove(callback_id);
        let mut subscription = match subscription {
            Some(sub) => sub,
            None => self.notifier.subscribe(callback_id).await?,
        };

        let outcome = tokio::time::timeout(timeout, subscription.recv()).await;
        let result = match outcome {
            Ok(Some(data)) => Ok(data),
            Ok(None) => Err(Error::internal(format!(
                "listener for callback {} was dropped",
                callback_id
            ))),
            Err(_) => match subscription.try_take() {
                Some(data) => Ok(data),
                None => {
                    self.store
                        .delete(&self.namespace, &callback_key(callback_id))
                        .await?;
                    warn!(
                        callback_id = %callback_id,
                        timeout_secs = timeout.as_secs(),
                        "Callback timed out"
                    );
                    Err(Error::timeout(format!(
                        "callback {} not received within {}s",
                        callback_id,
                        timeout.as_secs()
                    )))
                }
            },
        };

        self.notifier.unsubscribe(callback_id).await;
        result
    }

    /// Drop a pending callback without waking anyone. Returns whether its
    /// waiting state still existed.
    pub async fn cancel(&self, callback_id: &str) -> Result<bool> {
        self.subscriptions().remove(callback_id);
        self.notifier.unsubscribe(callback_id).await;
        let removed = self
            .store
            .delete(&self.namespace, &callback_key(callback_id))
            .await?;
        debug!(callback_id = %callback_id, removed, "Callback cancelled");
        Ok(removed)
    }

    pub async fn is_pending(&self, callback_id: &str) -> Result<bool> {
        Ok(self
            .store
            .exists(&self.namespace, &callback_key(callback_id))
            .await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::notifier::LocalNotifier;
    use flowrun_core::NodeStatus;
    use flowrun_state_store::MemoryStore;
    use serde_json::json;

    fn setup() -> (Arc<MemoryStore>, CallbackCoordinator) {
        let store = Arc::new(MemoryStore::new());
        let coordinator = CallbackCoordinator::new(
            store.clone(),
            Arc::new(LocalNotifier::new()),
            &EngineConfig::default(),
        );
        (store, coordinator)
    }

    fn fixture(timeout: Option<u64>) -> (FlowDefinition, FlowRun, NodeDefinition) {
        let node = NodeDefinition::http_callback("wait", timeout);
        let flow = FlowDefinition::new("f1", "callback flow").with_node(node.clone());
        let run = FlowRun::new("tenant", &flow, json!({}));
        (flow, run, node)
    }

    #[test]
    fn test_generate_callback_url() {
        assert_eq!(
            generate_callback_url("http://localhost:8080/api/callbacks", "abc"),
            "http://localhost:8080/api/callbacks?callbackId=abc"
        );
        assert_eq!(
            generate_callback_url("https://hooks.example.com/cb?src=x", "abc"),
            "https://hooks.example.com/cb?src=x&callbackId=abc"
        );
        assert_eq!(generate_callback_url("/relative", "abc"), "/relative?callbackId=abc");
    }

    #[tokio::test]
    async fn test_callback_resumes_waiter() {
        let (store, coordinator) = setup();
        let (flow, run, node) = fixture(None);
        let coordinator = Arc::new(coordinator);

        let id = coordinator.setup_callback(&flow, &run, &node).await.unwrap();
        let stored: WaitingState =
            flowrun_state_store::load(store.as_ref(), "default", &callback_key(&id))
                .await
                .unwrap()
                .unwrap();
        assert!(stored.deadline.unwrap() > Utc::now());

        let waiter = {
            let coordinator = coordinator.clone();
            let id = id.clone();
            tokio::spawn(async move {
                coordinator
                    .wait_for_callback(&id, Duration::from_secs(30))
                    .await
            })
        };

        let outcome = coordinator
            .handle_callback(&id, json!({"status": "done"}))
            .await
            .unwrap();
        match outcome {
            CallbackOutcome::Delivered(state) => {
                assert_eq!(state.node_state.status, NodeStatus::Completed);
                assert_eq!(state.node_state.result, Some(json!({"status": "done"})));
                assert!(state.node_state.finished_at.is_some());
                assert_eq!(state.node_state.logs.len(), 1);
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
        assert_eq!(waiter.await.unwrap().unwrap(), json!({"status": "done"}));
        assert!(!store.exists("default", &callback_key(&id)).await.unwrap());
    }

    #[tokio::test]
    async fn test_second_callback_is_noop() {
        let (_store, coordinator) = setup();
        let (flow, run, node) = fixture(None);
        let id = coordinator.setup_callback(&flow, &run, &node).await.unwrap();

        let first = coordinator.handle_callback(&id, json!(1)).await.unwrap();
        assert!(matches!(first, CallbackOutcome::Delivered(_)));
        let second = coordinator.handle_callback(&id, json!(2)).await.unwrap();
        assert_eq!(second, CallbackOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_callback_before_wait_is_kept() {
        let (_store, coordinator) = setup();
        let (flow, run, node) = fixture(None);
        let id = coordinator.setup_callback(&flow, &run, &node).await.unwrap();

        coordinator.handle_callback(&id, json!("early")).await.unwrap();
        let data = coordinator
            .wait_for_callback(&id, Duration::from_secs(1))
            .await
            .unwrap();
        assert_eq!(data, json!("early"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_cleans_up_waiting_state() {
        let (store, coordinator) = setup();
        let (flow, run, node) = fixture(Some(10));
        let id = coordinator.setup_callback(&flow, &run, &node).await.unwrap();
        let timeout = coordinator.effective_timeout(&node);
        assert_eq!(timeout, Duration::from_secs(10));

        let err = coordinator.wait_for_callback(&id, timeout).await.unwrap_err();
        assert!(err.is_timeout());
        assert_eq!(store.get("default", &callback_key(&id)).await.unwrap(), None);

        let late = coordinator.handle_callback(&id, json!({})).await.unwrap();
        assert_eq!(late, CallbackOutcome::Ignored);
    }

    #[tokio::test]
    async fn test_orphaned_when_nobody_listens() {
        let (_store, coordinator) = setup();
        let (flow, run, node) = fixture(None);
        let id = coordinator.setup_callback(&flow, &run, &node).await.unwrap();
        coordinator.notifier.unsubscribe(&id).await;

        let outcome = coordinator.handle_callback(&id, json!({"x": 1})).await.unwrap();
        match outcome {
            CallbackOutcome::Orphaned(state) => {
                assert_eq!(state.run_id(), run.run_id);
                assert_eq!(state.node_id(), "wait");
            }
            other => panic!("unexpected outcome: {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_cancel_removes_state() {
        let (_store, coordinator) = setup();
        let (flow, run, node) = fixture(None);
        let id = coordinator.setup_callback(&flow, &run, &node).await.unwrap();
        assert!(coordinator.is_pending(&id).await.unwrap());
        assert!(coordinator.cancel(&id).await.unwrap());
        assert!(!coordinator.cancel(&id).await.unwrap());
        assert_eq!(
            coordinator.handle_callback(&id, json!({})).await.unwrap(),
            CallbackOutcome::Ignored
        );
    }
}

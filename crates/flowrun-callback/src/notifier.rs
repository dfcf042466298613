//! Wake-up signal for callback waiters

use async_trait::async_trait;
use flowrun_core::{Error, Result};
use futures::StreamExt;
use redis::aio::MultiplexedConnection;
use redis::AsyncCommands;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receiving half handed to the waiter of one callback
#[derive(Debug)]
pub struct CallbackSubscription {
    callback_id: String,
    rx: oneshot::Receiver<Value>,
}

impl CallbackSubscription {
    pub fn new(callback_id: impl Into<String>, rx: oneshot::Receiver<Value>) -> Self {
        Self {
            callback_id: callback_id.into(),
            rx,
        }
    }

    pub fn callback_id(&self) -> &str {
        &self.callback_id
    }

    /// Payload if the callback already arrived
    pub fn try_take(&mut self) -> Option<Value> {
        self.rx.try_recv().ok()
    }

    /// Wait for the payload. `None` when the notifier dropped the sender.
    pub async fn recv(&mut self) -> Option<Value> {
        (&mut self.rx).await.ok()
    }
}

/// Delivers "callback arrived" to whoever waits on a callback id
#[async_trait]
pub trait CallbackNotifier: Send + Sync {
    /// Backend label used in logs
    fn name(&self) -> &'static str;

    /// Start listening for `callback_id`. A later subscription for the
    /// same id replaces the earlier one.
    async fn subscribe(&self, callback_id: &str) -> Result<CallbackSubscription>;

    /// Returns whether a listener received the payload
    async fn notify(&self, callback_id: &str, payload: &Value) -> Result<bool>;

    async fn unsubscribe(&self, callback_id: &str);
}

type Senders = HashMap<String, oneshot::Sender<Value>>;

/// In-process notifier; only reaches waiters of this process
#[derive(Default)]
pub struct LocalNotifier {
    senders: Mutex<Senders>,
}

impl LocalNotifier {
    pub fn new() -> Self {
        Self::default()
    }

    fn senders(&self) -> MutexGuard<'_, Senders> {
        self.senders.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn listener_count(&self) -> usize {
        self.senders().len()
    }
}

#[async_trait]
impl CallbackNotifier for LocalNotifier {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn subscribe(&self, callback_id: &str) -> Result<CallbackSubscription> {
        let (tx, rx) = oneshot::channel();
        if self.senders().insert(callback_id.to_string(), tx).is_some() {
            debug!(callback_id = %callback_id, "Replaced existing callback listener");
        }
        Ok(CallbackSubscription::new(callback_id, rx))
    }

    async fn notify(&self, callback_id: &str, payload: &Value) -> Result<bool> {
        let sender = self.senders().remove(callback_id);
        Ok(match sender {
            Some(tx) => tx.send(payload.clone()).is_ok(),
            None => false,
        })
    }

    async fn unsubscribe(&self, callback_id: &str) {
        self.senders().remove(callback_id);
    }
}

/// Pub/sub channel carrying the payload of one callback
pub fn callback_channel(callback_id: &str) -> String {
    format!("flowrun:callback:{}", callback_id)
}

fn redis_error(e: redis::RedisError) -> Error {
    Error::external("Redis", e.to_string())
}

/// Redis pub/sub notifier.
///
/// Each subscription holds its own pub/sub connection on
/// `flowrun:callback:<id>`, so the replica that receives an inbound
/// callback can wake a waiter living on another replica.
pub struct RedisNotifier {
    client: redis::Client,
    publisher: MultiplexedConnection,
    listeners: Mutex<HashMap<String, JoinHandle<()>>>,
}

impl RedisNotifier {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url).map_err(redis_error)?;
        let publisher = client
            .get_multiplexed_async_connection()
            .await
            .map_err(redis_error)?;
        info!("Connected Redis callback notifier");
        Ok(Self {
            client,
            publisher,
            listeners: Mutex::new(HashMap::new()),
        })
    }

    fn listeners(&self) -> MutexGuard<'_, HashMap<String, JoinHandle<()>>> {
        self.listeners.lock().unwrap_or_else(|e| e.into_inner())
    }
}

#[async_trait]
impl CallbackNotifier for RedisNotifier {
    fn name(&self) -> &'static str {
        "redis"
    }

    async fn subscribe(&self, callback_id: &str) -> Result<CallbackSubscription> {
        let channel = callback_channel(callback_id);
        let mut pubsub = self.client.get_async_pubsub().await.map_err(redis_error)?;
        pubsub.subscribe(&channel).await.map_err(redis_error)?;

        let (tx, rx) = oneshot::channel();
        let id = callback_id.to_string();
        let handle = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            if let Some(msg) = messages.next().await {
                let payload = msg
                    .get_payload::<String>()
                    .ok()
                    .and_then(|raw| serde_json::from_str::<Value>(&raw).ok());
                match payload {
                    Some(payload) => {
                        let _ = tx.send(payload);
                    }
                    None => warn!(callback_id = %id, "Discarding malformed callback notification"),
                }
            }
        });

        if let Some(previous) = self.listeners().insert(callback_id.to_string(), handle) {
            previous.abort();
        }
        Ok(CallbackSubscription::new(callback_id, rx))
    }

    async fn notify(&self, callback_id: &str, payload: &Value) -> Result<bool> {
        let mut conn = self.publisher.clone();
        let receivers: i64 = conn
            .publish(callback_channel(callback_id), payload.to_string())
            .await
            .map_err(redis_error)?;
        debug!(callback_id = %callback_id, receivers, "Published callback notification");
        Ok(receivers > 0)
    }

    async fn unsubscribe(&self, callback_id: &str) {
        if let Some(handle) = self.listeners().remove(callback_id) {
            handle.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn test_local_notify_reaches_subscriber_once() {
        let notifier = LocalNotifier::new();
        let mut sub = notifier.subscribe("cb1").await.unwrap();

        assert!(notifier.notify("cb1", &json!({"ok": true})).await.unwrap());
        assert_eq!(sub.recv().await, Some(json!({"ok": true})));
        assert!(!notifier.notify("cb1", &json!(null)).await.unwrap());
    }

    #[tokio::test]
    async fn test_local_notify_without_listener() {
        let notifier = LocalNotifier::new();
        let sub = notifier.subscribe("cb1").await.unwrap();
        drop(sub);
        assert!(!notifier.notify("cb1", &json!(1)).await.unwrap());
        assert!(!notifier.notify("unknown", &json!(1)).await.unwrap());
    }

    #[tokio::test]
    async fn test_unsubscribe_drops_listener() {
        let notifier = LocalNotifier::new();
        let mut sub = notifier.subscribe("cb1").await.unwrap();
        notifier.unsubscribe("cb1").await;
        assert_eq!(notifier.listener_count(), 0);
        assert_eq!(sub.recv().await, None);
    }

    #[test]
    fn test_channel_name() {
        assert_eq!(callback_channel("abc"), "flowrun:callback:abc");
    }
}

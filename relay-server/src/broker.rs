//! Message broker: retention, fan-out and the ack protocol (C3)
//!
//! A publish is recorded in the shared store before it is fanned out, so a
//! crash between the two never loses a message: retained messages survive
//! until every socket that was eligible to receive them acks, or their ttl
//! lapses, whichever comes first. A socket that disconnects before acking
//! simply drops out of the pending set; the retained copy lives on for
//! whichever socket subscribes next.

use crate::ids::{message_hash, NodeId, SocketId, Topic};
use crate::store::SharedStore;
use crate::subscription::{SubscriptionNotice, SubscriptionRegistry};
use async_trait::async_trait;
use relay_core::{Error, JsonRpcNotification, Result};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::Mutex;
use tracing::{debug, warn};

/// Content hash of a published payload; doubles as the retention key and
/// the id a subscriber echoes back in its `relay_ack`.
pub type MessageId = String;

/// Delivers an encoded frame to a live local socket.
///
/// Implemented by whatever owns the per-socket outbound queues (the
/// connection registry); the broker only needs to reach one socket at a
/// time and never needs the registry's bookkeeping.
#[async_trait]
pub trait Outbound: Send + Sync {
    async fn send(&self, socket_id: &SocketId, frame: Vec<u8>) -> Result<()>;

    /// Close a socket with the given WebSocket close code. Used by the
    /// broker when a delivery failure (closed socket, full queue) means the
    /// socket can no longer be trusted to make progress.
    async fn close(&self, socket_id: &SocketId, code: u16, reason: &str);
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct RetainedMessage {
    message_hash: String,
    topic: String,
    payload: String,
    published_at: u64,
}

/// The `data` field of a `relay_subscription` notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelaySubscriptionData {
    topic: String,
    message: String,
    #[serde(rename = "messageHash")]
    message_hash: String,
}

/// Wire payload for a server-initiated `relay_subscription` request: the
/// peer's `relay_ack` echoes `id` back to retire it from retention.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct RelaySubscriptionPayload {
    id: String,
    data: RelaySubscriptionData,
}

/// Cross-node message envelope published on `sub:<topic>` alongside
/// [`SubscriptionNotice`]s. Tagged so a single channel can multiplex both.
///
/// `Message` carries the originating node and publisher socket so every
/// other node's relay task (which shares this same channel, including the
/// publishing node's own) can tell a self-echo from a genuine remote
/// publish and skip it.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
enum TopicEvent {
    SubscribeRequest { topic: String },
    SubscribeRelease { topic: String },
    Message {
        origin_node: String,
        from_socket_id: Option<String>,
        message: RetainedMessage,
    },
}

fn now_secs() -> u64 {
    SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_secs()
}

fn retained_key(topic: &Topic) -> String {
    format!("retained:{topic}")
}

/// Fans out publishes, drives retention and the ack protocol (C3).
#[derive(Clone)]
pub struct MessageBroker {
    store: Arc<dyn SharedStore>,
    subs: SubscriptionRegistry,
    outbound: Arc<dyn Outbound>,
    pending_acks: Arc<Mutex<HashMap<(Topic, String), HashSet<SocketId>>>>,
    degraded: Arc<AtomicBool>,
    relay_tasks: Arc<Mutex<HashSet<Topic>>>,
    node_id: NodeId,
    retry_attempts: u32,
    retry_base_delay: Duration,
}

impl MessageBroker {
    pub fn new(store: Arc<dyn SharedStore>, subs: SubscriptionRegistry, outbound: Arc<dyn Outbound>) -> Self {
        Self::with_retry_config(store, subs, outbound, 3, Duration::from_millis(100))
    }

    /// Construct a broker with explicit transient-store retry parameters,
    /// matching [`crate::config::RelayConfig::ack_retry_attempts`] /
    /// `ack_retry_base_delay`.
    pub fn with_retry_config(
        store: Arc<dyn SharedStore>,
        subs: SubscriptionRegistry,
        outbound: Arc<dyn Outbound>,
        retry_attempts: u32,
        retry_base_delay: Duration,
    ) -> Self {
        Self {
            store,
            subs,
            outbound,
            pending_acks: Arc::new(Mutex::new(HashMap::new())),
            degraded: Arc::new(AtomicBool::new(false)),
            relay_tasks: Arc::new(Mutex::new(HashSet::new())),
            node_id: NodeId::generate(),
            retry_attempts,
            retry_base_delay,
        }
    }

    /// Retry `op` with capped exponential backoff on a transient store
    /// failure, giving up after `retry_attempts` tries.
    async fn with_retry<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: Fn() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let attempts = self.retry_attempts.max(1);
        let mut delay = self.retry_base_delay;
        let mut last_err = String::new();
        for attempt in 1..=attempts {
            match op().await {
                Ok(v) => return Ok(v),
                Err(Error::TransientStore(e)) => {
                    last_err = e;
                    if attempt < attempts {
                        debug!(attempt, ?delay, error = %last_err, "retrying transient store failure");
                        tokio::time::sleep(delay).await;
                        delay *= 2;
                    }
                }
                Err(other) => return Err(other),
            }
        }
        Err(Error::TransientStore(last_err))
    }

    /// Spawn [`Self::run_topic_relay`] for `topic` if one isn't already
    /// running. Idempotent per topic; the task removes itself from the
    /// tracked set on exit so a later subscriber can respawn it. Relay
    /// tasks are intentionally not cancelled on last-local-unsubscribe —
    /// an idle broadcast receiver is cheap, and topics are frequently
    /// resubscribed to.
    async fn spawn_relay_if_needed(&self, topic: Topic) {
        {
            let mut tasks = self.relay_tasks.lock().await;
            if !tasks.insert(topic.clone()) {
                return;
            }
        }
        let broker = self.clone();
        tokio::spawn(async move {
            if let Err(e) = broker.run_topic_relay(topic.clone()).await {
                warn!(topic = %topic, error = %e, "topic relay task exited with error");
            }
            broker.relay_tasks.lock().await.remove(&topic);
        });
    }

    /// Whether the last cross-node store publish failed fatally. While
    /// degraded, delivery continues locally but cross-node fan-out is skipped.
    pub fn is_degraded(&self) -> bool {
        self.degraded.load(Ordering::Relaxed)
    }

    /// Accept a publish, retain it, and fan out to local and remote
    /// subscribers. Returns the content hash used as the message id.
    pub async fn publish(
        &self,
        from_socket_id: Option<&SocketId>,
        topic: &Topic,
        payload: String,
        ttl: Duration,
    ) -> Result<MessageId> {
        let hash = message_hash(&payload);
        let retained = RetainedMessage {
            message_hash: hash.clone(),
            topic: topic.to_string(),
            payload: payload.clone(),
            published_at: now_secs(),
        };
        let encoded = serde_json::to_vec(&retained).map_err(|e| Error::Serialization(e.to_string()))?;

        let key = retained_key(topic);
        let already_retained = self
            .with_retry(|| self.store.range_list(&key))
            .await?
            .iter()
            .any(|raw| {
                serde_json::from_slice::<RetainedMessage>(raw)
                    .map(|r| r.message_hash == hash)
                    .unwrap_or(false)
            });
        if !already_retained {
            self.with_retry(|| self.store.push_to_list(&key, encoded.clone(), ttl))
                .await?;
        }

        let local_sockets = self.subs.sockets_for_topic(topic).await;
        let mut eligible = HashSet::new();
        for socket_id in &local_sockets {
            if Some(socket_id) == from_socket_id {
                continue;
            }
            if self.deliver(socket_id, topic, &retained).await.is_ok() {
                eligible.insert(socket_id.clone());
            }
        }
        if !eligible.is_empty() {
            let mut pending = self.pending_acks.lock().await;
            pending.insert((topic.clone(), hash.clone()), eligible);
        }

        let channel = format!("sub:{topic}");
        let event = TopicEvent::Message {
            origin_node: self.node_id.to_string(),
            from_socket_id: from_socket_id.map(|s| s.to_string()),
            message: retained,
        };
        let event_payload = serde_json::to_vec(&event).map_err(|e| Error::Serialization(e.to_string()))?;

        match self
            .with_retry(|| self.store.publish(&channel, event_payload.clone()))
            .await
        {
            Ok(()) => self.degraded.store(false, Ordering::Relaxed),
            Err(Error::FatalStore(e)) => {
                warn!(error = %e, "shared store publish failed fatally, continuing local-only");
                self.degraded.store(true, Ordering::Relaxed);
            }
            Err(Error::TransientStore(e)) => {
                warn!(error = %e, "shared store publish exhausted retries, marking degraded");
                self.degraded.store(true, Ordering::Relaxed);
            }
            Err(other) => return Err(other),
        }

        Ok(hash)
    }

    /// Record that `socket_id` has acknowledged `message_hash` for `topic`.
    /// Once every socket eligible at publish time has acked, the retention
    /// entry is dropped from the store.
    pub async fn acknowledge(&self, socket_id: &SocketId, topic: &Topic, message_hash: &str) -> Result<()> {
        let now_empty = {
            let mut pending = self.pending_acks.lock().await;
            let key = (topic.clone(), message_hash.to_string());
            if let Some(set) = pending.get_mut(&key) {
                set.remove(socket_id);
                let empty = set.is_empty();
                if empty {
                    pending.remove(&key);
                }
                empty
            } else {
                false
            }
        };
        if now_empty {
            self.drop_retained(topic, message_hash).await?;
        }
        Ok(())
    }

    /// A socket disconnected: drop its outstanding ack obligations. If that
    /// was the last obligation for a message, retire it from the store.
    pub async fn on_socket_closed(&self, socket_id: &SocketId) -> Result<()> {
        let drained: Vec<(Topic, String)> = {
            let mut pending = self.pending_acks.lock().await;
            let mut emptied = Vec::new();
            pending.retain(|key, set| {
                set.remove(socket_id);
                if set.is_empty() {
                    emptied.push(key.clone());
                    false
                } else {
                    true
                }
            });
            emptied
        };
        for (topic, hash) in drained {
            self.drop_retained(&topic, &hash).await?;
        }
        Ok(())
    }

    async fn drop_retained(&self, topic: &Topic, message_hash: &str) -> Result<()> {
        let key = retained_key(topic);
        if let Ok(entries) = self.store.range_list(&key).await {
            for raw in entries {
                if let Ok(retained) = serde_json::from_slice::<RetainedMessage>(&raw) {
                    if retained.message_hash == message_hash {
                        self.store.remove_from_list(&key, &raw).await?;
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    /// Replay every unexpired retained message for `topic` to a socket that
    /// just subscribed, oldest first, registering it as eligible to ack each.
    pub async fn on_new_subscriber(&self, socket_id: &SocketId, topic: &Topic) -> Result<()> {
        self.spawn_relay_if_needed(topic.clone()).await;

        let entries = self.store.range_list(&retained_key(topic)).await?;
        let mut pending = self.pending_acks.lock().await;
        for raw in entries {
            let Ok(retained) = serde_json::from_slice::<RetainedMessage>(&raw) else {
                continue;
            };
            if self.deliver(socket_id, topic, &retained).await.is_ok() {
                pending
                    .entry((topic.clone(), retained.message_hash.clone()))
                    .or_default()
                    .insert(socket_id.clone());
            }
        }
        Ok(())
    }

    /// Consume cross-node events for `topic`, invoking `on_new_subscriber`'s
    /// sibling delivery path for messages published on other nodes. Spawned
    /// by [`Self::spawn_relay_if_needed`] on first local subscribe to a topic
    /// and left running for the rest of the process's life.
    pub async fn run_topic_relay(&self, topic: Topic) -> Result<()> {
        let mut rx = self.store.subscribe(&format!("sub:{topic}")).await?;
        loop {
            let payload = match rx.recv().await {
                Ok(p) => p,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => return Ok(()),
            };
            let Ok(event) = serde_json::from_slice::<TopicEvent>(&payload) else {
                continue;
            };
            if let TopicEvent::Message {
                origin_node,
                from_socket_id,
                message: retained,
            } = event
            {
                if origin_node == self.node_id.to_string() {
                    // Already fanned out locally inside publish() itself.
                    continue;
                }
                let local_sockets = self.subs.sockets_for_topic(&topic).await;
                let mut eligible = HashSet::new();
                for socket_id in &local_sockets {
                    if from_socket_id.as_deref() == Some(socket_id.as_str()) {
                        continue;
                    }
                    if self.deliver(socket_id, &topic, &retained).await.is_ok() {
                        eligible.insert(socket_id.clone());
                    }
                }
                if !eligible.is_empty() {
                    let mut pending = self.pending_acks.lock().await;
                    pending
                        .entry((topic.clone(), retained.message_hash.clone()))
                        .or_default()
                        .extend(eligible);
                }
            }
        }
    }

    async fn deliver(&self, socket_id: &SocketId, topic: &Topic, retained: &RetainedMessage) -> Result<()> {
        let Some(sub_id) = self.subs.subscription_id_for(socket_id, topic).await else {
            // The socket unsubscribed between being listed and being delivered to.
            return Err(Error::ConnectionClosed);
        };
        let payload = RelaySubscriptionPayload {
            id: sub_id.to_string(),
            data: RelaySubscriptionData {
                topic: retained.topic.clone(),
                message: retained.payload.clone(),
                message_hash: retained.message_hash.clone(),
            },
        };
        let notification = JsonRpcNotification::new(
            "relay_subscription",
            Some(serde_json::to_value(&payload).map_err(|e| Error::Serialization(e.to_string()))?),
        );
        let frame = serde_json::to_vec(&notification).map_err(|e| Error::Serialization(e.to_string()))?;
        match self.outbound.send(socket_id, frame).await {
            Ok(()) => Ok(()),
            Err(e) => {
                warn!(socket = %socket_id, error = %e, "delivery failed, message stays retained");
                self.outbound.close(socket_id, 1011, "delivery failure").await;
                Err(e)
            }
        }
    }
}

/// Interest notice surfaced alongside message relay, for components that
/// want to react to other nodes gaining/losing subscribers (unused by the
/// core broker logic itself, which only cares about messages).
pub fn decode_subscription_notice(payload: &[u8]) -> Option<SubscriptionNotice> {
    serde_json::from_slice(payload).ok()
}

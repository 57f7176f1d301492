//! Subscription registry: topic <-> socket index, replicated across nodes (C2)
//!
//! Maintains bidirectional mappings between topics and subscriptions so the
//! broker can answer both "who is listening to this topic" (for fan-out) and
//! "what is this socket listening to" (for cleanup on close) in O(1).
//!
//! Cross-node interest is propagated through the shared store: the first
//! local subscriber to a topic announces a `subscribe_request` so any other
//! node holding retained messages for that topic can flush them here; the
//! last local unsubscriber announces a `subscribe_release`, purely advisory.

use crate::ids::{SocketId, SubscriptionId, Topic};
use crate::store::SharedStore;
use relay_core::Result;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::Mutex;

/// Message published on a topic's `sub:<topic>` channel to announce interest.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind")]
pub enum SubscriptionNotice {
    /// A node just gained its first local subscriber for this topic.
    SubscribeRequest { topic: String },
    /// A node just lost its last local subscriber for this topic.
    SubscribeRelease { topic: String },
}

#[derive(Default)]
struct Inner {
    topic_subs: HashMap<Topic, HashSet<SubscriptionId>>,
    socket_subs: HashMap<SocketId, HashSet<SubscriptionId>>,
    resolve: HashMap<SubscriptionId, (SocketId, Topic)>,
    existing: HashMap<(SocketId, Topic), SubscriptionId>,
}

/// Per-node topic <-> socket index with cross-node interest propagation.
#[derive(Clone)]
pub struct SubscriptionRegistry {
    inner: Arc<Mutex<Inner>>,
    store: Arc<dyn SharedStore>,
}

impl SubscriptionRegistry {
    pub fn new(store: Arc<dyn SharedStore>) -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            store,
        }
    }

    /// Subscribe `socket_id` to `topic`. Idempotent: returns the existing
    /// subscription id if this (socket, topic) pair is already subscribed.
    pub async fn subscribe(&self, socket_id: &SocketId, topic: &Topic) -> Result<SubscriptionId> {
        let (sub_id, became_first_local_interest) = {
            let mut inner = self.inner.lock().await;
            if let Some(existing) = inner.existing.get(&(socket_id.clone(), topic.clone())) {
                return Ok(existing.clone());
            }

            let sub_id = SubscriptionId::generate();
            let first = !inner.topic_subs.contains_key(topic)
                || inner.topic_subs.get(topic).map(|s| s.is_empty()).unwrap_or(true);

            inner
                .topic_subs
                .entry(topic.clone())
                .or_default()
                .insert(sub_id.clone());
            inner
                .socket_subs
                .entry(socket_id.clone())
                .or_default()
                .insert(sub_id.clone());
            inner
                .resolve
                .insert(sub_id.clone(), (socket_id.clone(), topic.clone()));
            inner
                .existing
                .insert((socket_id.clone(), topic.clone()), sub_id.clone());

            (sub_id, first)
        };

        if became_first_local_interest {
            self.announce(&SubscriptionNotice::SubscribeRequest {
                topic: topic.to_string(),
            })
            .await?;
        }

        Ok(sub_id)
    }

    /// Remove exactly one subscription. Silently returns if unknown.
    pub async fn unsubscribe(&self, socket_id: &SocketId, sub_id: &SubscriptionId) -> Result<()> {
        let released_topic = {
            let mut inner = self.inner.lock().await;
            let Some((owner, topic)) = inner.resolve.remove(sub_id) else {
                return Ok(());
            };
            if &owner != socket_id {
                // Not this socket's subscription; put it back untouched.
                inner.resolve.insert(sub_id.clone(), (owner, topic));
                return Ok(());
            }

            inner.existing.remove(&(socket_id.clone(), topic.clone()));
            if let Some(subs) = inner.socket_subs.get_mut(socket_id) {
                subs.remove(sub_id);
                if subs.is_empty() {
                    inner.socket_subs.remove(socket_id);
                }
            }

            let mut last_local = false;
            if let Some(subs) = inner.topic_subs.get_mut(&topic) {
                subs.remove(sub_id);
                if subs.is_empty() {
                    inner.topic_subs.remove(&topic);
                    last_local = true;
                }
            }

            if last_local {
                Some(topic)
            } else {
                None
            }
        };

        if let Some(topic) = released_topic {
            self.announce(&SubscriptionNotice::SubscribeRelease {
                topic: topic.to_string(),
            })
            .await?;
        }

        Ok(())
    }

    /// Remove every subscription belonging to `socket_id` (on socket close).
    pub async fn on_close(&self, socket_id: &SocketId) -> Result<()> {
        let sub_ids: Vec<SubscriptionId> = {
            let inner = self.inner.lock().await;
            inner
                .socket_subs
                .get(socket_id)
                .map(|s| s.iter().cloned().collect())
                .unwrap_or_default()
        };
        for sub_id in sub_ids {
            self.unsubscribe(socket_id, &sub_id).await?;
        }
        Ok(())
    }

    /// Local subscribers of `topic`.
    pub async fn sockets_for_topic(&self, topic: &Topic) -> HashSet<SocketId> {
        let inner = self.inner.lock().await;
        inner
            .topic_subs
            .get(topic)
            .map(|subs| {
                subs.iter()
                    .filter_map(|s| inner.resolve.get(s).map(|(socket, _)| socket.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The subscription id for an already-subscribed (socket, topic) pair.
    pub async fn subscription_id_for(&self, socket_id: &SocketId, topic: &Topic) -> Option<SubscriptionId> {
        let inner = self.inner.lock().await;
        inner.existing.get(&(socket_id.clone(), topic.clone())).cloned()
    }

    /// Topics `socket_id` currently subscribes to.
    pub async fn topics_for_socket(&self, socket_id: &SocketId) -> HashSet<Topic> {
        let inner = self.inner.lock().await;
        inner
            .socket_subs
            .get(socket_id)
            .map(|subs| {
                subs.iter()
                    .filter_map(|s| inner.resolve.get(s).map(|(_, topic)| topic.clone()))
                    .collect()
            })
            .unwrap_or_default()
    }

    async fn announce(&self, notice: &SubscriptionNotice) -> Result<()> {
        let topic = match notice {
            SubscriptionNotice::SubscribeRequest { topic }
            | SubscriptionNotice::SubscribeRelease { topic } => topic.clone(),
        };
        let channel = format!("sub:{topic}");
        let payload = serde_json::to_vec(notice)
            .map_err(|e| relay_core::Error::Serialization(e.to_string()))?;
        self.store.publish(&channel, payload).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledStore;

    fn registry() -> SubscriptionRegistry {
        SubscriptionRegistry::new(Arc::new(SledStore::open_temporary().unwrap()))
    }

    #[tokio::test]
    async fn subscribe_is_idempotent_per_socket_and_topic() {
        let reg = registry();
        let socket = SocketId::generate();
        let topic = Topic::generate();
        let a = reg.subscribe(&socket, &topic).await.unwrap();
        let b = reg.subscribe(&socket, &topic).await.unwrap();
        assert_eq!(a, b);
        assert_eq!(reg.sockets_for_topic(&topic).await.len(), 1);
    }

    #[tokio::test]
    async fn unsubscribe_removes_exactly_one_entry() {
        let reg = registry();
        let socket = SocketId::generate();
        let topic = Topic::generate();
        let sub_id = reg.subscribe(&socket, &topic).await.unwrap();
        reg.unsubscribe(&socket, &sub_id).await.unwrap();
        assert!(reg.sockets_for_topic(&topic).await.is_empty());
    }

    #[tokio::test]
    async fn unsubscribe_unknown_id_is_a_silent_no_op() {
        let reg = registry();
        let socket = SocketId::generate();
        reg.unsubscribe(&socket, &SubscriptionId::generate())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn on_close_removes_every_subscription_of_socket() {
        let reg = registry();
        let socket = SocketId::generate();
        let t1 = Topic::generate();
        let t2 = Topic::generate();
        reg.subscribe(&socket, &t1).await.unwrap();
        reg.subscribe(&socket, &t2).await.unwrap();
        reg.on_close(&socket).await.unwrap();
        assert!(reg.topics_for_socket(&socket).await.is_empty());
        assert!(reg.sockets_for_topic(&t1).await.is_empty());
        assert!(reg.sockets_for_topic(&t2).await.is_empty());
    }

    #[tokio::test]
    async fn multiple_sockets_can_subscribe_to_one_topic() {
        let reg = registry();
        let topic = Topic::generate();
        let s1 = SocketId::generate();
        let s2 = SocketId::generate();
        reg.subscribe(&s1, &topic).await.unwrap();
        reg.subscribe(&s2, &topic).await.unwrap();
        assert_eq!(reg.sockets_for_topic(&topic).await.len(), 2);
    }
}

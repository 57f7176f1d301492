//! Per-topic JSON-RPC request/response history (C5)
//!
//! Lets a peer that disconnects mid-exchange reconcile requests it issued
//! with their eventual responses. Records are keyed by `(topic, id)`; every
//! mutation snapshots the topic's full record list to the shared store so a
//! restart can recover in-flight state before serving further mutations.
//!
//! Because topics are opaque and not enumerable up front, restoration is
//! per-topic and lazy: the first operation touching a topic blocks on
//! restoring that topic's snapshot from the store, then every later
//! operation on the same topic proceeds without re-checking. This is the
//! `Restoring -> Ready` gate from the design notes, applied at topic
//! granularity rather than at process granularity.

use crate::ids::Topic;
use crate::store::SharedStore;
use relay_core::{Error, Id, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};

const PROTOCOL: &str = "relay";
const VERSION: u32 = 1;

/// The request half of a history record.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRequest {
    pub method: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub params: Option<serde_json::Value>,
}

/// The response half of a history record: exactly one of result or error.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(untagged)]
pub enum HistoryResponse {
    Result { result: serde_json::Value },
    Error { error: serde_json::Value },
}

/// A single outstanding-or-resolved JSON-RPC exchange for a topic.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryRecord {
    pub id: Id,
    pub topic: String,
    pub request: HistoryRequest,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub chain_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response: Option<HistoryResponse>,
}

impl HistoryRecord {
    pub fn is_pending(&self) -> bool {
        self.response.is_none()
    }
}

/// Observable mutation events. Informational only: handlers must never call
/// back into the history from within an event handler.
#[derive(Debug, Clone)]
pub enum HistoryEvent {
    Created(HistoryRecord),
    Updated(HistoryRecord),
    Deleted(HistoryRecord),
}

enum TopicState {
    Restoring,
    Ready(Vec<HistoryRecord>),
}

/// Per-topic JSON-RPC history, persisted through a [`SharedStore`].
#[derive(Clone)]
pub struct History {
    store: Arc<dyn SharedStore>,
    topics: Arc<Mutex<HashMap<Topic, TopicState>>>,
    events: mpsc::UnboundedSender<HistoryEvent>,
}

impl History {
    /// Construct a history, registering `events` as the sole observer
    /// channel. Events are emitted after each successful mutation.
    pub fn new(store: Arc<dyn SharedStore>, events: mpsc::UnboundedSender<HistoryEvent>) -> Self {
        Self {
            store,
            topics: Arc::new(Mutex::new(HashMap::new())),
            events,
        }
    }

    fn snapshot_key(topic: &str) -> String {
        format!("history:{PROTOCOL}@{VERSION}:{topic}")
    }

    /// Ensure `topic`'s records are loaded, restoring from the store on
    /// first touch. All mutating operations call this before touching state.
    async fn ensure_restored<'a>(
        &self,
        topics: &'a mut HashMap<Topic, TopicState>,
        topic: &Topic,
    ) -> Result<&'a mut Vec<HistoryRecord>> {
        if !matches!(topics.get(topic), Some(TopicState::Ready(_))) {
            let key = Self::snapshot_key(topic.as_str());
            let raw = self.store.range_list(&key).await?;
            let records: Result<Vec<HistoryRecord>> = raw
                .into_iter()
                .map(|bytes| {
                    serde_json::from_slice(&bytes)
                        .map_err(|e| Error::Internal(format!("corrupt history snapshot: {e}")))
                })
                .collect();
            topics.insert(topic.clone(), TopicState::Ready(records?));
        }
        match topics.get_mut(topic) {
            Some(TopicState::Ready(records)) => Ok(records),
            _ => unreachable!("just inserted Ready state"),
        }
    }

    async fn persist(&self, topic: &Topic, records: &[HistoryRecord]) -> Result<()> {
        let key = Self::snapshot_key(topic.as_str());
        let encoded: Result<Vec<Vec<u8>>> = records
            .iter()
            .map(|r| {
                serde_json::to_vec(r).map_err(|e| Error::Serialization(e.to_string()))
            })
            .collect();
        self.store.replace_list(&key, encoded?).await
    }

    /// `set(topic, request)`: fails `RecordAlreadyExists` if `request.id` is
    /// already recorded for this topic.
    pub async fn set(
        &self,
        topic: &Topic,
        id: Id,
        request: HistoryRequest,
        chain_id: Option<String>,
    ) -> Result<()> {
        let mut topics = self.topics.lock().await;
        let records = self.ensure_restored(&mut topics, topic).await?;
        if records.iter().any(|r| r.id == id) {
            return Err(Error::RecordAlreadyExists(id.to_string()));
        }
        let record = HistoryRecord {
            id,
            topic: topic.to_string(),
            request,
            chain_id,
            response: None,
        };
        records.push(record.clone());
        self.persist(topic, records).await?;
        let _ = self.events.send(HistoryEvent::Created(record));
        Ok(())
    }

    /// `update(topic, response)`: silently no-ops if no record matches, the
    /// topic disagrees, or the record already has a response.
    pub async fn update(&self, topic: &Topic, id: &Id, response: HistoryResponse) -> Result<()> {
        let mut topics = self.topics.lock().await;
        let records = self.ensure_restored(&mut topics, topic).await?;
        let Some(record) = records.iter_mut().find(|r| &r.id == id) else {
            return Ok(());
        };
        if record.topic != topic.to_string() || record.response.is_some() {
            return Ok(());
        }
        record.response = Some(response);
        let updated = record.clone();
        self.persist(topic, records).await?;
        let _ = self.events.send(HistoryEvent::Updated(updated));
        Ok(())
    }

    /// `get(topic, id)`: fails `NoMatchingId` / `MismatchedTopic`.
    pub async fn get(&self, topic: &Topic, id: &Id) -> Result<HistoryRecord> {
        let mut topics = self.topics.lock().await;
        let records = self.ensure_restored(&mut topics, topic).await?;
        let record = records
            .iter()
            .find(|r| &r.id == id)
            .ok_or_else(|| Error::NoMatchingId(id.to_string()))?;
        if record.topic != topic.to_string() {
            return Err(Error::MismatchedTopic);
        }
        Ok(record.clone())
    }

    /// `delete(topic, id)`: remove one record if its topic matches. Without
    /// an id, remove every record of `topic`, still emitting one `Deleted`
    /// event per record.
    pub async fn delete(&self, topic: &Topic, id: Option<&Id>) -> Result<()> {
        let mut topics = self.topics.lock().await;
        let records = self.ensure_restored(&mut topics, topic).await?;

        let removed: Vec<HistoryRecord> = match id {
            Some(id) => {
                let mut out = Vec::new();
                records.retain(|r| {
                    if &r.id == id && r.topic == topic.to_string() {
                        out.push(r.clone());
                        false
                    } else {
                        true
                    }
                });
                out
            }
            None => std::mem::take(records),
        };

        if !removed.is_empty() {
            self.persist(topic, records).await?;
            for record in removed {
                let _ = self.events.send(HistoryEvent::Deleted(record));
            }
        }
        Ok(())
    }

    /// Eagerly restore `topic` from the store, for embedders that want to
    /// warm a known set of topics at startup rather than rely on the lazy
    /// per-operation restore every mutation already performs. Fails if the
    /// topic already holds restored, non-empty records — restoring again
    /// would silently discard whatever is currently in memory.
    pub async fn restore(&self, topic: &Topic) -> Result<()> {
        let mut topics = self.topics.lock().await;
        if let Some(TopicState::Ready(records)) = topics.get(topic) {
            if !records.is_empty() {
                return Err(Error::RestoreWouldOverride);
            }
        }
        topics.remove(topic);
        self.ensure_restored(&mut topics, topic).await?;
        Ok(())
    }

    /// `exists(topic, id)`.
    pub async fn exists(&self, topic: &Topic, id: &Id) -> Result<bool> {
        let mut topics = self.topics.lock().await;
        let records = self.ensure_restored(&mut topics, topic).await?;
        Ok(records.iter().any(|r| &r.id == id && r.topic == topic.to_string()))
    }

    /// Every record across every touched topic whose response is absent.
    pub async fn pending(&self) -> Vec<HistoryRecord> {
        let topics = self.topics.lock().await;
        topics
            .values()
            .filter_map(|state| match state {
                TopicState::Ready(records) => Some(records.iter().filter(|r| r.is_pending())),
                TopicState::Restoring => None,
            })
            .flatten()
            .cloned()
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::SledStore;

    fn history() -> (History, mpsc::UnboundedReceiver<HistoryEvent>) {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let (tx, rx) = mpsc::unbounded_channel();
        (History::new(store, tx), rx)
    }

    fn req(method: &str) -> HistoryRequest {
        HistoryRequest {
            method: method.to_string(),
            params: None,
        }
    }

    #[tokio::test]
    async fn set_then_update_round_trips_through_get() {
        let (history, mut events) = history();
        let topic = Topic::generate();
        history
            .set(&topic, Id::Number(7), req("eth_sign"), None)
            .await
            .unwrap();
        history
            .update(
                &topic,
                &Id::Number(7),
                HistoryResponse::Result {
                    result: serde_json::json!("0xdead"),
                },
            )
            .await
            .unwrap();

        let record = history.get(&topic, &Id::Number(7)).await.unwrap();
        assert!(matches!(record.response, Some(HistoryResponse::Result { .. })));
        assert!(history.exists(&topic, &Id::Number(7)).await.unwrap());

        assert!(matches!(events.recv().await, Some(HistoryEvent::Created(_))));
        assert!(matches!(events.recv().await, Some(HistoryEvent::Updated(_))));
    }

    #[tokio::test]
    async fn set_rejects_duplicate_id() {
        let (history, _events) = history();
        let topic = Topic::generate();
        history
            .set(&topic, Id::Number(1), req("m"), None)
            .await
            .unwrap();
        let err = history.set(&topic, Id::Number(1), req("m"), None).await;
        assert!(matches!(err, Err(Error::RecordAlreadyExists(_))));
    }

    #[tokio::test]
    async fn update_on_other_topic_is_a_no_op() {
        let (history, _events) = history();
        let t1 = Topic::generate();
        let t2 = Topic::generate();
        history.set(&t1, Id::Number(1), req("m"), None).await.unwrap();
        history
            .update(
                &t2,
                &Id::Number(1),
                HistoryResponse::Result {
                    result: serde_json::json!(1),
                },
            )
            .await
            .unwrap();
        let record = history.get(&t1, &Id::Number(1)).await.unwrap();
        assert!(record.response.is_none());
    }

    #[tokio::test]
    async fn get_missing_id_fails_no_matching_id() {
        let (history, _events) = history();
        let topic = Topic::generate();
        let err = history.get(&topic, &Id::Number(99)).await;
        assert!(matches!(err, Err(Error::NoMatchingId(_))));
    }

    #[tokio::test]
    async fn delete_without_id_removes_every_record_with_per_record_events() {
        let (history, mut events) = history();
        let topic = Topic::generate();
        history.set(&topic, Id::Number(1), req("m"), None).await.unwrap();
        history.set(&topic, Id::Number(2), req("m"), None).await.unwrap();
        history.delete(&topic, None).await.unwrap();

        assert!(!history.exists(&topic, &Id::Number(1)).await.unwrap());
        assert!(!history.exists(&topic, &Id::Number(2)).await.unwrap());

        let mut deleted = 0;
        while let Ok(event) = events.try_recv() {
            if matches!(event, HistoryEvent::Deleted(_)) {
                deleted += 1;
            }
        }
        assert_eq!(deleted, 2);
    }

    #[tokio::test]
    async fn pending_excludes_resolved_records() {
        let (history, _events) = history();
        let topic = Topic::generate();
        history.set(&topic, Id::Number(1), req("m"), None).await.unwrap();
        history.set(&topic, Id::Number(2), req("m"), None).await.unwrap();
        history
            .update(
                &topic,
                &Id::Number(1),
                HistoryResponse::Result {
                    result: serde_json::json!(1),
                },
            )
            .await
            .unwrap();

        let pending = history.pending().await;
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, Id::Number(2));
    }

    #[tokio::test]
    async fn restore_over_non_empty_records_fails() {
        let (history, _events) = history();
        let topic = Topic::generate();
        history.set(&topic, Id::Number(1), req("m"), None).await.unwrap();
        let err = history.restore(&topic).await;
        assert!(matches!(err, Err(Error::RestoreWouldOverride)));
    }

    #[tokio::test]
    async fn restore_on_untouched_topic_loads_its_snapshot() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let topic = Topic::generate();
        {
            let (tx, _rx) = mpsc::unbounded_channel();
            let history = History::new(store.clone(), tx);
            history.set(&topic, Id::Number(1), req("m"), None).await.unwrap();
        }
        let (tx, _rx) = mpsc::unbounded_channel();
        let history = History::new(store, tx);
        history.restore(&topic).await.unwrap();
        assert!(history.exists(&topic, &Id::Number(1)).await.unwrap());
    }

    #[tokio::test]
    async fn restoring_over_persisted_snapshot_recovers_records() {
        let store = Arc::new(SledStore::open_temporary().unwrap());
        let topic = Topic::generate();
        {
            let (tx, _rx) = mpsc::unbounded_channel();
            let history = History::new(store.clone(), tx);
            history.set(&topic, Id::Number(1), req("m"), None).await.unwrap();
        }
        {
            let (tx, _rx) = mpsc::unbounded_channel();
            let history = History::new(store, tx);
            assert!(history.exists(&topic, &Id::Number(1)).await.unwrap());
        }
    }
}

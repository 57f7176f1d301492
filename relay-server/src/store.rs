//! Shared store: content-addressed KV plus a cross-node pub/sub bus (C1)
//!
//! The rest of the relay core depends on three primitives, expressed here as
//! the [`SharedStore`] trait rather than a concrete type:
//!
//! - `set_with_ttl` / `get` — a durable key/value entry that expires.
//! - `push_to_list` / `range_list` — an append-only per-key queue, used for
//!   retained messages and history snapshots.
//! - `publish` / `subscribe` — an at-least-once fan-out bus keyed by channel
//!   name, used to federate subscription interest and message delivery
//!   across relay nodes.
//!
//! [`SledStore`] is the bundled "cluster of one" implementation: sled gives
//! the durable KV/list half, and an in-process `tokio::sync::broadcast` bus
//! gives the pub/sub half. Running more than one relay process against a
//! genuinely shared backend (a shared database plus a message-bus client)
//! means implementing this trait against that backend; the rest of the core
//! never needs to change.

use async_trait::async_trait;
use relay_core::{Error, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::time::{Duration, SystemTime, UNIX_EPOCH};
use tokio::sync::{broadcast, Mutex};

fn now_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap()
        .as_secs()
}

/// A value stored with an expiry timestamp.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct Entry {
    value: Vec<u8>,
    expires_at: Option<u64>,
}

impl Entry {
    fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(t) if t <= now_secs())
    }
}

/// A single element of an append-only list, carrying its own expiry so
/// retained-message entries can be pruned lazily on read.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ListEntry {
    pub value: Vec<u8>,
    pub expires_at: Option<u64>,
}

impl ListEntry {
    pub fn is_expired(&self) -> bool {
        matches!(self.expires_at, Some(t) if t <= now_secs())
    }
}

/// The three primitives every other component in the core depends on.
#[async_trait]
pub trait SharedStore: Send + Sync {
    /// Store `value` under `key`, durable until `ttl` elapses.
    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Fetch the latest value for `key`, or `None` if absent or expired.
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>>;

    /// Remove `key` outright (used when a retention entry is fully acked).
    async fn delete(&self, key: &str) -> Result<()>;

    /// Append `entry` to the list at `key`, expiring after `ttl`.
    async fn push_to_list(&self, key: &str, entry: Vec<u8>, ttl: Duration) -> Result<()>;

    /// Return every unexpired entry in the list at `key`, in arrival order.
    async fn range_list(&self, key: &str) -> Result<Vec<Vec<u8>>>;

    /// Replace the entire list at `key` with `entries` (used by history
    /// snapshots, which persist the full record set on every mutation).
    async fn replace_list(&self, key: &str, entries: Vec<Vec<u8>>) -> Result<()>;

    /// Drop exactly one raw-byte-equal entry from the list at `key`, if present.
    async fn remove_from_list(&self, key: &str, entry: &[u8]) -> Result<()>;

    /// Publish `payload` on `channel`. Delivered to every live `subscribe`
    /// stream for that channel, including ones on this same node.
    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()>;

    /// Subscribe to `channel`, receiving every payload published to it from
    /// the moment of subscription onward.
    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Vec<u8>>>;
}

/// sled-backed [`SharedStore`]: durable KV/list, in-process pub/sub.
pub struct SledStore {
    db: sled::Db,
    kv: sled::Tree,
    lists: sled::Tree,
    channels: Mutex<HashMap<String, broadcast::Sender<Vec<u8>>>>,
}

impl SledStore {
    pub fn open(db_path: impl AsRef<Path>) -> Result<Self> {
        let db = sled::open(db_path)
            .map_err(|e| Error::FatalStore(format!("failed to open store: {e}")))?;
        let kv = db
            .open_tree("kv")
            .map_err(|e| Error::FatalStore(format!("failed to open kv tree: {e}")))?;
        let lists = db
            .open_tree("lists")
            .map_err(|e| Error::FatalStore(format!("failed to open lists tree: {e}")))?;
        Ok(Self {
            db,
            kv,
            lists,
            channels: Mutex::new(HashMap::new()),
        })
    }

    /// Open a store backed by a fresh temporary directory. Used by tests and
    /// by `RelayConfig::default()` for local development without a
    /// configured store path.
    pub fn open_temporary() -> Result<Self> {
        let db = sled::Config::new()
            .temporary(true)
            .open()
            .map_err(|e| Error::FatalStore(format!("failed to open temp store: {e}")))?;
        let kv = db
            .open_tree("kv")
            .map_err(|e| Error::FatalStore(format!("failed to open kv tree: {e}")))?;
        let lists = db
            .open_tree("lists")
            .map_err(|e| Error::FatalStore(format!("failed to open lists tree: {e}")))?;
        Ok(Self {
            db,
            kv,
            lists,
            channels: Mutex::new(HashMap::new()),
        })
    }

    fn list_key(key: &str, seq: u64) -> String {
        format!("{key}\0{seq:020}")
    }

    async fn next_seq(&self, key: &str) -> Result<u64> {
        let counter_key = format!("{key}\0__seq");
        let next = self
            .lists
            .fetch_and_update(counter_key.as_bytes(), |old| {
                let n = old
                    .map(|b| u64::from_be_bytes(b.try_into().unwrap_or([0; 8])))
                    .unwrap_or(0);
                Some((n + 1).to_be_bytes().to_vec())
            })
            .map_err(|e| Error::TransientStore(e.to_string()))?;
        Ok(next
            .map(|b| u64::from_be_bytes(b.try_into().unwrap_or([0; 8])))
            .unwrap_or(0)
            + 1)
    }
}

#[async_trait]
impl SharedStore for SledStore {
    async fn set_with_ttl(&self, key: &str, value: Vec<u8>, ttl: Duration) -> Result<()> {
        let entry = Entry {
            value,
            expires_at: Some(now_secs() + ttl.as_secs()),
        };
        let bytes = bincode::serialize(&entry)
            .map_err(|e| Error::Internal(format!("failed to encode store entry: {e}")))?;
        self.kv
            .insert(key.as_bytes(), bytes)
            .map_err(|e| Error::TransientStore(e.to_string()))?;
        self.kv
            .flush_async()
            .await
            .map_err(|e| Error::TransientStore(e.to_string()))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>> {
        let raw = self
            .kv
            .get(key.as_bytes())
            .map_err(|e| Error::TransientStore(e.to_string()))?;
        let Some(raw) = raw else { return Ok(None) };
        let entry: Entry = bincode::deserialize(&raw)
            .map_err(|e| Error::Internal(format!("failed to decode store entry: {e}")))?;
        if entry.is_expired() {
            let _ = self.kv.remove(key.as_bytes());
            return Ok(None);
        }
        Ok(Some(entry.value))
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.kv
            .remove(key.as_bytes())
            .map_err(|e| Error::TransientStore(e.to_string()))?;
        Ok(())
    }

    async fn push_to_list(&self, key: &str, entry: Vec<u8>, ttl: Duration) -> Result<()> {
        let seq = self.next_seq(key).await?;
        let list_entry = ListEntry {
            value: entry,
            expires_at: Some(now_secs() + ttl.as_secs()),
        };
        let bytes = bincode::serialize(&list_entry)
            .map_err(|e| Error::Internal(format!("failed to encode list entry: {e}")))?;
        self.lists
            .insert(Self::list_key(key, seq).as_bytes(), bytes)
            .map_err(|e| Error::TransientStore(e.to_string()))?;
        self.lists
            .flush_async()
            .await
            .map_err(|e| Error::TransientStore(e.to_string()))?;
        Ok(())
    }

    async fn range_list(&self, key: &str) -> Result<Vec<Vec<u8>>> {
        let prefix = format!("{key}\0");
        let mut out = Vec::new();
        for item in self.lists.scan_prefix(prefix.as_bytes()) {
            let (k, v) = item.map_err(|e| Error::TransientStore(e.to_string()))?;
            if k.ends_with(b"__seq") {
                continue;
            }
            let entry: ListEntry = bincode::deserialize(&v)
                .map_err(|e| Error::Internal(format!("failed to decode list entry: {e}")))?;
            if !entry.is_expired() {
                out.push(entry.value);
            }
        }
        Ok(out)
    }

    async fn replace_list(&self, key: &str, entries: Vec<Vec<u8>>) -> Result<()> {
        let prefix = format!("{key}\0");
        let stale: Vec<_> = self
            .lists
            .scan_prefix(prefix.as_bytes())
            .keys()
            .filter_map(|k| k.ok())
            .collect();
        for k in stale {
            let _ = self.lists.remove(k);
        }
        for entry in entries {
            self.push_to_list(key, entry, Duration::from_secs(365 * 24 * 3600))
                .await?;
        }
        Ok(())
    }

    async fn remove_from_list(&self, key: &str, entry: &[u8]) -> Result<()> {
        let prefix = format!("{key}\0");
        for item in self.lists.scan_prefix(prefix.as_bytes()) {
            let (k, v) = item.map_err(|e| Error::TransientStore(e.to_string()))?;
            if k.ends_with(b"__seq") {
                continue;
            }
            let list_entry: ListEntry = bincode::deserialize(&v)
                .map_err(|e| Error::Internal(format!("failed to decode list entry: {e}")))?;
            if list_entry.value == entry {
                self.lists
                    .remove(k)
                    .map_err(|e| Error::TransientStore(e.to_string()))?;
                break;
            }
        }
        Ok(())
    }

    async fn publish(&self, channel: &str, payload: Vec<u8>) -> Result<()> {
        let mut channels = self.channels.lock().await;
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(1024).0);
        // No live subscribers is not an error: at-least-once delivery only
        // promises every *live* subscribe stream receives the payload.
        let _ = sender.send(payload);
        Ok(())
    }

    async fn subscribe(&self, channel: &str) -> Result<broadcast::Receiver<Vec<u8>>> {
        let mut channels = self.channels.lock().await;
        let sender = channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(1024).0);
        Ok(sender.subscribe())
    }
}

impl Drop for SledStore {
    fn drop(&mut self) {
        let _ = self.db.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn set_with_ttl_then_get_roundtrips() {
        let store = SledStore::open_temporary().unwrap();
        store
            .set_with_ttl("k", b"v".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        assert_eq!(store.get("k").await.unwrap(), Some(b"v".to_vec()));
    }

    #[tokio::test]
    async fn expired_entry_reads_as_absent() {
        let store = SledStore::open_temporary().unwrap();
        store
            .set_with_ttl("k", b"v".to_vec(), Duration::from_secs(0))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(1100)).await;
        assert_eq!(store.get("k").await.unwrap(), None);
    }

    #[tokio::test]
    async fn list_push_and_range_preserves_order() {
        let store = SledStore::open_temporary().unwrap();
        for entry in ["a", "b", "c"] {
            store
                .push_to_list("topic", entry.as_bytes().to_vec(), Duration::from_secs(60))
                .await
                .unwrap();
        }
        let values = store.range_list("topic").await.unwrap();
        assert_eq!(values, vec![b"a".to_vec(), b"b".to_vec(), b"c".to_vec()]);
    }

    #[tokio::test]
    async fn publish_reaches_live_subscriber() {
        let store = SledStore::open_temporary().unwrap();
        let mut rx = store.subscribe("sub:topic").await.unwrap();
        store
            .publish("sub:topic", b"hello".to_vec())
            .await
            .unwrap();
        let received = rx.recv().await.unwrap();
        assert_eq!(received, b"hello".to_vec());
    }

    #[tokio::test]
    async fn remove_from_list_drops_only_matching_entry() {
        let store = SledStore::open_temporary().unwrap();
        store
            .push_to_list("topic", b"a".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .push_to_list("topic", b"b".to_vec(), Duration::from_secs(60))
            .await
            .unwrap();
        store.remove_from_list("topic", b"a").await.unwrap();
        let values = store.range_list("topic").await.unwrap();
        assert_eq!(values, vec![b"b".to_vec()]);
    }
}

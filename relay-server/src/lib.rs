//! Content-blind relay broker
//!
//! A WebSocket relay that routes opaque, content-blind messages between
//! peers by topic. Peers never share payload semantics with the server:
//! topics, subscription ids and socket ids are all random hex identifiers,
//! and payloads are retained keyed only by their content hash.
//!
//! # Architecture
//!
//! - [`ids`] — the `Topic` / `SocketId` / `SubscriptionId` newtypes and
//!   content hashing.
//! - [`store`] — [`SharedStore`], the durable-plus-pubsub abstraction every
//!   other component is built on; [`SledStore`] is the bundled "cluster of
//!   one" implementation.
//! - [`subscription`] — [`SubscriptionRegistry`], the topic/socket index.
//! - [`broker`] — [`MessageBroker`], retention, fan-out and the ack
//!   protocol.
//! - [`history`] — [`History`], per-topic JSON-RPC request/response
//!   reconciliation.
//! - [`connection`] — the WebSocket session layer and wire dispatch.
//! - [`config`] / [`builder`] — configuration and assembly.
//! - [`metrics`] — OpenTelemetry instrumentation.
//!
//! # Example
//!
//! ```rust,no_run
//! use relay_server::{RelayConfig, RelayServer};
//!
//! # async fn example() -> relay_core::Result<()> {
//! let server = RelayServer::builder(RelayConfig::default()).build().await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

mod broker;
mod builder;
mod config;
mod connection;
mod history;
mod ids;
mod metrics;
mod store;
mod subscription;

pub use broker::{MessageBroker, MessageId, Outbound};
pub use builder::ServerBuilder;
pub use config::RelayConfig;
pub use connection::{Connection, ConnectionRegistry, SessionContext};
pub use history::{History, HistoryEvent, HistoryRecord, HistoryRequest, HistoryResponse};
pub use ids::{message_hash, SocketId, SubscriptionId, Topic};
pub use metrics::ServerMetrics;
pub use store::{SharedStore, SledStore};
pub use subscription::{SubscriptionNotice, SubscriptionRegistry};

use connection::handle_connection;
use relay_core::{Error, Result};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{mpsc, Mutex};

/// A bound, runnable relay server.
///
/// Construct one via [`RelayServer::builder`]. Accepting connections and
/// running the liveness beat both happen inside [`RelayServer::run`].
pub struct RelayServer {
    listener: TcpListener,
    ctx: SessionContext,
    history: History,
    history_events: Mutex<Option<mpsc::UnboundedReceiver<HistoryEvent>>>,
    local_addr: SocketAddr,
    beat_interval: Duration,
    metrics: Arc<ServerMetrics>,
}

impl RelayServer {
    /// Start building a server from `config`.
    pub fn builder(config: RelayConfig) -> ServerBuilder {
        ServerBuilder::new(config)
    }

    /// The address the listener actually bound to (useful when the
    /// configured port is `0`).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The per-topic history component, for embedders that want to
    /// inspect or query request/response reconciliation state directly.
    pub fn history(&self) -> &History {
        &self.history
    }

    /// Take the receiving half of the history's mutation event channel.
    /// Returns `None` if already taken.
    pub async fn take_history_events(&self) -> Option<mpsc::UnboundedReceiver<HistoryEvent>> {
        self.history_events.lock().await.take()
    }

    /// Server metrics, for embedders that export them on their own schedule.
    pub fn metrics(&self) -> &Arc<ServerMetrics> {
        &self.metrics
    }

    /// Current number of live connections.
    pub async fn connection_count(&self) -> usize {
        self.ctx.registry.len().await
    }

    /// Accept connections and run the liveness beat until the listener
    /// errors. Each connection is handled on its own task.
    pub async fn run(self) -> Result<()> {
        let beat_registry = self.ctx.registry.clone();
        let beat_interval = self.beat_interval;
        tokio::spawn(async move {
            beat_registry.run_beat(beat_interval).await;
        });

        loop {
            let (stream, peer) = self
                .listener
                .accept()
                .await
                .map_err(|e| Error::Io(e.to_string()))?;
            let ctx = self.ctx.clone();
            let metrics = self.metrics.clone();
            tokio::spawn(async move {
                metrics.record_connection(1);
                if let Err(e) = handle_connection(stream, ctx).await {
                    tracing::warn!(peer = %peer, error = %e, "connection ended with error");
                }
                metrics.record_disconnection(0);
            });
        }
    }
}

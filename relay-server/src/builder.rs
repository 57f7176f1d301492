//! Server builder for constructing a [`RelayServer`]
//!
//! The builder wires together the shared store, subscription registry,
//! message broker, history, and connection registry from a [`RelayConfig`],
//! then binds the listener. Observability can be layered on top with
//! [`ServerBuilder::with_observability`].
//!
//! # Examples
//!
//! ```rust,no_run
//! use relay_server::{RelayConfig, RelayServer};
//!
//! # async fn example() -> relay_core::Result<()> {
//! let config = RelayConfig::from_env();
//! let server = RelayServer::builder(config).build().await?;
//! server.run().await?;
//! # Ok(())
//! # }
//! ```

use crate::broker::MessageBroker;
use crate::config::RelayConfig;
use crate::connection::{ConnectionRegistry, SessionContext};
use crate::history::History;
use crate::metrics::ServerMetrics;
use crate::store::{SharedStore, SledStore};
use crate::subscription::SubscriptionRegistry;
use crate::RelayServer;
use relay_core::{Error, Result};
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;

/// Builder for constructing a [`RelayServer`] from a [`RelayConfig`].
pub struct ServerBuilder {
    config: RelayConfig,
    observability_config: Option<relay_core::ObservabilityConfig>,
    service_name: Option<String>,
    store_override: Option<Arc<dyn SharedStore>>,
}

impl ServerBuilder {
    /// Start building a server from `config`.
    pub fn new(config: RelayConfig) -> Self {
        Self {
            config,
            observability_config: None,
            service_name: None,
            store_override: None,
        }
    }

    /// Use an already-open shared store instead of opening one from
    /// `config.store_path`. Lets several relay nodes in one process share a
    /// single [`SharedStore`], which is how multi-node fan-out is exercised
    /// in-process without a networked store backend.
    pub fn with_store(mut self, store: Arc<dyn SharedStore>) -> Self {
        self.store_override = Some(store);
        self
    }

    /// Enable OpenTelemetry observability with custom configuration.
    pub fn with_observability(mut self, config: relay_core::ObservabilityConfig) -> Self {
        self.observability_config = Some(config);
        self
    }

    /// Enable OpenTelemetry observability with default configuration.
    pub fn with_default_observability(mut self) -> Self {
        self.observability_config = Some(relay_core::ObservabilityConfig::default());
        self
    }

    /// Override the service name used for observability and metrics.
    pub fn service_name(mut self, name: impl Into<String>) -> Self {
        self.service_name = Some(name.into());
        self
    }

    /// Bind the listener and assemble every component.
    pub async fn build(self) -> Result<RelayServer> {
        let listener = TcpListener::bind(self.config.bind_addr)
            .await
            .map_err(|e| Error::Io(e.to_string()))?;
        let local_addr = listener.local_addr().map_err(|e| Error::Io(e.to_string()))?;

        let store: Arc<dyn SharedStore> = match self.store_override {
            Some(store) => store,
            None => match &self.config.store_path {
                Some(path) => Arc::new(SledStore::open(path)?),
                None => Arc::new(SledStore::open_temporary()?),
            },
        };

        let subs = SubscriptionRegistry::new(store.clone());
        let registry = ConnectionRegistry::new();
        let broker = MessageBroker::with_retry_config(
            store.clone(),
            subs.clone(),
            Arc::new(registry.clone()),
            self.config.ack_retry_attempts,
            self.config.ack_retry_base_delay,
        );

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let history = History::new(store.clone(), events_tx);

        let service_name = self.service_name.unwrap_or_else(|| "relay".to_string());
        if let Some(mut obs_config) = self.observability_config {
            obs_config.service_name = service_name.clone();
            relay_core::init_observability(obs_config)
                .map_err(|e| Error::Internal(format!("failed to initialize observability: {e}")))?;
        }
        let metrics = Arc::new(ServerMetrics::new(service_name));

        tracing::info!(addr = %local_addr, "relay server built");

        Ok(RelayServer {
            listener,
            ctx: SessionContext {
                subs,
                broker,
                registry,
                max_frame_bytes: self.config.max_frame_bytes,
                outbound_queue_capacity: self.config.outbound_queue_capacity,
            },
            history,
            history_events: tokio::sync::Mutex::new(Some(events_rx)),
            local_addr,
            beat_interval: self.config.beat_interval,
            metrics,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RelayConfig {
        let mut config = RelayConfig::default();
        config.bind_addr = "127.0.0.1:0".parse().unwrap();
        config
    }

    #[tokio::test]
    async fn build_binds_an_ephemeral_port() {
        let server = ServerBuilder::new(test_config()).build().await.unwrap();
        assert_ne!(server.local_addr().port(), 0);
    }

    #[tokio::test]
    async fn build_exposes_history_event_receiver_once() {
        let server = ServerBuilder::new(test_config()).build().await.unwrap();
        assert!(server.take_history_events().await.is_some());
        assert!(server.take_history_events().await.is_none());
    }

    #[tokio::test]
    async fn service_name_is_applied_to_metrics_without_panicking() {
        let server = ServerBuilder::new(test_config())
            .service_name("custom-relay")
            .build()
            .await
            .unwrap();
        server.metrics().record_connection(1);
    }
}

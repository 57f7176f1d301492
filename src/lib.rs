//! relay - a content-blind WalletConnect-style relay broker
//!
//! This is the convenience crate that re-exports the relay sub-crates and
//! wires them into a runnable binary.
//!
//! # Architecture
//!
//! - **relay-core**: JSON-RPC 2.0 types, codec, error handling, observability
//! - **relay-server**: WebSocket session layer, subscription registry,
//!   message broker, and JSON-RPC history, backed by a pluggable shared store
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use relay_server::{RelayServer, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let config = RelayConfig::from_env();
//!     let server = RelayServer::builder(config).build().await?;
//!     server.run().await?;
//!     Ok(())
//! }
//! ```

pub use relay_core as core;
pub use relay_server as server;

pub use relay_server::RelayServer;

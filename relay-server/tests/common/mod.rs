//! Shared helpers for crate-level integration tests.
//!
//! Spins up real `RelayServer`s bound to ephemeral ports and drives them
//! with genuine `tokio-tungstenite` WebSocket clients — no mocked transport.

#![allow(dead_code)]

use futures::{SinkExt, StreamExt};
use relay_core::{Id, JsonRpcRequest};
use relay_server::{RelayConfig, RelayServer, SharedStore};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream};

pub type Client = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Configuration for a throwaway server: ephemeral port, fast beat, fresh
/// temporary store.
pub fn ephemeral_config() -> RelayConfig {
    let mut config = RelayConfig::default();
    config.bind_addr = "127.0.0.1:0".parse().unwrap();
    config.beat_interval = Duration::from_millis(200);
    config
}

/// Build and run a server, returning the address it bound to.
pub async fn spawn_server(config: RelayConfig) -> SocketAddr {
    let server = RelayServer::builder(config).build().await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

/// Build and run a server over a pre-opened shared store — the way two
/// relay nodes share a store in-process in these tests.
pub async fn spawn_server_with_store(config: RelayConfig, store: Arc<dyn SharedStore>) -> SocketAddr {
    let server = RelayServer::builder(config).with_store(store).build().await.unwrap();
    let addr = server.local_addr();
    tokio::spawn(async move {
        let _ = server.run().await;
    });
    tokio::time::sleep(Duration::from_millis(50)).await;
    addr
}

/// Open a WebSocket connection to `addr`.
pub async fn connect(addr: SocketAddr) -> Client {
    let (ws, _) = tokio_tungstenite::connect_async(format!("ws://{addr}")).await.unwrap();
    ws
}

/// Send a JSON-RPC request and wait for the matching response, decoded as JSON.
pub async fn rpc(ws: &mut Client, method: &str, params: serde_json::Value, id: i64) -> serde_json::Value {
    let request = JsonRpcRequest::new(method, Some(params), Id::Number(id));
    let text = serde_json::to_string(&request).unwrap();
    ws.send(Message::Text(text)).await.unwrap();
    let msg = ws.next().await.unwrap().unwrap();
    serde_json::from_str(&msg.into_text().unwrap()).unwrap()
}

/// Wait for the next text frame, decoded as JSON (for server-initiated
/// `relay_subscription` notifications).
pub async fn next_frame(ws: &mut Client) -> serde_json::Value {
    let msg = ws.next().await.unwrap().unwrap();
    serde_json::from_str(&msg.into_text().unwrap()).unwrap()
}

/// Wait up to `timeout` for the next text frame; `None` on timeout.
pub async fn next_frame_timeout(ws: &mut Client, timeout: Duration) -> Option<serde_json::Value> {
    tokio::time::timeout(timeout, next_frame(ws)).await.ok()
}

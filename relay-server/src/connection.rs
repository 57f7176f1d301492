//! WebSocket socket session layer (C4)
//!
//! Each connection spawns two tasks: a send task owning the WebSocket
//! sink and a recv task owning the WebSocket stream. This decouples slow
//! sends from incoming frame processing. A connection also carries a
//! liveness flag flipped by the central beat task and by inbound pongs.
//!
//! # Dispatch
//!
//! `relay_publish` → [`MessageBroker::publish`]; `relay_subscribe` →
//! [`SubscriptionRegistry::subscribe`] + [`MessageBroker::on_new_subscriber`];
//! `relay_unsubscribe` → [`SubscriptionRegistry::unsubscribe`]; `relay_ack` →
//! [`MessageBroker::acknowledge`]; anything else is a JSON-RPC method-not-found
//! response. The socket stays open for every protocol-level failure; only
//! capacity violations (oversize frame, queue overflow) and send failures
//! close it.

use crate::broker::{MessageBroker, Outbound};
use crate::ids::{SocketId, SubscriptionId, Topic};
use crate::subscription::SubscriptionRegistry;
use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use relay_core::{codec, Error, Id, JsonRpcErrorData, JsonRpcMessage, JsonRpcRequest, JsonRpcResponse, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, Mutex};
use tokio_tungstenite::accept_async;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::{CloseFrame, Message};

/// Shared dependencies every connection dispatches into.
#[derive(Clone)]
pub struct SessionContext {
    pub subs: SubscriptionRegistry,
    pub broker: MessageBroker,
    pub registry: ConnectionRegistry,
    pub max_frame_bytes: usize,
    pub outbound_queue_capacity: usize,
}

/// Handle for a single live WebSocket connection, held by [`ConnectionRegistry`].
#[derive(Clone)]
pub struct Connection {
    pub id: SocketId,
    tx: mpsc::Sender<Message>,
    close_tx: mpsc::UnboundedSender<(u16, String)>,
    is_alive: Arc<AtomicBool>,
}

impl Connection {
    /// Enqueue a pre-encoded frame, closing the socket with 1013 if its
    /// outbound queue is already full.
    fn try_send(&self, frame: Vec<u8>) -> Result<()> {
        match self.tx.try_send(Message::Text(String::from_utf8_lossy(&frame).into_owned())) {
            Ok(()) => Ok(()),
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.request_close(1013, "outbound queue overflow");
                Err(Error::ConnectionClosed)
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Err(Error::ConnectionClosed),
        }
    }

    fn request_close(&self, code: u16, reason: &str) {
        let _ = self.close_tx.send((code, reason.to_string()));
    }

    fn mark_alive(&self) {
        self.is_alive.store(true, Ordering::Relaxed);
    }
}

/// Registry of live connections, doubling as the [`Outbound`] the broker
/// delivers through.
#[derive(Clone)]
pub struct ConnectionRegistry {
    inner: Arc<Mutex<HashMap<SocketId, Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    async fn insert(&self, conn: Connection) {
        self.inner.lock().await.insert(conn.id.clone(), conn);
    }

    async fn remove(&self, socket_id: &SocketId) {
        self.inner.lock().await.remove(socket_id);
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.len()
    }

    /// Run the central liveness beat: every socket not yet ponged since the
    /// last beat is terminated, everything else is pinged and flipped to
    /// "awaiting pong" for the next tick.
    pub async fn run_beat(&self, interval: Duration) {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let conns: Vec<Connection> = self.inner.lock().await.values().cloned().collect();
            for conn in conns {
                if conn.is_alive.swap(false, Ordering::Relaxed) {
                    let _ = conn.tx.try_send(Message::Ping(Vec::new()));
                } else {
                    tracing::info!(socket = %conn.id, "missed beat, terminating");
                    conn.request_close(1001, "missed liveness beat");
                }
            }
        }
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Outbound for ConnectionRegistry {
    async fn send(&self, socket_id: &SocketId, frame: Vec<u8>) -> Result<()> {
        let conn = {
            let conns = self.inner.lock().await;
            conns.get(socket_id).cloned()
        };
        match conn {
            Some(conn) => conn.try_send(frame),
            None => Err(Error::ConnectionClosed),
        }
    }

    async fn close(&self, socket_id: &SocketId, code: u16, reason: &str) {
        let conn = {
            let conns = self.inner.lock().await;
            conns.get(socket_id).cloned()
        };
        if let Some(conn) = conn {
            conn.request_close(code, reason);
        }
    }
}

/// Accept and drive one WebSocket connection to completion.
#[tracing::instrument(skip(stream, ctx))]
pub async fn handle_connection(stream: TcpStream, ctx: SessionContext) -> Result<()> {
    let ws_stream = accept_async(stream)
        .await
        .map_err(|e| Error::WebSocket(e.to_string()))?;
    let (mut ws_sender, mut ws_receiver) = ws_stream.split();

    let socket_id = SocketId::generate();
    let (tx, mut rx) = mpsc::channel::<Message>(ctx.outbound_queue_capacity);
    let (close_tx, mut close_rx) = mpsc::unbounded_channel::<(u16, String)>();
    let is_alive = Arc::new(AtomicBool::new(true));

    let conn = Connection {
        id: socket_id.clone(),
        tx: tx.clone(),
        close_tx,
        is_alive,
    };
    ctx.registry.insert(conn.clone()).await;
    tracing::info!(socket = %socket_id, "connection accepted");

    let mut send_task = tokio::spawn(async move {
        loop {
            tokio::select! {
                msg = rx.recv() => {
                    let Some(msg) = msg else { break };
                    if ws_sender.send(msg).await.is_err() {
                        break;
                    }
                }
                Some((code, reason)) = close_rx.recv() => {
                    let frame = CloseFrame {
                        code: CloseCode::from(code),
                        reason: reason.into(),
                    };
                    let _ = ws_sender.send(Message::Close(Some(frame))).await;
                    break;
                }
            }
        }
    });

    let recv_ctx = ctx.clone();
    let recv_conn = conn.clone();
    let recv_socket_id = socket_id.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(message) = ws_receiver.next().await {
            match message {
                Ok(Message::Text(text)) => {
                    if text.len() > recv_ctx.max_frame_bytes {
                        recv_conn.request_close(1009, "frame too large");
                        break;
                    }
                    handle_frame(&text, &recv_socket_id, &recv_conn, &recv_ctx).await;
                }
                Ok(Message::Binary(bytes)) => {
                    if bytes.len() > recv_ctx.max_frame_bytes {
                        recv_conn.request_close(1009, "frame too large");
                        break;
                    }
                    let text = String::from_utf8_lossy(&bytes).into_owned();
                    handle_frame(&text, &recv_socket_id, &recv_conn, &recv_ctx).await;
                }
                Ok(Message::Ping(payload)) => {
                    let _ = recv_conn.tx.try_send(Message::Pong(payload));
                }
                Ok(Message::Pong(_)) => {
                    recv_conn.mark_alive();
                }
                Ok(Message::Close(_)) => {
                    tracing::debug!(socket = %recv_socket_id, "closed by peer");
                    break;
                }
                Ok(Message::Frame(_)) => {}
                Err(e) => {
                    tracing::warn!(socket = %recv_socket_id, error = %e, "websocket error");
                    break;
                }
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => { recv_task.abort(); }
        _ = &mut recv_task => { send_task.abort(); }
    }

    ctx.registry.remove(&socket_id).await;
    ctx.subs.on_close(&socket_id).await?;
    ctx.broker.on_socket_closed(&socket_id).await?;
    tracing::info!(socket = %socket_id, "connection cleaned up");

    Ok(())
}

async fn handle_frame(text: &str, socket_id: &SocketId, conn: &Connection, ctx: &SessionContext) {
    if text.trim().is_empty() {
        let error = JsonRpcResponse::error(JsonRpcErrorData::invalid_request("empty frame"), Id::Null);
        let _ = send_response(conn, &error);
        return;
    }

    let message = match codec::decode(text) {
        Ok(m) => m,
        Err(_) => {
            let error = JsonRpcResponse::error(JsonRpcErrorData::parse_error(), Id::Null);
            let _ = send_response(conn, &error);
            return;
        }
    };

    match message {
        JsonRpcMessage::Request(request) => {
            let response = dispatch(request, socket_id, ctx).await;
            let _ = send_response(conn, &response);
        }
        JsonRpcMessage::Notification(_) | JsonRpcMessage::Response(_) | JsonRpcMessage::Batch(_) => {
            let error = JsonRpcResponse::error(
                JsonRpcErrorData::invalid_request("expected a single JSON-RPC request"),
                Id::Null,
            );
            let _ = send_response(conn, &error);
        }
    }
}

fn send_response(conn: &Connection, response: &JsonRpcResponse) -> Result<()> {
    let text = codec::encode_response(response)?;
    conn.try_send(text.into_bytes())
}

#[derive(Deserialize)]
struct PublishParams {
    topic: String,
    message: String,
    ttl: u64,
}

#[derive(Deserialize)]
struct SubscribeParams {
    topic: String,
}

#[derive(Deserialize)]
struct UnsubscribeParams {
    topic: String,
    id: String,
}

#[derive(Deserialize)]
struct AckParams {
    topic: String,
    #[serde(rename = "messageHash")]
    message_hash: String,
}

async fn dispatch(request: JsonRpcRequest, socket_id: &SocketId, ctx: &SessionContext) -> JsonRpcResponse {
    let id = request.id.clone();
    let span = tracing::info_span!("dispatch", socket = %socket_id, method = %request.method);
    let _enter = span.enter();

    match request.method.as_str() {
        "relay_publish" => {
            let params: PublishParams = match parse_params(request.params) {
                Ok(p) => p,
                Err(e) => return e.into_response(id),
            };
            let topic = Topic::from(params.topic);
            match ctx
                .broker
                .publish(Some(socket_id), &topic, params.message, Duration::from_secs(params.ttl))
                .await
            {
                Ok(_hash) => JsonRpcResponse::success(serde_json::json!(true), id),
                Err(e) => JsonRpcResponse::error(JsonRpcErrorData::internal_error(e.to_string()), id),
            }
        }
        "relay_subscribe" => {
            let params: SubscribeParams = match parse_params(request.params) {
                Ok(p) => p,
                Err(e) => return e.into_response(id),
            };
            let topic = Topic::from(params.topic);
            match ctx.subs.subscribe(socket_id, &topic).await {
                Ok(sub_id) => {
                    if let Err(e) = ctx.broker.on_new_subscriber(socket_id, &topic).await {
                        tracing::warn!(error = %e, "failed replaying retained messages to new subscriber");
                    }
                    JsonRpcResponse::success(serde_json::json!(sub_id.to_string()), id)
                }
                Err(e) => JsonRpcResponse::error(JsonRpcErrorData::internal_error(e.to_string()), id),
            }
        }
        "relay_unsubscribe" => {
            let params: UnsubscribeParams = match parse_params(request.params) {
                Ok(p) => p,
                Err(e) => return e.into_response(id),
            };
            let sub_id = SubscriptionId::from(params.id);
            match ctx.subs.unsubscribe(socket_id, &sub_id).await {
                Ok(()) => JsonRpcResponse::success(serde_json::json!(true), id),
                Err(e) => JsonRpcResponse::error(JsonRpcErrorData::internal_error(e.to_string()), id),
            }
        }
        "relay_ack" => {
            let params: AckParams = match parse_params(request.params) {
                Ok(p) => p,
                Err(e) => return e.into_response(id),
            };
            let topic = Topic::from(params.topic);
            match ctx.broker.acknowledge(socket_id, &topic, &params.message_hash).await {
                Ok(()) => JsonRpcResponse::success(serde_json::json!(true), id),
                Err(e) => JsonRpcResponse::error(JsonRpcErrorData::internal_error(e.to_string()), id),
            }
        }
        other => JsonRpcResponse::error(JsonRpcErrorData::method_not_found(other), id),
    }
}

struct ParamError(JsonRpcErrorData);

impl ParamError {
    fn into_response(self, id: Id) -> JsonRpcResponse {
        JsonRpcResponse::error(self.0, id)
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<serde_json::Value>) -> std::result::Result<T, ParamError> {
    let Some(params) = params else {
        return Err(ParamError(JsonRpcErrorData::invalid_params("missing params")));
    };
    serde_json::from_value(params).map_err(|e| ParamError(JsonRpcErrorData::invalid_params(e.to_string())))
}

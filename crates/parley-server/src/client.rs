use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use axum::extract::ws::{Message as WsMessage, WebSocket};
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use parley_core::ids::ConversationId;

use crate::error::DeliveryError;
use crate::groups::{ConnectionGroups, EventSink, Subscriber};

/// Subscriber backed by a websocket writer task. Frames queue on a bounded
/// channel; a full queue makes `send` wait, which the registry bounds.
pub struct WsSink {
    tx: mpsc::Sender<String>,
}

impl WsSink {
    pub fn new(max_send_queue: usize) -> (Self, mpsc::Receiver<String>) {
        let (tx, rx) = mpsc::channel(max_send_queue);
        (Self { tx }, rx)
    }
}

#[async_trait]
impl EventSink for WsSink {
    async fn send(&self, frame: &str) -> Result<(), DeliveryError> {
        self.tx
            .send(frame.to_string())
            .await
            .map_err(|_| DeliveryError::Closed)
    }
}

/// Serve one websocket watching `conversation_id` until either side closes.
pub async fn handle_ws_connection(
    socket: WebSocket,
    conversation_id: ConversationId,
    groups: Arc<ConnectionGroups>,
    max_send_queue: usize,
    heartbeat_interval: Duration,
) {
    let (sink, mut rx) = WsSink::new(max_send_queue);
    let subscriber: Subscriber = Arc::new(sink);
    groups.subscribe(&conversation_id, Arc::clone(&subscriber));
    tracing::info!(conversation_id = %conversation_id, "websocket subscriber connected");

    let (mut ws_tx, mut ws_rx) = socket.split();

    // Writer: queued frames plus periodic pings
    let writer_cid = conversation_id.clone();
    let mut writer = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(heartbeat_interval);
        ping_interval.tick().await;

        loop {
            tokio::select! {
                msg = rx.recv() => {
                    match msg {
                        Some(text) => {
                            if ws_tx.send(WsMessage::Text(text.into())).await.is_err() {
                                break;
                            }
                        }
                        None => break,
                    }
                }
                _ = ping_interval.tick() => {
                    if ws_tx.send(WsMessage::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                    tracing::trace!(conversation_id = %writer_cid, "sent ping");
                }
            }
        }
    });

    // Reader: clients only listen; inbound frames are drained until close
    let reader_cid = conversation_id.clone();
    let mut reader = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_rx.next().await {
            match msg {
                WsMessage::Close(_) => break,
                WsMessage::Text(text) => {
                    tracing::debug!(conversation_id = %reader_cid, len = text.len(), "ignoring client frame");
                }
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut writer => reader.abort(),
        _ = &mut reader => writer.abort(),
    }

    groups.unsubscribe(&conversation_id, &subscriber);
    tracing::info!(conversation_id = %conversation_id, "websocket subscriber disconnected");
}

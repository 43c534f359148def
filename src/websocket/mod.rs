//! WebSocket server for real-time escrow updates
//!
//! `WsState` is the ledger's event sink: every published `EscrowEvent` goes out
//! on a broadcast channel and each connected client receives the events for
//! the payments it subscribed to (all events when it has no subscriptions).

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tokio::sync::{broadcast, mpsc, RwLock};
use uuid::Uuid;

use crate::escrow::{EscrowEvent, EventSink};

/// WebSocket server state
#[derive(Clone)]
pub struct WsState {
    /// Broadcast channel for escrow events
    pub tx: broadcast::Sender<EscrowEvent>,
    /// Connected clients registry
    pub clients: Arc<RwLock<HashMap<Uuid, ClientInfo>>>,
}

/// Client connection information
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub subscribed_payments: HashSet<Uuid>,
}

impl ClientInfo {
    fn wants(&self, event: &EscrowEvent) -> bool {
        self.subscribed_payments.is_empty()
            || self.subscribed_payments.contains(&event.payment_id())
    }
}

/// Client message types
#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
enum ClientMessage {
    Subscribe { payment_ids: Vec<Uuid> },
    Unsubscribe { payment_ids: Vec<Uuid> },
    Ping,
}

/// Server message types
#[derive(Debug, Serialize)]
#[serde(tag = "type")]
enum ServerMessage {
    Event { event: EscrowEvent },
    Subscribed { payment_ids: Vec<Uuid> },
    Unsubscribed { payment_ids: Vec<Uuid> },
    Pong,
}

impl Default for WsState {
    fn default() -> Self {
        Self::new()
    }
}

impl WsState {
    /// Create new WebSocket state
    pub fn new() -> Self {
        let (tx, _rx) = broadcast::channel(256);
        Self {
            tx,
            clients: Arc::new(RwLock::new(HashMap::new())),
        }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<EscrowEvent> {
        self.tx.subscribe()
    }

    async fn register_client(&self, client_id: Uuid) {
        let mut clients = self.clients.write().await;
        clients.insert(client_id, ClientInfo::default());
        tracing::info!(client_id = %client_id, "WebSocket client connected");
    }

    async fn unregister_client(&self, client_id: Uuid) {
        let mut clients = self.clients.write().await;
        clients.remove(&client_id);
        tracing::info!(client_id = %client_id, "WebSocket client disconnected");
    }

    async fn subscribe_client(&self, client_id: Uuid, payment_ids: &[Uuid]) {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get_mut(&client_id) {
            client.subscribed_payments.extend(payment_ids.iter().copied());
        }
    }

    async fn unsubscribe_client(&self, client_id: Uuid, payment_ids: &[Uuid]) {
        let mut clients = self.clients.write().await;
        if let Some(client) = clients.get_mut(&client_id) {
            for id in payment_ids {
                client.subscribed_payments.remove(id);
            }
        }
    }
}

impl EventSink for WsState {
    fn publish(&self, event: EscrowEvent) {
        // no receivers is the normal state when nobody is connected
        if self.tx.send(event).is_err() {
            tracing::trace!("Escrow event published with no listeners");
        }
    }
}

/// WebSocket handler - upgrades HTTP connection to WebSocket
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> Response {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle WebSocket connection
async fn handle_socket(socket: WebSocket, state: WsState) {
    let client_id = Uuid::new_v4();
    state.register_client(client_id).await;

    let (mut sender, mut receiver) = socket.split();

    // Internal channel for sending messages from recv_task to sender
    let (internal_tx, mut internal_rx) = mpsc::channel::<ServerMessage>(32);

    let mut rx = state.tx.subscribe();
    let state_send = state.clone();

    let mut send_task = tokio::spawn(async move {
        loop {
            let msg = tokio::select! {
                received = rx.recv() => match received {
                    Ok(event) => {
                        let clients = state_send.clients.read().await;
                        match clients.get(&client_id) {
                            Some(client) if client.wants(&event) => ServerMessage::Event { event },
                            _ => continue,
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(client_id = %client_id, skipped, "WebSocket client lagging");
                        continue;
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                },
                Some(msg) = internal_rx.recv() => msg,
                else => break,
            };

            if let Ok(text) = serde_json::to_string(&msg) {
                if sender.send(Message::Text(text)).await.is_err() {
                    break;
                }
            }
        }
    });

    let state_recv = state.clone();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => {
                    let Ok(client_msg) = serde_json::from_str::<ClientMessage>(&text) else {
                        tracing::debug!(client_id = %client_id, "Unreadable WebSocket message");
                        continue;
                    };

                    let response = match client_msg {
                        ClientMessage::Subscribe { payment_ids } => {
                            state_recv.subscribe_client(client_id, &payment_ids).await;
                            ServerMessage::Subscribed { payment_ids }
                        }
                        ClientMessage::Unsubscribe { payment_ids } => {
                            state_recv.unsubscribe_client(client_id, &payment_ids).await;
                            ServerMessage::Unsubscribed { payment_ids }
                        }
                        ClientMessage::Ping => ServerMessage::Pong,
                    };
                    let _ = internal_tx.send(response).await;
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    // Wait for either task to finish
    tokio::select! {
        _ = (&mut send_task) => recv_task.abort(),
        _ = (&mut recv_task) => send_task.abort(),
    }

    state.unregister_client(client_id).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_published_events_reach_subscribers() {
        let state = WsState::new();
        let mut rx = state.subscribe();
        let payment_id = Uuid::new_v4();

        state.publish(EscrowEvent::PaymentEscrowed { payment_id });

        assert_eq!(
            rx.recv().await.unwrap(),
            EscrowEvent::PaymentEscrowed { payment_id }
        );
    }

    #[test]
    fn test_publish_without_listeners_does_not_panic() {
        let state = WsState::new();
        state.publish(EscrowEvent::PaymentRefunded {
            payment_id: Uuid::new_v4(),
        });
    }

    #[test]
    fn test_subscription_filter() {
        let watched = Uuid::new_v4();
        let mut client = ClientInfo::default();
        let other = EscrowEvent::PaymentEscrowed {
            payment_id: Uuid::new_v4(),
        };
        assert!(client.wants(&other));

        client.subscribed_payments.insert(watched);
        assert!(!client.wants(&other));
        assert!(client.wants(&EscrowEvent::PaymentEscrowed {
            payment_id: watched
        }));
    }
}

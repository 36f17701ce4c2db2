//! WebSocket connection management.
//!
//! One UI message queue is drained by a forwarder task and multiplexed to
//! open connections filtered by session id. Opening a new connection for
//! a session closes that session's prior connections. Clients only ever
//! see `question` and `answer` events; pipeline errors stay internal.

use crate::pipeline::messages::UiMessage;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Per-connection outbox.
type Outbox = mpsc::UnboundedSender<Message>;

/// Tracks open connections by session id.
#[derive(Default)]
pub struct ConnectionManager {
    sessions: Mutex<HashMap<String, Vec<(String, Outbox)>>>,
}

impl ConnectionManager {
    /// Create an empty manager.
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Register a connection, closing any prior connections of the same
    /// session. Returns the connection id used for unregistration.
    pub fn register(&self, session_id: &str, outbox: Outbox) -> String {
        let conn_id = uuid::Uuid::new_v4().to_string();
        let Ok(mut sessions) = self.sessions.lock() else {
            return conn_id;
        };
        if let Some(old) = sessions.insert(
            session_id.to_owned(),
            vec![(conn_id.clone(), outbox)],
        ) && !old.is_empty()
        {
            info!(
                "closing {} prior connection(s) for session {session_id}",
                old.len()
            );
            for (_, sender) in old {
                // A close frame followed by the dropped sender ends the
                // connection task.
                let _ = sender.send(Message::Close(None));
            }
        }
        conn_id
    }

    /// Remove one connection.
    pub fn unregister(&self, session_id: &str, conn_id: &str) {
        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        if let Some(connections) = sessions.get_mut(session_id) {
            connections.retain(|(id, _)| id != conn_id);
            if connections.is_empty() {
                sessions.remove(session_id);
            }
        }
    }

    /// Send a UI message to every connection of its session.
    pub fn send_to_session(&self, message: &UiMessage) {
        let payload = match serde_json::to_string(message) {
            Ok(payload) => payload,
            Err(e) => {
                warn!("UI message serialization failed: {e}");
                return;
            }
        };
        let Ok(mut sessions) = self.sessions.lock() else {
            return;
        };
        if let Some(connections) = sessions.get_mut(message.session_id()) {
            connections
                .retain(|(_, sender)| sender.send(Message::Text(payload.clone().into())).is_ok());
        }
    }

    /// Number of open connections across all sessions.
    pub fn connection_count(&self) -> usize {
        match self.sessions.lock() {
            Ok(sessions) => sessions.values().map(Vec::len).sum(),
            Err(_) => 0,
        }
    }
}

/// Drain the UI message queue into the connection manager until cancelled.
pub async fn run_ui_forwarder(
    mut rx: mpsc::UnboundedReceiver<UiMessage>,
    manager: Arc<ConnectionManager>,
    cancel: CancellationToken,
) {
    loop {
        tokio::select! {
            () = cancel.cancelled() => break,
            message = rx.recv() => {
                let Some(message) = message else { break };
                manager.send_to_session(&message);
            }
        }
    }
    debug!("UI forwarder stopped");
}

/// Drive one accepted WebSocket until it closes or is replaced.
pub async fn handle_socket(socket: WebSocket, session_id: String, manager: Arc<ConnectionManager>) {
    let (outbox_tx, mut outbox_rx) = mpsc::unbounded_channel::<Message>();
    let conn_id = manager.register(&session_id, outbox_tx);
    info!("WebSocket connected for session {session_id}");

    let (mut sink, mut stream) = socket.split();

    loop {
        tokio::select! {
            outgoing = outbox_rx.recv() => {
                match outgoing {
                    Some(message) => {
                        let closing = matches!(message, Message::Close(_));
                        if sink.send(message).await.is_err() || closing {
                            break;
                        }
                    }
                    // Outbox dropped: this connection was replaced.
                    None => {
                        let _ = sink.send(Message::Close(None)).await;
                        break;
                    }
                }
            }
            incoming = stream.next() => {
                match incoming {
                    // Inbound frames are ignored; the socket only carries
                    // server-to-client events apart from close handling.
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }

    manager.unregister(&session_id, &conn_id);
    info!("WebSocket disconnected for session {session_id}");
}

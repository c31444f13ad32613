//! WebSocket transport for progress notifications.
//!
//! Frames are JSON [`ClientMessage`]s and [`ServerMessage`]s. A connection
//! opened with `?user_id=` is subscribed right away so it receives the
//! user's job notices; otherwise registration happens on the first
//! `subscribe` message.

use axum::{
    Router,
    extract::{
        Query, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::stream::SplitSink;
use futures::{SinkExt, StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::api::server::AppState;
use crate::progress::{ClientMessage, ProgressTracker, ServerMessage};

#[derive(Debug, Deserialize)]
pub struct WsParams {
    pub user_id: Option<String>,
}

pub fn router() -> Router<AppState> {
    Router::new().route("/api/ws", get(progress_ws))
}

async fn progress_ws(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    Query(params): Query<WsParams>,
) -> impl IntoResponse {
    let tracker = state.services.tracker.clone();
    let user_id = params.user_id.filter(|u| !u.trim().is_empty());
    ws.on_upgrade(move |socket| handle_socket(socket, tracker, user_id))
}

async fn send_json(
    sender: &mut SplitSink<WebSocket, Message>,
    message: &ServerMessage,
) -> bool {
    match serde_json::to_string(message) {
        Ok(text) => sender.send(Message::Text(text.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode server message");
            true
        }
    }
}

/// Per-connection state. The tracker holds the only sender once the
/// connection is registered, so removal by the tracker closes `outbound`.
struct Session {
    tracker: Arc<ProgressTracker>,
    user_id: Option<String>,
    pending_sink: Option<mpsc::Sender<ServerMessage>>,
    connection_id: Option<String>,
}

impl Session {
    async fn handle(&mut self, message: ClientMessage) -> Option<ServerMessage> {
        if let Some(id) = &self.connection_id {
            self.tracker.heartbeat(id);
        }

        match message {
            ClientMessage::Subscribe {
                job_ids,
                channels,
                user_id,
            } => {
                if let Some(id) = self.connection_id.clone() {
                    return match self.tracker.extend_subscription(&id, job_ids, channels).await {
                        Ok(()) => None,
                        Err(e) => Some(ServerMessage::error(e.to_string())),
                    };
                }
                let Some(sink) = self.pending_sink.take() else {
                    return Some(ServerMessage::error("connection is closed"));
                };
                let user_id = self.user_id.clone().or(user_id);
                let id = self.tracker.subscribe(sink, user_id, job_ids, channels).await;
                self.connection_id = Some(id);
                None
            }
            ClientMessage::Unsubscribe { job_ids, channels } => {
                if let Some(id) = &self.connection_id {
                    self.tracker.unsubscribe_topics(id, &job_ids, &channels);
                }
                None
            }
            ClientMessage::Ping => Some(ServerMessage::pong()),
            ClientMessage::Pong => None,
        }
    }
}

async fn handle_socket(socket: WebSocket, tracker: Arc<ProgressTracker>, user_id: Option<String>) {
    let (mut sender, mut receiver) = socket.split();
    let (sink, mut outbound) = mpsc::channel(tracker.config().connection_buffer.max(1));

    let mut session = Session {
        tracker: tracker.clone(),
        user_id: user_id.clone(),
        pending_sink: Some(sink),
        connection_id: None,
    };
    if let Some(user) = user_id
        && let Some(sink) = session.pending_sink.take()
    {
        let id = tracker.subscribe(sink, Some(user), Vec::new(), Vec::new()).await;
        session.connection_id = Some(id);
    }

    loop {
        tokio::select! {
            outgoing = outbound.recv() => {
                match outgoing {
                    Some(message) => {
                        if !send_json(&mut sender, &message).await {
                            break;
                        }
                    }
                    // Dropped by the tracker (stale or shut down).
                    None => break,
                }
            }

            incoming = receiver.next() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        let reply = match serde_json::from_str::<ClientMessage>(text.as_str()) {
                            Ok(message) => session.handle(message).await,
                            Err(e) => Some(ServerMessage::error(format!("invalid message: {}", e))),
                        };
                        if let Some(reply) = reply
                            && !send_json(&mut sender, &reply).await
                        {
                            break;
                        }
                    }
                    Some(Ok(Message::Pong(_))) | Some(Ok(Message::Ping(_))) => {
                        if let Some(id) = &session.connection_id {
                            tracker.heartbeat(id);
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(Message::Binary(_))) => {
                        if !send_json(&mut sender, &ServerMessage::error("binary frames are not supported")).await {
                            break;
                        }
                    }
                    Some(Err(e)) => {
                        debug!(error = %e, "WebSocket receive error");
                        break;
                    }
                }
            }
        }
    }

    if let Some(id) = session.connection_id {
        tracker.unsubscribe(&id);
    }
    let _ = sender.close().await;
}

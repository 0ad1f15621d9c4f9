// src/handlers/status_ws.rs
//! WebSocket status feed.
//!
//! Clients either bind a session at the handshake (`/ws?session=<id>`) or
//! send `{"type":"register","session_id":...}` later. Every server frame
//! carries the session id plus the event body.

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{Extension, Query};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures::{sink::SinkExt, stream::StreamExt};
use serde::Deserialize;
use std::sync::Arc;
use uuid::Uuid;

use crate::AppState;

pub fn status_routes() -> Router {
    Router::new().route("/ws", get(websocket_handler))
}

#[derive(Deserialize)]
struct StatusQuery {
    session: Option<Uuid>,
}

#[derive(Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum ClientMessage {
    Register { session_id: Uuid },
}

async fn websocket_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<StatusQuery>,
    Extension(state): Extension<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| status_socket(socket, state, params.session))
}

async fn status_socket(stream: WebSocket, state: Arc<AppState>, session_id: Option<Uuid>) {
    let (mut sender, mut receiver) = stream.split();
    let conn_id = Uuid::new_v4();

    let (frame_tx, mut frame_rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    state.registry.accept(conn_id, frame_tx, session_id).await;

    loop {
        tokio::select! {
            // Outbound status frames for this connection.
            frame = frame_rx.recv() => {
                match frame {
                    Some(frame) => {
                        if sender.send(Message::Text(frame)).await.is_err() {
                            tracing::warn!("Failed to send status frame on connection {}", conn_id);
                            break;
                        }
                    }
                    None => break,
                }
            }

            // Inbound client messages: registration and close.
            message = receiver.next() => {
                match message {
                    Some(Ok(Message::Text(text))) => {
                        match serde_json::from_str::<ClientMessage>(&text) {
                            Ok(ClientMessage::Register { session_id }) => {
                                if !state.registry.complete_registration(conn_id, session_id).await {
                                    tracing::warn!(
                                        "Connection {} sent register while already bound",
                                        conn_id
                                    );
                                }
                            }
                            Err(_) => {
                                tracing::debug!("Ignoring unrecognized client message on {}", conn_id);
                            }
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::warn!("WebSocket error on connection {}: {}", conn_id, e);
                        break;
                    }
                }
            }
        }
    }

    state.registry.disconnect(conn_id).await;
    tracing::info!("🔌 Status socket {} closed", conn_id);
}

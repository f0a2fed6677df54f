//! WebSocket handler for control channel connections.

use axum::{
    extract::{
        State, WebSocketUpgrade,
        ws::{Message, WebSocket},
    },
    response::Response,
};
use futures::{SinkExt, StreamExt};
use log::{debug, info, warn};
use std::time::Duration;

use crate::api::AppState;

/// WebSocket upgrade handler.
///
/// GET /api/ws
pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: AppState) {
    let (mut sender, mut receiver) = socket.split();
    let (session, mut outbound) = state.sessions.register();
    let session_id = session.id().to_string();

    // Single writer: every frame for this connection goes through here.
    let ping_secs = state.ws_ping_interval.as_secs().max(1);
    let writer_session = session_id.clone();
    let send_task = tokio::spawn(async move {
        let mut ping_interval = tokio::time::interval(Duration::from_secs(ping_secs));
        ping_interval.tick().await;

        loop {
            tokio::select! {
                envelope = outbound.recv() => {
                    let Some(envelope) = envelope else { break };
                    let json = match envelope.to_json() {
                        Ok(j) => j,
                        Err(e) => {
                            warn!("Failed to serialize {}: {}", envelope.kind, e);
                            continue;
                        }
                    };
                    if sender.send(Message::Text(json.into())).await.is_err() {
                        break;
                    }
                }

                _ = ping_interval.tick() => {
                    if sender.send(Message::Ping(Vec::new().into())).await.is_err() {
                        break;
                    }
                }
            }
        }
        debug!("Writer for session {} stopped", writer_session);
    });

    loop {
        let msg_result = tokio::select! {
            _ = session.evicted() => {
                warn!("Closing session {}: it fell behind on broadcasts", session_id);
                break;
            }
            msg = receiver.next() => match msg {
                Some(msg) => msg,
                None => break,
            },
        };
        match msg_result {
            Ok(Message::Text(text)) => {
                state.router.route(&session, text.as_str()).await;
            }
            Ok(Message::Binary(_)) => {
                debug!("Ignoring binary frame on session {}", session_id);
            }
            Ok(Message::Ping(_)) | Ok(Message::Pong(_)) => {}
            Ok(Message::Close(_)) => {
                info!("Session {} closed by client", session_id);
                break;
            }
            Err(e) => {
                warn!("WebSocket error on session {}: {}", session_id, e);
                break;
            }
        }
    }

    // Cancels everything the session still has running.
    state.sessions.unregister(&session);
    send_task.abort();
    info!("Control session {} ended", session_id);
}

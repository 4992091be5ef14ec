use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    http::HeaderMap,
    response::{IntoResponse, Response},
};
use serde_json::json;
use uuid::Uuid;

use crate::api::{owner_from_headers, ApiState};
use crate::notify::{ChannelConnection, JobEvent};

/// Real-time channel. Authenticated by the same owner identity the REST
/// surface uses; the server pushes job events, the client may answer
/// keep-alive pings with lightweight `pong` messages.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<ApiState>,
    headers: HeaderMap,
) -> Response {
    let owner = match owner_from_headers(&headers) {
        Ok(owner) => owner,
        Err(rejection) => return rejection.into_response(),
    };

    ws.on_upgrade(move |socket| run_socket(socket, state, owner))
}

async fn run_socket(mut socket: WebSocket, state: ApiState, owner: Uuid) {
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel::<String>();
    let conn_id = state
        .notifier
        .register(
            owner,
            Arc::new(ChannelConnection::new(tx)),
            json!({ "transport": "websocket" }),
        )
        .await;

    if socket
        .send(Message::Text(JobEvent::connected(owner).to_json()))
        .await
        .is_err()
    {
        state.notifier.remove(conn_id).await;
        return;
    }

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Some(text) => {
                        if socket.send(Message::Text(text)).await.is_err() {
                            break;
                        }
                    }
                    // Registry dropped our sender (evicted elsewhere).
                    None => break,
                }
            }
            incoming = socket.recv() => {
                match incoming {
                    Some(Ok(Message::Text(text))) => {
                        if is_pong(&text) {
                            state.notifier.touch(conn_id).await;
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        state.notifier.touch(conn_id).await;
                    }
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Ok(_)) => {}
                    Some(Err(e)) => {
                        tracing::debug!(connection = %conn_id, error = %e, "websocket read error");
                        break;
                    }
                }
            }
        }
    }

    state.notifier.remove(conn_id).await;
}

fn is_pong(text: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("type").and_then(|t| t.as_str()).map(|t| t == "pong"))
        .unwrap_or(false)
}

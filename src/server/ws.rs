/// WebSocket endpoint for live receipt updates.
///
/// A client connects to one receipt and receives its current snapshot
/// followed by every newer one it manages to observe. Slow clients skip
/// intermediate states. The socket is closed after a terminal snapshot.
///
/// Message format (server → client):
/// ```json
/// {
///   "type": "receipt",
///   "receipt": { "id": "...", "status": "anchored", "revision": 2, ... }
/// }
/// ```
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, State, WebSocketUpgrade};
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use super::{error_response, ApiError, AppState};
use crate::state::models::ReceiptSnapshot;

const KEEPALIVE: Duration = Duration::from_secs(25);

#[derive(Debug, Serialize)]
struct ReceiptMessage<'a> {
    #[serde(rename = "type")]
    msg_type: &'static str,
    receipt: &'a ReceiptSnapshot,
}

fn receipt_frame(snapshot: &ReceiptSnapshot) -> Option<Message> {
    let msg = ReceiptMessage {
        msg_type: "receipt",
        receipt: snapshot,
    };
    serde_json::to_string(&msg)
        .ok()
        .map(|text| Message::Text(text.into()))
}

/// GET /v1/receipts/{id}/ws: 404 before upgrading if the receipt is unknown.
async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
    Path(id): Path<Uuid>,
) -> Result<impl IntoResponse, ApiError> {
    let rx = state.pipeline.subscribe(id).await.map_err(error_response)?;
    Ok(ws.on_upgrade(move |socket| async move {
        stream_receipt(socket, rx).await;
        state.pipeline.notifier().release(id);
    }))
}

async fn stream_receipt(mut socket: WebSocket, mut rx: watch::Receiver<ReceiptSnapshot>) {
    let mut keepalive = tokio::time::interval(KEEPALIVE);
    keepalive.tick().await;

    loop {
        let snapshot = rx.borrow_and_update().clone();
        let Some(frame) = receipt_frame(&snapshot) else {
            break;
        };
        if socket.send(frame).await.is_err() {
            return;
        }
        if snapshot.status.is_terminal() {
            let _ = socket.send(Message::Close(None)).await;
            return;
        }

        // Wait for the next snapshot while servicing the socket.
        loop {
            tokio::select! {
                changed = rx.changed() => {
                    if changed.is_err() {
                        return;
                    }
                    break;
                }
                incoming = socket.recv() => match incoming {
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            return;
                        }
                    }
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => return,
                    Some(Ok(_)) => {}
                },
                _ = keepalive.tick() => {
                    if socket.send(Message::Ping(Vec::new().into())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
}

pub fn ws_routes() -> Router<Arc<AppState>> {
    Router::new().route("/v1/receipts/{id}/ws", get(ws_handler))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::models::tests::demo_facts;
    use crate::state::models::Receipt;

    #[test]
    fn test_receipt_frame_shape() {
        let receipt = Receipt::new(demo_facts("demo:tip:1"), Some("https://cb.example/x".into()));
        let Some(Message::Text(text)) = receipt_frame(&receipt.snapshot()) else {
            panic!("expected a text frame");
        };
        let value: serde_json::Value = serde_json::from_str(text.as_str()).unwrap();
        assert_eq!(value["type"], "receipt");
        assert_eq!(value["receipt"]["status"], "pending");
        assert_eq!(value["receipt"]["reference"], "demo:tip:1");
        assert!(value["receipt"].get("callback_url").is_none());
    }
}

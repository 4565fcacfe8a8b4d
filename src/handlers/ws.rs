//! WebSocket handler: one message router per socket, frames in, frames out.

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{Sink, SinkExt, StreamExt};
use std::fmt::Display;
use std::sync::Arc;
use tokio::sync::mpsc::UnboundedReceiver;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::error::TransportError;
use crate::handlers::http::AppState;
use crate::live::{Outbox, TransportReporter};
use crate::models::Frame;
use crate::services::MessageRouter;

pub async fn ws_handler(State(state): State<AppState>, ws: WebSocketUpgrade) -> Response {
    ws.on_upgrade(move |socket| handle_socket(state, socket))
}

async fn handle_socket(state: AppState, socket: WebSocket) {
    let socket_id = Uuid::new_v4().to_string();
    info!(socket_id = %socket_id, "ws connected");

    let (sender, mut receiver) = socket.split();
    let (tx, rx) = tokio::sync::mpsc::unbounded_channel::<Frame>();

    let error_id = socket_id.clone();
    let outbox = Outbox::new(tx).on_error(move |e| {
        debug!(socket_id = %error_id, error = %e, "outbound frame dropped");
    });
    let send_task = tokio::spawn(write_frames(sender, rx, outbox.reporter()));
    let mut router = MessageRouter::new(
        Arc::clone(&state.registry),
        Arc::clone(&state.sessions),
        Arc::clone(&state.pubsub),
        outbox,
    );

    loop {
        let next = tokio::time::timeout(state.heartbeat_timeout, receiver.next()).await;
        let msg = match next {
            Ok(Some(Ok(msg))) => msg,
            Ok(Some(Err(e))) => {
                debug!(socket_id = %socket_id, error = %e, "ws read error");
                break;
            }
            Ok(None) => break,
            Err(_) => {
                info!(socket_id = %socket_id, "heartbeat timeout");
                break;
            }
        };
        match msg {
            Message::Text(text) => router.handle_text(&text).await,
            Message::Close(_) => break,
            _ => {}
        }
    }

    router.shutdown().await;
    send_task.abort();
    info!(socket_id = %socket_id, "ws disconnected");
}

/// Serialize queued frames onto the socket. A failed write is reported and
/// the next frame is still attempted.
async fn write_frames<S>(sink: S, mut rx: UnboundedReceiver<Frame>, reporter: TransportReporter)
where
    S: Sink<Message>,
    S::Error: Display,
{
    let mut sink = std::pin::pin!(sink);
    while let Some(frame) = rx.recv().await {
        let text = match serde_json::to_string(&frame) {
            Ok(text) => text,
            Err(e) => {
                warn!(topic = %frame.topic, error = %e, "unserializable frame");
                continue;
            }
        };
        if let Err(e) = sink.send(Message::Text(text)).await {
            reporter.report(TransportError {
                topic: frame.topic,
                event: frame.event,
                reason: e.to_string(),
            });
        }
    }
}

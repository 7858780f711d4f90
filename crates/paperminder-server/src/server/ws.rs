//! WebSocket transport for device and operator sessions.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, Path, State};
use axum::response::Response;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use super::AppState;
use crate::registry::Outbound;
use crate::session::Session;

/// Outbound frames buffered per connection before sends start timing out.
const OUTBOUND_BUFFER: usize = 64;

/// `GET /ws/{identity}`
#[instrument(skip_all, fields(identity = %identity, remote = %remote))]
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    Path(identity): Path<Uuid>,
    ConnectInfo(remote): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
) -> Response {
    ws.on_upgrade(move |socket| run_session(socket, state, identity, remote))
}

async fn run_session(socket: WebSocket, state: AppState, identity: Uuid, remote: SocketAddr) {
    let (mut sink, mut stream) = socket.split();
    let (frame_tx, mut frame_rx) = mpsc::channel::<Outbound>(OUTBOUND_BUFFER);

    // The registry only ever sees `frame_tx`; this task owns the socket sink.
    // A frame is confirmed only after the sink accepted it; frames still
    // queued when the task ends are dropped unconfirmed.
    let writer = tokio::spawn(async move {
        while let Some(mut outbound) = frame_rx.recv().await {
            let text = match outbound.frame.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(error = %e, "Failed to encode outbound frame");
                    continue;
                }
            };
            if sink.send(Message::Text(text.into())).await.is_err() {
                break;
            }
            outbound.confirm();
        }
        let _ = sink.close().await;
    });

    let session = Session::open(state, identity, frame_tx, Some(remote)).await;
    info!(identity = %identity, remote = %remote, "WebSocket session opened");

    while let Some(result) = stream.next().await {
        match result {
            Ok(Message::Text(text)) => session.handle_text(text.as_str()).await,
            Ok(Message::Binary(bytes)) => session.handle_text(&String::from_utf8_lossy(&bytes)).await,
            Ok(Message::Close(_)) => break,
            Ok(Message::Ping(_) | Message::Pong(_)) => {}
            Err(e) => {
                debug!(identity = %identity, error = %e, "WebSocket read failed");
                break;
            }
        }
    }

    session.close().await;
    writer.abort();
    info!(identity = %identity, "WebSocket session closed");
}

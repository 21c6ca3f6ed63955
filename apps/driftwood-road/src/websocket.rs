use std::{net::SocketAddr, sync::Arc};

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::Response,
};
use futures_util::{SinkExt, StreamExt};
use metrics::counter;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    matchmaking::{LeaveOutcome, Outbound},
    relay, AppState,
};

pub async fn ws_handler(
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state, remote_addr))
}

fn encode(outbound: Outbound) -> Option<Message> {
    match outbound {
        Outbound::Message(message) => match serde_json::to_string(&message) {
            Ok(json) => Some(Message::Text(json)),
            Err(err) => {
                warn!(error = %err, kind = message.kind(), "failed to encode server message");
                None
            }
        },
        Outbound::Relay(raw) => Some(Message::Text(raw)),
        Outbound::Ping => Some(Message::Ping(Vec::new())),
    }
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>, remote_addr: SocketAddr) {
    let connection_id = Uuid::new_v4();
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Outbound>();

    let matchmaker = &state.matchmaker;
    let registration = matchmaker.register(connection_id, tx);
    counter!("driftwood_road_connections_total", 1);
    info!(
        connection_id = %connection_id,
        remote_addr = %remote_addr,
        "websocket connected"
    );

    let writer = tokio::spawn(async move {
        while let Some(outbound) = rx.recv().await {
            let Some(message) = encode(outbound) else {
                continue;
            };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.close().await;
        debug!(connection_id = %connection_id, "writer task finished");
    });

    loop {
        let frame = tokio::select! {
            _ = registration.terminate.notified() => {
                debug!(connection_id = %connection_id, "terminating evicted connection");
                break;
            }
            frame = ws_rx.next() => frame,
        };

        let message = match frame {
            Some(Ok(message)) => message,
            Some(Err(err)) => {
                warn!(connection_id = %connection_id, error = %err, "error receiving frame");
                break;
            }
            None => break,
        };

        match message {
            Message::Text(text) => {
                relay::handle_text(matchmaker, connection_id, &text);
            }
            Message::Binary(bytes) => {
                relay::handle_binary(matchmaker, connection_id, &bytes);
            }
            Message::Pong(_) => matchmaker.mark_alive(connection_id),
            // Axum answers pings itself; any inbound traffic proves liveness.
            Message::Ping(_) => matchmaker.mark_alive(connection_id),
            Message::Close(frame) => {
                debug!(
                    connection_id = %connection_id,
                    reason = ?frame.map(|f| f.reason.to_string()),
                    "client closed websocket"
                );
                break;
            }
        }
    }

    if let Some(LeaveOutcome::Unpaired { partner }) = matchmaker.disconnect(connection_id) {
        debug!(connection_id = %connection_id, partner = %partner, "partner notified of departure");
    }
    counter!("driftwood_road_connections_closed_total", 1);
    writer.abort();

    info!(connection_id = %connection_id, "websocket closed");
}

//! WebSocket sessions for viewers

use super::{initial_sync, RealtimeEvent};
use crate::bridge::TransportBridge;
use axum::extract::ws::{Message, WebSocket};
use axum::extract::{State, WebSocketUpgrade};
use axum::response::Response;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

pub async fn websocket_handler(
    ws: WebSocketUpgrade,
    State(bridge): State<Arc<TransportBridge>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, bridge))
}

async fn handle_socket(mut socket: WebSocket, bridge: Arc<TransportBridge>) {
    // Subscribe before reading the snapshot so no change falls between the two
    let mut events = bridge.realtime().subscribe();
    info!(
        "Viewer connected ({} total)",
        bridge.realtime().viewer_count()
    );

    for event in initial_sync(&bridge.store().current_snapshot()) {
        if let Err(e) = send_event(&mut socket, &event).await {
            debug!("Viewer went away during initial sync: {}", e);
            return;
        }
    }

    loop {
        tokio::select! {
            received = events.recv() => match received {
                Ok(event) => {
                    if let Err(e) = send_event(&mut socket, &event).await {
                        debug!("Failed to deliver {} to viewer: {}", event.name(), e);
                        break;
                    }
                }
                Err(RecvError::Lagged(skipped)) => {
                    warn!("Viewer lagging, skipped {} event(s)", skipped);
                }
                Err(RecvError::Closed) => break,
            },

            incoming = socket.recv() => match incoming {
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Text(text))) => debug!("Ignoring viewer message: {}", text),
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    debug!("Viewer socket error: {}", e);
                    break;
                }
            },
        }
    }

    info!("Viewer disconnected");
}

async fn send_event(socket: &mut WebSocket, event: &RealtimeEvent) -> Result<(), axum::Error> {
    let text = serde_json::to_string(event).map_err(axum::Error::new)?;
    socket.send(Message::Text(text)).await
}

//! Viewer WebSocket lifecycle: subscribe, forward events, answer pings.

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use tracing::{debug, error, info, warn};

use drawbridge_core::protocol::{CanvasEvent, ViewerMessage};

use crate::state::EngineState;

/// Serve one viewer connection until either side goes away.
pub async fn handle_viewer(state: Arc<EngineState>, ws: WebSocket) {
    let sub = state.handler.subscribe().await;
    let subscriber = sub.id;
    let mut rx = sub.rx;
    info!(subscriber, "Viewer connected");
    #[cfg(feature = "metrics")]
    crate::metrics::record_subscriber_connect();

    let (mut ws_tx, mut ws_rx) = ws.split();

    // Ends when the socket fails or the hub drops this subscriber.
    let mut send_task = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if ws_tx.send(Message::Text(frame.to_string().into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    loop {
        tokio::select! {
            _ = &mut send_task => {
                debug!(subscriber, "Outbound stream ended");
                break;
            }
            msg = ws_rx.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<ViewerMessage>(text.as_str()) {
                        Ok(ViewerMessage::Ping) => {
                            state.handler.hub().send_to(subscriber, &CanvasEvent::Pong);
                        }
                        Err(e) => {
                            warn!(subscriber, %e, "Ignoring unrecognised viewer frame");
                        }
                    }
                }
                Some(Ok(Message::Close(_))) | None => {
                    debug!(subscriber, "Viewer closed connection");
                    break;
                }
                Some(Err(e)) => {
                    error!(subscriber, %e, "WebSocket error");
                    break;
                }
                // Axum answers protocol-level pings itself.
                Some(Ok(_)) => {}
            }
        }
    }

    send_task.abort();
    state.handler.hub().unsubscribe(subscriber);
    #[cfg(feature = "metrics")]
    crate::metrics::record_subscriber_disconnect();
    info!(subscriber, "Viewer disconnected");
}

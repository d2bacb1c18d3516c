//! Bridges an axum WebSocket to a tbrpc connection.

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use std::sync::Arc;
use tbrpc::{ChannelTransport, ServerRouter};
use tokio::sync::mpsc;
use tracing::{debug, warn};

/// Serve one client socket until either side closes it.
///
/// Text frames are handed to the connection; binary frames are ignored.
/// Returning means the connection has been closed and unregistered.
pub async fn serve_socket(router: ServerRouter, socket: WebSocket) {
    let (mut ws_sink, mut ws_stream) = socket.split();

    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
    let transport = Arc::new(
        ChannelTransport::new(outgoing_tx).with_diagnostics(router.options().diagnostics.clone()),
    );
    let connection = router.accept(transport.clone());
    let id = connection.id();
    debug!("Client {} connected ({} total)", id, router.connection_count());

    // Drains frames queued by the transport; ends once the transport closes.
    let send_task = tokio::spawn(async move {
        while let Some(text) = outgoing_rx.recv().await {
            if ws_sink.send(Message::Text(text)).await.is_err() {
                debug!("WebSocket send failed, closing");
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    while let Some(frame) = ws_stream.next().await {
        match frame {
            Ok(Message::Text(text)) => transport.deliver(text),
            Ok(Message::Binary(_)) => {
                warn!("Ignoring binary frame from {}", id);
            }
            Ok(Message::Close(_)) => {
                debug!("Client {} closed WebSocket", id);
                break;
            }
            // Ping/pong are answered by axum.
            Ok(_) => {}
            Err(e) => {
                debug!("WebSocket receive error from {}: {}", id, e);
                break;
            }
        }
    }

    connection.close();
    let _ = send_task.await;

    debug!("Client {} disconnected ({} remaining)", id, router.connection_count());
}

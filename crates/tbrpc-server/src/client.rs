//! WebSocket client: a [`Peer`] over a tokio-tungstenite connection.

use anyhow::Context;
use futures::{SinkExt, StreamExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use tbrpc::{ChannelTransport, Dispatcher, PendingCall, Peer, RouteTable, RpcOptions};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::debug;

/// A connected client. Serves `routes` to the server and calls the server's.
pub struct WsPeer {
    peer: Peer,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

/// Connect to a tbrpc server at `url` (e.g. `ws://127.0.0.1:8080/ws`).
pub async fn connect(url: &str, routes: RouteTable, options: RpcOptions) -> anyhow::Result<WsPeer> {
    let (stream, _response) = connect_async(url)
        .await
        .with_context(|| format!("Failed to connect to {}", url))?;
    let (mut ws_sink, mut ws_stream) = stream.split();

    let (outgoing_tx, mut outgoing_rx) = mpsc::unbounded_channel::<String>();
    let transport = Arc::new(
        ChannelTransport::new(outgoing_tx).with_diagnostics(options.diagnostics.clone()),
    );
    let peer = Peer::new(transport.clone(), routes, options);

    let writer = tokio::spawn(async move {
        while let Some(text) = outgoing_rx.recv().await {
            if ws_sink.send(Message::Text(text)).await.is_err() {
                debug!("WebSocket send failed, closing");
                break;
            }
        }
        let _ = ws_sink.close().await;
    });

    let reader = {
        let peer = peer.clone();
        tokio::spawn(async move {
            while let Some(frame) = ws_stream.next().await {
                match frame {
                    Ok(Message::Text(text)) => transport.deliver(text),
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        debug!("WebSocket receive error: {}", e);
                        break;
                    }
                }
            }
            let abandoned = peer.close();
            debug!("Server connection ended, {} calls abandoned", abandoned);
        })
    };

    Ok(WsPeer {
        peer,
        reader,
        writer: Some(writer),
    })
}

impl WsPeer {
    pub fn peer(&self) -> &Peer {
        &self.peer
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        self.peer.dispatcher()
    }

    pub fn invoke(&self, function_name: &str, args: Vec<Value>) -> PendingCall {
        self.peer.invoke(function_name, args)
    }

    pub async fn call<R, A>(&self, function_name: &str, args: A) -> tbrpc::Result<R>
    where
        R: DeserializeOwned,
        A: Serialize,
    {
        self.peer.call(function_name, args).await
    }

    /// True once the server side has gone away.
    pub fn is_finished(&self) -> bool {
        self.reader.is_finished()
    }

    /// Close the socket and wait for the close frame to be sent.
    pub async fn close(mut self) {
        self.peer.close();
        if let Some(writer) = self.writer.take() {
            let _ = writer.await;
        }
    }
}

impl Drop for WsPeer {
    fn drop(&mut self) {
        self.peer.close();
        self.reader.abort();
    }
}

impl std::fmt::Debug for WsPeer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WsPeer")
            .field("peer", &self.peer)
            .field("finished", &self.is_finished())
            .finish()
    }
}

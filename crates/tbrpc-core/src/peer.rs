//! One endpoint of a connection that both serves and calls.

use crate::diagnostics::Diagnostic;
use crate::dispatcher::{Dispatcher, PendingCall};
use crate::envelope::{self, Envelope, Parsed};
use crate::responder::{Responder, RouteTable};
use crate::transport::Transport;
use crate::{Result, RpcOptions};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// A responder and a dispatcher sharing one transport.
///
/// This is the client-side composition: the process serves `routes` to the
/// remote end and calls the remote end's routes through the same transport.
#[derive(Clone)]
pub struct Peer {
    transport: Arc<dyn Transport>,
    dispatcher: Dispatcher,
    responder: Responder,
}

impl Peer {
    /// Must be called inside a tokio runtime (see [`Responder::attach`]).
    pub fn new(transport: Arc<dyn Transport>, routes: RouteTable, options: RpcOptions) -> Self {
        let responder = Responder::detached(&transport, routes, options.clone());
        let dispatcher = Dispatcher::detached(transport.clone(), options.clone());
        subscribe_endpoint(transport.as_ref(), responder.clone(), &dispatcher, &options);
        Self {
            transport,
            dispatcher,
            responder,
        }
    }

    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn responder(&self) -> &Responder {
        &self.responder
    }

    pub fn invoke(&self, function_name: &str, args: Vec<Value>) -> PendingCall {
        self.dispatcher.invoke(function_name, args)
    }

    pub async fn call<R, A>(&self, function_name: &str, args: A) -> Result<R>
    where
        R: DeserializeOwned,
        A: Serialize,
    {
        self.dispatcher.call(function_name, args).await
    }

    /// Close the transport and fail every call still waiting on it.
    pub fn close(&self) -> usize {
        self.transport.close();
        self.dispatcher.abandon_all("peer closed")
    }
}

/// One subscription serving both halves of an endpoint: each frame is parsed
/// once, requests go to `responder`, responses to `dispatcher`.
pub(crate) fn subscribe_endpoint(
    transport: &dyn Transport,
    responder: Responder,
    dispatcher: &Dispatcher,
    options: &RpcOptions,
) {
    let resolve = dispatcher.resolver();
    let diagnostics = options.diagnostics.clone();
    transport.on_message(Arc::new(move |text| match envelope::parse(&text) {
        Parsed::Envelope(Envelope::Request(request)) => responder.handle_request(request),
        Parsed::Envelope(Envelope::Response(response)) => resolve(response),
        Parsed::Malformed(reason) => diagnostics.emit(&Diagnostic::MalformedPayload { reason }),
        Parsed::Foreign => {}
    }));
}

impl std::fmt::Debug for Peer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Peer")
            .field("dispatcher", &self.dispatcher)
            .field("responder", &self.responder)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::diagnostics::MemorySink;
    use crate::transport::ChannelTransport;
    use crate::TbrpcError;
    use serde_json::json;
    use tokio::sync::mpsc;

    fn math_routes() -> RouteTable {
        RouteTable::new()
            .typed_route("add", |(a, b): (i64, i64)| async move { Ok(a + b) })
            .route("echo", |args| async move { Ok(json!(args)) })
    }

    #[tokio::test]
    async fn test_add_round_trip() {
        let (a, b) = ChannelTransport::pair();
        let _server = Peer::new(a, math_routes(), RpcOptions::default());
        let client = Peer::new(b, RouteTable::new(), RpcOptions::default());

        let sum: i64 = client.call("add", (2, 3)).await.unwrap();
        assert_eq!(sum, 5);

        let echoed = client.invoke("echo", vec![json!(1), json!("two")]).await.unwrap();
        assert_eq!(echoed, json!([1, "two"]));
    }

    #[tokio::test]
    async fn test_both_ends_call_each_other() {
        let (a, b) = ChannelTransport::pair();
        let left = Peer::new(
            a,
            RouteTable::new().typed_route("side", |(): ()| async move { Ok("left") }),
            RpcOptions::default(),
        );
        let right = Peer::new(
            b,
            RouteTable::new().typed_route("side", |(): ()| async move { Ok("right") }),
            RpcOptions::default(),
        );

        let (from_left, from_right) = tokio::join!(
            left.call::<String, _>("side", ()),
            right.call::<String, _>("side", ())
        );
        assert_eq!(from_left.unwrap(), "right");
        assert_eq!(from_right.unwrap(), "left");
    }

    #[tokio::test]
    async fn test_malformed_frame_is_reported_once() {
        let (tx, _outbound) = mpsc::unbounded_channel();
        let transport = Arc::new(ChannelTransport::new(tx));
        let sink = Arc::new(MemorySink::new());
        let peer = Peer::new(
            transport.clone(),
            math_routes(),
            RpcOptions::new().with_diagnostics(sink.clone()),
        );

        transport.deliver("not json".to_string());
        transport.deliver(r#"{"type":"other"}"#.to_string());

        assert_eq!(transport.subscriber_count(), 1);
        assert!(matches!(
            sink.events().as_slice(),
            [Diagnostic::MalformedPayload { .. }]
        ));
        assert_eq!(peer.dispatcher().pending_count(), 0);
    }

    #[tokio::test]
    async fn test_close_fails_outstanding_calls() {
        let (a, _b) = ChannelTransport::pair();
        let peer = Peer::new(a, RouteTable::new(), RpcOptions::default());

        let call = peer.invoke("never", vec![]);
        assert_eq!(peer.close(), 1);
        assert!(matches!(call.await, Err(TbrpcError::ConnectionClosed { .. })));
    }
}

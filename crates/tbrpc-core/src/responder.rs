//! Route responder: serves request envelopes from a [`RouteTable`].
//!
//! Every request is run in its own spawned task, so a slow handler never
//! holds up the frames behind it and responses go out in completion order.
//! Handler failures (errors and panics) become failure responses instead of
//! escaping into the transport.

use crate::diagnostics::Diagnostic;
use crate::envelope::{self, Envelope, Parsed, RemoteError, RequestEnvelope, ResponseEnvelope};
use crate::transport::Transport;
use crate::{RpcOptions, TbrpcError};
use futures::future::BoxFuture;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Weak};
use tokio::runtime::Handle;
use tracing::debug;

/// Boxed future returned by a route handler.
pub type RouteFuture = BoxFuture<'static, anyhow::Result<Value>>;

/// A route handler over raw positional arguments.
pub type RouteHandler = Arc<dyn Fn(Vec<Value>) -> RouteFuture + Send + Sync>;

/// Named handlers served by a [`Responder`].
///
/// Lookups are exact and case-sensitive. Registering a name twice keeps the
/// later handler.
#[derive(Clone, Default)]
pub struct RouteTable {
    routes: HashMap<String, RouteHandler>,
}

impl RouteTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler that takes the raw argument list.
    pub fn route<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.routes
            .insert(name.into(), Arc::new(move |args: Vec<Value>| handler(args).boxed()));
        self
    }

    /// Register a handler whose positional arguments decode into a tuple.
    ///
    /// Surplus trailing arguments are ignored; missing or mistyped ones are
    /// answered with an invalid-arguments failure.
    ///
    /// ```rust,ignore
    /// let routes = RouteTable::new()
    ///     .typed_route("add", |(a, b): (i64, i64)| async move { Ok(a + b) });
    /// ```
    pub fn typed_route<A, R, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.route(name, move |args| {
            let handler = handler.clone();
            async move {
                let decoded: A = decode_args(args)?;
                encode_result(handler(decoded).await?)
            }
        })
    }

    pub fn insert(&mut self, name: impl Into<String>, handler: RouteHandler) {
        self.routes.insert(name.into(), handler);
    }

    pub fn get(&self, name: &str) -> Option<&RouteHandler> {
        self.routes.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.routes.contains_key(name)
    }

    /// Registered route names, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.routes.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.routes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

impl std::fmt::Debug for RouteTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RouteTable")
            .field("routes", &self.names())
            .finish()
    }
}

/// Decode positional arguments into `A` (usually a tuple).
///
/// Arguments beyond what `A` takes are dropped, so `(i64,)` accepts
/// `[1, 2]`. Any argument list that `()` can absorb decodes into `()`.
pub fn decode_args<A: DeserializeOwned>(args: Vec<Value>) -> Result<A, RemoteError> {
    let full = Value::Array(args);
    let first_error = match A::deserialize(&full) {
        Ok(decoded) => return Ok(decoded),
        Err(e) => e,
    };

    if let Value::Array(args) = &full {
        for len in (0..args.len()).rev() {
            let prefix = Value::Array(args[..len].to_vec());
            if let Ok(decoded) = A::deserialize(&prefix) {
                return Ok(decoded);
            }
        }
    }

    A::deserialize(&Value::Null).map_err(|_| RemoteError::invalid_arguments(first_error.to_string()))
}

/// Encode a handler's return value for the wire.
pub fn encode_result<R: Serialize>(result: R) -> anyhow::Result<Value> {
    serde_json::to_value(result)
        .map_err(|e| RemoteError::handler_failed(format!("Unserializable result: {}", e)).into())
}

/// Map a handler error onto the failure payload sent to the caller.
pub fn into_remote_error(err: anyhow::Error) -> RemoteError {
    let err = match err.downcast::<RemoteError>() {
        Ok(remote) => return remote,
        Err(err) => err,
    };
    match err.downcast::<TbrpcError>() {
        Ok(TbrpcError::Remote(remote)) => remote,
        Ok(other) => RemoteError::new(other.to_rpc_error_code(), other.to_string()),
        Err(err) => RemoteError::handler_failed(format!("{:#}", err)),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic payload".to_string()
    }
}

/// Serves a route table on one transport.
#[derive(Clone)]
pub struct Responder {
    inner: Arc<ResponderInner>,
}

struct ResponderInner {
    routes: RouteTable,
    transport: Weak<dyn Transport>,
    options: RpcOptions,
    runtime: Handle,
}

impl Responder {
    /// Subscribe to `transport` and start answering requests.
    ///
    /// Must be called inside a tokio runtime: handlers run on that runtime,
    /// whichever thread the transport delivers frames from. The subscription
    /// lives as long as the transport keeps its handlers.
    pub fn attach(transport: Arc<dyn Transport>, routes: RouteTable, options: RpcOptions) -> Self {
        let responder = Self::detached(&transport, routes, options);

        let subscriber = responder.inner.clone();
        transport.on_message(Arc::new(move |text| subscriber.handle_frame(&text)));

        responder
    }

    /// A responder replying on `transport` that is not subscribed to it.
    /// The caller feeds it requests through [`handle_request`](Self::handle_request).
    pub(crate) fn detached(
        transport: &Arc<dyn Transport>,
        routes: RouteTable,
        options: RpcOptions,
    ) -> Self {
        Self {
            inner: Arc::new(ResponderInner {
                routes,
                transport: Arc::downgrade(transport),
                options,
                runtime: Handle::current(),
            }),
        }
    }

    pub(crate) fn handle_request(&self, request: RequestEnvelope) {
        self.inner.handle_request(request);
    }

    pub fn routes(&self) -> &RouteTable {
        &self.inner.routes
    }
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("routes", &self.inner.routes)
            .finish_non_exhaustive()
    }
}

impl ResponderInner {
    fn handle_frame(self: &Arc<Self>, text: &str) {
        match envelope::parse(text) {
            Parsed::Envelope(Envelope::Request(request)) => self.handle_request(request),
            Parsed::Malformed(reason) => {
                self.options
                    .diagnostics
                    .emit(&Diagnostic::MalformedPayload { reason });
            }
            // Responses belong to the dispatcher; foreign traffic is not ours.
            Parsed::Envelope(Envelope::Response(_)) | Parsed::Foreign => {}
        }
    }

    fn handle_request(self: &Arc<Self>, request: RequestEnvelope) {
        let (function_name, args, transaction_id) = request.into_parts();

        let Some(handler) = self.routes.get(&function_name).cloned() else {
            self.options.diagnostics.emit(&Diagnostic::UnknownRoute {
                function_name: function_name.clone(),
                transaction_id: transaction_id.clone(),
            });
            if self.options.reply_to_unknown_routes {
                self.reply(ResponseEnvelope::failure(
                    transaction_id,
                    RemoteError::route_not_found(&function_name),
                ));
            }
            return;
        };

        debug!("Route call: {} ({})", function_name, transaction_id);

        let inner = self.clone();
        self.runtime.spawn(async move {
            let outcome = AssertUnwindSafe(async move { handler(args).await })
                .catch_unwind()
                .await;

            let response = match outcome {
                Ok(Ok(value)) => ResponseEnvelope::success(transaction_id, value),
                Ok(Err(err)) => {
                    let remote = into_remote_error(err);
                    inner.report_failure(&function_name, &transaction_id, &remote.message);
                    ResponseEnvelope::failure(transaction_id, remote)
                }
                Err(payload) => {
                    let message = format!("Route handler panicked: {}", panic_message(&*payload));
                    inner.report_failure(&function_name, &transaction_id, &message);
                    ResponseEnvelope::failure(transaction_id, RemoteError::handler_failed(message))
                }
            };

            inner.reply(response);
        });
    }

    fn report_failure(&self, function_name: &str, transaction_id: &str, message: &str) {
        self.options.diagnostics.emit(&Diagnostic::HandlerFailed {
            function_name: function_name.to_string(),
            transaction_id: transaction_id.to_string(),
            message: message.to_string(),
        });
    }

    fn reply(&self, response: ResponseEnvelope) {
        match self.transport.upgrade() {
            Some(transport) => transport.send(envelope::encode(&Envelope::Response(response))),
            None => self.options.diagnostics.emit(&Diagnostic::SendDropped {
                reason: format!("transport gone before reply to {}", response.transaction_id()),
            }),
        }
    }
}

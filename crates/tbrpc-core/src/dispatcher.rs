//! Call dispatcher: issues requests and matches responses by transaction id.
//!
//! Each [`Dispatcher`] owns a ledger of pending calls keyed by transaction
//! id. [`Dispatcher::invoke`] registers an entry, sends the request and hands
//! back a [`PendingCall`] straight away; the entry is resolved later, on the
//! transport's receive path, by whichever response carries its id. Responses
//! may arrive in any order.
//!
//! # Entry lifecycle
//!
//! An entry ends in exactly one of:
//! - resolved with the peer's result,
//! - resolved with the peer's failure payload,
//! - abandoned: timed out, dropped by its caller, or failed by
//!   [`Dispatcher::abandon_all`] when the connection goes away.
//!
//! The entry is removed from the ledger the moment it ends.

use crate::diagnostics::Diagnostic;
use crate::envelope::{self, Envelope, Parsed, RequestEnvelope, ResponseEnvelope};
use crate::transport::Transport;
use crate::{Result, RpcOptions, TbrpcError};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, Weak};
use std::task::{Context, Poll};
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::time::{Instant, Sleep};
use tracing::debug;

struct PendingEntry {
    function_name: String,
    created_at: Instant,
    completion: oneshot::Sender<Result<Value>>,
}

/// Issues calls to the routes served by the peer on one transport.
///
/// Cheap to clone; clones share the same ledger.
#[derive(Clone)]
pub struct Dispatcher {
    inner: Arc<DispatcherInner>,
}

struct DispatcherInner {
    transport: Arc<dyn Transport>,
    pending: Mutex<HashMap<String, PendingEntry>>,
    options: RpcOptions,
}

impl Dispatcher {
    /// Subscribe to `transport` for responses and return a dispatcher bound to it.
    pub fn attach(transport: Arc<dyn Transport>, options: RpcOptions) -> Self {
        let dispatcher = Self::detached(transport.clone(), options);

        let ledger = Arc::downgrade(&dispatcher.inner);
        transport.on_message(Arc::new(move |text| {
            if let Some(inner) = ledger.upgrade() {
                inner.handle_frame(&text);
            }
        }));

        dispatcher
    }

    /// A dispatcher sending on `transport` that is not subscribed to it.
    /// Responses reach it through [`resolver`](Self::resolver).
    pub(crate) fn detached(transport: Arc<dyn Transport>, options: RpcOptions) -> Self {
        Self {
            inner: Arc::new(DispatcherInner {
                transport,
                pending: Mutex::new(HashMap::new()),
                options,
            }),
        }
    }

    /// Completes pending calls from response envelopes. Holds the ledger
    /// weakly, so a transport subscription built on it does not keep the
    /// dispatcher alive.
    pub(crate) fn resolver(&self) -> impl Fn(ResponseEnvelope) + Send + Sync + 'static {
        let ledger = Arc::downgrade(&self.inner);
        move |response| {
            if let Some(inner) = ledger.upgrade() {
                inner.resolve(response);
            }
        }
    }

    /// Call `function_name` on the peer with positional `args`.
    ///
    /// Sends the request before returning. The returned handle resolves when
    /// the matching response arrives, the call times out, or the connection
    /// closes.
    pub fn invoke(&self, function_name: &str, args: Vec<Value>) -> PendingCall {
        let (completion, receiver) = oneshot::channel();
        let created_at = Instant::now();

        let transaction_id = {
            let mut pending = self.inner.pending.lock().expect("ledger lock poisoned");
            let mut transaction_id = envelope::new_transaction_id();
            // A live id is never reused.
            while pending.contains_key(&transaction_id) {
                transaction_id = envelope::new_transaction_id();
            }
            pending.insert(
                transaction_id.clone(),
                PendingEntry {
                    function_name: function_name.to_string(),
                    created_at,
                    completion,
                },
            );
            transaction_id
        };

        let request = RequestEnvelope::new(function_name, args, transaction_id.clone());
        self.inner
            .transport
            .send(envelope::encode(&Envelope::Request(request)));

        PendingCall {
            transaction_id,
            function_name: function_name.to_string(),
            receiver,
            deadline: self.inner.options.call_timeout.map(|after| Deadline {
                after,
                at: created_at + after,
                sleep: None,
            }),
            ledger: Arc::downgrade(&self.inner),
            finished: false,
        }
    }

    /// Typed call: `args` serializes to the argument list (use a tuple such
    /// as `(2, 3)`, `("x",)` or `()`), and the result decodes into `R`.
    pub async fn call<R, A>(&self, function_name: &str, args: A) -> Result<R>
    where
        R: DeserializeOwned,
        A: Serialize,
    {
        let args = encode_args(args)?;
        let value = self.invoke(function_name, args).await?;
        serde_json::from_value(value).map_err(|e| TbrpcError::UnexpectedResult {
            function_name: function_name.to_string(),
            message: e.to_string(),
        })
    }

    /// Fail every pending call with [`TbrpcError::ConnectionClosed`].
    ///
    /// Returns how many calls were abandoned.
    pub fn abandon_all(&self, reason: &str) -> usize {
        let drained: Vec<(String, PendingEntry)> = self
            .inner
            .pending
            .lock()
            .expect("ledger lock poisoned")
            .drain()
            .collect();

        let count = drained.len();
        for (transaction_id, entry) in drained {
            let _ = entry
                .completion
                .send(Err(TbrpcError::ConnectionClosed { transaction_id }));
        }

        if count > 0 {
            self.inner.options.diagnostics.emit(&Diagnostic::CallsAbandoned {
                count,
                reason: reason.to_string(),
            });
        }
        count
    }

    /// Number of calls still waiting for a response.
    pub fn pending_count(&self) -> usize {
        self.inner.pending.lock().expect("ledger lock poisoned").len()
    }

    /// Transaction ids of the calls still waiting for a response.
    pub fn pending_ids(&self) -> Vec<String> {
        self.inner
            .pending
            .lock()
            .expect("ledger lock poisoned")
            .keys()
            .cloned()
            .collect()
    }

    /// True if both handles share one ledger (and therefore one connection).
    pub fn same_as(&self, other: &Dispatcher) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl std::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Dispatcher")
            .field("pending", &self.pending_count())
            .finish_non_exhaustive()
    }
}

impl DispatcherInner {
    fn handle_frame(&self, text: &str) {
        match envelope::parse(text) {
            Parsed::Envelope(Envelope::Response(response)) => self.resolve(response),
            Parsed::Malformed(reason) => {
                self.options
                    .diagnostics
                    .emit(&Diagnostic::MalformedPayload { reason });
            }
            // Requests belong to the responder; foreign traffic is not ours.
            Parsed::Envelope(Envelope::Request(_)) | Parsed::Foreign => {}
        }
    }

    fn resolve(&self, response: ResponseEnvelope) {
        let (transaction_id, outcome) = response.into_outcome();

        let entry = self
            .pending
            .lock()
            .expect("ledger lock poisoned")
            .remove(&transaction_id);

        match entry {
            Some(entry) => {
                debug!(
                    "Resolved {} ({}) after {:?}",
                    entry.function_name,
                    transaction_id,
                    entry.created_at.elapsed()
                );
                let _ = entry.completion.send(outcome.map_err(TbrpcError::Remote));
            }
            None => {
                self.options
                    .diagnostics
                    .emit(&Diagnostic::UnmatchedResponse { transaction_id });
            }
        }
    }

    /// Remove an entry whose caller stopped waiting. True if it was still pending.
    fn forget(&self, transaction_id: &str) -> bool {
        self.pending
            .lock()
            .expect("ledger lock poisoned")
            .remove(transaction_id)
            .is_some()
    }
}

/// Turn serializable call arguments into a positional argument list.
pub fn encode_args<A: Serialize>(args: A) -> Result<Vec<Value>> {
    match serde_json::to_value(args)? {
        Value::Array(values) => Ok(values),
        // `()` serializes to null.
        Value::Null => Ok(Vec::new()),
        other => Err(TbrpcError::InvalidArguments {
            message: format!(
                "arguments must serialize to a JSON array (use a tuple), got {}",
                other
            ),
        }),
    }
}

struct Deadline {
    after: Duration,
    at: Instant,
    sleep: Option<Pin<Box<Sleep>>>,
}

/// Completion handle for one call.
///
/// Resolves to the peer's result, the peer's failure as
/// [`TbrpcError::Remote`], [`TbrpcError::Timeout`], or
/// [`TbrpcError::ConnectionClosed`]. Dropping it before it resolves abandons
/// the call.
#[must_use = "a call is abandoned when its PendingCall is dropped"]
pub struct PendingCall {
    transaction_id: String,
    function_name: String,
    receiver: oneshot::Receiver<Result<Value>>,
    deadline: Option<Deadline>,
    ledger: Weak<DispatcherInner>,
    finished: bool,
}

impl PendingCall {
    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }
}

impl Future for PendingCall {
    type Output = Result<Value>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = &mut *self;
        if this.finished {
            return Poll::Ready(Err(TbrpcError::ConnectionClosed {
                transaction_id: this.transaction_id.clone(),
            }));
        }

        match Pin::new(&mut this.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => {
                this.finished = true;
                return Poll::Ready(outcome);
            }
            // The dispatcher went away with the entry still in its ledger.
            Poll::Ready(Err(_)) => {
                this.finished = true;
                return Poll::Ready(Err(TbrpcError::ConnectionClosed {
                    transaction_id: this.transaction_id.clone(),
                }));
            }
            Poll::Pending => {}
        }

        let Some(deadline) = this.deadline.as_mut() else {
            return Poll::Pending;
        };
        let at = deadline.at;
        let sleep = deadline
            .sleep
            .get_or_insert_with(|| Box::pin(tokio::time::sleep_until(at)));
        if sleep.as_mut().poll(cx).is_pending() {
            return Poll::Pending;
        }

        let after = deadline.after;
        if let Some(inner) = this.ledger.upgrade() {
            // Someone else already took the entry and is about to complete
            // (or drop) it; the receiver registered above will wake us.
            if !inner.forget(&this.transaction_id) {
                return Poll::Pending;
            }
            inner.options.diagnostics.emit(&Diagnostic::CallTimedOut {
                function_name: this.function_name.clone(),
                transaction_id: this.transaction_id.clone(),
                after,
            });
        }

        this.finished = true;
        Poll::Ready(Err(TbrpcError::Timeout {
            function_name: this.function_name.clone(),
            after,
        }))
    }
}

impl Drop for PendingCall {
    fn drop(&mut self) {
        if !self.finished {
            if let Some(inner) = self.ledger.upgrade() {
                inner.forget(&self.transaction_id);
            }
        }
    }
}

impl std::fmt::Debug for PendingCall {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PendingCall")
            .field("transaction_id", &self.transaction_id)
            .field("function_name", &self.function_name)
            .field("finished", &self.finished)
            .finish()
    }
}

/// Generate a named-method facade over a [`Dispatcher`] for a known route list.
///
/// ```rust,ignore
/// tbrpc::route_caller! {
///     pub struct MathApi {
///         fn add(a: i64, b: i64) -> i64;
///         fn ping() -> String;
///     }
/// }
///
/// let api = MathApi::new(dispatcher);
/// assert_eq!(api.add(2, 3).await?, 5);
/// ```
#[macro_export]
macro_rules! route_caller {
    (
        $(#[$meta:meta])*
        $vis:vis struct $name:ident {
            $(
                $(#[$route_meta:meta])*
                fn $route:ident ( $( $arg:ident : $arg_ty:ty ),* $(,)? ) -> $ret:ty ;
            )*
        }
    ) => {
        $(#[$meta])*
        #[derive(Clone, Debug)]
        $vis struct $name {
            dispatcher: $crate::Dispatcher,
        }

        impl $name {
            $vis fn new(dispatcher: $crate::Dispatcher) -> Self {
                Self { dispatcher }
            }

            $vis fn dispatcher(&self) -> &$crate::Dispatcher {
                &self.dispatcher
            }

            $(
                $(#[$route_meta])*
                #[allow(non_snake_case)]
                $vis async fn $route(&self, $( $arg: $arg_ty ),*) -> $crate::Result<$ret> {
                    self.dispatcher
                        .call(stringify!($route), ( $( $arg, )* ))
                        .await
                }
            )*
        }
    };
}

//! Server-side composition: one responder and one dispatcher per connection.
//!
//! A [`ServerRouter`] accepts transports. Each accepted connection gets its
//! own [`Dispatcher`] (to call back into that client) and a [`Responder`]
//! serving the router's [`ServerRoutes`]. Server route handlers receive a
//! [`ConnectionContext`] ahead of the caller's arguments; the remote caller
//! never sees it.
//!
//! Connection lifecycle: `Accepted -> Active -> Closed`. The shared registry
//! holds exactly the connections that are currently active.

use crate::dispatcher::{Dispatcher, PendingCall};
use crate::peer::subscribe_endpoint;
use crate::responder::{decode_args, encode_result, RouteFuture, RouteTable, Responder};
use crate::transport::Transport;
use crate::RpcOptions;
use futures::FutureExt;
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;
use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use tracing::debug;

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Opaque identity of one accepted connection. Never reused within a process.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(u64);

impl ConnectionId {
    fn next() -> Self {
        ConnectionId(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(&self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn-{}", self.0)
    }
}

/// Where a connection is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Accepted,
    Active,
    Closed,
}

/// What a server route handler knows about the connection that called it.
#[derive(Clone)]
pub struct ConnectionContext {
    /// The calling connection.
    pub id: ConnectionId,
    /// Calls back into the calling client.
    pub client: Dispatcher,
    /// Every connected client.
    pub clients: RegistryView,
}

impl fmt::Debug for ConnectionContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionContext")
            .field("id", &self.id)
            .field("clients", &self.clients.len())
            .finish_non_exhaustive()
    }
}

/// Server route handler: context first, then the caller's positional arguments.
pub type ServerRouteHandler = Arc<dyn Fn(ConnectionContext, Vec<Value>) -> RouteFuture + Send + Sync>;

/// Route table for a [`ServerRouter`].
#[derive(Clone, Default)]
pub struct ServerRoutes {
    routes: HashMap<String, ServerRouteHandler>,
}

impl ServerRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<F, Fut>(mut self, name: impl Into<String>, handler: F) -> Self
    where
        F: Fn(ConnectionContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Value>> + Send + 'static,
    {
        self.routes.insert(
            name.into(),
            Arc::new(move |ctx: ConnectionContext, args: Vec<Value>| handler(ctx, args).boxed()),
        );
        self
    }

    /// Like [`RouteTable::typed_route`], with the connection context first.
    pub fn typed_route<A, R, F, Fut>(self, name: impl Into<String>, handler: F) -> Self
    where
        A: DeserializeOwned + Send + 'static,
        R: Serialize + 'static,
        F: Fn(ConnectionContext, A) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<R>> + Send + 'static,
    {
        let handler = Arc::new(handler);
        self.route(name, move |ctx, args| {
            let handler = handler.clone();
            async move {
                let decoded: A = decode_args(args)?;
                encode_result(handler(ctx, decoded).await?)
            }
        })
    }

    /// Close every handler over `ctx`, producing a plain route table.
    pub fn bind(&self, ctx: ConnectionContext) -> RouteTable {
        let mut table = RouteTable::new();
        for (name, handler) in &self.routes {
            let handler = handler.clone();
            let ctx = ctx.clone();
            table.insert(
                name.clone(),
                Arc::new(move |args: Vec<Value>| handler(ctx.clone(), args)),
            );
        }
        table
    }

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

impl fmt::Debug for ServerRoutes {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRoutes")
            .field("routes", &self.names())
            .finish()
    }
}

/// Read-only view of the live connections and their dispatchers.
///
/// Only the accept/close lifecycle of a [`ServerRouter`] changes it.
#[derive(Clone, Default)]
pub struct RegistryView {
    entries: Arc<RwLock<HashMap<ConnectionId, Dispatcher>>>,
}

impl RegistryView {
    pub fn get(&self, id: ConnectionId) -> Option<Dispatcher> {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .get(&id)
            .cloned()
    }

    pub fn contains(&self, id: ConnectionId) -> bool {
        self.entries
            .read()
            .expect("registry lock poisoned")
            .contains_key(&id)
    }

    pub fn len(&self) -> usize {
        self.entries.read().expect("registry lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Live connection ids, ascending.
    pub fn ids(&self) -> Vec<ConnectionId> {
        let mut ids: Vec<ConnectionId> = self
            .entries
            .read()
            .expect("registry lock poisoned")
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    /// A consistent copy of the registry, ordered by connection id.
    ///
    /// Connections closing while the caller iterates do not affect the copy.
    pub fn snapshot(&self) -> Vec<(ConnectionId, Dispatcher)> {
        let mut entries: Vec<(ConnectionId, Dispatcher)> = self
            .entries
            .read()
            .expect("registry lock poisoned")
            .iter()
            .map(|(id, dispatcher)| (*id, dispatcher.clone()))
            .collect();
        entries.sort_by_key(|(id, _)| *id);
        entries
    }

    /// Snapshot of every connection except `id`.
    pub fn others(&self, id: ConnectionId) -> Vec<(ConnectionId, Dispatcher)> {
        self.snapshot()
            .into_iter()
            .filter(|(other, _)| *other != id)
            .collect()
    }

    /// Call `function_name` on every connection (optionally skipping one).
    pub fn broadcast(
        &self,
        function_name: &str,
        args: Vec<Value>,
        except: Option<ConnectionId>,
    ) -> Vec<(ConnectionId, PendingCall)> {
        self.snapshot()
            .into_iter()
            .filter(|(id, _)| Some(*id) != except)
            .map(|(id, dispatcher)| (id, dispatcher.invoke(function_name, args.clone())))
            .collect()
    }

    fn insert(&self, id: ConnectionId, dispatcher: Dispatcher) {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .insert(id, dispatcher);
    }

    fn remove(&self, id: ConnectionId) -> Option<Dispatcher> {
        self.entries
            .write()
            .expect("registry lock poisoned")
            .remove(&id)
    }
}

impl fmt::Debug for RegistryView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RegistryView")
            .field("connections", &self.ids())
            .finish()
    }
}

/// Hook fired when a connection is accepted or closed.
pub type ConnectionHook = Arc<dyn Fn(ConnectionId, &Dispatcher) + Send + Sync>;

struct RouterShared {
    routes: ServerRoutes,
    registry: RegistryView,
    on_connect: Option<ConnectionHook>,
    on_disconnect: Option<ConnectionHook>,
    options: RpcOptions,
}

/// Builder for [`ServerRouter`].
#[derive(Default)]
pub struct ServerRouterBuilder {
    routes: ServerRoutes,
    on_connect: Option<ConnectionHook>,
    on_disconnect: Option<ConnectionHook>,
    options: RpcOptions,
}

impl ServerRouterBuilder {
    pub fn routes(mut self, routes: ServerRoutes) -> Self {
        self.routes = routes;
        self
    }

    pub fn on_connect<F>(mut self, hook: F) -> Self
    where
        F: Fn(ConnectionId, &Dispatcher) + Send + Sync + 'static,
    {
        self.on_connect = Some(Arc::new(hook));
        self
    }

    pub fn on_disconnect<F>(mut self, hook: F) -> Self
    where
        F: Fn(ConnectionId, &Dispatcher) + Send + Sync + 'static,
    {
        self.on_disconnect = Some(Arc::new(hook));
        self
    }

    pub fn options(mut self, options: RpcOptions) -> Self {
        self.options = options;
        self
    }

    pub fn build(self) -> ServerRouter {
        ServerRouter {
            shared: Arc::new(RouterShared {
                routes: self.routes,
                registry: RegistryView::default(),
                on_connect: self.on_connect,
                on_disconnect: self.on_disconnect,
                options: self.options,
            }),
        }
    }
}

/// Serves [`ServerRoutes`] to any number of connections.
#[derive(Clone)]
pub struct ServerRouter {
    shared: Arc<RouterShared>,
}

impl ServerRouter {
    pub fn builder() -> ServerRouterBuilder {
        ServerRouterBuilder::default()
    }

    /// Take ownership of a freshly opened transport.
    ///
    /// Must be called inside a tokio runtime (see [`Responder::attach`]).
    ///
    /// The connection is active (registered and serving routes) when this
    /// returns. Close it with [`Connection::close`] or by dropping it.
    pub fn accept(&self, transport: Arc<dyn Transport>) -> Connection {
        let id = ConnectionId::next();
        let mut state = ConnectionState::Accepted;
        debug!("Connection {} {:?}", id, state);

        let shared = &self.shared;
        let dispatcher = Dispatcher::detached(transport.clone(), shared.options.clone());
        let ctx = ConnectionContext {
            id,
            client: dispatcher.clone(),
            clients: shared.registry.clone(),
        };
        let responder =
            Responder::detached(&transport, shared.routes.bind(ctx), shared.options.clone());
        subscribe_endpoint(transport.as_ref(), responder, &dispatcher, &shared.options);

        if let Some(hook) = &shared.on_connect {
            hook(id, &dispatcher);
        }
        shared.registry.insert(id, dispatcher.clone());

        state = ConnectionState::Active;
        debug!("Connection {} {:?}", id, state);

        Connection {
            id,
            dispatcher,
            transport,
            shared: self.shared.clone(),
            state,
        }
    }

    /// Live connections.
    pub fn registry(&self) -> &RegistryView {
        &self.shared.registry
    }

    pub fn connection_count(&self) -> usize {
        self.shared.registry.len()
    }

    pub fn route_names(&self) -> Vec<String> {
        self.shared.routes.names()
    }

    pub fn options(&self) -> &RpcOptions {
        &self.shared.options
    }
}

impl fmt::Debug for ServerRouter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServerRouter")
            .field("routes", &self.shared.routes)
            .field("registry", &self.shared.registry)
            .finish_non_exhaustive()
    }
}

/// One accepted connection. Closing (or dropping) it ends its lifecycle.
pub struct Connection {
    id: ConnectionId,
    dispatcher: Dispatcher,
    transport: Arc<dyn Transport>,
    shared: Arc<RouterShared>,
    state: ConnectionState,
}

impl Connection {
    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// Calls into this connection's client.
    pub fn dispatcher(&self) -> &Dispatcher {
        &self.dispatcher
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    /// The transport closed: unregister, then notify `on_disconnect`.
    pub fn close(mut self) {
        self.shutdown();
    }

    fn shutdown(&mut self) {
        if self.state == ConnectionState::Closed {
            return;
        }

        self.shared.registry.remove(self.id);
        self.transport.close();

        if let Some(hook) = &self.shared.on_disconnect {
            hook(self.id, &self.dispatcher);
        }

        self.dispatcher.abandon_all("connection closed");
        self.state = ConnectionState::Closed;
        debug!("Connection {} {:?}", self.id, self.state);
    }
}

impl Drop for Connection {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

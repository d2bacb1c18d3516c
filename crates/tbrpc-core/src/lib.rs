//! tbrpc - bidirectional JSON RPC over any duplex text transport.
//!
//! Either end of a connection can serve routes and call the other end's
//! routes. Every frame is a JSON envelope tagged `"type": "tBRPC"`; requests
//! and responses are matched by a transaction id, so any number of calls may
//! be in flight at once and complete in any order.
//!
//! The crate knows nothing about sockets. A binding implements [`Transport`]
//! (send a text frame, hear about inbound ones) and the rest is plain
//! composition:
//!
//! - [`Responder`] serves a [`RouteTable`]
//! - [`Dispatcher`] calls remote routes and resolves the returned futures
//! - [`Peer`] is both on one transport (the client side)
//! - [`ServerRouter`] accepts many transports, keeping a registry of
//!   connected clients that route handlers can call back into
//!
//! # Example
//!
//! ```rust,ignore
//! use tbrpc::{ChannelTransport, Peer, RouteTable, RpcOptions};
//!
//! #[tokio::main]
//! async fn main() -> tbrpc::Result<()> {
//!     let (left, right) = ChannelTransport::pair();
//!
//!     let routes = RouteTable::new()
//!         .typed_route("add", |(a, b): (i64, i64)| async move { Ok(a + b) });
//!     let _server = Peer::new(left, routes, RpcOptions::default());
//!     let client = Peer::new(right, RouteTable::new(), RpcOptions::default());
//!
//!     let sum: i64 = client.call("add", (2, 3)).await?;
//!     assert_eq!(sum, 5);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod diagnostics;
pub mod dispatcher;
pub mod envelope;
pub mod error;
pub mod peer;
pub mod registry;
pub mod responder;
pub mod transport;

pub use config::{ProtocolConfig, RpcOptions, ServerConfig};
pub use diagnostics::{Diagnostic, DiagnosticsSink, MemorySink, TracingSink};
pub use dispatcher::{encode_args, Dispatcher, PendingCall};
pub use envelope::{Envelope, Parsed, RemoteError, RequestEnvelope, ResponseEnvelope};
pub use error::{Result, TbrpcError};
pub use peer::Peer;
pub use registry::{
    Connection, ConnectionContext, ConnectionHook, ConnectionId, ConnectionState, RegistryView,
    ServerRouteHandler, ServerRouter, ServerRouterBuilder, ServerRoutes,
};
pub use responder::{
    decode_args, encode_result, Responder, RouteFuture, RouteHandler, RouteTable,
};
pub use transport::{ChannelTransport, MessageHandler, MessageHub, Transport};

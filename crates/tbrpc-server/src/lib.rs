//! tbrpc over WebSockets.
//!
//! [`server::start_server`] hosts a [`tbrpc::ServerRouter`] behind an axum
//! WebSocket endpoint; [`client::connect`] opens a [`client::WsPeer`] to it.

pub mod client;
pub mod handlers;
pub mod server;
pub mod ws;

pub use client::{connect, WsPeer};
pub use server::{app, start_server, HealthStatus};

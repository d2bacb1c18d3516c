//! Centralized configuration for tbrpc.
//!
//! Protocol constants live on unit structs, runtime knobs on [`RpcOptions`].

use crate::diagnostics::{DiagnosticsSink, TracingSink};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Wire protocol constants.
pub struct ProtocolConfig;

impl ProtocolConfig {
    /// Value of the `type` field identifying tbrpc envelopes.
    pub const PROTOCOL_TAG: &'static str = "tBRPC";
    pub const REQUEST_KIND: &'static str = "request";
    pub const RESPONSE_KIND: &'static str = "response";

    /// Default upper bound on how long a call waits for its response.
    pub const DEFAULT_CALL_TIMEOUT: Duration = Duration::from_secs(30);

    // JSON-RPC 2.0 style error codes carried in failure responses
    pub const CALL_INCOMPLETE: i32 = -32000;
    pub const ROUTE_NOT_FOUND: i32 = -32601;
    pub const INVALID_ARGUMENTS: i32 = -32602;
    pub const HANDLER_FAILED: i32 = -32603;
}

/// Socket host defaults.
pub struct ServerConfig;

impl ServerConfig {
    pub const DEFAULT_HOST: &'static str = "127.0.0.1";
    pub const WS_PATH: &'static str = "/ws";
    pub const HEALTH_PATH: &'static str = "/health";
}

/// Runtime options shared by responders and dispatchers.
#[derive(Clone)]
pub struct RpcOptions {
    /// Upper bound for a single call. `None` waits forever.
    pub call_timeout: Option<Duration>,
    /// Answer requests for unregistered routes with a failure response.
    /// When false the request is dropped and the caller is only bounded by
    /// its own timeout.
    pub reply_to_unknown_routes: bool,
    /// Where protocol diagnostics go.
    pub diagnostics: Arc<dyn DiagnosticsSink>,
}

impl RpcOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_call_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.call_timeout = timeout;
        self
    }

    pub fn with_unknown_route_replies(mut self, reply: bool) -> Self {
        self.reply_to_unknown_routes = reply;
        self
    }

    pub fn with_diagnostics(mut self, sink: Arc<dyn DiagnosticsSink>) -> Self {
        self.diagnostics = sink;
        self
    }
}

impl Default for RpcOptions {
    fn default() -> Self {
        Self {
            call_timeout: Some(ProtocolConfig::DEFAULT_CALL_TIMEOUT),
            reply_to_unknown_routes: true,
            diagnostics: Arc::new(TracingSink),
        }
    }
}

impl fmt::Debug for RpcOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RpcOptions")
            .field("call_timeout", &self.call_timeout)
            .field("reply_to_unknown_routes", &self.reply_to_unknown_routes)
            .finish_non_exhaustive()
    }
}

//! Error types for tbrpc.
//!
//! Only failures that a caller can act on surface here. Transport-adjacent
//! problems (malformed frames, stray responses, dropped sends) are reported
//! through the [`DiagnosticsSink`](crate::diagnostics::DiagnosticsSink) and
//! never reach business logic.

use crate::config::ProtocolConfig;
use crate::envelope::RemoteError;
use std::time::Duration;
use thiserror::Error;

/// Main error type for tbrpc operations.
#[derive(Debug, Error)]
pub enum TbrpcError {
    // Serialization errors
    #[error("JSON error: {message}")]
    Json {
        message: String,
        #[source]
        source: Option<serde_json::Error>,
    },

    #[error("Invalid arguments: {message}")]
    InvalidArguments { message: String },

    #[error("Unexpected result for {function_name}: {message}")]
    UnexpectedResult {
        function_name: String,
        message: String,
    },

    // Call outcome errors
    #[error("Remote error: {0}")]
    Remote(RemoteError),

    #[error("Call to {function_name} timed out after {after:?}")]
    Timeout {
        function_name: String,
        after: Duration,
    },

    #[error("Connection closed before transaction {transaction_id} completed")]
    ConnectionClosed { transaction_id: String },
}

/// Result type alias for tbrpc operations.
pub type Result<T> = std::result::Result<T, TbrpcError>;

impl From<serde_json::Error> for TbrpcError {
    fn from(err: serde_json::Error) -> Self {
        TbrpcError::Json {
            message: err.to_string(),
            source: Some(err),
        }
    }
}

impl From<RemoteError> for TbrpcError {
    fn from(err: RemoteError) -> Self {
        TbrpcError::Remote(err)
    }
}

impl TbrpcError {
    /// Convert to the error code carried in a failure response.
    ///
    /// Remote errors keep the code the peer sent; everything else maps onto
    /// the JSON-RPC 2.0 reserved range:
    /// - -32602: Invalid params
    /// - -32603: Internal error
    /// - -32000: Call did not complete (timeout / closed connection)
    pub fn to_rpc_error_code(&self) -> i32 {
        match self {
            TbrpcError::Remote(remote) => remote.code,
            TbrpcError::InvalidArguments { .. } => ProtocolConfig::INVALID_ARGUMENTS,
            TbrpcError::Timeout { .. } | TbrpcError::ConnectionClosed { .. } => {
                ProtocolConfig::CALL_INCOMPLETE
            }
            _ => ProtocolConfig::HANDLER_FAILED,
        }
    }

    /// True when the remote side never produced an answer for the call.
    pub fn is_incomplete(&self) -> bool {
        matches!(
            self,
            TbrpcError::Timeout { .. } | TbrpcError::ConnectionClosed { .. }
        )
    }

    /// The remote failure payload, if the peer answered with one.
    pub fn as_remote(&self) -> Option<&RemoteError> {
        match self {
            TbrpcError::Remote(remote) => Some(remote),
            _ => None,
        }
    }
}

//! Protocol diagnostics.
//!
//! Responders and dispatchers never raise transport-level problems to their
//! callers. They report them to a [`DiagnosticsSink`] instead. The default
//! sink logs through `tracing`; tests plug in a [`MemorySink`] and assert on
//! what was reported.

use std::sync::Mutex;
use std::time::Duration;
use tracing::warn;

/// Something noteworthy that the protocol swallowed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Diagnostic {
    /// A frame carried the protocol tag but could not be decoded, or was not JSON at all.
    MalformedPayload { reason: String },
    /// A request named a route that is not registered.
    UnknownRoute {
        function_name: String,
        transaction_id: String,
    },
    /// A response arrived for a transaction that is not pending.
    UnmatchedResponse { transaction_id: String },
    /// A route handler returned an error or panicked.
    HandlerFailed {
        function_name: String,
        transaction_id: String,
        message: String,
    },
    /// A call gave up waiting for its response.
    CallTimedOut {
        function_name: String,
        transaction_id: String,
        after: Duration,
    },
    /// Outbound text was dropped because the transport is closed.
    SendDropped { reason: String },
    /// Pending calls were failed because their connection went away.
    CallsAbandoned { count: usize, reason: String },
}

/// Receiver for protocol diagnostics.
pub trait DiagnosticsSink: Send + Sync + 'static {
    fn emit(&self, diagnostic: &Diagnostic);
}

/// Forwards diagnostics to `tracing` as warnings.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingSink;

impl DiagnosticsSink for TracingSink {
    fn emit(&self, diagnostic: &Diagnostic) {
        match diagnostic {
            Diagnostic::MalformedPayload { reason } => {
                warn!(%reason, "Failed to parse ws message");
            }
            Diagnostic::UnknownRoute {
                function_name,
                transaction_id,
            } => {
                warn!(%function_name, %transaction_id, "No route found for function: {}", function_name);
            }
            Diagnostic::UnmatchedResponse { transaction_id } => {
                warn!(%transaction_id, "No transaction found for ID: {}", transaction_id);
            }
            Diagnostic::HandlerFailed {
                function_name,
                transaction_id,
                message,
            } => {
                warn!(%function_name, %transaction_id, "Route handler failed: {}", message);
            }
            Diagnostic::CallTimedOut {
                function_name,
                transaction_id,
                after,
            } => {
                warn!(%function_name, %transaction_id, "Call timed out after {:?}", after);
            }
            Diagnostic::SendDropped { reason } => {
                warn!(%reason, "Transport is not open, dropping message");
            }
            Diagnostic::CallsAbandoned { count, reason } => {
                warn!(count, %reason, "Abandoned {} pending call(s)", count);
            }
        }
    }
}

/// Records diagnostics in memory.
#[derive(Debug, Default)]
pub struct MemorySink {
    events: Mutex<Vec<Diagnostic>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    /// Everything emitted so far, in order.
    pub fn events(&self) -> Vec<Diagnostic> {
        self.events.lock().expect("diagnostics lock poisoned").clone()
    }

    pub fn len(&self) -> usize {
        self.events.lock().expect("diagnostics lock poisoned").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn clear(&self) {
        self.events.lock().expect("diagnostics lock poisoned").clear();
    }
}

impl DiagnosticsSink for MemorySink {
    fn emit(&self, diagnostic: &Diagnostic) {
        self.events
            .lock()
            .expect("diagnostics lock poisoned")
            .push(diagnostic.clone());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_memory_sink_records_in_order() {
        let sink = MemorySink::new();
        sink.emit(&Diagnostic::UnmatchedResponse {
            transaction_id: "a".into(),
        });
        sink.emit(&Diagnostic::SendDropped {
            reason: "closed".into(),
        });

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert!(matches!(events[0], Diagnostic::UnmatchedResponse { .. }));
        assert!(matches!(events[1], Diagnostic::SendDropped { .. }));

        sink.clear();
        assert!(sink.is_empty());
    }

    #[test]
    fn test_tracing_sink_does_not_panic_without_subscriber() {
        TracingSink.emit(&Diagnostic::MalformedPayload {
            reason: "bad".into(),
        });
    }
}

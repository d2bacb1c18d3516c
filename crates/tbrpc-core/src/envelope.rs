//! Wire envelopes and the text codec.
//!
//! Every tbrpc message is a JSON object tagged with `"type": "tBRPC"` and a
//! `messageType` discriminator:
//!
//! ```text
//! { "type": "tBRPC", "messageType": "request",  "functionName": "add", "args": [2, 3], "transactionId": "…" }
//! { "type": "tBRPC", "messageType": "response", "result": 5, "transactionId": "…" }
//! { "type": "tBRPC", "messageType": "response", "error": { "code": -32601, "message": "…" }, "transactionId": "…" }
//! ```
//!
//! Frames without the tag belong to someone else sharing the transport and
//! are ignored. Unknown fields are ignored as well.

use crate::config::ProtocolConfig;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "messageType", rename_all = "lowercase")]
pub enum Envelope {
    Request(RequestEnvelope),
    Response(ResponseEnvelope),
}

/// A call of a named route with positional arguments.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequestEnvelope {
    function_name: String,
    args: Vec<Value>,
    transaction_id: String,
}

impl RequestEnvelope {
    pub fn new(
        function_name: impl Into<String>,
        args: Vec<Value>,
        transaction_id: impl Into<String>,
    ) -> Self {
        Self {
            function_name: function_name.into(),
            args,
            transaction_id: transaction_id.into(),
        }
    }

    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    pub fn args(&self) -> &[Value] {
        &self.args
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn into_parts(self) -> (String, Vec<Value>, String) {
        (self.function_name, self.args, self.transaction_id)
    }
}

/// The answer to a request, carrying either a result or a failure payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    // An omitted `result` reads back as null.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<RemoteError>,
    transaction_id: String,
}

impl ResponseEnvelope {
    pub fn success(transaction_id: impl Into<String>, result: Value) -> Self {
        Self {
            result: Some(result),
            error: None,
            transaction_id: transaction_id.into(),
        }
    }

    pub fn failure(transaction_id: impl Into<String>, error: RemoteError) -> Self {
        Self {
            result: None,
            error: Some(error),
            transaction_id: transaction_id.into(),
        }
    }

    pub fn transaction_id(&self) -> &str {
        &self.transaction_id
    }

    pub fn is_failure(&self) -> bool {
        self.error.is_some()
    }

    /// Consume the envelope, yielding the transaction id and the call outcome.
    pub fn into_outcome(self) -> (String, std::result::Result<Value, RemoteError>) {
        let outcome = match self.error {
            Some(error) => Err(error),
            None => Ok(self.result.unwrap_or(Value::Null)),
        };
        (self.transaction_id, outcome)
    }
}

/// Structured failure payload sent back when a call cannot produce a value.
#[derive(Debug, Clone, PartialEq, Error, Serialize, Deserialize)]
#[error("{message} (code {code})")]
pub struct RemoteError {
    pub code: i32,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl RemoteError {
    pub fn new(code: i32, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            data: None,
        }
    }

    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    pub fn route_not_found(function_name: &str) -> Self {
        Self::new(
            ProtocolConfig::ROUTE_NOT_FOUND,
            format!("No route found for function: {}", function_name),
        )
    }

    pub fn invalid_arguments(message: impl Into<String>) -> Self {
        Self::new(ProtocolConfig::INVALID_ARGUMENTS, message)
    }

    pub fn handler_failed(message: impl Into<String>) -> Self {
        Self::new(ProtocolConfig::HANDLER_FAILED, message)
    }
}

/// Result of looking at one inbound text frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Parsed {
    /// A well-formed tbrpc envelope.
    Envelope(Envelope),
    /// Valid JSON that does not carry the protocol tag (or an unknown
    /// `messageType`). Not ours; ignored silently.
    Foreign,
    /// Invalid JSON, or a tagged object with the wrong shape.
    Malformed(String),
}

impl Parsed {
    /// The envelope, if the frame was one.
    pub fn envelope(self) -> Option<Envelope> {
        match self {
            Parsed::Envelope(envelope) => Some(envelope),
            _ => None,
        }
    }
}

/// Wire form: the protocol tag first, then the discriminated body.
#[derive(Serialize)]
struct Tagged<'a> {
    #[serde(rename = "type")]
    tag: &'static str,
    #[serde(flatten)]
    body: &'a Envelope,
}

/// Decode one text frame.
///
/// Never fails: anything that is not a tbrpc envelope comes back as
/// [`Parsed::Foreign`] or [`Parsed::Malformed`].
pub fn parse(raw: &str) -> Parsed {
    let value: Value = match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => return Parsed::Malformed(format!("invalid JSON: {}", e)),
    };

    let Some(object) = value.as_object() else {
        return Parsed::Foreign;
    };

    if object.get("type").and_then(Value::as_str) != Some(ProtocolConfig::PROTOCOL_TAG) {
        return Parsed::Foreign;
    }

    match object.get("messageType").and_then(Value::as_str) {
        Some(ProtocolConfig::REQUEST_KIND) | Some(ProtocolConfig::RESPONSE_KIND) => {}
        _ => return Parsed::Foreign,
    }

    match serde_json::from_value::<Envelope>(value) {
        Ok(envelope) => Parsed::Envelope(envelope),
        Err(e) => Parsed::Malformed(format!("invalid envelope: {}", e)),
    }
}

/// Encode an envelope to its JSON text form.
pub fn encode(envelope: &Envelope) -> String {
    let tagged = Tagged {
        tag: ProtocolConfig::PROTOCOL_TAG,
        body: envelope,
    };
    // Envelopes hold only strings and serde_json values; serialization cannot fail.
    serde_json::to_string(&tagged).unwrap_or_default()
}

/// Fresh transaction id: a random v4 UUID (122 bits of entropy).
pub fn new_transaction_id() -> String {
    uuid::Uuid::new_v4().to_string()
}

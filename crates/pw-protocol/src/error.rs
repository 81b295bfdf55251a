//! Protocol error types

use thiserror::Error;

/// Errors that can occur while decoding or verifying a message
#[derive(Error, Debug)]
pub enum ProtocolError {
    /// Response tag does not echo the request tag
    #[error("Request and response tags do not match: sent {expected}, got {actual:?}")]
    TagMismatch { expected: u32, actual: Option<u32> },

    /// The RPC call reached the client but did not succeed
    #[error("RPC method {method} failed: {result}")]
    Failed { method: String, result: String },

    /// The remote service answered with an explicit error
    #[error("Request rejected: {0}")]
    Rejected(String),

    /// The payload is not the expected shape
    #[error("Malformed response: {0}")]
    Malformed(String),

    /// JSON (de)serialization error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

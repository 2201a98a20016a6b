//! Layered error taxonomy for the client.
//!
//! Every subsystem owns its own `thiserror` enum; [`ClientError`] rolls
//! them up so callers can match on one type regardless of which layer
//! raised. Server errors are mapped from the JSON-RPC envelope by
//! [`map_jsonrpc_error`], following the same code/name/message cascade a
//! caller of the wire protocol is expected to implement.

use serde_json::Value;
use std::fmt;

use crate::batch::BatchError;
use crate::retry::RetryError;
use crate::transaction::TransactionError;

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("connection refused or unreachable: {0}")]
    Unreachable(String),
    #[error("request timed out after {0:?}")]
    Timeout(std::time::Duration),
    #[error("connection pool exhausted (max_connections reached)")]
    PoolExhausted,
    #[error("circuit breaker open, retry after {retry_after:?}")]
    CircuitOpen { retry_after: std::time::Duration },
    #[error("server returned non-2xx status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("transport is closed")]
    Closed,
    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl TransportError {
    /// Whether a retry policy should consider this error retryable by default.
    pub fn is_retryable(&self) -> bool {
        match self {
            TransportError::Unreachable(_) | TransportError::Timeout(_) | TransportError::PoolExhausted => true,
            TransportError::HttpStatus { status, .. } => {
                matches!(status, 429 | 500 | 502 | 503 | 504)
            }
            TransportError::Http(e) => e.is_timeout() || e.is_connect(),
            TransportError::CircuitOpen { .. } | TransportError::Closed => false,
        }
    }
}

#[derive(thiserror::Error, Debug)]
pub enum CacheError {
    #[error("cache backend error: {0}")]
    Backend(String),
    #[error("cache backend unavailable")]
    Unavailable,
}

/// Top-level error type returned by every public, fallible client method.
#[derive(thiserror::Error, Debug)]
pub enum ClientError {
    #[error(transparent)]
    Transport(#[from] TransportError),

    #[error(transparent)]
    Transaction(#[from] TransactionError),

    #[error(transparent)]
    Batch(#[from] BatchError),

    #[error(transparent)]
    Retry(#[from] RetryError),

    #[error(transparent)]
    Cache(#[from] CacheError),

    #[error("not authenticated: call login() before issuing model calls")]
    NotAuthenticated,

    #[error("authentication failed: {0}")]
    Authentication(String),

    #[error("access denied: {0}")]
    Access(String),

    #[error("validation failed: {message}{}", missing_fields_suffix(missing_fields))]
    Validation { message: String, missing_fields: Vec<String> },

    #[error("record not found: {0}")]
    Missing(String),

    #[error("method not found: {0}")]
    MethodNotFound(String),

    #[error("internal server error: {message}")]
    Internal { message: String, server_traceback: Option<String> },

    #[error("{0}")]
    Other(String),
}

/// Tagged error kind used by the retry engine's classification sets
/// (§4.5, §9 "every raise/catch maps to a tagged error kind"). Callers
/// match on this instead of reflecting on `ClientError`'s variants.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    Transport,
    Timeout,
    Authentication,
    Access,
    Validation,
    Missing,
    MethodNotFound,
    Internal,
    Transaction,
    Batch,
    Retry,
    Cache,
    Other,
}

fn missing_fields_suffix(fields: &[String]) -> String {
    if fields.is_empty() {
        String::new()
    } else {
        format!(" (missing fields: {})", fields.join(", "))
    }
}

impl ClientError {
    /// Whether this error is, by default, safe to retry (transport-kind
    /// retryable errors and retry-engine timeouts only; validation,
    /// access, and authentication failures are never retryable).
    pub fn is_retryable(&self) -> bool {
        match self {
            ClientError::Transport(t) => t.is_retryable(),
            _ => false,
        }
    }

    pub(crate) fn access(message: impl Into<String>) -> Self {
        ClientError::Access(enhance_access_message(&message.into()))
    }

    pub(crate) fn validation(message: impl Into<String>) -> Self {
        ClientError::Validation { message: message.into(), missing_fields: Vec::new() }
    }

    /// Classifies this error into the taxonomy kind used by retry
    /// policies and logging, without exposing internal variant shape.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ClientError::Transport(t) => match t {
                TransportError::Timeout(_) => ErrorKind::Timeout,
                _ => ErrorKind::Transport,
            },
            ClientError::Transaction(_) => ErrorKind::Transaction,
            ClientError::Batch(_) => ErrorKind::Batch,
            ClientError::Retry(_) => ErrorKind::Retry,
            ClientError::Cache(_) => ErrorKind::Cache,
            ClientError::NotAuthenticated | ClientError::Authentication(_) => ErrorKind::Authentication,
            ClientError::Access(_) => ErrorKind::Access,
            ClientError::Validation { .. } => ErrorKind::Validation,
            ClientError::Missing(_) => ErrorKind::Missing,
            ClientError::MethodNotFound(_) => ErrorKind::MethodNotFound,
            ClientError::Internal { .. } => ErrorKind::Internal,
            ClientError::Other(_) => ErrorKind::Other,
        }
    }
}

/// The `error` object of a JSON-RPC response envelope.
#[derive(Debug, Clone, serde::Deserialize)]
pub struct JsonRpcErrorObject {
    pub code: i64,
    pub message: String,
    #[serde(default)]
    pub data: Value,
}

/// Maps a JSON-RPC error envelope onto the taxonomy in the core spec (§7).
///
/// Standard JSON-RPC codes are mapped first; failing that, the server
/// exception `data.name` is inspected for well-known suffixes, and
/// failing *that* the message text is scanned for keywords. Unknown
/// shapes fall back to [`ClientError::Other`], preserving the original
/// message and any server traceback.
pub fn map_jsonrpc_error(error: &JsonRpcErrorObject) -> ClientError {
    match error.code {
        -32700 => return ClientError::validation(format!("parse error: {}", error.message)),
        -32600 => return ClientError::validation(format!("invalid request: {}", error.message)),
        -32602 => return ClientError::validation(format!("invalid params: {}", error.message)),
        -32601 => return ClientError::MethodNotFound(error.message.clone()),
        -32603 => {
            return ClientError::Internal {
                message: format!("internal error: {}", error.message),
                server_traceback: server_traceback(error),
            }
        }
        _ => {}
    }

    let name = error.data.get("name").and_then(Value::as_str).unwrap_or("");
    let traceback = server_traceback(error);

    if name.contains("AccessError") || name.contains("AccessDenied") {
        return ClientError::access(error.message.clone());
    }
    if name.contains("AuthenticationError") {
        return ClientError::Authentication(enhance_auth_message(&error.message));
    }
    if name.contains("MissingError") {
        return ClientError::Missing(format!(
            "record not found: {}",
            enhance_missing_message(&error.message)
        ));
    }
    if name.contains("IntegrityError") {
        return ClientError::validation(enhance_integrity_message(&error.message));
    }
    if name.contains("ValidationError") || name.contains("UserError") || name.contains("Warning") {
        return ClientError::validation(error.message.clone());
    }

    let lower = error.message.to_lowercase();
    if ["permission", "access denied", "forbidden"].iter().any(|k| lower.contains(k)) {
        return ClientError::access(error.message.clone());
    }
    if ["required", "constraint", "invalid"].iter().any(|k| lower.contains(k)) {
        return ClientError::validation(error.message.clone());
    }
    if ["foreign key", "referenced", "violates"].iter().any(|k| lower.contains(k)) {
        return ClientError::validation(enhance_integrity_message(&error.message));
    }

    let _ = traceback;
    ClientError::Other(error.message.clone())
}

fn server_traceback(error: &JsonRpcErrorObject) -> Option<String> {
    error.data.get("debug").and_then(Value::as_str).map(str::to_owned)
}

fn enhance_access_message(message: &str) -> String {
    if message.to_lowercase().contains("access") {
        format!(
            "{message}\n\nThis typically occurs when your user account lacks the required \
             permissions, the record is restricted by access rules, or you're trying to reach a \
             field with group restrictions. Contact your administrator to review access rights."
        )
    } else {
        message.to_string()
    }
}

fn enhance_auth_message(message: &str) -> String {
    format!(
        "{message}\n\nCheck that the username and password are correct, the account is active, \
         the database name is correct, and the session hasn't expired."
    )
}

fn enhance_missing_message(message: &str) -> String {
    format!(
        "{message}\n\nThe record may have been deleted, you may lack access to view it, or the \
         id may be incorrect."
    )
}

fn enhance_integrity_message(message: &str) -> String {
    if message.to_lowercase().contains("foreign key") {
        format!("{message}\n\nRemove references to this record before deleting it.")
    } else {
        message.to_string()
    }
}

impl fmt::Display for JsonRpcErrorObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}] {}", self.code, self.message)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn err(code: i64, message: &str, data: Value) -> JsonRpcErrorObject {
        JsonRpcErrorObject { code, message: message.to_string(), data }
    }

    #[test]
    fn maps_standard_codes() {
        assert!(matches!(
            map_jsonrpc_error(&err(-32601, "no such method", Value::Null)),
            ClientError::MethodNotFound(_)
        ));
        assert!(matches!(
            map_jsonrpc_error(&err(-32602, "bad params", Value::Null)),
            ClientError::Validation { .. }
        ));
    }

    #[test]
    fn maps_access_error_by_name() {
        let data = serde_json::json!({"name": "odoo.exceptions.AccessError", "debug": "trace"});
        assert!(matches!(map_jsonrpc_error(&err(1, "denied", data)), ClientError::Access(_)));
    }

    #[test]
    fn maps_missing_error_by_name() {
        let data = serde_json::json!({"name": "odoo.exceptions.MissingError"});
        match map_jsonrpc_error(&err(1, "gone", data)) {
            ClientError::Missing(m) => assert!(m.contains("record not found")),
            other => panic!("unexpected: {other:?}"),
        }
    }

    #[test]
    fn maps_by_message_keyword_when_name_absent() {
        assert!(matches!(
            map_jsonrpc_error(&err(1, "permission denied for model", Value::Null)),
            ClientError::Access(_)
        ));
        assert!(matches!(
            map_jsonrpc_error(&err(1, "value violates constraint", Value::Null)),
            ClientError::Validation { .. }
        ));
    }

    #[test]
    fn falls_back_to_other() {
        assert!(matches!(map_jsonrpc_error(&err(1, "whatever", Value::Null)), ClientError::Other(_)));
    }
}

//! Error types for the client library.

use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;

/// Error type for session operations.
///
/// Cloneable so that one connection failure can be handed to every caller
/// waiting on the same `connect()`.
#[derive(Error, Debug, Clone)]
pub enum Error {
    /// WebSocket transport error.
    #[error("WebSocket error: {0}")]
    WebSocket(Arc<tokio_tungstenite::tungstenite::Error>),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(Arc<serde_json::Error>),

    /// The endpoint could not be turned into a WebSocket request.
    #[error("Invalid endpoint: {0}")]
    InvalidEndpoint(String),

    /// No API key was configured.
    #[error("API key not set ({0})")]
    MissingApiKey(&'static str),

    /// Operation requires an open, authenticated connection.
    #[error("Client not connected")]
    NotConnected,

    /// Socket did not open in time.
    #[error("Connection timeout")]
    ConnectionTimeout,

    /// The server rejected the credential.
    #[error("Authentication failed: {0}")]
    Authentication(String),

    /// The server did not answer the auth frame in time.
    #[error("Authentication handshake timed out")]
    HandshakeTimeout,

    /// The connection closed before the session became ready.
    #[error("Connection closed: {0}")]
    ConnectionClosed(String),

    /// The caller closed the session.
    #[error("Client closed")]
    ClientClosed,

    /// No terminal frame arrived within the request's window.
    #[error("Request timeout after {0:?}")]
    RequestTimeout(Duration),

    /// The request was aborted by the caller.
    #[error("Request aborted")]
    Aborted,

    /// Server returned an error frame for a request.
    #[error("Server error: {message} (code: {code})")]
    Server {
        /// Error code from server.
        code: String,
        /// Error message from server.
        message: String,
    },

    /// The reconnect ceiling was reached.
    #[error("Gave up reconnecting after {0} attempts")]
    ReconnectExhausted(u32),

    /// Request payload has the wrong shape.
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl Error {
    /// Machine-readable error code.
    pub fn code(&self) -> &str {
        match self {
            Error::WebSocket(_) => "websocket",
            Error::Json(_) => "json",
            Error::InvalidEndpoint(_) => "invalid_endpoint",
            Error::MissingApiKey(_) => "missing_api_key",
            Error::NotConnected => "not_connected",
            Error::ConnectionTimeout => "connection_timeout",
            Error::Authentication(_) => "auth_failed",
            Error::HandshakeTimeout => "handshake_timeout",
            Error::ConnectionClosed(_) => "connection_closed",
            Error::ClientClosed => "client_closed",
            Error::RequestTimeout(_) => "request_timeout",
            Error::Aborted => "aborted",
            Error::Server { code, .. } => code,
            Error::ReconnectExhausted(_) => "reconnect_exhausted",
            Error::InvalidPayload(_) => "invalid_payload",
        }
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for Error {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        Error::WebSocket(Arc::new(e))
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Error::Json(Arc::new(e))
    }
}

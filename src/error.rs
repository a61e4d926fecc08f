//! Error types for the gateway

use thiserror::Error;

/// Gateway errors
#[derive(Error, Debug)]
pub enum GatewayError {
    #[error("WebSocket connection error: {0}")]
    WebSocketConnection(String),

    #[error("Failed to parse message: {0}")]
    ParseError(String),

    #[error("Not connected to upstream feed")]
    UpstreamNotConnected,

    #[error("Upstream request {0} timed out")]
    RequestTimeout(u64),

    #[error("Upstream request {0} abandoned: connection lost")]
    RequestAbandoned(u64),

    #[error("Upstream send timed out")]
    SendTimeout,

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Session {0} is closed")]
    SessionClosed(u64),

    #[error("Log root unavailable: {0}")]
    LogRoot(String),

    #[error("REST API error: {0}")]
    RestApiError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("Metrics error: {0}")]
    Metrics(String),

    #[error("Max reconnection attempts exceeded")]
    MaxReconnectAttemptsExceeded,
}

impl From<tokio_tungstenite::tungstenite::Error> for GatewayError {
    fn from(err: tokio_tungstenite::tungstenite::Error) -> Self {
        GatewayError::WebSocketConnection(err.to_string())
    }
}

impl From<serde_json::Error> for GatewayError {
    fn from(err: serde_json::Error) -> Self {
        GatewayError::ParseError(err.to_string())
    }
}

impl From<reqwest::Error> for GatewayError {
    fn from(err: reqwest::Error) -> Self {
        GatewayError::RestApiError(err.to_string())
    }
}

impl From<std::io::Error> for GatewayError {
    fn from(err: std::io::Error) -> Self {
        GatewayError::Io(err.to_string())
    }
}

impl From<prometheus::Error> for GatewayError {
    fn from(err: prometheus::Error) -> Self {
        GatewayError::Metrics(err.to_string())
    }
}

impl From<config::ConfigError> for GatewayError {
    fn from(err: config::ConfigError) -> Self {
        GatewayError::ConfigError(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;

//! Shared error types for the DRP mesh.

use thiserror::Error;

/// Top-level error type for mesh operations.
#[derive(Error, Debug)]
pub enum DrpError {
    /// Socket or filesystem failure.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// A frame or payload could not be (de)serialized.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// The peer sent something that is not a DRP frame.
    #[error("Protocol violation: {0}")]
    Protocol(String),

    /// The connection is closed; the frame was not written.
    #[error("Connection closed")]
    ConnectionClosed,

    /// No handler is registered under this command name.
    #[error("Endpoint does not have method '{0}'")]
    UnknownCommand(String),

    /// A command handler failed. The message is sent back as the reply payload.
    #[error("{0}")]
    Handler(String),

    /// The remote side answered with status 0.
    #[error("Remote error: {0}")]
    Remote(String),

    /// Required command parameters were missing or malformed.
    #[error("Invalid parameters: {0}")]
    InvalidParams(String),

    /// A provider is known but its connection never opened.
    #[error("Provider unavailable: {0}")]
    ProviderUnavailable(String),

    /// No provider in the directory offers the requested service.
    #[error("No provider for {0}")]
    NoProvider(String),

    /// A reply did not arrive within the configured TTL.
    #[error("Timed out waiting for reply")]
    Timeout,

    /// WebSocket or HTTP transport failure.
    #[error("Transport error: {0}")]
    Transport(String),

    /// Webhook delivery failed.
    #[error("Webhook error: {0}")]
    Webhook(String),

    /// A configuration error occurred.
    #[error("Configuration error: {0}")]
    Config(String),
}

impl DrpError {
    /// Shorthand for a handler failure with a formatted message.
    pub fn handler(msg: impl Into<String>) -> Self {
        DrpError::Handler(msg.into())
    }
}

/// Alias for `Result<T, DrpError>`.
pub type DrpResult<T> = Result<T, DrpError>;

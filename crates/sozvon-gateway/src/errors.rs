//! Gateway error types.

use thiserror::Error;

/// Gateway failures. None of them is fatal to the process.
#[derive(Debug, Error)]
pub enum GatewayError {
    /// A configured URL does not parse.
    #[error("invalid {what} URL '{url}': {reason}")]
    InvalidUrl {
        /// Which setting.
        what: &'static str,
        /// The offending value.
        url: String,
        /// Parser message.
        reason: String,
    },

    /// The relay refused or failed the WebSocket handshake.
    #[error("relay dial failed: {0}")]
    Dial(#[from] tokio_tungstenite::tungstenite::Error),

    /// The relay did not complete the handshake in time.
    #[error("relay dial timed out after {0:?}")]
    DialTimeout(std::time::Duration),

    /// An upstream HTTP request failed.
    #[error("upstream request failed: {0}")]
    Upstream(#[from] reqwest::Error),

    /// Building the HTTP client failed.
    #[error("http client: {0}")]
    Client(String),
}

/// Result alias for gateway operations.
pub type Result<T> = std::result::Result<T, GatewayError>;

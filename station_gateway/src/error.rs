//! Error types shared by drivers, channels, the orchestrator and the dispatcher.

use thiserror::Error;

/// Errors raised by the gateway core.
#[derive(Error, Debug)]
pub enum GatewayError {
    /// The driver could not establish or keep a session with the device.
    #[error("Connection error: {0}")]
    Connection(String),

    /// A buffer could not be decoded into the tag's declared type.
    #[error("Decode error for '{tag}': {message}")]
    Decode { tag: String, message: String },

    /// A merged S7 read failed as a whole.
    #[error("Batch read error: {0}")]
    Batch(String),

    /// Unknown tag identifier or channel.
    #[error("Not found: {0}")]
    NotFound(String),

    /// Data type / function code combination the driver cannot handle.
    #[error("Not supported: {0}")]
    NotSupported(String),

    /// Device answered with a non-zero status code.
    #[error("Protocol error {code}: {message}")]
    Protocol { code: i64, message: String },

    /// Tag/channel mapping or settings are inconsistent.
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// A caller-supplied value cannot be converted to the tag's type.
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// The component has been shut down and no longer accepts work.
    #[error("{0} is shut down")]
    Shutdown(&'static str),

    #[error("Timeout: {0}")]
    Timeout(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl GatewayError {
    pub fn decode(tag: impl Into<String>, message: impl Into<String>) -> Self {
        GatewayError::Decode {
            tag: tag.into(),
            message: message.into(),
        }
    }

    /// Errors after which the current session must be torn down and
    /// re-established on the next poll tick.
    pub fn is_connection_loss(&self) -> bool {
        matches!(
            self,
            GatewayError::Connection(_) | GatewayError::Io(_) | GatewayError::Timeout(_)
        )
    }
}

pub type GatewayResult<T> = Result<T, GatewayError>;

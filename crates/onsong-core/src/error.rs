use thiserror::Error;

/// Errors produced by the bridge protocol layer.
#[derive(Debug, Error)]
pub enum BridgeError {
    /// A required field is missing or malformed.
    #[error("validation error: {0}")]
    Validation(String),

    /// The caller did not present an identity or credential at all.
    #[error("missing credential: {0}")]
    MissingCredential(String),

    /// The caller presented an identity or credential that was rejected.
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// No matching response arrived before the request timer fired.
    #[error("timeout")]
    Timeout,

    /// The remote side reported a failed call.
    #[error("upstream failure: {0}")]
    Upstream(String),

    /// The connection carrying a pending request went away.
    #[error("disconnected: {0}")]
    Disconnected(String),

    /// A socket message could not be decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

impl BridgeError {
    /// Short machine-readable code included in every error response.
    pub fn code(&self) -> &'static str {
        match self {
            BridgeError::Validation(_) => "validation_error",
            BridgeError::MissingCredential(_) => "missing_credential",
            BridgeError::Unauthorized(_) => "unauthorized",
            BridgeError::Timeout => "upstream_timeout",
            BridgeError::Upstream(_) => "upstream_failure",
            BridgeError::Disconnected(_) => "agent_disconnected",
            BridgeError::Protocol(_) => "protocol_error",
            BridgeError::Transport(_) => "transport_error",
            BridgeError::Config(_) => "config_error",
            BridgeError::Io(_) => "io_error",
            BridgeError::Json(_) => "json_error",
            BridgeError::Other(_) => "internal_error",
        }
    }
}

pub type BridgeResult<T> = Result<T, BridgeError>;

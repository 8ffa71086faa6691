//! Application-wide error types.
//!
//! Failures are values with a kind and a human message; nothing is thrown
//! across a public boundary. `Error::code` is the wire code the API layer
//! puts in error envelopes.

use thiserror::Error;

/// Application-wide result type.
pub type Result<T> = std::result::Result<T, Error>;

/// Application-wide error type.
#[derive(Error, Debug)]
pub enum Error {
    #[error("Validation error: {0}")]
    Validation(String),

    #[error("{entity} not found: {id}")]
    NotFound { entity: String, id: String },

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("Payload too large: {0}")]
    PayloadTooLarge(String),

    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Plugin error: {0}")]
    Plugin(String),

    #[error("Transcode error: {0}")]
    Transcode(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("Service unavailable: {0}")]
    Unavailable(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(entity: impl Into<String>, id: impl Into<String>) -> Self {
        Self::NotFound {
            entity: entity.into(),
            id: id.into(),
        }
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn plugin(msg: impl Into<String>) -> Self {
        Self::Plugin(msg.into())
    }

    pub fn transcode(msg: impl Into<String>) -> Self {
        Self::Transcode(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    pub fn unavailable(msg: impl Into<String>) -> Self {
        Self::Unavailable(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }

    /// The stable wire code for this error kind.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Validation(_) => "validation_error",
            Self::NotFound { .. } => "not_found",
            Self::Conflict(_) => "conflict",
            Self::Unauthorized(_) => "unauthorized",
            Self::Forbidden(_) => "forbidden",
            Self::PayloadTooLarge(_) => "payload_too_large",
            Self::RateLimited(_) => "rate_limited",
            Self::Plugin(_) => "plugin_error",
            Self::Transcode(_) => "transcode_error",
            Self::Storage(_) | Self::Io(_) => "storage_error",
            Self::Unavailable(_) => "service_unavailable",
            Self::Serialization(_) | Self::Http(_) | Self::Internal(_) => "internal_error",
        }
    }
}

impl From<process_utils::ProcessError> for Error {
    fn from(err: process_utils::ProcessError) -> Self {
        use process_utils::ProcessError;
        match err {
            ProcessError::Spawn { .. } => Self::Plugin(err.to_string()),
            ProcessError::TimedOut { .. }
            | ProcessError::Cancelled { .. }
            | ProcessError::Exited { .. } => Self::Transcode(err.to_string()),
            ProcessError::Io { .. } => Self::Storage(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn codes_match_wire_taxonomy() {
        assert_eq!(Error::validation("x").code(), "validation_error");
        assert_eq!(Error::not_found("job", "j1").code(), "not_found");
        assert_eq!(Error::conflict("x").code(), "conflict");
        assert_eq!(Error::plugin("x").code(), "plugin_error");
        assert_eq!(Error::transcode("x").code(), "transcode_error");
        assert_eq!(Error::unavailable("x").code(), "service_unavailable");
        assert_eq!(Error::internal("x").code(), "internal_error");
    }

    #[test]
    fn not_found_message_names_entity_and_id() {
        let err = Error::not_found("channel", "ch-42");
        assert_eq!(err.to_string(), "channel not found: ch-42");
    }
}

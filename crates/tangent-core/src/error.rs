//! Error taxonomy for generation.
//!
//! Provider adapters normalize their failures into [`GenerationError`] before
//! yielding them through the chunk stream. The generation controller never
//! lets these escape to its caller: they are classified into an [`ErrorCode`]
//! and attached to the target message, so callers observe failure via message
//! state rather than exceptions. Cancellation is deliberately part of the enum
//! but maps to *no* error code: a stopped generation is not a failure.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Result type alias for generation paths.
pub type GenerationResult<T> = std::result::Result<T, GenerationError>;

/// A failure (or intentional stop) while producing one assistant message.
#[derive(Debug, Clone, Error)]
pub enum GenerationError {
    /// The provider could not be reached at all.
    #[error("network error: {0}")]
    Transport(String),

    /// The provider was reached but returned a non-success response.
    #[error("provider returned an error: {message}")]
    Api {
        status: Option<u16>,
        message: String,
    },

    /// A capability was requested that the active model does not support
    /// (vision, tool use, ...).
    #[error("model does not support {0}")]
    Capability(String),

    /// Generation was stopped intentionally. Not surfaced as a failure.
    #[error("generation cancelled")]
    Cancelled,

    /// Anything else, with the original message preserved.
    #[error("{0}")]
    Unknown(String),
}

impl GenerationError {
    /// Create a transport error.
    pub fn transport(message: impl Into<String>) -> Self {
        Self::Transport(message.into())
    }

    /// Create an API error.
    pub fn api(status: Option<u16>, message: impl Into<String>) -> Self {
        Self::Api {
            status,
            message: message.into(),
        }
    }

    /// Create a capability error.
    pub fn capability(feature: impl Into<String>) -> Self {
        Self::Capability(feature.into())
    }

    /// Create an unknown error.
    pub fn unknown(message: impl Into<String>) -> Self {
        Self::Unknown(message.into())
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Serializable classification stored on the failed message.
    /// `None` for cancellation, which must not look like an error in the UI.
    pub fn code(&self) -> Option<ErrorCode> {
        match self {
            Self::Transport(_) => Some(ErrorCode::NetworkError),
            Self::Api { .. } => Some(ErrorCode::ApiError),
            Self::Capability(_) => Some(ErrorCode::NotSupported),
            Self::Cancelled => None,
            Self::Unknown(_) => Some(ErrorCode::Unknown),
        }
    }
}

/// Classification persisted on a message's `error_code` field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorCode {
    NetworkError,
    ApiError,
    NotSupported,
    Unknown,
}

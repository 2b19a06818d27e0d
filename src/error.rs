//! Error types for the game engine.

use thiserror::Error;
use uuid::Uuid;

/// Errors raised by model drivers and game state.
///
/// Most of these never reach a player: the session client and scene
/// requester turn them into fallback text or "no image" outcomes.
#[derive(Error, Debug)]
pub enum GameError {
    /// HTTP request failed.
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// JSON serialization/deserialization error.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Model API returned an error response.
    #[error("API error ({status}): {message}")]
    Api {
        /// HTTP status code.
        status: u16,
        /// Error message from the API.
        message: String,
    },

    /// No API credential was configured.
    #[error("API credential missing")]
    MissingCredential,

    /// Model answered without any usable content.
    #[error("model returned an empty response")]
    EmptyResponse,

    /// Image payload could not be decoded.
    #[error("invalid image payload: {0}")]
    InvalidImage(String),

    /// Transcript has no message with this id.
    #[error("message not found: {0}")]
    MessageNotFound(Uuid),

    /// Stream broke mid-way.
    #[error("stream error: {0}")]
    Stream(String),
}

/// Result type alias for game operations.
pub type Result<T> = std::result::Result<T, GameError>;

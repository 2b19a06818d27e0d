//! Model drivers and the conversational session built on top of them.
//!
//! This module provides provider-agnostic abstractions for the two external
//! services the game talks to: a streaming text model that narrates the
//! adventure, and an image model that paints the current scene.
//!
//! # Overview
//!
//! The [`TextModel`] trait defines one-shot and streaming generation. The
//! [`SessionManager`] builds on top of a text model to keep a single
//! conversation alive across turns. [`ImageModel`] backs the scene
//! requester.
//!
//! # Drivers
//!
//! - [`GeminiDriver`]: Gemini `generateContent` / `streamGenerateContent`
//!   REST endpoints, for both text and images.
//! - [`mock::ScriptedModel`]: replays queued replies, no network.
//!
//! # Example
//!
//! ```rust,ignore
//! use phantom_terminal::llm::{GeminiDriver, ModelSettings, SessionManager};
//!
//! let driver = Arc::new(GeminiDriver::new(settings.clone()));
//! let sessions = SessionManager::new(driver, settings.generation());
//! let intro = sessions.start_session().await;
//! ```

pub mod gemini;
pub mod mock;
pub mod provider;
pub mod session;

pub use gemini::GeminiDriver;
pub use provider::Provider;
pub use session::{SessionManager, SessionState, TurnEvent, TurnFault, TurnOutcome, TurnStream};

use std::pin::Pin;

use futures::Stream;
use serde::{Deserialize, Serialize};

use crate::error::Result;

/// Model connection settings.
#[derive(Clone)]
pub struct ModelSettings {
    /// Base URL for the model API (e.g., `https://generativelanguage.googleapis.com`).
    pub base_url: String,
    /// API credential. `None` puts the game in degraded mode.
    pub api_key: Option<String>,
    /// Model used for narration.
    pub text_model: String,
    /// Model used for scene images.
    pub image_model: String,
    /// Sampling temperature for narration.
    pub temperature: f32,
    /// Output length cap per reply.
    pub max_output_tokens: u32,
    /// Provider type (detected from `base_url`).
    pub provider: Provider,
}

impl std::fmt::Debug for ModelSettings {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ModelSettings")
            .field("base_url", &self.base_url)
            .field("api_key", &self.api_key.as_ref().map(|_| "<redacted>"))
            .field("text_model", &self.text_model)
            .field("image_model", &self.image_model)
            .field("temperature", &self.temperature)
            .field("max_output_tokens", &self.max_output_tokens)
            .field("provider", &self.provider)
            .finish()
    }
}

impl ModelSettings {
    /// Generation parameters derived from these settings.
    #[must_use]
    pub fn generation(&self) -> GenerationConfig {
        GenerationConfig {
            temperature: self.temperature,
            max_output_tokens: self.max_output_tokens,
        }
    }
}

/// Sampling parameters sent with every text request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GenerationConfig {
    pub temperature: f32,
    pub max_output_tokens: u32,
}

impl Default for GenerationConfig {
    fn default() -> Self {
        Self {
            temperature: 0.7,
            max_output_tokens: 500,
        }
    }
}

/// Author of a [`Content`] entry in the model history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContentRole {
    /// Player (or priming) input.
    User,
    /// Model reply.
    Model,
}

/// One entry of the conversation history as the model sees it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Content {
    pub role: ContentRole,
    pub parts: Vec<Part>,
}

impl Content {
    /// Text-only user content.
    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self {
            role: ContentRole::User,
            parts: vec![Part::text(text)],
        }
    }

    /// Text-only model content.
    #[must_use]
    pub fn model(text: impl Into<String>) -> Self {
        Self {
            role: ContentRole::Model,
            parts: vec![Part::text(text)],
        }
    }

    /// Concatenated text of all text parts.
    #[must_use]
    pub fn text(&self) -> String {
        self.parts.iter().filter_map(Part::as_text).collect()
    }
}

/// A content part: plain text or inline binary data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Part {
    Text {
        text: String,
    },
    InlineData {
        #[serde(rename = "inlineData")]
        inline_data: InlineImage,
    },
}

impl Part {
    #[must_use]
    pub fn text(s: impl Into<String>) -> Self {
        Self::Text { text: s.into() }
    }

    #[must_use]
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Self::Text { text } => Some(text),
            Self::InlineData { .. } => None,
        }
    }
}

/// Inline image payload (base64 data plus MIME type).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InlineImage {
    #[serde(default = "default_image_mime")]
    pub mime_type: String,
    pub data: String,
}

fn default_image_mime() -> String {
    "image/png".to_string()
}

impl InlineImage {
    /// Render as a `data:` URI.
    #[must_use]
    pub fn to_data_uri(&self) -> String {
        format!("data:{};base64,{}", self.mime_type, self.data)
    }
}

/// Request to a text model.
#[derive(Debug, Clone)]
pub struct TextRequest {
    /// Persona and formatting rules.
    pub system_instruction: Option<String>,
    /// History followed by the new user content.
    pub contents: Vec<Content>,
    pub generation: GenerationConfig,
}

/// Stream of text fragments from a model.
pub type TextStream = Pin<Box<dyn Stream<Item = Result<String>> + Send>>;

/// Trait for text generation drivers.
#[async_trait::async_trait]
pub trait TextModel: Send + Sync {
    /// Whether a credential is available. Unconfigured models are never called.
    fn is_configured(&self) -> bool {
        true
    }

    /// Generate a complete reply.
    ///
    /// # Errors
    ///
    /// Returns an error if the request fails or the reply cannot be parsed.
    async fn generate(&self, req: TextRequest) -> Result<String>;

    /// Stream a reply as text fragments.
    ///
    /// # Errors
    ///
    /// Returns an error if the request cannot be started. Faults after the
    /// first byte arrive as `Err` items on the stream.
    async fn stream(&self, req: TextRequest) -> Result<TextStream>;
}

/// Trait for image generation drivers.
#[async_trait::async_trait]
pub trait ImageModel: Send + Sync {
    /// Generate at most one image for the prompt.
    ///
    /// `Ok(None)` means the model answered without an image.
    async fn generate_image(&self, prompt: &str) -> Result<Option<InlineImage>>;
}

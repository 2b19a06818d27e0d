//! Phantom Terminal
//!
//! A retro text-adventure front-end: player input is relayed to a hosted
//! Gemini model that narrates the game, replies stream into a simulated
//! 1988 terminal, and substantial replies are illustrated with generated
//! pixel-art scenes.
//!
//! # Architecture
//!
//! - **Server**: Axum HTTP server, JSON commands plus an SSE event stream
//! - **LLM**: Gemini REST driver and the single narrator session
//! - **Shell**: boot/playing flow, local commands, turn orchestration
//! - **Transcript**: the in-memory conversation shown on screen
//!
//! # Modules
//!
//! - [`llm`]: model traits, the Gemini driver and [`llm::SessionManager`]
//! - [`scene`]: scene image requests and the scene slot
//! - [`transcript`]: the conversation store
//! - [`shell`]: the game shell
//! - [`effects`]: ambient sound cues
//! - [`events`]: events pushed to the page
//! - [`ui`]: the terminal page

// Allow pedantic clippy warnings that don't add value for this codebase
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::missing_fields_in_debug)]
#![allow(clippy::match_same_arms)]
#![allow(clippy::cargo_common_metadata)]
#![allow(clippy::multiple_crate_versions)]
#![allow(clippy::unused_async)]

pub mod config;
pub mod effects;
pub mod error;
pub mod events;
pub mod llm;
pub mod scene;
pub mod server;
pub mod shell;
pub mod transcript;
pub mod ui;

use std::sync::Arc;

use crate::config::AppConfig;
use crate::events::EventBus;
use crate::llm::{GeminiDriver, ImageModel, ModelSettings, SessionManager, TextModel};
use crate::scene::SceneRequester;
use crate::shell::GameShell;

/// Application state shared across all handlers.
#[derive(Clone, Debug)]
pub struct AppState {
    /// The one running game.
    pub shell: GameShell,
    /// Global Configuration
    pub config: Arc<AppConfig>,
}

impl AppState {
    /// Wire a game against the Gemini driver.
    #[must_use]
    pub fn new(config: Arc<AppConfig>, settings: ModelSettings) -> Self {
        let driver = Arc::new(GeminiDriver::new(settings));
        Self::with_models(config, Arc::clone(&driver) as Arc<dyn TextModel>, driver)
    }

    /// Wire a game against arbitrary models.
    #[must_use]
    pub fn with_models(
        config: Arc<AppConfig>,
        text: Arc<dyn TextModel>,
        image: Arc<dyn ImageModel>,
    ) -> Self {
        let generation = llm::GenerationConfig {
            temperature: config.model.temperature,
            max_output_tokens: config.model.max_output_tokens,
        };
        let shell = GameShell::new(
            SessionManager::new(text, generation),
            SceneRequester::new(image),
            config.game.clone(),
            EventBus::new(),
        );
        Self { shell, config }
    }
}

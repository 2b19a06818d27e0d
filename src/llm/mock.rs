//! Scripted in-process models.
//!
//! Test support: [`ScriptedModel`] plays back queued replies instead of
//! calling a provider. No configuration selects it; suites wire it in
//! through `AppState::with_models` or `GameShell::new`.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex, PoisonError};

use tokio::sync::Notify;

use crate::error::{GameError, Result};

use super::{ImageModel, InlineImage, TextModel, TextRequest, TextStream};

/// One streamed item of a scripted turn.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Step {
    /// A text fragment.
    Text(String),
    /// A transport fault; the stream ends after it.
    Fault(String),
}

/// How a scripted `stream` call behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnScript {
    /// The stream opens and plays the steps in order.
    Open(Vec<Step>),
    /// The request fails before any fragment.
    Refuse(String),
}

/// How a scripted image call behaves.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageScript {
    Image(InlineImage),
    Nothing,
    Fail(String),
}

/// Text and image model that replays queued scripts.
#[derive(Debug, Default)]
pub struct ScriptedModel {
    unconfigured: bool,
    replies: Mutex<VecDeque<std::result::Result<String, String>>>,
    turns: Mutex<VecDeque<TurnScript>>,
    images: Mutex<VecDeque<ImageScript>>,
    requests: Mutex<Vec<TextRequest>>,
    image_prompts: Mutex<Vec<String>>,
    hold: Option<Arc<Notify>>,
    hold_reply: Option<Arc<Notify>>,
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

impl ScriptedModel {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// A model without credentials: `is_configured` reports `false`.
    #[must_use]
    pub fn unconfigured() -> Self {
        Self {
            unconfigured: true,
            ..Self::default()
        }
    }

    /// Make every `stream` call wait for a permit on `gate` first.
    #[must_use]
    pub fn held_by(mut self, gate: Arc<Notify>) -> Self {
        self.hold = Some(gate);
        self
    }

    /// Make every `generate` call wait for a permit on `gate` first.
    #[must_use]
    pub fn reply_held_by(mut self, gate: Arc<Notify>) -> Self {
        self.hold_reply = Some(gate);
        self
    }

    #[must_use]
    pub fn with_reply(self, text: impl Into<String>) -> Self {
        lock(&self.replies).push_back(Ok(text.into()));
        self
    }

    #[must_use]
    pub fn with_failed_reply(self, reason: impl Into<String>) -> Self {
        lock(&self.replies).push_back(Err(reason.into()));
        self
    }

    /// Queue a turn that streams `fragments` and ends cleanly.
    #[must_use]
    pub fn with_turn<I, S>(self, fragments: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let steps = fragments.into_iter().map(|s| Step::Text(s.into())).collect();
        self.with_script(TurnScript::Open(steps))
    }

    #[must_use]
    pub fn with_script(self, script: TurnScript) -> Self {
        lock(&self.turns).push_back(script);
        self
    }

    #[must_use]
    pub fn with_image(self, script: ImageScript) -> Self {
        lock(&self.images).push_back(script);
        self
    }

    /// Every text request received so far.
    #[must_use]
    pub fn requests(&self) -> Vec<TextRequest> {
        lock(&self.requests).clone()
    }

    /// Every image prompt received so far.
    #[must_use]
    pub fn image_prompts(&self) -> Vec<String> {
        lock(&self.image_prompts).clone()
    }
}

#[async_trait::async_trait]
impl TextModel for ScriptedModel {
    fn is_configured(&self) -> bool {
        !self.unconfigured
    }

    async fn generate(&self, req: TextRequest) -> Result<String> {
        lock(&self.requests).push(req);
        if let Some(gate) = &self.hold_reply {
            gate.notified().await;
        }
        let next = lock(&self.replies).pop_front();
        match next {
            Some(Ok(text)) => Ok(text),
            Some(Err(reason)) => Err(GameError::Stream(reason)),
            None => Err(GameError::EmptyResponse),
        }
    }

    async fn stream(&self, req: TextRequest) -> Result<TextStream> {
        lock(&self.requests).push(req);
        if let Some(gate) = &self.hold {
            gate.notified().await;
        }

        let script = lock(&self.turns).pop_front();
        let steps = match script {
            Some(TurnScript::Open(steps)) => steps,
            Some(TurnScript::Refuse(reason)) => return Err(GameError::Stream(reason)),
            None => Vec::new(),
        };

        let items = steps.into_iter().map(|step| match step {
            Step::Text(text) => Ok(text),
            Step::Fault(reason) => Err(GameError::Stream(reason)),
        });
        Ok(Box::pin(futures::stream::iter(items)))
    }
}

#[async_trait::async_trait]
impl ImageModel for ScriptedModel {
    async fn generate_image(&self, prompt: &str) -> Result<Option<InlineImage>> {
        lock(&self.image_prompts).push(prompt.to_string());
        let next = lock(&self.images).pop_front();
        match next {
            Some(ImageScript::Image(image)) => Ok(Some(image)),
            Some(ImageScript::Fail(reason)) => Err(GameError::Stream(reason)),
            Some(ImageScript::Nothing) | None => Ok(None),
        }
    }
}

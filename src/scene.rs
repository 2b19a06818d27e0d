//! Scene images: one pixel-art picture of the current narrative moment.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::{GameError, Result};
use crate::llm::{ImageModel, InlineImage};

/// Style prompt wrapped around the narration.
#[must_use]
pub fn scene_prompt(description: &str) -> String {
    format!(
        "Create a retro 8-bit pixel art scene based on this description (Note: description is in Chinese): \"{description}\". \
         Style: 1990s adventure game, limited color palette, dithering, low resolution aesthetic. \
         Do not include text in the image. Return only the image."
    )
}

/// Requests scene images from an image model.
///
/// Stateless: every call is independent, nothing is retried or cached.
#[derive(Clone)]
pub struct SceneRequester {
    model: Arc<dyn ImageModel>,
}

impl std::fmt::Debug for SceneRequester {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SceneRequester").finish_non_exhaustive()
    }
}

impl SceneRequester {
    #[must_use]
    pub fn new(model: Arc<dyn ImageModel>) -> Self {
        Self { model }
    }

    /// Render `description` as a `data:` URI, or `None` on any fault.
    pub async fn request_scene(&self, description: &str) -> Option<String> {
        match self.try_request(description).await {
            Ok(uri) => {
                info!(name: "scene.generated", bytes = uri.len(), "Scene image generated");
                Some(uri)
            }
            Err(GameError::MissingCredential) => {
                debug!("No credential, skipping scene image");
                None
            }
            Err(e) => {
                warn!(name: "scene.failed", error = %e, "Failed to generate scene image");
                None
            }
        }
    }

    async fn try_request(&self, description: &str) -> Result<String> {
        let image = self
            .model
            .generate_image(&scene_prompt(description))
            .await?
            .ok_or(GameError::EmptyResponse)?;
        validate(&image)?;
        Ok(image.to_data_uri())
    }
}

fn validate(image: &InlineImage) -> Result<()> {
    if !image.mime_type.starts_with("image/") {
        return Err(GameError::InvalidImage(format!(
            "unexpected mime type {}",
            image.mime_type
        )));
    }
    let bytes = BASE64
        .decode(image.data.as_bytes())
        .map_err(|e| GameError::InvalidImage(e.to_string()))?;
    if bytes.is_empty() {
        return Err(GameError::InvalidImage("empty payload".to_string()));
    }
    Ok(())
}

/// Sequence number handed out per scene request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Ticket(u64);

/// The displayed scene and the request that produced it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SceneImage {
    pub data_uri: String,
    pub sequence: u64,
}

/// Holder of the current scene.
///
/// Results are applied only when they answer the newest request issued,
/// so a slow, stale response can never replace a fresher picture.
#[derive(Debug, Clone, Default)]
pub struct SceneSlot {
    inner: Arc<Mutex<SlotInner>>,
}

#[derive(Debug, Default)]
struct SlotInner {
    issued: u64,
    current: Option<SceneImage>,
}

impl SceneSlot {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, SlotInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Issue the ticket for a new request.
    pub fn issue(&self) -> Ticket {
        let mut inner = self.lock();
        inner.issued += 1;
        Ticket(inner.issued)
    }

    /// Store `data_uri` if `ticket` is still the newest. Returns whether it was applied.
    pub fn apply(&self, ticket: Ticket, data_uri: String) -> bool {
        let mut inner = self.lock();
        if ticket.0 != inner.issued {
            debug!(ticket = ticket.0, latest = inner.issued, "Discarding stale scene");
            return false;
        }
        inner.current = Some(SceneImage {
            data_uri,
            sequence: ticket.0,
        });
        true
    }

    #[must_use]
    pub fn current(&self) -> Option<SceneImage> {
        self.lock().current.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::mock::{ImageScript, ScriptedModel};

    fn png() -> InlineImage {
        InlineImage {
            mime_type: "image/png".to_string(),
            data: BASE64.encode(b"\x89PNG fake"),
        }
    }

    #[test]
    fn test_prompt_embeds_description() {
        let prompt = scene_prompt("潮湿的走廊");
        assert!(prompt.contains("\"潮湿的走廊\""));
        assert!(prompt.contains("pixel art"));
    }

    #[tokio::test]
    async fn test_request_returns_data_uri() {
        let model = Arc::new(ScriptedModel::new().with_image(ImageScript::Image(png())));
        let requester = SceneRequester::new(Arc::clone(&model) as Arc<dyn ImageModel>);

        let uri = requester.request_scene("钢门").await.unwrap();

        assert!(uri.starts_with("data:image/png;base64,"));
        assert_eq!(model.image_prompts(), vec![scene_prompt("钢门")]);
    }

    #[tokio::test]
    async fn test_faults_become_none() {
        let broken = InlineImage {
            mime_type: "image/png".to_string(),
            data: "not base64!!".to_string(),
        };
        let model = Arc::new(
            ScriptedModel::new()
                .with_image(ImageScript::Nothing)
                .with_image(ImageScript::Fail("500".into()))
                .with_image(ImageScript::Image(broken)),
        );
        let requester = SceneRequester::new(model);

        for _ in 0..3 {
            assert!(requester.request_scene("x").await.is_none());
        }
    }

    #[test]
    fn test_slot_applies_latest_ticket() {
        let slot = SceneSlot::new();
        let t1 = slot.issue();
        assert!(slot.apply(t1, "data:a".into()));
        assert_eq!(slot.current().unwrap().data_uri, "data:a");
    }

    #[test]
    fn test_slot_discards_stale_results() {
        let slot = SceneSlot::new();
        let old = slot.issue();
        let new = slot.issue();

        assert!(slot.apply(new, "data:new".into()));
        assert!(!slot.apply(old, "data:old".into()));

        let current = slot.current().unwrap();
        assert_eq!(current.data_uri, "data:new");
        assert_eq!(current.sequence, 2);
    }

    #[test]
    fn test_slot_keeps_image_when_newer_request_pending() {
        let slot = SceneSlot::new();
        let first = slot.issue();
        assert!(slot.apply(first, "data:first".into()));

        let _pending = slot.issue();
        assert!(!slot.apply(first, "data:again".into()));
        assert_eq!(slot.current().unwrap().data_uri, "data:first");
    }
}

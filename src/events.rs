//! Game events pushed to the terminal page.
//!
//! Every observable change to the game (transcript, theme, phase, scene,
//! ambient effects) is published as a [`GameEvent`] on an [`EventBus`] and
//! forwarded to browsers as Server-Sent Events.
//!
//! # Example
//!
//! ```rust
//! use phantom_terminal::events::{GameEvent, sse_event};
//!
//! let event = GameEvent::TranscriptCleared;
//! let sse = sse_event(&event);
//! assert!(sse.starts_with("event: transcript.cleared\n"));
//! ```

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

use crate::effects::Effect;
use crate::shell::{Phase, Theme};
use crate::transcript::Message;

/// Events older than this are dropped for slow subscribers.
const BUS_CAPACITY: usize = 256;

/// Events emitted by the game shell.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", content = "data")]
pub enum GameEvent {
    // ─────────────────────────────────────────────────────────────────────
    // Transcript
    // ─────────────────────────────────────────────────────────────────────
    /// A new line was added.
    #[serde(rename = "message.appended")]
    MessageAppended(Message),

    /// A line's text or typing flag changed.
    #[serde(rename = "message.updated")]
    MessageUpdated {
        id: Uuid,
        text: String,
        typing: bool,
    },

    #[serde(rename = "transcript.cleared")]
    TranscriptCleared,

    // ─────────────────────────────────────────────────────────────────────
    // Shell state
    // ─────────────────────────────────────────────────────────────────────
    #[serde(rename = "phase.changed")]
    PhaseChanged { phase: Phase },

    #[serde(rename = "theme.changed")]
    ThemeChanged { theme: Theme },

    /// Input is locked while a turn is in flight.
    #[serde(rename = "processing.changed")]
    ProcessingChanged { processing: bool },

    #[serde(rename = "scene.updated")]
    SceneUpdated { data_uri: String },

    // ─────────────────────────────────────────────────────────────────────
    // Ambient
    // ─────────────────────────────────────────────────────────────────────
    #[serde(rename = "effect")]
    Effect { effect: Effect },
}

/// Get the SSE event name for a [`GameEvent`].
pub fn event_name(evt: &GameEvent) -> &'static str {
    match evt {
        GameEvent::MessageAppended(_) => "message.appended",
        GameEvent::MessageUpdated { .. } => "message.updated",
        GameEvent::TranscriptCleared => "transcript.cleared",
        GameEvent::PhaseChanged { .. } => "phase.changed",
        GameEvent::ThemeChanged { .. } => "theme.changed",
        GameEvent::ProcessingChanged { .. } => "processing.changed",
        GameEvent::SceneUpdated { .. } => "scene.updated",
        GameEvent::Effect { .. } => "effect",
    }
}

/// Convert a [`GameEvent`] to an SSE-formatted string.
///
/// The output carries an `event:` line for `EventSource` listeners and a
/// `data:` line with the JSON payload.
pub fn sse_event(evt: &GameEvent) -> String {
    let json = serde_json::to_string(evt).unwrap_or_else(|e| {
        serde_json::json!({ "type": "error", "data": { "message": e.to_string() } }).to_string()
    });

    let event_name = event_name(evt);

    format!("event: {event_name}\ndata: {json}\n\n")
}

/// Broadcast channel for [`GameEvent`]s.
///
/// Publishing never blocks and never fails; with no subscribers the event
/// is simply dropped.
#[derive(Debug, Clone)]
pub struct EventBus {
    tx: broadcast::Sender<GameEvent>,
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

impl EventBus {
    #[must_use]
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(BUS_CAPACITY);
        Self { tx }
    }

    pub fn publish(&self, event: GameEvent) {
        tracing::trace!(event = event_name(&event), "Publishing game event");
        let _ = self.tx.send(event);
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.tx.subscribe()
    }
}

//! Ambient effects: fire-and-forget sound cues for the terminal page.
//!
//! The server only decides *which* cue fires; the page synthesizes the
//! sound. Cues are dropped until the effects are armed by the first user
//! interaction (browsers refuse to start audio earlier) and while muted.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::Serialize;

use crate::events::{EventBus, GameEvent};

/// A sound cue.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Effect {
    /// A boot line appeared.
    BootLine,
    /// Power-on chord when the game starts.
    BootSound,
    /// Start the background loop.
    StartMusic,
    /// Player pressed a key.
    Keystroke,
    /// Player submitted a command.
    Enter,
    /// A piece of narration arrived.
    Blip,
}

/// Effect trigger shared by the shell and the HTTP layer.
#[derive(Debug, Clone)]
pub struct Effects {
    bus: EventBus,
    state: Arc<EffectState>,
}

#[derive(Debug, Default)]
struct EffectState {
    armed: AtomicBool,
    muted: AtomicBool,
}

impl Effects {
    #[must_use]
    pub fn new(bus: EventBus) -> Self {
        Self {
            bus,
            state: Arc::default(),
        }
    }

    /// Allow cues to fire. Idempotent.
    pub fn arm(&self) {
        self.state.armed.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_armed(&self) -> bool {
        self.state.armed.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_muted(&self) -> bool {
        self.state.muted.load(Ordering::Acquire)
    }

    /// Flip mute and return the new value.
    pub fn toggle_mute(&self) -> bool {
        let muted = !self.state.muted.fetch_xor(true, Ordering::AcqRel);
        tracing::info!(name: "effects.mute", muted, "Ambient sound toggled");
        muted
    }

    /// Fire a cue. Dropped silently when unarmed or muted.
    pub fn trigger(&self, effect: Effect) {
        if !self.is_armed() || self.is_muted() {
            return;
        }
        self.bus.publish(GameEvent::Effect { effect });
    }
}

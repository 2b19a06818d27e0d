//! Conversation store: the ordered transcript shown in the terminal.

use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::watch;
use uuid::Uuid;

use crate::error::{GameError, Result};

/// Who a transcript line belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Sender {
    /// Player input.
    User,
    /// Boot lines and error notices.
    System,
    /// Narrator output.
    Ai,
}

/// A single transcript line.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct Message {
    pub id: Uuid,
    pub sender: Sender,
    pub text: String,
    /// Set while the narrator is still streaming into this line.
    pub typing: bool,
    pub created_at: DateTime<Utc>,
}

impl Message {
    #[must_use]
    pub fn new(sender: Sender, text: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            sender,
            text: text.into(),
            typing: false,
            created_at: Utc::now(),
        }
    }

    #[must_use]
    pub fn user(text: impl Into<String>) -> Self {
        Self::new(Sender::User, text)
    }

    #[must_use]
    pub fn system(text: impl Into<String>) -> Self {
        Self::new(Sender::System, text)
    }

    #[must_use]
    pub fn ai(text: impl Into<String>) -> Self {
        Self::new(Sender::Ai, text)
    }

    /// Empty narrator line that a turn will stream into.
    #[must_use]
    pub fn pending_ai() -> Self {
        Self {
            typing: true,
            ..Self::ai("")
        }
    }
}

/// Ordered, in-memory transcript.
///
/// Cloning the store yields another handle to the same transcript. Every
/// mutation bumps a revision counter that renderers can watch.
#[derive(Debug, Clone)]
pub struct ConversationStore {
    inner: Arc<StoreInner>,
}

#[derive(Debug)]
struct StoreInner {
    messages: RwLock<Vec<Message>>,
    revision: watch::Sender<u64>,
}

impl Default for ConversationStore {
    fn default() -> Self {
        Self::new()
    }
}

impl ConversationStore {
    #[must_use]
    pub fn new() -> Self {
        let (revision, _) = watch::channel(0);
        Self {
            inner: Arc::new(StoreInner {
                messages: RwLock::new(Vec::new()),
                revision,
            }),
        }
    }

    fn read(&self) -> RwLockReadGuard<'_, Vec<Message>> {
        self.inner
            .messages
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, Vec<Message>> {
        self.inner
            .messages
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn bump(&self) {
        self.inner.revision.send_modify(|r| *r += 1);
    }

    /// Append a message and return its id.
    pub fn append(&self, message: Message) -> Uuid {
        let id = message.id;
        self.write().push(message);
        self.bump();
        id
    }

    /// Replace the text of the message with `id`.
    pub fn update_text(&self, id: Uuid, text: impl Into<String>) -> Result<()> {
        let mut guard = self.write();
        let message = guard
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(GameError::MessageNotFound(id))?;
        message.text = text.into();
        drop(guard);
        self.bump();
        Ok(())
    }

    /// Set or clear the typing flag of the message with `id`.
    pub fn set_typing(&self, id: Uuid, typing: bool) -> Result<()> {
        let mut guard = self.write();
        let message = guard
            .iter_mut()
            .find(|m| m.id == id)
            .ok_or(GameError::MessageNotFound(id))?;
        message.typing = typing;
        drop(guard);
        self.bump();
        Ok(())
    }

    /// Remove every message.
    pub fn clear(&self) {
        self.write().clear();
        self.bump();
    }

    /// Copy of the whole transcript.
    #[must_use]
    pub fn snapshot(&self) -> Vec<Message> {
        self.read().clone()
    }

    #[must_use]
    pub fn get(&self, id: Uuid) -> Option<Message> {
        self.read().iter().find(|m| m.id == id).cloned()
    }

    #[must_use]
    pub fn last(&self) -> Option<Message> {
        self.read().last().cloned()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.read().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Watch the revision counter; it changes after every mutation.
    #[must_use]
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.inner.revision.subscribe()
    }

    #[must_use]
    pub fn revision(&self) -> u64 {
        *self.inner.revision.borrow()
    }
}

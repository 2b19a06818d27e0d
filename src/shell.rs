//! Presentation shell: the two-phase game flow behind the terminal page.
//!
//! The shell starts in [`Phase::Boot`], replays the scripted boot lines and
//! waits for the first user interaction. [`GameShell::start`] opens the
//! model session and moves to [`Phase::Playing`], where each submitted line
//! is either a local command (theme, clear, mute) or a player action that
//! is relayed to the narrator as one streamed turn.
//!
//! All state lives here and in the [`ConversationStore`]; every change is
//! published on the [`EventBus`] so connected pages can re-render.

use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, PoisonError, RwLock};
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use futures::StreamExt;
use rand::Rng;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{broadcast, watch};
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::config::GameConfig;
use crate::effects::{Effect, Effects};
use crate::error::{GameError, Result};
use crate::events::{EventBus, GameEvent};
use crate::llm::{SessionManager, SessionState, TurnEvent, TurnOutcome};
use crate::scene::{SceneImage, SceneRequester, SceneSlot};
use crate::transcript::{ConversationStore, Message};

/// Lines shown while the terminal "boots".
pub const BOOT_SEQUENCE: [&str; 6] = [
    "BIOS 日期 01/01/1988 14:22:56 版本 2.0",
    "CPU检测: NEC V20, 频率: 8 MHz",
    "系统内核: 幻境OS (Phantom OS) v1.0",
    "加载音频驱动... 正常",
    "加载图形适配器... 正常",
    "连接至幻境终端... 成功",
];

/// SYSTEM line appended when a turn fails outside the narrator stream.
pub const LINK_LOST_TEXT: &str = "错误：链接丢失。";

// ─────────────────────────────────────────────────────────────────────────────
// Phase, theme and commands
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Phase {
    Boot,
    Playing,
}

/// Terminal color scheme.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Theme {
    #[default]
    Green,
    Amber,
    Cyan,
}

impl Theme {
    pub const ALL: [Theme; 3] = [Theme::Green, Theme::Amber, Theme::Cyan];

    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Theme::Green => "green",
            Theme::Amber => "amber",
            Theme::Cyan => "cyan",
        }
    }
}

impl fmt::Display for Theme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown theme: {0}")]
pub struct UnknownTheme(pub String);

impl FromStr for Theme {
    type Err = UnknownTheme;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        Theme::ALL
            .into_iter()
            .find(|t| t.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| UnknownTheme(s.to_string()))
    }
}

/// A parsed input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Blank line.
    Empty,
    /// `/theme <green|amber|cyan>`
    SetTheme(Theme),
    /// `/theme` with a missing, extra or unknown argument.
    ThemeRejected,
    /// `/cls`
    Clear,
    /// `/cls` followed by anything.
    ClearRejected,
    /// `/mute`
    ToggleMute,
    /// `/mute` followed by anything.
    MuteRejected,
    /// Anything else, forwarded to the narrator as typed (trimmed).
    Action(String),
}

impl Command {
    /// Parse one input line.
    ///
    /// Only an exact, case-insensitive match of the first token makes a
    /// local command: `/themes` or `/clsx` are player actions.
    #[must_use]
    pub fn parse(line: &str) -> Self {
        let line = line.trim();
        let mut tokens = line.split_whitespace();
        let Some(head) = tokens.next() else {
            return Command::Empty;
        };
        let args: Vec<&str> = tokens.collect();

        if head.eq_ignore_ascii_case("/theme") {
            match args.as_slice() {
                [name] => name
                    .parse()
                    .map_or(Command::ThemeRejected, Command::SetTheme),
                _ => Command::ThemeRejected,
            }
        } else if head.eq_ignore_ascii_case("/cls") {
            if args.is_empty() {
                Command::Clear
            } else {
                Command::ClearRejected
            }
        } else if head.eq_ignore_ascii_case("/mute") {
            if args.is_empty() {
                Command::ToggleMute
            } else {
                Command::MuteRejected
            }
        } else {
            Command::Action(line.to_string())
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Outcomes
// ─────────────────────────────────────────────────────────────────────────────

/// Why a submission was refused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Rejection {
    /// The game is still in the boot phase.
    NotStarted,
    /// A turn is in flight.
    Busy,
}

/// Result of [`GameShell::submit`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum Submission {
    Ignored,
    Rejected { reason: Rejection },
    ThemeChanged { theme: Theme },
    ThemeRejected,
    Cleared,
    ClearRejected,
    MuteToggled { muted: bool },
    MuteRejected,
    /// A turn is running; both lines already exist in the transcript.
    TurnStarted {
        user_message_id: Uuid,
        reply_message_id: Uuid,
    },
}

/// Result of [`GameShell::start`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StartOutcome {
    Started {
        message_id: Uuid,
        session: SessionState,
    },
    AlreadyStarted,
    /// The start task was cancelled before reporting back.
    Interrupted,
}

/// Everything a page needs to render from scratch.
#[derive(Debug, Clone, Serialize)]
pub struct ShellSnapshot {
    pub phase: Phase,
    pub theme: Theme,
    pub processing: bool,
    pub muted: bool,
    pub session: SessionState,
    pub messages: Vec<Message>,
    pub scene: Option<SceneImage>,
}

// ─────────────────────────────────────────────────────────────────────────────
// Shell
// ─────────────────────────────────────────────────────────────────────────────

/// The game shell. Cloning yields another handle to the same game.
#[derive(Clone)]
pub struct GameShell {
    inner: Arc<ShellInner>,
}

struct ShellInner {
    sessions: SessionManager,
    scenes: SceneRequester,
    slot: SceneSlot,
    store: ConversationStore,
    bus: EventBus,
    effects: Effects,
    config: GameConfig,
    phase: RwLock<Phase>,
    theme: RwLock<Theme>,
    booting: AtomicBool,
    processing: watch::Sender<bool>,
    pending_scenes: watch::Sender<usize>,
}

impl fmt::Debug for GameShell {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("GameShell")
            .field("phase", &self.phase())
            .field("theme", &self.theme())
            .field("processing", &self.is_processing())
            .finish_non_exhaustive()
    }
}

impl GameShell {
    #[must_use]
    pub fn new(
        sessions: SessionManager,
        scenes: SceneRequester,
        config: GameConfig,
        bus: EventBus,
    ) -> Self {
        let effects = Effects::new(bus.clone());
        Self {
            inner: Arc::new(ShellInner {
                sessions,
                scenes,
                slot: SceneSlot::new(),
                store: ConversationStore::new(),
                bus,
                effects,
                config,
                phase: RwLock::new(Phase::Boot),
                theme: RwLock::new(Theme::default()),
                booting: AtomicBool::new(false),
                processing: watch::Sender::new(false),
                pending_scenes: watch::Sender::new(0),
            }),
        }
    }

    #[must_use]
    pub fn store(&self) -> &ConversationStore {
        &self.inner.store
    }

    #[must_use]
    pub fn effects(&self) -> &Effects {
        &self.inner.effects
    }

    #[must_use]
    pub fn sessions(&self) -> &SessionManager {
        &self.inner.sessions
    }

    #[must_use]
    pub fn subscribe(&self) -> broadcast::Receiver<GameEvent> {
        self.inner.bus.subscribe()
    }

    #[must_use]
    pub fn phase(&self) -> Phase {
        *self
            .inner
            .phase
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn theme(&self) -> Theme {
        *self
            .inner
            .theme
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    #[must_use]
    pub fn is_processing(&self) -> bool {
        *self.inner.processing.borrow()
    }

    #[must_use]
    pub fn scene(&self) -> Option<SceneImage> {
        self.inner.slot.current()
    }

    #[must_use]
    pub fn snapshot(&self) -> ShellSnapshot {
        ShellSnapshot {
            phase: self.phase(),
            theme: self.theme(),
            processing: self.is_processing(),
            muted: self.inner.effects.is_muted(),
            session: self.inner.sessions.state(),
            messages: self.inner.store.snapshot(),
            scene: self.scene(),
        }
    }

    /// Wait until no turn is running and no scene request is outstanding.
    pub async fn settled(&self) {
        let mut processing = self.inner.processing.subscribe();
        let _ = processing.wait_for(|busy| !*busy).await;
        let mut scenes = self.inner.pending_scenes.subscribe();
        let _ = scenes.wait_for(|pending| *pending == 0).await;
    }

    // ─────────────────────────────────────────────────────────────────────
    // Boot phase
    // ─────────────────────────────────────────────────────────────────────

    /// Append the boot lines one by one with staggered delays.
    ///
    /// Runs at most once; returns `false` if it already ran. Stops early
    /// when the game starts mid-sequence.
    pub async fn run_boot_sequence(&self) -> bool {
        if self.inner.booting.swap(true, Ordering::AcqRel) {
            return false;
        }
        info!(name: "shell.boot.started", "Boot sequence started");

        for line in BOOT_SEQUENCE {
            tokio::time::sleep(self.boot_delay()).await;
            if self.phase() == Phase::Playing {
                debug!("Game started, skipping remaining boot lines");
                break;
            }
            self.append(Message::system(line));
            self.inner.effects.trigger(Effect::BootLine);
        }

        info!(name: "shell.boot.finished", "Boot sequence finished");
        true
    }

    fn boot_delay(&self) -> Duration {
        let GameConfig {
            boot_delay_ms,
            boot_jitter_ms,
            ..
        } = self.inner.config;
        let jitter = rand::thread_rng().gen_range(0..=boot_jitter_ms);
        Duration::from_millis(boot_delay_ms + jitter)
    }

    /// Leave the boot phase and open the narrator session.
    ///
    /// The opening runs on its own task: it completes and releases input
    /// even if the caller stops waiting.
    pub async fn start(&self) -> StartOutcome {
        {
            let mut phase = self
                .inner
                .phase
                .write()
                .unwrap_or_else(PoisonError::into_inner);
            if *phase == Phase::Playing {
                return StartOutcome::AlreadyStarted;
            }
            self.inner.processing.send_replace(true);
            *phase = Phase::Playing;
        }
        self.publish(GameEvent::ProcessingChanged { processing: true });
        self.publish(GameEvent::PhaseChanged {
            phase: Phase::Playing,
        });
        info!(name: "shell.started", "Game started");

        let effects = &self.inner.effects;
        effects.arm();
        effects.trigger(Effect::BootSound);
        effects.trigger(Effect::StartMusic);

        let shell = self.clone();
        let opening = tokio::spawn(async move {
            let worker = shell.clone();
            let message_id = match tokio::spawn(async move { worker.open_session().await }).await {
                Ok(id) => id,
                Err(e) => {
                    error!(name: "shell.start.failed", error = %e, "Opening the session failed");
                    shell.append(Message::system(LINK_LOST_TEXT))
                }
            };
            shell.finish_processing();
            message_id
        });

        match opening.await {
            Ok(message_id) => StartOutcome::Started {
                message_id,
                session: self.inner.sessions.state(),
            },
            Err(e) => {
                error!(name: "shell.start.interrupted", error = %e, "Start task did not report back");
                StartOutcome::Interrupted
            }
        }
    }

    async fn open_session(&self) -> Uuid {
        let intro = self.inner.sessions.start_session().await;
        let message_id = self.append(Message::ai(intro.clone()));
        self.spawn_scene(intro);
        message_id
    }

    // ─────────────────────────────────────────────────────────────────────
    // Playing phase
    // ─────────────────────────────────────────────────────────────────────

    /// Handle one submitted line.
    ///
    /// Player actions return as soon as the turn task is spawned.
    pub fn submit(&self, line: &str) -> Submission {
        if self.phase() == Phase::Boot {
            return Submission::Rejected {
                reason: Rejection::NotStarted,
            };
        }

        let command = Command::parse(line);
        if command == Command::Empty {
            return Submission::Ignored;
        }
        if self.is_processing() {
            debug!("Submission while a turn is in flight");
            return Submission::Rejected {
                reason: Rejection::Busy,
            };
        }

        match command {
            Command::Empty => Submission::Ignored,
            Command::SetTheme(theme) => {
                *self
                    .inner
                    .theme
                    .write()
                    .unwrap_or_else(PoisonError::into_inner) = theme;
                info!(name: "shell.theme.changed", theme = %theme, "Theme changed");
                self.publish(GameEvent::ThemeChanged { theme });
                Submission::ThemeChanged { theme }
            }
            Command::ThemeRejected => Submission::ThemeRejected,
            Command::Clear => {
                self.inner.store.clear();
                info!(name: "shell.transcript.cleared", "Transcript cleared");
                self.publish(GameEvent::TranscriptCleared);
                Submission::Cleared
            }
            Command::ClearRejected => Submission::ClearRejected,
            Command::ToggleMute => Submission::MuteToggled {
                muted: self.inner.effects.toggle_mute(),
            },
            Command::MuteRejected => Submission::MuteRejected,
            Command::Action(text) => self.begin_turn(text),
        }
    }

    fn begin_turn(&self, text: String) -> Submission {
        let claimed = self.inner.processing.send_if_modified(|busy| {
            if *busy {
                false
            } else {
                *busy = true;
                true
            }
        });
        if !claimed {
            return Submission::Rejected {
                reason: Rejection::Busy,
            };
        }
        self.publish(GameEvent::ProcessingChanged { processing: true });
        self.inner.effects.trigger(Effect::Enter);

        let user_message_id = self.append(Message::user(text.clone()));
        let reply_message_id = self.append(Message::pending_ai());
        info!(
            name: "game.turn.started",
            reply_id = %reply_message_id,
            input_length = text.chars().count(),
            "Turn started"
        );

        let worker = self.clone();
        let turn = tokio::spawn(async move { worker.run_turn(text, reply_message_id).await });

        let shell = self.clone();
        tokio::spawn(async move {
            match turn.await {
                Ok(Ok(outcome)) => {
                    info!(
                        name: "game.turn.finished",
                        reply_id = %reply_message_id,
                        completed = outcome.is_completed(),
                        "Turn finished"
                    );
                }
                Ok(Err(e)) => shell.fail_turn(reply_message_id, &e.to_string()),
                Err(e) => shell.fail_turn(reply_message_id, &e.to_string()),
            }
            shell.finish_processing();
        });

        Submission::TurnStarted {
            user_message_id,
            reply_message_id,
        }
    }

    async fn run_turn(&self, action: String, reply_id: Uuid) -> Result<TurnOutcome> {
        let mut stream = self.inner.sessions.send_turn(action);
        let mut reply = String::new();
        let mut outcome = None;

        while let Some(event) = stream.next().await {
            match event {
                TurnEvent::Fragment(fragment) => {
                    tracing::trace!(reply_id = %reply_id, length = fragment.len(), "Fragment");
                    reply.push_str(&fragment);
                    self.inner.effects.trigger(Effect::Blip);
                    self.update_reply(reply_id, &reply, true)?;
                }
                TurnEvent::Finished(o) => outcome = Some(o),
            }
        }

        self.update_reply(reply_id, &reply, false)?;
        let outcome =
            outcome.ok_or_else(|| GameError::Stream("turn ended without an outcome".into()))?;

        if reply.chars().count() > self.inner.config.scene_min_chars {
            self.spawn_scene(reply);
        }
        Ok(outcome)
    }

    fn fail_turn(&self, reply_id: Uuid, reason: &str) {
        error!(name: "game.turn.failed", reply_id = %reply_id, error = %reason, "Turn failed");
        if let Some(reply) = self.inner.store.get(reply_id)
            && reply.typing
            && let Err(e) = self.update_reply(reply_id, &reply.text, false)
        {
            warn!(reply_id = %reply_id, error = %e, "Could not settle the pending reply");
        }
        self.append(Message::system(LINK_LOST_TEXT));
    }

    fn finish_processing(&self) {
        self.inner.processing.send_replace(false);
        self.publish(GameEvent::ProcessingChanged { processing: false });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Scenes
    // ─────────────────────────────────────────────────────────────────────

    fn spawn_scene(&self, description: String) {
        let ticket = self.inner.slot.issue();
        self.inner.pending_scenes.send_modify(|n| *n += 1);

        let shell = self.clone();
        tokio::spawn(async move {
            let inner = &shell.inner;
            if let Some(data_uri) = inner.scenes.request_scene(&description).await
                && inner.slot.apply(ticket, data_uri.clone())
            {
                shell.publish(GameEvent::SceneUpdated { data_uri });
            }
            inner.pending_scenes.send_modify(|n| *n = n.saturating_sub(1));
        });
    }

    // ─────────────────────────────────────────────────────────────────────
    // Store helpers
    // ─────────────────────────────────────────────────────────────────────

    fn append(&self, message: Message) -> Uuid {
        let event = GameEvent::MessageAppended(message.clone());
        let id = self.inner.store.append(message);
        self.publish(event);
        id
    }

    fn update_reply(&self, id: Uuid, text: &str, typing: bool) -> Result<()> {
        let store = &self.inner.store;
        store.update_text(id, text)?;
        store.set_typing(id, typing)?;
        self.publish(GameEvent::MessageUpdated {
            id,
            text: text.to_string(),
            typing,
        });
        Ok(())
    }

    fn publish(&self, event: GameEvent) {
        self.inner.bus.publish(event);
    }
}

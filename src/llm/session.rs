//! The single conversational session with the narrator model.
//!
//! [`SessionManager`] owns at most one session at a time. A session binds
//! the game-master system instruction and generation parameters to the
//! running turn history, so every turn after the opening one continues the
//! same story.

use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::{Stream, StreamExt};
use serde::Serialize;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{Content, GenerationConfig, TextModel, TextRequest};

/// Persona and rules for the narrator.
pub const SYSTEM_INSTRUCTION: &str = r#"
你是一个名为 "幻境终端" (Phantom Terminal) 的1988年复古文字冒险游戏引擎。
你的目标是为用户运行一个沉浸式的、交互式的小说游戏。

规则：
1. 语言：必须全程使用**中文**。
2. 基调：氛围感强，描述生动但简洁（类似 Zork 或早期的 MUD 游戏）。
3. 格式：纯文本。不要使用 Markdown 格式（如 **加粗** 或 # 标题）。如果需要强调，可以使用【】或大写。
4. 机制：你需要隐式地追踪玩家的【生命值】（初始 100%）、【物品栏】和【位置】。
5. 交互：在每段描述的最后，提示用户 "你会怎么做？" 或给出具体的选项。
6. 首次互动：在游戏开始时，请让用户选择游戏题材："奇幻"、"科幻"、"赛博朋克" 或 "悬疑"。
7. 状态查询：如果用户询问 "物品" 或 "状态"，请以复古的列表格式显示他们的状态。

示例输出：
你站在一条潮湿、昏暗的走廊里。水珠从头顶生锈的管道中滴落。
北面是一扇沉重的钢门。南面是一片漆黑。
你会怎么做？
"#;

/// Synthetic first message that makes the narrator open the game.
pub const PRIMING_MESSAGE: &str = "初始化系统。启动序列完成。请用中文开始游戏介绍，欢迎玩家来到【幻境终端】，并询问玩家想要游玩哪种题材（奇幻、科幻等）。";

/// Returned by `start_session` when no credential is configured.
pub const NOT_CONNECTED_TEXT: &str = "错误：系统未连接 (API Key missing)。";
/// Returned by `start_session` when the opening call fails.
pub const HOST_FAILURE_TEXT: &str = "严重错误：主机连接失败。";
/// Returned by `start_session` when the opening reply is empty.
pub const EMPTY_REPLY_TEXT: &str = "系统错误：无数据返回";
/// Only fragment of a turn attempted without a session.
pub const NO_SESSION_TEXT: &str = "系统错误：无活动会话。";
/// Final fragment of a turn that faulted mid-stream.
pub const LINK_BROKEN_TEXT: &str = "\n[连接中断]";

/// Session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    /// No session exists.
    Closed,
    /// Created, opening call in flight.
    Open,
    /// Opening call answered; turns go to this session.
    Active,
}

/// Why a turn ended early.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", content = "reason", rename_all = "snake_case")]
pub enum TurnFault {
    /// No active session.
    NoSession,
    /// The model call failed or broke mid-stream.
    Transport(String),
}

/// How a turn ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "fault", rename_all = "snake_case")]
pub enum TurnOutcome {
    Completed,
    Faulted(TurnFault),
}

impl TurnOutcome {
    #[must_use]
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed)
    }
}

/// Item of a [`TurnStream`].
///
/// A stream yields zero or more fragments and then exactly one `Finished`.
/// Fault sentinels ([`NO_SESSION_TEXT`], [`LINK_BROKEN_TEXT`]) arrive as
/// a last fragment so they end up in the transcript, but the outcome says
/// what happened.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TurnEvent {
    Fragment(String),
    Finished(TurnOutcome),
}

/// Single-pass stream of turn events.
pub type TurnStream = Pin<Box<dyn Stream<Item = TurnEvent> + Send>>;

#[derive(Debug)]
struct Session {
    id: Uuid,
    state: SessionState,
    history: Vec<Content>,
}

/// Owner of the one conversational session.
#[derive(Clone)]
pub struct SessionManager {
    model: Arc<dyn TextModel>,
    generation: GenerationConfig,
    session: Arc<Mutex<Option<Session>>>,
}

impl std::fmt::Debug for SessionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionManager")
            .field("generation", &self.generation)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

fn lock(slot: &Mutex<Option<Session>>) -> MutexGuard<'_, Option<Session>> {
    slot.lock().unwrap_or_else(PoisonError::into_inner)
}

impl SessionManager {
    #[must_use]
    pub fn new(model: Arc<dyn TextModel>, generation: GenerationConfig) -> Self {
        Self {
            model,
            generation,
            session: Arc::new(Mutex::new(None)),
        }
    }

    /// Current lifecycle state.
    #[must_use]
    pub fn state(&self) -> SessionState {
        lock(&self.session)
            .as_ref()
            .map_or(SessionState::Closed, |s| s.state)
    }

    /// Id of the current session, if any.
    #[must_use]
    pub fn session_id(&self) -> Option<Uuid> {
        lock(&self.session).as_ref().map(|s| s.id)
    }

    /// Number of history entries the next turn will carry.
    #[must_use]
    pub fn history_len(&self) -> usize {
        lock(&self.session).as_ref().map_or(0, |s| s.history.len())
    }

    /// Drop the current session.
    pub fn close(&self) {
        if lock(&self.session).take().is_some() {
            info!(name: "session.closed", "Session closed");
        }
    }

    /// Open a new session and return the narrator's opening text.
    ///
    /// Never fails: faults come back as one of the fallback strings.
    pub async fn start_session(&self) -> String {
        if !self.model.is_configured() {
            error!(name: "session.start.unconfigured", "API credential missing, running disconnected");
            return NOT_CONNECTED_TEXT.to_string();
        }

        let id = Uuid::new_v4();
        *lock(&self.session) = Some(Session {
            id,
            state: SessionState::Open,
            history: Vec::new(),
        });
        info!(name: "session.opened", session_id = %id, "Session opened");

        let request = TextRequest {
            system_instruction: Some(SYSTEM_INSTRUCTION.to_string()),
            contents: vec![Content::user(PRIMING_MESSAGE)],
            generation: self.generation,
        };

        let result = self.model.generate(request).await;

        let mut guard = lock(&self.session);
        let Some(session) = guard.as_mut().filter(|s| s.id == id) else {
            warn!(session_id = %id, "Session replaced while opening");
            return HOST_FAILURE_TEXT.to_string();
        };

        match result {
            Ok(text) if text.trim().is_empty() => {
                session.state = SessionState::Active;
                warn!(session_id = %id, "Opening reply was empty");
                EMPTY_REPLY_TEXT.to_string()
            }
            Ok(text) => {
                session.state = SessionState::Active;
                session.history.push(Content::user(PRIMING_MESSAGE));
                session.history.push(Content::model(text.clone()));
                info!(
                    name: "session.active",
                    session_id = %id,
                    reply_length = text.chars().count(),
                    "Session active"
                );
                text
            }
            Err(e) => {
                *guard = None;
                error!(name: "session.start.failed", session_id = %id, error = %e, "Error starting game");
                HOST_FAILURE_TEXT.to_string()
            }
        }
    }

    /// Send one player action and stream the narrator's reply.
    ///
    /// Callers must not overlap turns; the stream must be consumed to the
    /// end for the exchange to be recorded in the session history.
    pub fn send_turn(&self, player_text: impl Into<String>) -> TurnStream {
        let player_text = player_text.into();
        let model = Arc::clone(&self.model);
        let slot = Arc::clone(&self.session);
        let generation = self.generation;

        Box::pin(async_stream::stream! {
            let prepared = prepare_turn(&slot, &player_text, generation);
            let Some((session_id, request)) = prepared else {
                warn!(name: "session.turn.no_session", "Turn attempted without an active session");
                yield TurnEvent::Fragment(NO_SESSION_TEXT.to_string());
                yield TurnEvent::Finished(TurnOutcome::Faulted(TurnFault::NoSession));
                return;
            };

            let mut reply = String::new();
            let mut fault = None;

            match model.stream(request).await {
                Ok(mut fragments) => {
                    while let Some(item) = fragments.next().await {
                        match item {
                            Ok(text) if text.is_empty() => {}
                            Ok(text) => {
                                reply.push_str(&text);
                                yield TurnEvent::Fragment(text);
                            }
                            Err(e) => {
                                fault = Some(e.to_string());
                                break;
                            }
                        }
                    }
                }
                Err(e) => fault = Some(e.to_string()),
            }

            if let Some(reason) = fault {
                error!(
                    name: "session.turn.faulted",
                    session_id = %session_id,
                    error = %reason,
                    received = reply.chars().count(),
                    "Stream error"
                );
                yield TurnEvent::Fragment(LINK_BROKEN_TEXT.to_string());
                yield TurnEvent::Finished(TurnOutcome::Faulted(TurnFault::Transport(reason)));
                return;
            }

            record_exchange(&slot, session_id, player_text, reply);
            yield TurnEvent::Finished(TurnOutcome::Completed);
        })
    }
}

fn prepare_turn(
    slot: &Mutex<Option<Session>>,
    player_text: &str,
    generation: GenerationConfig,
) -> Option<(Uuid, TextRequest)> {
    let guard = lock(slot);
    let session = guard.as_ref()?;

    let mut contents = session.history.clone();
    contents.push(Content::user(player_text));

    Some((
        session.id,
        TextRequest {
            system_instruction: Some(SYSTEM_INSTRUCTION.to_string()),
            contents,
            generation,
        },
    ))
}

fn record_exchange(slot: &Mutex<Option<Session>>, session_id: Uuid, player_text: String, reply: String) {
    let mut guard = lock(slot);
    match guard.as_mut() {
        Some(session) if session.id == session_id => {
            session.history.push(Content::user(player_text));
            if !reply.is_empty() {
                session.history.push(Content::model(reply));
            }
        }
        _ => warn!(session_id = %session_id, "Session gone before turn was recorded"),
    }
}

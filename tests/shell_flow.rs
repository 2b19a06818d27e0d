use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use tokio::sync::Notify;

use phantom_terminal::config::GameConfig;
use phantom_terminal::events::{EventBus, GameEvent};
use phantom_terminal::llm::mock::{ImageScript, ScriptedModel, Step, TurnScript};
use phantom_terminal::llm::session::{LINK_BROKEN_TEXT, NO_SESSION_TEXT, NOT_CONNECTED_TEXT};
use phantom_terminal::error::Result;
use phantom_terminal::llm::{
    GenerationConfig, ImageModel, InlineImage, SessionManager, SessionState, TextModel,
    TextRequest, TextStream,
};
use phantom_terminal::scene::{SceneRequester, scene_prompt};
use phantom_terminal::shell::{
    BOOT_SEQUENCE, GameShell, LINK_LOST_TEXT, Phase, Rejection, StartOutcome, Submission, Theme,
};
use phantom_terminal::transcript::Sender;

fn game_config() -> GameConfig {
    GameConfig {
        scene_min_chars: 50,
        boot_delay_ms: 600,
        boot_jitter_ms: 300,
    }
}

fn shell_with(model: ScriptedModel) -> (GameShell, Arc<ScriptedModel>) {
    let model = Arc::new(model);
    let text: Arc<dyn TextModel> = Arc::clone(&model) as Arc<dyn TextModel>;
    let image: Arc<dyn ImageModel> = Arc::clone(&model) as Arc<dyn ImageModel>;
    let shell = GameShell::new(
        SessionManager::new(text, GenerationConfig::default()),
        SceneRequester::new(image),
        game_config(),
        EventBus::new(),
    );
    (shell, model)
}

fn image(tag: &str) -> InlineImage {
    InlineImage {
        mime_type: "image/png".to_string(),
        data: BASE64.encode(tag.as_bytes()),
    }
}

fn reply_id(submission: &Submission) -> uuid::Uuid {
    match submission {
        Submission::TurnStarted {
            reply_message_id, ..
        } => *reply_message_id,
        other => panic!("expected a turn, got {other:?}"),
    }
}

async fn settle(shell: &GameShell) {
    tokio::time::timeout(Duration::from_secs(5), shell.settled())
        .await
        .expect("shell did not settle");
}

#[tokio::test(start_paused = true)]
async fn test_boot_sequence_appends_scripted_lines() {
    let (shell, _) = shell_with(ScriptedModel::new());

    assert!(shell.run_boot_sequence().await);

    let messages = shell.store().snapshot();
    let texts: Vec<&str> = messages.iter().map(|m| m.text.as_str()).collect();
    assert_eq!(texts, BOOT_SEQUENCE);
    assert!(messages.iter().all(|m| m.sender == Sender::System));

    assert!(!shell.run_boot_sequence().await);
    assert_eq!(shell.store().len(), BOOT_SEQUENCE.len());
}

#[tokio::test]
async fn test_submissions_rejected_during_boot() {
    let (shell, model) = shell_with(ScriptedModel::new().with_turn(["never"]));

    assert_eq!(shell.phase(), Phase::Boot);
    for line in ["向北走", "/theme amber", "/cls"] {
        assert_eq!(
            shell.submit(line),
            Submission::Rejected {
                reason: Rejection::NotStarted
            }
        );
    }
    assert!(shell.store().is_empty());
    assert_eq!(shell.theme(), Theme::Green);
    assert!(model.requests().is_empty());
}

#[tokio::test]
async fn test_start_without_credential_degrades() {
    let (shell, model) = shell_with(ScriptedModel::unconfigured().with_turn(["never"]));

    let outcome = shell.start().await;
    assert!(matches!(
        outcome,
        StartOutcome::Started {
            session: SessionState::Closed,
            ..
        }
    ));
    assert_eq!(shell.phase(), Phase::Playing);
    assert_eq!(shell.store().last().unwrap().text, NOT_CONNECTED_TEXT);
    assert_eq!(shell.start().await, StartOutcome::AlreadyStarted);

    let id = reply_id(&shell.submit("向北走"));
    settle(&shell).await;

    let reply = shell.store().get(id).unwrap();
    assert_eq!(reply.text, NO_SESSION_TEXT);
    assert!(!reply.typing);
    assert!(!shell.is_processing());
    assert!(model.requests().is_empty());
}

#[tokio::test]
async fn test_long_reply_requests_one_scene() {
    let long_reply = "你".repeat(80);
    let (shell, model) = shell_with(
        ScriptedModel::new()
            .with_reply("欢迎。")
            .with_image(ImageScript::Nothing)
            .with_turn([&long_reply[..30], &long_reply[30..]])
            .with_image(ImageScript::Image(image("scene-1"))),
    );
    shell.start().await;
    settle(&shell).await;
    assert!(shell.scene().is_none());

    let id = reply_id(&shell.submit("看看四周"));
    settle(&shell).await;

    let reply = shell.store().get(id).unwrap();
    assert_eq!(reply.text, long_reply);
    assert_eq!(reply.sender, Sender::Ai);

    let prompts = model.image_prompts();
    assert_eq!(prompts.len(), 2);
    assert_eq!(prompts[1], scene_prompt(&long_reply));

    let scene = shell.scene().expect("scene applied");
    assert_eq!(scene.data_uri, image("scene-1").to_data_uri());
}

#[tokio::test]
async fn test_short_reply_skips_scene() {
    // Exactly at the threshold: not "longer than".
    let reply = "好".repeat(50);
    let (shell, model) = shell_with(
        ScriptedModel::new()
            .with_reply("欢迎。")
            .with_turn([reply.as_str()]),
    );
    shell.start().await;

    shell.submit("等待");
    settle(&shell).await;

    assert_eq!(model.image_prompts().len(), 1);
}

#[tokio::test]
async fn test_failed_scene_keeps_previous_image() {
    let first = "甲".repeat(60);
    let second = "乙".repeat(60);
    let (shell, _) = shell_with(
        ScriptedModel::new()
            .with_reply("欢迎。")
            .with_image(ImageScript::Nothing)
            .with_turn([first.as_str()])
            .with_image(ImageScript::Image(image("first")))
            .with_turn([second.as_str()])
            .with_image(ImageScript::Fail("503".into())),
    );
    shell.start().await;

    shell.submit("一");
    settle(&shell).await;
    let before = shell.scene().expect("first scene");

    shell.submit("二");
    settle(&shell).await;

    assert_eq!(shell.scene(), Some(before));
}

#[tokio::test]
async fn test_mid_stream_fault_appends_sentinel() {
    let (shell, _) = shell_with(
        ScriptedModel::new()
            .with_reply("欢迎。")
            .with_script(TurnScript::Open(vec![
                Step::Text("第一段".into()),
                Step::Text("第二段".into()),
                Step::Fault("connection reset".into()),
            ])),
    );
    shell.start().await;

    let id = reply_id(&shell.submit("跑"));
    settle(&shell).await;

    let reply = shell.store().get(id).unwrap();
    assert_eq!(reply.text, format!("第一段第二段{LINK_BROKEN_TEXT}"));
    assert!(!reply.typing);
    assert!(!shell.is_processing());
}

#[tokio::test]
async fn test_everything_rejected_while_turn_in_flight() {
    let gate = Arc::new(Notify::new());
    let (shell, model) = shell_with(
        ScriptedModel::new()
            .held_by(Arc::clone(&gate))
            .with_reply("欢迎。")
            .with_turn(["门开了。"]),
    );
    shell.start().await;

    let first = shell.submit("开门");
    assert!(matches!(first, Submission::TurnStarted { .. }));
    assert!(shell.is_processing());

    let busy = Submission::Rejected {
        reason: Rejection::Busy,
    };
    assert_eq!(shell.submit("再开一次"), busy);
    assert_eq!(shell.submit("/theme amber"), busy);
    assert_eq!(shell.submit("/cls"), busy);
    assert_eq!(shell.theme(), Theme::Green);
    assert_eq!(shell.store().len(), 3);

    gate.notify_one();
    settle(&shell).await;

    assert_eq!(model.requests().len(), 2);
    assert_eq!(
        shell.submit("/theme amber"),
        Submission::ThemeChanged {
            theme: Theme::Amber
        }
    );
}

#[tokio::test]
async fn test_local_commands_never_reach_the_model() {
    let (shell, model) = shell_with(
        ScriptedModel::new()
            .with_reply("欢迎。")
            .with_turn(["你在走廊里。"]),
    );
    shell.start().await;
    let requests_after_start = model.requests().len();

    assert_eq!(shell.submit("/theme"), Submission::ThemeRejected);
    assert_eq!(shell.submit("/theme green extra"), Submission::ThemeRejected);
    assert_eq!(shell.submit("/theme purple"), Submission::ThemeRejected);
    assert_eq!(shell.theme(), Theme::Green);

    assert_eq!(
        shell.submit("/THEME cyan"),
        Submission::ThemeChanged { theme: Theme::Cyan }
    );

    let before = shell.store().len();
    assert_eq!(shell.submit("/cls extra"), Submission::ClearRejected);
    assert_eq!(shell.store().len(), before);

    assert_eq!(shell.submit("/mute"), Submission::MuteToggled { muted: true });
    assert!(shell.snapshot().muted);

    assert_eq!(shell.submit("   "), Submission::Ignored);
    assert_eq!(model.requests().len(), requests_after_start);

    assert_eq!(shell.submit("/cls"), Submission::Cleared);
    assert!(shell.store().is_empty());

    // Near miss goes to the narrator.
    let id = reply_id(&shell.submit("/themes green"));
    settle(&shell).await;
    assert_eq!(shell.store().get(id).unwrap().text, "你在走廊里。");
    assert_eq!(model.requests().last().unwrap().contents.last().unwrap().text(), "/themes green");
}

#[tokio::test]
async fn test_turn_publishes_events_in_order() {
    let (shell, _) = shell_with(
        ScriptedModel::new()
            .with_reply("欢迎。")
            .with_turn(["你", "好"]),
    );
    shell.start().await;
    let mut rx = shell.subscribe();

    let id = reply_id(&shell.submit("打招呼"));
    settle(&shell).await;

    let mut events = Vec::new();
    while let Ok(event) = rx.try_recv() {
        events.push(event);
    }

    assert_eq!(events[0], GameEvent::ProcessingChanged { processing: true });
    assert!(matches!(&events[1], GameEvent::Effect { .. }));
    assert!(matches!(&events[2], GameEvent::MessageAppended(m) if m.sender == Sender::User));
    assert!(matches!(&events[3], GameEvent::MessageAppended(m) if m.id == id && m.typing));

    let updates: Vec<(String, bool)> = events
        .iter()
        .filter_map(|e| match e {
            GameEvent::MessageUpdated { id: i, text, typing } if *i == id => {
                Some((text.clone(), *typing))
            }
            _ => None,
        })
        .collect();
    assert_eq!(
        updates,
        vec![
            ("你".to_string(), true),
            ("你好".to_string(), true),
            ("你好".to_string(), false)
        ]
    );
    assert_eq!(
        events.last(),
        Some(&GameEvent::ProcessingChanged { processing: false })
    );
}

#[tokio::test]
async fn test_snapshot_reflects_state() {
    let (shell, _) = shell_with(ScriptedModel::new().with_reply("欢迎来到幻境终端。"));

    let snapshot = shell.snapshot();
    assert_eq!(snapshot.phase, Phase::Boot);
    assert!(snapshot.messages.is_empty());

    shell.start().await;
    settle(&shell).await;
    let snapshot = shell.snapshot();
    assert_eq!(snapshot.phase, Phase::Playing);
    assert_eq!(snapshot.session, SessionState::Active);
    assert!(!snapshot.processing);
    assert_eq!(snapshot.messages.len(), 1);
    assert_eq!(snapshot.messages[0].sender, Sender::Ai);
}

/// Opens the session normally, then panics inside every turn.
struct PanickingNarrator;

#[async_trait::async_trait]
impl TextModel for PanickingNarrator {
    async fn generate(&self, _req: TextRequest) -> Result<String> {
        Ok("欢迎。".to_string())
    }

    async fn stream(&self, _req: TextRequest) -> Result<TextStream> {
        panic!("narrator crashed");
    }
}

#[tokio::test]
async fn test_panicking_turn_reports_link_lost() {
    let images = Arc::new(ScriptedModel::new());
    let shell = GameShell::new(
        SessionManager::new(Arc::new(PanickingNarrator), GenerationConfig::default()),
        SceneRequester::new(images as Arc<dyn ImageModel>),
        game_config(),
        EventBus::new(),
    );
    shell.start().await;

    let id = reply_id(&shell.submit("向北走"));
    settle(&shell).await;

    let reply = shell.store().get(id).unwrap();
    assert!(!reply.typing);
    let last = shell.store().last().unwrap();
    assert_eq!(last.sender, Sender::System);
    assert_eq!(last.text, LINK_LOST_TEXT);
    assert!(!shell.is_processing());

    assert!(matches!(shell.submit("再试一次"), Submission::TurnStarted { .. }));
}

#[tokio::test]
async fn test_turn_store_fault_reports_link_lost() {
    let gate = Arc::new(Notify::new());
    let (shell, _) = shell_with(
        ScriptedModel::new()
            .held_by(Arc::clone(&gate))
            .with_reply("欢迎。")
            .with_turn(["门开了。"]),
    );
    shell.start().await;

    reply_id(&shell.submit("开门"));
    // The pending reply disappears while the narrator is still thinking.
    shell.store().clear();
    gate.notify_one();
    settle(&shell).await;

    let messages = shell.store().snapshot();
    assert_eq!(messages.len(), 1);
    assert_eq!(messages[0].sender, Sender::System);
    assert_eq!(messages[0].text, LINK_LOST_TEXT);
    assert!(!shell.is_processing());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_input_unlocked_when_processing_event_arrives() {
    let (shell, _) = shell_with(
        ScriptedModel::new()
            .with_reply("欢迎。")
            .with_turn(["第一回合。"])
            .with_turn(["第二回合。"]),
    );
    shell.start().await;
    let mut rx = shell.subscribe();

    reply_id(&shell.submit("一"));
    loop {
        let event = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("event arrived")
            .expect("bus open");
        if event == (GameEvent::ProcessingChanged { processing: false }) {
            break;
        }
    }

    assert!(!shell.is_processing());
    assert!(matches!(shell.submit("二"), Submission::TurnStarted { .. }));
    settle(&shell).await;
}

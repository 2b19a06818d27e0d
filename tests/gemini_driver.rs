//! The Gemini driver against a local stub of the REST API.

use std::sync::{Arc, Mutex};

use axum::{
    Json, Router,
    body::{Body, Bytes},
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::post,
};
use futures::StreamExt;
use serde_json::{Value, json};

use phantom_terminal::error::GameError;
use phantom_terminal::llm::session::SYSTEM_INSTRUCTION;
use phantom_terminal::llm::{
    Content, GeminiDriver, GenerationConfig, ImageModel, ModelSettings, Provider, SessionManager,
    TextModel, TextRequest, TurnEvent, TurnOutcome,
};
use phantom_terminal::scene::SceneRequester;

#[derive(Debug, Clone)]
struct Recorded {
    target: String,
    authorization: Option<String>,
    body: Value,
}

type Log = Arc<Mutex<Vec<Recorded>>>;

fn candidate(text: &str) -> Value {
    json!({ "candidates": [{ "content": { "role": "model", "parts": [{ "text": text }] } }] })
}

async fn stub_handler(
    State(log): State<Log>,
    Path(target): Path<String>,
    headers: HeaderMap,
    Json(body): Json<Value>,
) -> Response {
    log.lock().unwrap().push(Recorded {
        target: target.clone(),
        authorization: headers
            .get("authorization")
            .and_then(|v| v.to_str().ok())
            .map(str::to_string),
        body,
    });

    let Some((model, action)) = target.split_once(':') else {
        return StatusCode::NOT_FOUND.into_response();
    };

    match (model, action) {
        ("broken", _) => (
            StatusCode::FORBIDDEN,
            Json(json!({ "error": { "code": 403, "message": "API key not valid", "status": "PERMISSION_DENIED" } })),
        )
            .into_response(),
        ("painter", "generateContent") => Json(json!({
            "candidates": [{ "content": { "parts": [
                { "text": "Here is your scene" },
                { "inlineData": { "mimeType": "image/png", "data": "iVBORw0KGgo=" } }
            ]}}]
        }))
        .into_response(),
        (_, "generateContent") => Json(candidate("欢迎来到幻境终端。")).into_response(),
        ("chunky", "streamGenerateContent") => {
            let payload = format!(
                "data: {}\n\ndata: {}\n\n",
                candidate("你站在"),
                candidate("走廊里。")
            );
            // Split in the middle of the first frame's JSON.
            let (a, b) = payload.split_at(20);
            let chunks = vec![
                Ok::<_, std::convert::Infallible>(Bytes::from(a.to_string())),
                Ok(Bytes::from(b.to_string())),
            ];
            sse(Body::from_stream(futures::stream::iter(chunks)))
        }
        (_, "streamGenerateContent") => sse(Body::from(format!(
            "data: {}\r\n\r\ndata: {}",
            candidate("北面是"),
            candidate("一扇钢门。")
        ))),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

fn sse(body: Body) -> Response {
    Response::builder()
        .header("content-type", "text/event-stream")
        .body(body)
        .unwrap()
}

async fn start_stub() -> (String, Log) {
    let log: Log = Arc::default();
    let app = Router::new()
        .route("/v1beta/models/{target}", post(stub_handler))
        .with_state(Arc::clone(&log));

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    (format!("http://{addr}"), log)
}

fn settings(base_url: &str, text_model: &str, api_key: Option<&str>) -> ModelSettings {
    ModelSettings {
        provider: Provider::detect_from_url(base_url),
        base_url: base_url.to_string(),
        api_key: api_key.map(str::to_string),
        text_model: text_model.to_string(),
        image_model: "painter".to_string(),
        temperature: 0.7,
        max_output_tokens: 500,
    }
}

fn request(text: &str) -> TextRequest {
    TextRequest {
        system_instruction: Some("rules".to_string()),
        contents: vec![Content::user(text)],
        generation: GenerationConfig::default(),
    }
}

#[tokio::test]
async fn test_generate_sends_gemini_body_with_bearer_auth() {
    let (base, log) = start_stub().await;
    let driver = GeminiDriver::new(settings(&base, "gemini-2.5-flash", Some("test-key")));

    let text = driver.generate(request("开始")).await.unwrap();
    assert_eq!(text, "欢迎来到幻境终端。");

    let recorded = log.lock().unwrap()[0].clone();
    assert_eq!(recorded.target, "gemini-2.5-flash:generateContent");
    assert_eq!(recorded.authorization.as_deref(), Some("Bearer test-key"));
    assert_eq!(recorded.body["systemInstruction"]["parts"][0]["text"], "rules");
    assert_eq!(recorded.body["contents"][0]["parts"][0]["text"], "开始");
    assert_eq!(recorded.body["generationConfig"]["maxOutputTokens"], 500);
}

#[tokio::test]
async fn test_stream_parses_crlf_frames_and_trailing_frame() {
    let (base, _) = start_stub().await;
    let driver = GeminiDriver::new(settings(&base, "gemini-2.5-flash", Some("k")));

    let fragments: Vec<String> = driver
        .stream(request("看"))
        .await
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;

    assert_eq!(fragments, vec!["北面是", "一扇钢门。"]);
}

#[tokio::test]
async fn test_stream_reassembles_split_chunks() {
    let (base, _) = start_stub().await;
    let driver = GeminiDriver::new(settings(&base, "chunky", Some("k")));

    let fragments: Vec<String> = driver
        .stream(request("看"))
        .await
        .unwrap()
        .map(Result::unwrap)
        .collect()
        .await;

    assert_eq!(fragments, vec!["你站在", "走廊里。"]);
}

#[tokio::test]
async fn test_api_error_is_mapped() {
    let (base, _) = start_stub().await;
    let driver = GeminiDriver::new(settings(&base, "broken", Some("k")));

    let Err(err) = driver.stream(request("看")).await else {
        panic!("expected an error");
    };
    assert!(matches!(
        err,
        GameError::Api { status: 403, ref message } if message.contains("API key not valid")
    ));
}

#[tokio::test]
async fn test_missing_credential_never_calls_out() {
    let (base, log) = start_stub().await;
    let driver = GeminiDriver::new(settings(&base, "gemini-2.5-flash", None));

    assert!(!driver.is_configured());
    assert!(matches!(
        driver.generate(request("x")).await,
        Err(GameError::MissingCredential)
    ));
    assert!(matches!(
        driver.generate_image("x").await,
        Err(GameError::MissingCredential)
    ));
    assert!(log.lock().unwrap().is_empty());
}

#[tokio::test]
async fn test_scene_request_through_driver() {
    let (base, log) = start_stub().await;
    let driver = Arc::new(GeminiDriver::new(settings(&base, "gemini-2.5-flash", Some("k"))));
    let scenes = SceneRequester::new(driver);

    let uri = scenes.request_scene("潮湿的走廊").await.unwrap();
    assert_eq!(uri, "data:image/png;base64,iVBORw0KGgo=");

    let recorded = log.lock().unwrap()[0].clone();
    assert_eq!(recorded.target, "painter:generateContent");
    assert!(recorded.body.get("systemInstruction").is_none());
    let prompt = recorded.body["contents"][0]["parts"][0]["text"].as_str().unwrap();
    assert!(prompt.contains("潮湿的走廊"));
}

#[tokio::test]
async fn test_session_over_driver() {
    let (base, log) = start_stub().await;
    let driver: Arc<dyn TextModel> =
        Arc::new(GeminiDriver::new(settings(&base, "gemini-2.5-flash", Some("k"))));
    let sessions = SessionManager::new(driver, GenerationConfig::default());

    assert_eq!(sessions.start_session().await, "欢迎来到幻境终端。");

    let events: Vec<TurnEvent> = sessions.send_turn("向北走").collect().await;
    assert_eq!(
        events,
        vec![
            TurnEvent::Fragment("北面是".into()),
            TurnEvent::Fragment("一扇钢门。".into()),
            TurnEvent::Finished(TurnOutcome::Completed),
        ]
    );

    let log = log.lock().unwrap();
    assert_eq!(log.len(), 2);
    assert_eq!(
        log[1].body["systemInstruction"]["parts"][0]["text"],
        SYSTEM_INSTRUCTION
    );
    let roles: Vec<&str> = log[1].body["contents"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["role"].as_str().unwrap())
        .collect();
    assert_eq!(roles, vec!["user", "model", "user"]);
}

//! Gemini REST driver.
//!
//! This module implements [`TextModel`] and [`ImageModel`] on top of the
//! Gemini `generateContent` and `streamGenerateContent` endpoints. Streaming
//! responses are requested with `alt=sse` and parsed frame by frame.

use std::time::Duration;

use futures::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{GameError, Result};

use super::provider::Method;
use super::{
    Content, GenerationConfig, ImageModel, InlineImage, ModelSettings, TextModel, TextRequest,
    TextStream,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Driver for the Gemini API.
#[derive(Clone)]
pub struct GeminiDriver {
    http: reqwest::Client,
    settings: ModelSettings,
}

impl std::fmt::Debug for GeminiDriver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GeminiDriver")
            .field("settings", &self.settings)
            .finish()
    }
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateContentRequest<'a> {
    contents: &'a [Content],
    #[serde(skip_serializing_if = "Option::is_none")]
    system_instruction: Option<SystemInstruction<'a>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    generation_config: Option<GenerationConfig>,
}

#[derive(Serialize)]
struct SystemInstruction<'a> {
    parts: [TextPart<'a>; 1],
}

#[derive(Serialize)]
struct TextPart<'a> {
    text: &'a str,
}

#[derive(Deserialize)]
struct ErrorWrapper {
    error: ErrorBody,
}

#[derive(Deserialize)]
struct ErrorBody {
    message: Option<String>,
    status: Option<String>,
}

impl GeminiDriver {
    /// Create a new driver with the given settings.
    #[must_use]
    pub fn new(settings: ModelSettings) -> Self {
        let http = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT)
            .build()
            .unwrap_or_else(|e| {
                tracing::warn!(error = %e, "Falling back to default HTTP client");
                reqwest::Client::new()
            });
        Self { http, settings }
    }

    /// Settings this driver was built with.
    #[must_use]
    pub fn settings(&self) -> &ModelSettings {
        &self.settings
    }

    async fn post(&self, model: &str, method: Method, body: &impl Serialize) -> Result<reqwest::Response> {
        let api_key = self
            .settings
            .api_key
            .as_deref()
            .ok_or(GameError::MissingCredential)?;

        let provider = self.settings.provider;
        let url = provider.build_model_url(&self.settings.base_url, model, method);

        let rb = provider.authorize(self.http.post(&url).json(body), api_key);
        let resp = rb.send().await?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp
                .text()
                .await
                .unwrap_or_else(|_| "Failed to read Gemini error body".to_string());
            return Err(map_api_error(status.as_u16(), &body_text));
        }
        Ok(resp)
    }
}

#[async_trait::async_trait]
impl TextModel for GeminiDriver {
    fn is_configured(&self) -> bool {
        self.settings.api_key.is_some()
    }

    async fn generate(&self, req: TextRequest) -> Result<String> {
        let body = GenerateContentRequest {
            contents: &req.contents,
            system_instruction: system_instruction(req.system_instruction.as_deref()),
            generation_config: Some(req.generation),
        };

        let resp = self
            .post(&self.settings.text_model, Method::Generate, &body)
            .await?;
        let v: Value = resp.json().await?;
        Ok(extract_text(&v))
    }

    async fn stream(&self, req: TextRequest) -> Result<TextStream> {
        let body = GenerateContentRequest {
            contents: &req.contents,
            system_instruction: system_instruction(req.system_instruction.as_deref()),
            generation_config: Some(req.generation),
        };

        let resp = self
            .post(&self.settings.text_model, Method::Stream, &body)
            .await?;
        let byte_stream = resp.bytes_stream();

        let out = async_stream::try_stream! {
            let mut buf = Vec::<u8>::new();

            futures::pin_mut!(byte_stream);
            while let Some(chunk) = byte_stream.next().await {
                let chunk = chunk?;
                buf.extend_from_slice(&chunk);

                while let Some((pos, delim)) = find_frame_end(&buf) {
                    let frame = buf.drain(..pos + delim).collect::<Vec<_>>();
                    if let Some(text) = parse_frame(&frame)? {
                        yield text;
                    }
                }
            }

            // Servers may close without a trailing blank line.
            if let Some(text) = parse_frame(&buf)? {
                yield text;
            }
        };

        Ok(Box::pin(out))
    }
}

#[async_trait::async_trait]
impl ImageModel for GeminiDriver {
    async fn generate_image(&self, prompt: &str) -> Result<Option<InlineImage>> {
        let contents = [Content::user(prompt)];
        let body = GenerateContentRequest {
            contents: &contents,
            system_instruction: None,
            generation_config: None,
        };

        let resp = self
            .post(&self.settings.image_model, Method::Generate, &body)
            .await?;
        let v: Value = resp.json().await?;
        Ok(extract_image(&v))
    }
}

fn system_instruction(text: Option<&str>) -> Option<SystemInstruction<'_>> {
    text.map(|text| SystemInstruction {
        parts: [TextPart { text }],
    })
}

/// Find the end of the next SSE frame: `(offset, delimiter length)`.
fn find_frame_end(buf: &[u8]) -> Option<(usize, usize)> {
    let lf = buf.windows(2).position(|w| w == b"\n\n").map(|p| (p, 2));
    let crlf = buf.windows(4).position(|w| w == b"\r\n\r\n").map(|p| (p, 4));
    match (lf, crlf) {
        (Some(a), Some(b)) => Some(if a.0 <= b.0 { a } else { b }),
        (a, b) => a.or(b),
    }
}

/// Parse one SSE frame into the text it carries.
fn parse_frame(frame: &[u8]) -> Result<Option<String>> {
    let text = String::from_utf8_lossy(frame);
    let mut out = String::new();

    for line in text.lines() {
        let line = line.trim();
        let Some(data) = line.strip_prefix("data:") else {
            continue;
        };
        let data = data.trim();
        if data.is_empty() || data == "[DONE]" {
            continue;
        }

        let v: Value = serde_json::from_str(data)?;
        if let Some(err) = v.get("error") {
            let message = err
                .get("message")
                .and_then(Value::as_str)
                .unwrap_or("stream error")
                .to_string();
            return Err(GameError::Stream(message));
        }
        out.push_str(&extract_text(&v));
    }

    Ok((!out.is_empty()).then_some(out))
}

/// Concatenate the text parts of the first candidate, skipping thoughts.
fn extract_text(v: &Value) -> String {
    v["candidates"][0]["content"]["parts"]
        .as_array()
        .map(|parts| {
            parts
                .iter()
                .filter(|p| !p.get("thought").and_then(Value::as_bool).unwrap_or(false))
                .filter_map(|p| p.get("text").and_then(Value::as_str))
                .collect()
        })
        .unwrap_or_default()
}

/// First inline image found in any candidate.
fn extract_image(v: &Value) -> Option<InlineImage> {
    let candidates = v.get("candidates").and_then(Value::as_array)?;

    candidates
        .iter()
        .filter_map(|c| c.get("content")?.get("parts")?.as_array())
        .flatten()
        .find_map(|part| {
            let inline = part.get("inlineData").or_else(|| part.get("inline_data"))?;
            let data = inline.get("data").and_then(Value::as_str)?;
            if data.is_empty() {
                return None;
            }
            let mime_type = inline
                .get("mimeType")
                .or_else(|| inline.get("mime_type"))
                .and_then(Value::as_str)
                .unwrap_or("image/png");
            Some(InlineImage {
                mime_type: mime_type.to_string(),
                data: data.to_string(),
            })
        })
}

fn map_api_error(status: u16, body: &str) -> GameError {
    let message = serde_json::from_str::<ErrorWrapper>(body)
        .map(|wrapper| {
            let status_text = wrapper.error.status.unwrap_or_default();
            let msg = wrapper.error.message.unwrap_or_else(|| body.to_string());
            if status_text.is_empty() {
                msg
            } else {
                format!("{status_text}: {msg}")
            }
        })
        .unwrap_or_else(|_| body.to_string());

    GameError::Api { status, message }
}

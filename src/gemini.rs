use std::time::Duration;

use async_trait::async_trait;
use base64::Engine;
use once_cell::sync::Lazy;
use regex::Regex;
use reqwest::header::HeaderValue;
use serde::{Deserialize, Serialize};
use url::Url;

use crate::config::Settings;

// ── Constants ────────────────────────────────────────────────────────────────

/// Model used when the configured one is unset or cannot be initialized.
pub const FALLBACK_MODEL: &str = "gemini-2.5-flash";

/// Every submitted image is tagged as JPEG, whatever its real encoding.
pub const IMAGE_MIME_TYPE: &str = "image/jpeg";

const USER_AGENT: &str = "sensesketch-api/0.1";
const RESPONSE_MIME_TYPE: &str = "application/json";
const TEMPERATURE: f32 = 0.7;
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const ERROR_BODY_LIMIT: usize = 200;

pub const SYSTEM_PROMPT: &str = r#"Bạn là trợ lý giúp phụ huynh và giáo viên hiểu ý định đằng sau bức vẽ hoặc bức ảnh của một đứa trẻ tự kỷ.

Bạn sẽ nhận được một hình ảnh. Bạn CHỈ được trả về một đối tượng JSON chứa danh sách "intents".

Mỗi intent là một ý nghĩa hoặc nhu cầu có thể có đằng sau bức vẽ.

Định dạng:
{ "intents": [ { "label": string, "confidence": number, "category": string, "reasoning": string }, ... ] }

"label" phải ngắn gọn, bằng tiếng Việt, ví dụ "Con muốn uống nước".
"confidence" là số từ 0.0 đến 1.0.
"category" là một trong "need", "emotion", "object" hoặc "activity".
"reasoning" là lời giải thích ngắn bằng tiếng Việt đơn giản.

Nếu bức vẽ không rõ ràng, hãy trả về confidence thấp và giải thích sự không chắc chắn trong "reasoning".

Luôn trả về ít nhất một intent, kể cả khi confidence thấp.
"#;

// ── Lazy static regexes ──────────────────────────────────────────────────────

static MODEL_ID_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._-]*$").unwrap());

// ── Error types ──────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum ModelError {
    #[error("cannot initialize model '{model}': {reason}")]
    Init { model: String, reason: String },
    #[error("{0}")]
    Request(String),
    #[error("upstream returned {status}: {body}")]
    Status { status: u16, body: String },
    #[error("response contained no text")]
    EmptyResponse,
    #[error("unreadable response: {0}")]
    Decode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum InvokeError {
    #[error("Gemini API error: {0}")]
    BackendUnavailable(ModelError),
    #[error(
        "Gemini API error: failed to initialize models. \
         Primary '{primary}' failed with: {primary_error}. \
         Fallback '{fallback}' failed with: {fallback_error}."
    )]
    BothFailed {
        primary: String,
        primary_error: ModelError,
        fallback: String,
        fallback_error: ModelError,
    },
    #[error("Gemini API error: {0}")]
    Generation(ModelError),
}

// ── Backend seam ─────────────────────────────────────────────────────────────

/// Something that can bind a client to a named model.
pub trait ModelBackend: Send + Sync {
    fn init_model(&self, model_name: &str) -> Result<Box<dyn GenerativeModel>, ModelError>;
}

#[async_trait]
pub trait GenerativeModel: Send + Sync {
    fn name(&self) -> &str;

    async fn generate(
        &self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
    ) -> Result<String, ModelError>;
}

// ── Invocation with fallback ─────────────────────────────────────────────────

#[derive(Debug)]
pub struct ModelOutput {
    pub model: String,
    pub text: String,
}

pub async fn invoke_model(
    backend: &dyn ModelBackend,
    image: &[u8],
    model_name: &str,
) -> Result<ModelOutput, InvokeError> {
    let model = init_with_fallback(backend, model_name)?;
    let text = model
        .generate(SYSTEM_PROMPT, image, IMAGE_MIME_TYPE)
        .await
        .map_err(InvokeError::Generation)?;
    Ok(ModelOutput {
        model: model.name().to_string(),
        text,
    })
}

fn init_with_fallback(
    backend: &dyn ModelBackend,
    model_name: &str,
) -> Result<Box<dyn GenerativeModel>, InvokeError> {
    let primary_error = match backend.init_model(model_name) {
        Ok(model) => return Ok(model),
        Err(e) if model_name == FALLBACK_MODEL => return Err(InvokeError::BackendUnavailable(e)),
        Err(e) => e,
    };

    tracing::warn!(
        "model '{}' failed to initialize ({}), falling back to '{}'",
        model_name,
        primary_error,
        FALLBACK_MODEL
    );

    backend
        .init_model(FALLBACK_MODEL)
        .map_err(|fallback_error| InvokeError::BothFailed {
            primary: model_name.to_string(),
            primary_error,
            fallback: FALLBACK_MODEL.to_string(),
            fallback_error,
        })
}

// ── Gemini REST backend ──────────────────────────────────────────────────────

pub struct GeminiBackend {
    client: reqwest::Client,
    api_key: String,
    base_url: Url,
}

impl GeminiBackend {
    pub fn new(settings: &Settings) -> Result<Self, ModelError> {
        let client = reqwest::ClientBuilder::new()
            .connect_timeout(CONNECT_TIMEOUT)
            .timeout(settings.request_timeout)
            .user_agent(USER_AGENT)
            .build()
            .map_err(|e| ModelError::Request(e.to_string()))?;

        // A trailing slash keeps any path prefix when joining endpoint paths.
        let mut base = settings.base_url.clone();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base_url = Url::parse(&base)
            .map_err(|e| ModelError::Request(format!("invalid GEMINI_BASE_URL: {}", e)))?;

        Ok(Self {
            client,
            api_key: settings.api_key.clone(),
            base_url,
        })
    }
}

impl ModelBackend for GeminiBackend {
    fn init_model(&self, model_name: &str) -> Result<Box<dyn GenerativeModel>, ModelError> {
        let init_error = |reason: String| ModelError::Init {
            model: model_name.to_string(),
            reason,
        };

        let trimmed = model_name.trim();
        let id = trimmed.strip_prefix("models/").unwrap_or(trimmed);
        if !MODEL_ID_RE.is_match(id) {
            return Err(init_error("invalid model identifier".to_string()));
        }

        let endpoint = self
            .base_url
            .join(&format!("v1beta/models/{}:generateContent", id))
            .map_err(|e| init_error(e.to_string()))?;

        let mut api_key = HeaderValue::from_str(&self.api_key)
            .map_err(|_| init_error("API key is not a valid header value".to_string()))?;
        api_key.set_sensitive(true);

        Ok(Box::new(GeminiModel {
            client: self.client.clone(),
            name: id.to_string(),
            endpoint,
            api_key,
        }))
    }
}

struct GeminiModel {
    client: reqwest::Client,
    name: String,
    endpoint: Url,
    api_key: HeaderValue,
}

#[async_trait]
impl GenerativeModel for GeminiModel {
    fn name(&self) -> &str {
        &self.name
    }

    async fn generate(
        &self,
        prompt: &str,
        image: &[u8],
        mime_type: &str,
    ) -> Result<String, ModelError> {
        let body = GenerateRequest {
            contents: vec![Content {
                parts: vec![
                    Part::text(prompt),
                    Part::inline(mime_type, base64::engine::general_purpose::STANDARD.encode(image)),
                ],
            }],
            generation_config: GenerationConfig {
                response_mime_type: RESPONSE_MIME_TYPE,
                temperature: TEMPERATURE,
            },
        };

        let response = self
            .client
            .post(self.endpoint.clone())
            .header("x-goog-api-key", self.api_key.clone())
            .json(&body)
            .send()
            .await
            .map_err(|e| {
                if e.is_timeout() {
                    ModelError::Request(format!("TimeoutError: {}", e))
                } else if e.is_connect() {
                    ModelError::Request(format!("ConnectError: {}", e))
                } else {
                    ModelError::Request(format!("RequestError: {}", e))
                }
            })?;

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            return Err(ModelError::Status {
                status: status.as_u16(),
                body: text.chars().take(ERROR_BODY_LIMIT).collect(),
            });
        }

        let payload: GenerateResponse = response
            .json()
            .await
            .map_err(|e| ModelError::Decode(e.to_string()))?;

        payload.into_text().ok_or(ModelError::EmptyResponse)
    }
}

// ── Wire types ───────────────────────────────────────────────────────────────

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerateRequest<'a> {
    contents: Vec<Content<'a>>,
    generation_config: GenerationConfig,
}

#[derive(Debug, Serialize)]
struct Content<'a> {
    parts: Vec<Part<'a>>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct Part<'a> {
    #[serde(skip_serializing_if = "Option::is_none")]
    text: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    inline_data: Option<InlineData<'a>>,
}

impl<'a> Part<'a> {
    fn text(text: &'a str) -> Self {
        Self {
            text: Some(text),
            inline_data: None,
        }
    }

    fn inline(mime_type: &'a str, data: String) -> Self {
        Self {
            text: None,
            inline_data: Some(InlineData { mime_type, data }),
        }
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct InlineData<'a> {
    mime_type: &'a str,
    data: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct GenerationConfig {
    response_mime_type: &'static str,
    temperature: f32,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: Option<CandidateContent>,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<ResponsePart>,
}

#[derive(Debug, Deserialize)]
struct ResponsePart {
    text: Option<String>,
}

impl GenerateResponse {
    /// Joined text of the first candidate; `None` when it carries no text.
    fn into_text(self) -> Option<String> {
        let content = self.candidates.into_iter().next()?.content?;
        let text: String = content
            .parts
            .into_iter()
            .filter_map(|p| p.text)
            .collect::<Vec<_>>()
            .join("");
        if text.trim().is_empty() {
            None
        } else {
            Some(text)
        }
    }
}

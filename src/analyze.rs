use std::any::Any;
use std::sync::Arc;

use axum::{
    extract::{rejection::JsonRejection, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use base64::Engine;
use serde_json::json;

use crate::config::Settings;
use crate::gemini::{self, InvokeError, ModelBackend};
use crate::models::{AnalyzeRequest, AnalyzeResponse};
use crate::normalize;

// ── Shared state ─────────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub settings: Arc<Settings>,
    pub backend: Arc<dyn ModelBackend>,
}

// ── Error type ───────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum AnalyzeError {
    #[error("{detail}")]
    InvalidBody { status: StatusCode, detail: String },
    #[error("Invalid base64 image data: {0}")]
    InvalidImage(String),
    #[error("Image analysis failed: {0}")]
    Analysis(#[from] InvokeError),
    #[error("Invalid response format: {0}")]
    InvalidResponse(String),
    #[error("Internal server error: {0}")]
    Internal(String),
}

impl AnalyzeError {
    fn status(&self) -> StatusCode {
        match self {
            AnalyzeError::InvalidBody { status, .. } => *status,
            AnalyzeError::InvalidImage(_) => StatusCode::BAD_REQUEST,
            AnalyzeError::Analysis(_)
            | AnalyzeError::InvalidResponse(_)
            | AnalyzeError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Malformed bodies are the only failures not logged as errors.
    fn log_level(&self) -> tracing::Level {
        match self {
            AnalyzeError::InvalidBody { .. } => tracing::Level::WARN,
            _ => tracing::Level::ERROR,
        }
    }
}

impl IntoResponse for AnalyzeError {
    fn into_response(self) -> Response {
        let status = self.status();
        let detail = self.to_string();
        if self.log_level() == tracing::Level::ERROR {
            tracing::error!("{}", detail);
        } else {
            tracing::warn!("rejected request: {}", detail);
        }
        (status, Json(json!({ "detail": detail }))).into_response()
    }
}

/// Converts a handler panic into the generic 500 response.
pub fn panic_response(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        "unknown panic".to_string()
    };
    AnalyzeError::Internal(message).into_response()
}

// ── Image decoding ───────────────────────────────────────────────────────────

/// Drops everything up to and including the first comma (a `data:...;base64,` header).
pub fn strip_data_url(input: &str) -> &str {
    match input.split_once(',') {
        Some((_, payload)) => payload,
        None => input,
    }
}

pub fn decode_image(input: &str) -> Result<Vec<u8>, AnalyzeError> {
    let payload: String = strip_data_url(input)
        .chars()
        .filter(|c| !c.is_ascii_whitespace())
        .collect();

    let bytes = base64::engine::general_purpose::STANDARD
        .decode(payload.as_bytes())
        .map_err(|e| AnalyzeError::InvalidImage(e.to_string()))?;

    if bytes.is_empty() {
        return Err(AnalyzeError::InvalidImage("image payload is empty".to_string()));
    }
    Ok(bytes)
}

// ── Handler ──────────────────────────────────────────────────────────────────

pub async fn analyze(
    State(state): State<AppState>,
    body: Result<Json<AnalyzeRequest>, JsonRejection>,
) -> Result<Json<AnalyzeResponse>, AnalyzeError> {
    let Json(req) = body.map_err(|rejection| AnalyzeError::InvalidBody {
        status: rejection.status(),
        detail: rejection.body_text(),
    })?;

    let image = decode_image(&req.image_base64)?;

    let output = gemini::invoke_model(
        state.backend.as_ref(),
        &image,
        state.settings.resolved_model_name(),
    )
    .await?;

    let normalized = normalize::normalize(&output.text);
    let response = normalize::validate_response(&normalized)
        .map_err(|defects| AnalyzeError::InvalidResponse(normalize::describe_defects(&defects)))?;

    tracing::info!(
        "analyzed {} byte image with {}: {} intent(s)",
        image.len(),
        output.model,
        response.intents.len()
    );
    Ok(Json(response))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;
    use std::time::Duration;

    use async_trait::async_trait;
    use axum::{body::Body, http::Request, Router};
    use serde_json::Value;
    use tower::ServiceExt;

    use crate::gemini::{GenerativeModel, ModelError, FALLBACK_MODEL};
    use crate::normalize::{DEFAULT_REASONING, PARSE_ERROR_LABEL};

    // ── Fake backend ─────────────────────────────────────────────────────────

    #[derive(Default)]
    struct Calls {
        inits: Vec<String>,
        images: Vec<Vec<u8>>,
    }

    struct FakeBackend {
        reply: Result<&'static str, &'static str>,
        failing: Vec<&'static str>,
        panics: bool,
        calls: Arc<Mutex<Calls>>,
    }

    struct FakeModel {
        name: String,
        reply: Result<&'static str, &'static str>,
        calls: Arc<Mutex<Calls>>,
    }

    impl ModelBackend for FakeBackend {
        fn init_model(&self, model_name: &str) -> Result<Box<dyn GenerativeModel>, ModelError> {
            if self.panics {
                panic!("backend exploded");
            }
            self.calls.lock().unwrap().inits.push(model_name.to_string());
            if self.failing.iter().any(|f| *f == model_name) {
                return Err(ModelError::Init {
                    model: model_name.to_string(),
                    reason: "model not available".to_string(),
                });
            }
            Ok(Box::new(FakeModel {
                name: model_name.to_string(),
                reply: self.reply,
                calls: self.calls.clone(),
            }))
        }
    }

    #[async_trait]
    impl GenerativeModel for FakeModel {
        fn name(&self) -> &str {
            &self.name
        }

        async fn generate(&self, _: &str, image: &[u8], _: &str) -> Result<String, ModelError> {
            self.calls.lock().unwrap().images.push(image.to_vec());
            self.reply
                .map(str::to_string)
                .map_err(|e| ModelError::Request(e.to_string()))
        }
    }

    struct Harness {
        app: Router,
        calls: Arc<Mutex<Calls>>,
    }

    fn harness(
        model_name: Option<&str>,
        reply: Result<&'static str, &'static str>,
        failing: Vec<&'static str>,
        panics: bool,
    ) -> Harness {
        let calls = Arc::new(Mutex::new(Calls::default()));
        let settings = Settings {
            api_key: "test-key".to_string(),
            model_name: model_name.map(str::to_string),
            base_url: "https://example.invalid".to_string(),
            request_timeout: Duration::from_secs(5),
            bind_addr: "127.0.0.1:0".parse().unwrap(),
        };
        let backend = FakeBackend {
            reply,
            failing,
            panics,
            calls: calls.clone(),
        };
        let state = AppState {
            settings: Arc::new(settings),
            backend: Arc::new(backend),
        };
        Harness {
            app: crate::app(state),
            calls,
        }
    }

    fn replying(reply: &'static str) -> Harness {
        harness(None, Ok(reply), vec![], false)
    }

    async fn post_analyze(app: Router, body: Value) -> (StatusCode, Value) {
        let request = Request::builder()
            .method("POST")
            .uri("/api/v1/analyze")
            .header("content-type", "application/json")
            .body(Body::from(body.to_string()))
            .unwrap();
        let response = app.oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    const GOOD_REPLY: &str = r#"{"intents": [{"label": "Con muốn uống nước", "confidence": 0.8, "category": "need", "reasoning": "Có một cái cốc"}]}"#;

    // ── Decoding ─────────────────────────────────────────────────────────────

    #[test]
    fn data_url_prefix_does_not_change_bytes() {
        let plain = decode_image("iVBORw0KGgo=").unwrap();
        let prefixed = decode_image("data:image/png;base64,iVBORw0KGgo=").unwrap();
        assert_eq!(plain, prefixed);
        assert_eq!(plain, b"\x89PNG\r\n\x1a\n".to_vec());
    }

    #[test]
    fn strip_data_url_splits_on_first_comma_only() {
        assert_eq!(strip_data_url("data:image/png;base64,iVBORw0KGgo="), "iVBORw0KGgo=");
        assert_eq!(strip_data_url("a,b,c"), "b,c");
        assert_eq!(strip_data_url("iVBORw0KGgo="), "iVBORw0KGgo=");
    }

    #[test]
    fn line_wrapped_base64_decodes() {
        assert_eq!(decode_image("iVBO\nRw0K\r\nGgo=").unwrap(), b"\x89PNG\r\n\x1a\n".to_vec());
    }

    #[test]
    fn malformed_or_empty_base64_is_rejected() {
        for input in ["!!!not-base64!!!", "iVBORw0KGgo", "data:image/png;base64,", ""] {
            let err = decode_image(input).unwrap_err();
            assert!(matches!(err, AnalyzeError::InvalidImage(_)), "input: {:?}", input);
            assert_eq!(err.status(), StatusCode::BAD_REQUEST);
            assert_eq!(err.log_level(), tracing::Level::ERROR);
        }
    }

    #[test]
    fn only_body_rejections_log_below_error() {
        let body = AnalyzeError::InvalidBody {
            status: StatusCode::UNPROCESSABLE_ENTITY,
            detail: "missing field".to_string(),
        };
        assert_eq!(body.log_level(), tracing::Level::WARN);
        for err in [
            AnalyzeError::InvalidImage("bad".to_string()),
            AnalyzeError::InvalidResponse("bad".to_string()),
            AnalyzeError::Internal("bad".to_string()),
        ] {
            assert_eq!(err.log_level(), tracing::Level::ERROR);
        }
    }

    // ── Endpoint ─────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn health_check_reports_ok() {
        let h = replying(GOOD_REPLY);
        let request = Request::builder().uri("/").body(Body::empty()).unwrap();
        let response = h.app.oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(body["status"], "ok");
        assert!(body["message"].as_str().unwrap().contains("running"));
    }

    #[tokio::test]
    async fn data_url_image_is_forwarded_to_model() {
        let h = replying(GOOD_REPLY);
        let (status, body) = post_analyze(
            h.app,
            json!({"image_base64": "data:image/png;base64,iVBORw0KGgo="}),
        )
        .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["intents"][0]["label"], "Con muốn uống nước");
        assert_eq!(body["intents"][0]["category"], "need");
        let calls = h.calls.lock().unwrap();
        assert_eq!(calls.images, vec![b"\x89PNG\r\n\x1a\n".to_vec()]);
        assert_eq!(calls.inits, vec![FALLBACK_MODEL]);
    }

    #[tokio::test]
    async fn camel_case_field_is_accepted() {
        let h = replying(GOOD_REPLY);
        let (status, _) = post_analyze(h.app, json!({"imageBase64": "iVBORw0KGgo="})).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn bad_base64_never_reaches_model() {
        let h = replying(GOOD_REPLY);
        let (status, body) = post_analyze(h.app, json!({"image_base64": "!!!not-base64!!!"})).await;

        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(body["detail"].as_str().unwrap().contains("Invalid base64"));
        let calls = h.calls.lock().unwrap();
        assert!(calls.inits.is_empty());
        assert!(calls.images.is_empty());
    }

    #[tokio::test]
    async fn missing_field_is_unprocessable() {
        let h = replying(GOOD_REPLY);
        let (status, body) = post_analyze(h.app, json!({"image": "iVBORw0KGgo="})).await;
        assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
        assert!(body["detail"].as_str().unwrap().contains("image_base64"));
    }

    #[tokio::test]
    async fn unparsable_model_output_degrades_to_single_intent() {
        let h = replying("not json");
        let (status, body) = post_analyze(h.app, json!({"image_base64": "iVBORw0KGgo="})).await;

        assert_eq!(status, StatusCode::OK);
        let intents = body["intents"].as_array().unwrap();
        assert_eq!(intents.len(), 1);
        assert_eq!(intents[0]["label"], PARSE_ERROR_LABEL);
        assert_eq!(intents[0]["confidence"], 0.0);
        assert_eq!(intents[0]["category"], "object");
        assert!(!intents[0]["reasoning"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn partial_intent_is_backfilled() {
        let h = replying(r#"{"intents": [{"label": "muốn uống nước"}]}"#);
        let (status, body) = post_analyze(h.app, json!({"image_base64": "iVBORw0KGgo="})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(
            body,
            json!({"intents": [{
                "label": "muốn uống nước",
                "confidence": 0.0,
                "category": "object",
                "reasoning": DEFAULT_REASONING,
            }]})
        );
    }

    #[tokio::test]
    async fn shapeless_output_returns_empty_intents() {
        let h = replying(r#"{"answer": "a cat"}"#);
        let (status, body) = post_analyze(h.app, json!({"image_base64": "iVBORw0KGgo="})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"intents": []}));
    }

    #[tokio::test]
    async fn wrongly_typed_fields_fail_validation() {
        let h = replying(r#"{"intents": [{"label": "Mèo", "confidence": "high"}]}"#);
        let (status, body) = post_analyze(h.app, json!({"image_base64": "iVBORw0KGgo="})).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.starts_with("Invalid response format"));
        assert!(detail.contains("intents[0].confidence"));
    }

    #[tokio::test]
    async fn quoted_confidence_is_accepted() {
        let h = replying(r#"{"intents": [{"label": "Nước", "confidence": "0.8", "category": "need", "reasoning": "r"}]}"#);
        let (status, body) = post_analyze(h.app, json!({"image_base64": "iVBORw0KGgo="})).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["intents"][0]["confidence"], 0.8);
    }

    #[tokio::test]
    async fn failing_fallback_model_is_tried_once() {
        let h = harness(Some(FALLBACK_MODEL), Ok(GOOD_REPLY), vec![FALLBACK_MODEL], false);
        let (status, body) = post_analyze(h.app, json!({"image_base64": "iVBORw0KGgo="})).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        assert!(body["detail"].as_str().unwrap().starts_with("Image analysis failed"));
        assert_eq!(h.calls.lock().unwrap().inits, vec![FALLBACK_MODEL]);
    }

    #[tokio::test]
    async fn configured_model_falls_back_before_failing() {
        let h = harness(
            Some("gemini-1.5-pro"),
            Ok(GOOD_REPLY),
            vec!["gemini-1.5-pro", FALLBACK_MODEL],
            false,
        );
        let (status, body) = post_analyze(h.app, json!({"image_base64": "iVBORw0KGgo="})).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.contains("Primary 'gemini-1.5-pro'"));
        assert!(detail.contains(&format!("Fallback '{}'", FALLBACK_MODEL)));
        assert_eq!(
            h.calls.lock().unwrap().inits,
            vec!["gemini-1.5-pro", FALLBACK_MODEL]
        );
    }

    #[tokio::test]
    async fn configured_model_fallback_can_succeed() {
        let h = harness(Some("gemini-1.5-pro"), Ok(GOOD_REPLY), vec!["gemini-1.5-pro"], false);
        let (status, _) = post_analyze(h.app, json!({"image_base64": "iVBORw0KGgo="})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(h.calls.lock().unwrap().images.len(), 1);
    }

    #[tokio::test]
    async fn generation_failure_is_server_error() {
        let h = harness(None, Err("quota exceeded"), vec![], false);
        let (status, body) = post_analyze(h.app, json!({"image_base64": "iVBORw0KGgo="})).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.contains("Gemini API error"));
        assert!(detail.contains("quota exceeded"));
    }

    #[tokio::test]
    async fn panics_become_generic_server_error() {
        let h = harness(None, Ok(GOOD_REPLY), vec![], true);
        let (status, body) = post_analyze(h.app, json!({"image_base64": "iVBORw0KGgo="})).await;

        assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
        let detail = body["detail"].as_str().unwrap();
        assert!(detail.starts_with("Internal server error"));
        assert!(detail.contains("backend exploded"));
    }
}

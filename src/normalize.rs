use once_cell::sync::Lazy;
use regex::Regex;
use serde_json::{json, Map, Value};

use crate::models::{AnalyzeResponse, Intent};

// ── Constants ────────────────────────────────────────────────────────────────

pub const DEFAULT_LABEL: &str = "Không xác định";
pub const DEFAULT_CONFIDENCE: f64 = 0.0;
pub const DEFAULT_CATEGORY: &str = "object";
pub const DEFAULT_REASONING: &str = "Không thể phân tích được.";

pub const PARSE_ERROR_LABEL: &str = "Lỗi phân tích";
const PARSE_ERROR_PREFIX: &str = "Không thể phân tích phản hồi từ AI";

// ── Lazy static regexes ──────────────────────────────────────────────────────

static CODE_FENCE_RE: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"(?is)^```(?:json)?\s*(.*?)\s*```$").unwrap());

// ── Error types ──────────────────────────────────────────────────────────────

/// Model output that could not be parsed. Recovered locally, never sent to the client as an error.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{0}")]
pub struct MalformedOutput(String);

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("{path}: {message}")]
pub struct SchemaDefect {
    pub path: String,
    pub message: String,
}

impl SchemaDefect {
    fn new(path: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            message: message.into(),
        }
    }
}

pub fn describe_defects(defects: &[SchemaDefect]) -> String {
    defects
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ── Parsing ──────────────────────────────────────────────────────────────────

/// Removes a surrounding markdown code fence (optionally tagged `json`).
pub fn strip_code_fence(text: &str) -> &str {
    match CODE_FENCE_RE.captures(text).and_then(|c| c.get(1)) {
        Some(inner) => inner.as_str(),
        None => text,
    }
}

pub fn parse_model_output(raw: &str) -> Result<Value, MalformedOutput> {
    let text = strip_code_fence(raw.trim());
    serde_json::from_str(text).map_err(|e| MalformedOutput(e.to_string()))
}

// ── Normalization ────────────────────────────────────────────────────────────

/// Turns raw model text into `{"intents": [...]}` with every entry back-filled.
///
/// Unparsable text becomes a single zero-confidence intent that carries the
/// parse error in its reasoning.
pub fn normalize(raw: &str) -> Value {
    match parse_model_output(raw) {
        Ok(value) => backfill(value),
        Err(err) => {
            tracing::warn!("model returned malformed output: {}", err);
            parse_failure(&err)
        }
    }
}

fn parse_failure(err: &MalformedOutput) -> Value {
    json!({
        "intents": [{
            "label": PARSE_ERROR_LABEL,
            "confidence": DEFAULT_CONFIDENCE,
            "category": DEFAULT_CATEGORY,
            "reasoning": format!("{}: {}", PARSE_ERROR_PREFIX, err),
        }]
    })
}

fn backfill(value: Value) -> Value {
    let mut intents = match value {
        Value::Object(mut root) => match root.remove("intents") {
            Some(Value::Array(items)) => items,
            _ => Vec::new(),
        },
        _ => Vec::new(),
    };

    // Non-object entries are left for the schema validator to reject.
    for item in intents.iter_mut() {
        if let Value::Object(fields) = item {
            fill_missing(fields, "label", json!(DEFAULT_LABEL));
            fill_missing(fields, "confidence", json!(DEFAULT_CONFIDENCE));
            fill_missing(fields, "category", json!(DEFAULT_CATEGORY));
            fill_missing(fields, "reasoning", json!(DEFAULT_REASONING));
        }
    }

    json!({ "intents": intents })
}

fn fill_missing(fields: &mut Map<String, Value>, key: &str, default: Value) {
    if matches!(fields.get(key), None | Some(Value::Null)) {
        fields.insert(key.to_string(), default);
    }
}

// ── Schema validation ────────────────────────────────────────────────────────

/// Checks a normalized structure against the response schema, collecting every defect.
/// Keys outside the four intent fields are dropped.
pub fn validate_response(value: &Value) -> Result<AnalyzeResponse, Vec<SchemaDefect>> {
    let Some(items) = value.get("intents").and_then(Value::as_array) else {
        return Err(vec![SchemaDefect::new("intents", "expected an array")]);
    };

    let mut defects = Vec::new();
    let mut intents = Vec::with_capacity(items.len());

    for (idx, item) in items.iter().enumerate() {
        let path = format!("intents[{}]", idx);
        let Some(fields) = item.as_object() else {
            defects.push(SchemaDefect::new(
                path,
                format!("expected an object, got {}", kind(item)),
            ));
            continue;
        };

        let label = string_field(fields, &path, "label", &mut defects);
        let confidence = number_field(fields, &path, "confidence", &mut defects);
        let category = string_field(fields, &path, "category", &mut defects);
        let reasoning = string_field(fields, &path, "reasoning", &mut defects);

        if let (Some(label), Some(confidence), Some(category), Some(reasoning)) =
            (label, confidence, category, reasoning)
        {
            intents.push(Intent {
                label,
                confidence,
                category,
                reasoning,
            });
        }
    }

    if defects.is_empty() {
        Ok(AnalyzeResponse { intents })
    } else {
        Err(defects)
    }
}

fn string_field(
    fields: &Map<String, Value>,
    path: &str,
    key: &str,
    defects: &mut Vec<SchemaDefect>,
) -> Option<String> {
    match fields.get(key) {
        Some(Value::String(s)) => Some(s.clone()),
        Some(other) => {
            defects.push(SchemaDefect::new(
                format!("{}.{}", path, key),
                format!("expected a string, got {}", kind(other)),
            ));
            None
        }
        None => {
            defects.push(SchemaDefect::new(format!("{}.{}", path, key), "field required"));
            None
        }
    }
}

fn number_field(
    fields: &Map<String, Value>,
    path: &str,
    key: &str,
    defects: &mut Vec<SchemaDefect>,
) -> Option<f64> {
    match fields.get(key) {
        Some(Value::Number(n)) => n.as_f64(),
        // Quoted numbers are coerced; anything else in a string is a defect.
        Some(Value::String(s)) => match s.trim().parse::<f64>() {
            Ok(n) if n.is_finite() => Some(n),
            _ => {
                defects.push(SchemaDefect::new(
                    format!("{}.{}", path, key),
                    format!("expected a number, got {:?}", s),
                ));
                None
            }
        },
        Some(other) => {
            defects.push(SchemaDefect::new(
                format!("{}.{}", path, key),
                format!("expected a number, got {}", kind(other)),
            ));
            None
        }
        None => {
            defects.push(SchemaDefect::new(format!("{}.{}", path, key), "field required"));
            None
        }
    }
}

fn kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

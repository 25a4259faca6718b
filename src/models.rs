use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize)]
pub struct AnalyzeRequest {
    #[serde(alias = "imageBase64")]
    pub image_base64: String,
}

/// One hypothesized meaning behind a drawing.
#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct Intent {
    pub label: String,
    pub confidence: f64,
    pub category: String,
    pub reasoning: String,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AnalyzeResponse {
    pub intents: Vec<Intent>,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub message: &'static str,
    pub status: &'static str,
}

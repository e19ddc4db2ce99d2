use serde::{Deserialize, Serialize};

// Ollama API request format
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct GenerateRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default)]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub options: Option<GenerateOptions>,
    // Caller's own deadline in seconds, capped by the gateway's; not forwarded
    #[serde(default, skip_serializing)]
    pub timeout: Option<u64>,
}

// Model options; num_thread is overwritten with the gateway's advice
#[derive(Deserialize, Serialize, Clone, Debug, Default)]
pub struct GenerateOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub num_thread: Option<usize>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

// Ollama API response format
#[derive(Deserialize, Serialize, Clone, Debug)]
pub struct GenerateResponse {
    pub model: String,
    pub response: String,
}

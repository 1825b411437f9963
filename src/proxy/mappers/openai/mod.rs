pub mod streaming;

use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct OpenAIRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<OpenAIMessage>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stop: Option<Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenAIMessage {
    pub role: String,
    #[serde(default)]
    pub content: Option<OpenAIContent>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum OpenAIContent {
    String(String),
    Array(Vec<Value>),
}

impl OpenAIContent {
    pub fn flat_text(&self) -> String {
        match self {
            OpenAIContent::String(s) => s.clone(),
            OpenAIContent::Array(blocks) => blocks
                .iter()
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

/// Translate an OpenAI chat request into the inner Gemini request. System
/// turns become the system instruction; everything else maps to contents.
pub fn to_gemini_request(req: &OpenAIRequest) -> Value {
    let mut contents = Vec::new();
    let mut system_parts = Vec::new();

    for message in &req.messages {
        let text = message
            .content
            .as_ref()
            .map(|c| c.flat_text())
            .unwrap_or_default();
        match message.role.as_str() {
            "system" | "developer" => {
                if !text.is_empty() {
                    system_parts.push(text);
                }
            }
            "assistant" => contents.push(json!({"role": "model", "parts": [{"text": text}]})),
            _ => contents.push(json!({"role": "user", "parts": [{"text": text}]})),
        }
    }

    let mut inner = json!({"contents": contents});
    if !system_parts.is_empty() {
        inner["systemInstruction"] = json!({"parts": [{"text": system_parts.join("\n")}]});
    }

    let mut generation = serde_json::Map::new();
    if let Some(t) = req.temperature {
        generation.insert("temperature".to_string(), json!(t));
    }
    if let Some(p) = req.top_p {
        generation.insert("topP".to_string(), json!(p));
    }
    if let Some(m) = req.max_tokens {
        generation.insert("maxOutputTokens".to_string(), json!(m));
    }
    match &req.stop {
        Some(Value::String(s)) => {
            generation.insert("stopSequences".to_string(), json!([s]));
        }
        Some(Value::Array(a)) if !a.is_empty() => {
            generation.insert("stopSequences".to_string(), json!(a));
        }
        _ => {}
    }
    if !generation.is_empty() {
        inner["generationConfig"] = Value::Object(generation);
    }
    inner
}

pub fn last_user_text(req: &OpenAIRequest) -> Option<String> {
    req.messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .and_then(|m| m.content.as_ref())
        .map(|c| c.flat_text())
        .filter(|t| !t.is_empty())
}

/// Synthetic completion used for cache replays.
pub fn synthetic_openai_response(text: &str, model: &str) -> Value {
    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": "stop"
        }],
        "usage": {"prompt_tokens": 0, "completion_tokens": 0, "total_tokens": 0}
    })
}

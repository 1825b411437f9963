pub mod streaming;

use super::gemini::{claude_stop_reason, ParsedResponse};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Deserialize)]
pub struct ClaudeRequest {
    pub model: String,
    #[serde(default)]
    pub messages: Vec<Message>,
    #[serde(default)]
    pub system: Option<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub max_tokens: Option<u32>,
    #[serde(default)]
    pub temperature: Option<f64>,
    #[serde(default)]
    pub top_p: Option<f64>,
    #[serde(default)]
    pub stop_sequences: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    pub content: MessageContent,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Blocks(Vec<Value>),
}

impl MessageContent {
    pub fn flat_text(&self) -> String {
        match self {
            MessageContent::Text(s) => s.clone(),
            MessageContent::Blocks(blocks) => blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("\n"),
        }
    }
}

fn system_text(system: &Value) -> String {
    match system {
        Value::String(s) => s.clone(),
        Value::Array(blocks) => blocks
            .iter()
            .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

/// Translate an Anthropic messages request into the inner Gemini request.
pub fn to_gemini_request(req: &ClaudeRequest) -> Value {
    let mut contents = Vec::new();
    for message in &req.messages {
        let role = if message.role == "assistant" { "model" } else { "user" };
        let text = message.content.flat_text();
        contents.push(json!({"role": role, "parts": [{"text": text}]}));
    }

    let mut inner = json!({"contents": contents});

    if let Some(system) = &req.system {
        let text = system_text(system);
        if !text.is_empty() {
            inner["systemInstruction"] = json!({"parts": [{"text": text}]});
        }
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
    if !req.stop_sequences.is_empty() {
        generation.insert("stopSequences".to_string(), json!(req.stop_sequences));
    }
    if !generation.is_empty() {
        inner["generationConfig"] = Value::Object(generation);
    }
    inner
}

pub fn last_user_text(req: &ClaudeRequest) -> Option<String> {
    req.messages
        .iter()
        .rev()
        .find(|m| m.role == "user")
        .map(|m| m.content.flat_text())
        .filter(|t| !t.is_empty())
}

/// Rebuild an Anthropic request as an OpenAI chat request for a local
/// provider, folding the system prompt into a leading system message.
pub fn to_local_openai_request(req: &ClaudeRequest, model: &str, stream: bool) -> Value {
    let mut messages = Vec::new();
    if let Some(system) = &req.system {
        let text = system_text(system);
        if !text.is_empty() {
            messages.push(json!({"role": "system", "content": text}));
        }
    }
    for message in &req.messages {
        messages.push(json!({
            "role": message.role,
            "content": message.content.flat_text()
        }));
    }

    let mut body = json!({
        "model": model,
        "messages": messages,
        "stream": stream
    });
    if let Some(m) = req.max_tokens {
        body["max_tokens"] = json!(m);
    }
    if let Some(t) = req.temperature {
        body["temperature"] = json!(t);
    }
    if let Some(p) = req.top_p {
        body["top_p"] = json!(p);
    }
    body
}

fn usage_json(parsed: &ParsedResponse) -> Value {
    let (input, output) = parsed
        .usage
        .as_ref()
        .map(|u| {
            (
                u.prompt_token_count.unwrap_or(0),
                u.candidates_token_count.unwrap_or(0),
            )
        })
        .unwrap_or((0, 0));
    json!({"input_tokens": input, "output_tokens": output})
}

/// Map a whole Gemini response to the Anthropic message shape.
pub fn gemini_to_claude_response(parsed: &ParsedResponse, model: &str) -> Value {
    let mut content: Vec<Value> = Vec::new();
    let mut used_tool = false;

    for part in &parsed.parts {
        if let Some(fc) = &part.function_call {
            used_tool = true;
            content.push(json!({
                "type": "tool_use",
                "id": format!("toolu_{}", uuid::Uuid::new_v4().simple()),
                "name": fc.name,
                "input": fc.args
            }));
            continue;
        }
        if let Some(code) = &part.executable_code {
            let fenced = format!("```{}\n{}\n```", code.language.to_lowercase(), code.code);
            push_text(&mut content, &fenced);
            continue;
        }
        if let Some(text) = &part.text {
            if part.thought.unwrap_or(false) {
                content.push(json!({"type": "thinking", "thinking": text}));
            } else {
                push_text(&mut content, text);
            }
        }
    }

    json!({
        "id": parsed
            .response_id
            .clone()
            .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
        "type": "message",
        "role": "assistant",
        "model": parsed.model_version.as_deref().unwrap_or(model),
        "content": content,
        "stop_reason": claude_stop_reason(parsed.finish_reason.as_deref(), used_tool),
        "stop_sequence": null,
        "usage": usage_json(parsed)
    })
}

// Consecutive plain-text parts merge into one block.
fn push_text(content: &mut Vec<Value>, text: &str) {
    if let Some(last) = content.last_mut() {
        if last.get("type").and_then(|t| t.as_str()) == Some("text") {
            let merged = format!("{}{}", last["text"].as_str().unwrap_or(""), text);
            last["text"] = json!(merged);
            return;
        }
    }
    content.push(json!({"type": "text", "text": text}));
}

/// Flatten the Anthropic intermediate into an OpenAI chat completion.
pub fn claude_to_openai_response(claude: &Value, model: &str) -> Value {
    let text: String = claude
        .get("content")
        .and_then(|c| c.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter(|b| b.get("type").and_then(|t| t.as_str()) == Some("text"))
                .filter_map(|b| b.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default();

    let finish_reason = match claude.get("stop_reason").and_then(|s| s.as_str()) {
        Some("max_tokens") => "length",
        Some("tool_use") => "tool_calls",
        _ => "stop",
    };
    let input = claude
        .pointer("/usage/input_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output = claude
        .pointer("/usage/output_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    json!({
        "id": format!("chatcmpl-{}", uuid::Uuid::new_v4()),
        "object": "chat.completion",
        "created": chrono::Utc::now().timestamp(),
        "model": model,
        "choices": [{
            "index": 0,
            "message": {"role": "assistant", "content": text},
            "finish_reason": finish_reason
        }],
        "usage": {
            "prompt_tokens": input,
            "completion_tokens": output,
            "total_tokens": input + output
        }
    })
}

/// Synthetic Anthropic message used for cache replays.
pub fn synthetic_claude_message(text: &str, model: &str) -> Value {
    json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "stop_sequence": null,
        "usage": {"input_tokens": 0, "output_tokens": 0}
    })
}

/// Re-wrap a local OpenAI-compatible completion as a single-block Anthropic
/// message.
pub fn local_openai_to_claude_response(openai: &Value, model: &str) -> Value {
    let text = openai
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .unwrap_or_default();
    let input = openai
        .pointer("/usage/prompt_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);
    let output = openai
        .pointer("/usage/completion_tokens")
        .and_then(|v| v.as_u64())
        .unwrap_or(0);

    json!({
        "id": format!("msg_{}", uuid::Uuid::new_v4().simple()),
        "type": "message",
        "role": "assistant",
        "model": model,
        "content": [{"type": "text", "text": text}],
        "stop_reason": "end_turn",
        "stop_sequence": null,
        "usage": {"input_tokens": input, "output_tokens": output}
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::proxy::mappers::gemini::parse_response;

    fn request_from(raw: Value) -> ClaudeRequest {
        serde_json::from_value(raw).unwrap()
    }

    #[test]
    fn request_translation_maps_roles_and_system() {
        let req = request_from(json!({
            "model": "claude-sonnet-4-5",
            "max_tokens": 512,
            "system": "be brief",
            "messages": [
                {"role": "user", "content": "hello"},
                {"role": "assistant", "content": [{"type": "text", "text": "hi"}]},
                {"role": "user", "content": "bye"}
            ]
        }));
        let inner = to_gemini_request(&req);
        let contents = inner["contents"].as_array().unwrap();
        assert_eq!(contents.len(), 3);
        assert_eq!(contents[0]["role"], "user");
        assert_eq!(contents[1]["role"], "model");
        assert_eq!(contents[1]["parts"][0]["text"], "hi");
        assert_eq!(inner["systemInstruction"]["parts"][0]["text"], "be brief");
        assert_eq!(inner["generationConfig"]["maxOutputTokens"], 512);
    }

    #[test]
    fn last_user_text_skips_assistant_turns() {
        let req = request_from(json!({
            "model": "m",
            "messages": [
                {"role": "user", "content": "first"},
                {"role": "assistant", "content": "reply"},
                {"role": "user", "content": [{"type": "text", "text": "second"}]}
            ]
        }));
        assert_eq!(last_user_text(&req).as_deref(), Some("second"));
    }

    #[test]
    fn response_mapping_builds_blocks_and_usage() {
        let raw = json!({
            "candidates": [{
                "content": {"parts": [
                    {"text": "thinking...", "thought": true},
                    {"text": "Hello"},
                    {"text": " world"}
                ]},
                "finishReason": "STOP"
            }],
            "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 7}
        });
        let claude = gemini_to_claude_response(&parse_response(&raw), "claude-sonnet-4-5");
        let content = claude["content"].as_array().unwrap();
        assert_eq!(content.len(), 2);
        assert_eq!(content[0]["type"], "thinking");
        assert_eq!(content[1]["text"], "Hello world");
        assert_eq!(claude["stop_reason"], "end_turn");
        assert_eq!(claude["usage"]["output_tokens"], 7);
    }

    #[test]
    fn tool_calls_become_tool_use_blocks() {
        let raw = json!({
            "candidates": [{
                "content": {"parts": [
                    {"functionCall": {"name": "get_weather", "args": {"city": "Berlin"}}}
                ]},
                "finishReason": "STOP"
            }]
        });
        let claude = gemini_to_claude_response(&parse_response(&raw), "m");
        let content = claude["content"].as_array().unwrap();
        assert_eq!(content[0]["type"], "tool_use");
        assert_eq!(content[0]["name"], "get_weather");
        assert_eq!(content[0]["input"]["city"], "Berlin");
        assert_eq!(claude["stop_reason"], "tool_use");
    }

    #[test]
    fn openai_flattening_drops_thinking() {
        let claude = json!({
            "content": [
                {"type": "thinking", "thinking": "hmm"},
                {"type": "text", "text": "final answer"}
            ],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 2, "output_tokens": 5}
        });
        let openai = claude_to_openai_response(&claude, "gpt-4");
        assert_eq!(openai["choices"][0]["message"]["content"], "final answer");
        assert_eq!(openai["choices"][0]["finish_reason"], "stop");
        assert_eq!(openai["usage"]["total_tokens"], 7);
    }

    #[test]
    fn local_wrap_produces_single_block_message() {
        let local = json!({
            "choices": [{"message": {"role": "assistant", "content": "echo"}}],
            "usage": {"prompt_tokens": 1, "completion_tokens": 2}
        });
        let claude = local_openai_to_claude_response(&local, "llama3:8b");
        assert_eq!(claude["content"].as_array().unwrap().len(), 1);
        assert_eq!(claude["content"][0]["text"], "echo");
        assert_eq!(claude["usage"]["output_tokens"], 2);
    }
}

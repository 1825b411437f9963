use serde::{Deserialize, Serialize};
use serde_json::{json, Value};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct UsageMetadata {
    pub prompt_token_count: Option<u32>,
    pub candidates_token_count: Option<u32>,
    pub total_token_count: Option<u32>,
    pub cached_content_token_count: Option<u32>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct GeminiPart {
    pub text: Option<String>,
    pub thought: Option<bool>,
    pub function_call: Option<FunctionCall>,
    pub executable_code: Option<ExecutableCode>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FunctionCall {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ExecutableCode {
    pub language: String,
    pub code: String,
}

/// One upstream SSE event (or whole non-streaming body), reduced to the
/// fields the translators consume.
#[derive(Debug, Default)]
pub struct ParsedResponse {
    pub parts: Vec<GeminiPart>,
    pub finish_reason: Option<String>,
    pub usage: Option<UsageMetadata>,
    pub response_id: Option<String>,
    pub model_version: Option<String>,
}

/// The generation endpoints wrap their payload in a `response` envelope;
/// streaming events sometimes arrive bare.
pub fn unwrap_response(v: &Value) -> &Value {
    v.get("response").unwrap_or(v)
}

pub fn parse_response(raw: &Value) -> ParsedResponse {
    let v = unwrap_response(raw);
    let mut parsed = ParsedResponse {
        response_id: v.get("responseId").and_then(|x| x.as_str()).map(String::from),
        model_version: v.get("modelVersion").and_then(|x| x.as_str()).map(String::from),
        usage: v
            .get("usageMetadata")
            .and_then(|u| serde_json::from_value(u.clone()).ok()),
        ..Default::default()
    };

    if let Some(candidate) = v.get("candidates").and_then(|c| c.as_array()).and_then(|c| c.first()) {
        parsed.finish_reason = candidate
            .get("finishReason")
            .and_then(|f| f.as_str())
            .map(String::from);
        if let Some(parts) = candidate
            .get("content")
            .and_then(|c| c.get("parts"))
            .and_then(|p| p.as_array())
        {
            parsed.parts = parts
                .iter()
                .filter_map(|p| serde_json::from_value(p.clone()).ok())
                .collect();
        }
    }
    parsed
}

/// Build the cloud-code envelope around a translated inner request.
pub fn wrap_request(inner: Value, project_id: &str, model: &str) -> Value {
    json!({
        "project": project_id,
        "requestId": format!("agent-{}", uuid::Uuid::new_v4()),
        "request": inner,
        "model": model,
        "userAgent": crate::constants::USER_AGENT.as_str(),
        "requestType": "agent"
    })
}

pub fn claude_stop_reason(finish_reason: Option<&str>, used_tool: bool) -> &'static str {
    if used_tool {
        "tool_use"
    } else if finish_reason == Some("MAX_TOKENS") {
        "max_tokens"
    } else {
        "end_turn"
    }
}

pub fn openai_finish_reason(finish_reason: Option<&str>, used_tool: bool) -> &'static str {
    if used_tool {
        "tool_calls"
    } else if finish_reason == Some("MAX_TOKENS") {
        "length"
    } else {
        "stop"
    }
}

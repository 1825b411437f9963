use crate::error::AppError;
use crate::proxy::mappers::gemini::{
    claude_stop_reason, parse_response, GeminiPart, ParsedResponse, UsageMetadata,
};
use crate::proxy::mappers::{drain_sse_lines, CacheSink};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;
use tracing::warn;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockType {
    None,
    Text,
    Thinking,
    ToolUse,
}

/// Running state of one Anthropic SSE translation: which content block is
/// open, how many blocks were emitted, and what the terminal events need.
pub struct StreamingState {
    block_type: BlockType,
    block_index: usize,
    message_start_sent: bool,
    message_stop_sent: bool,
    used_tool: bool,
    model: String,
    pub collected_text: String,
}

impl StreamingState {
    pub fn new(model: String) -> Self {
        Self {
            block_type: BlockType::None,
            block_index: 0,
            message_start_sent: false,
            message_stop_sent: false,
            used_tool: false,
            model,
            collected_text: String::new(),
        }
    }

    pub fn emit(&self, event_type: &str, data: Value) -> Bytes {
        let sse = format!(
            "event: {}\ndata: {}\n\n",
            event_type,
            serde_json::to_string(&data).unwrap_or_default()
        );
        Bytes::from(sse)
    }

    pub fn emit_message_start(&mut self, parsed: &ParsedResponse) -> Bytes {
        if self.message_start_sent {
            return Bytes::new();
        }
        let input_tokens = parsed
            .usage
            .as_ref()
            .and_then(|u| u.prompt_token_count)
            .unwrap_or(0);
        let message = json!({
            "id": parsed
                .response_id
                .clone()
                .unwrap_or_else(|| format!("msg_{}", uuid::Uuid::new_v4().simple())),
            "type": "message",
            "role": "assistant",
            "content": [],
            "model": parsed.model_version.as_deref().unwrap_or(self.model.as_str()),
            "stop_reason": null,
            "stop_sequence": null,
            "usage": {"input_tokens": input_tokens, "output_tokens": 0}
        });

        self.message_start_sent = true;
        self.emit("message_start", json!({"type": "message_start", "message": message}))
    }

    pub fn start_block(&mut self, block_type: BlockType, content_block: Value) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if self.block_type != BlockType::None {
            chunks.extend(self.end_block());
        }
        chunks.push(self.emit(
            "content_block_start",
            json!({
                "type": "content_block_start",
                "index": self.block_index,
                "content_block": content_block
            }),
        ));
        self.block_type = block_type;
        chunks
    }

    pub fn end_block(&mut self) -> Vec<Bytes> {
        if self.block_type == BlockType::None {
            return vec![];
        }
        let chunk = self.emit(
            "content_block_stop",
            json!({"type": "content_block_stop", "index": self.block_index}),
        );
        self.block_index += 1;
        self.block_type = BlockType::None;
        vec![chunk]
    }

    pub fn emit_delta(&self, delta_type: &str, delta_content: Value) -> Bytes {
        let mut delta = json!({"type": delta_type});
        if let Value::Object(map) = delta_content {
            for (k, v) in map {
                delta[k] = v;
            }
        }
        self.emit(
            "content_block_delta",
            json!({
                "type": "content_block_delta",
                "index": self.block_index,
                "delta": delta
            }),
        )
    }

    pub fn emit_finish(
        &mut self,
        finish_reason: Option<&str>,
        usage: Option<&UsageMetadata>,
    ) -> Vec<Bytes> {
        let mut chunks = self.end_block();

        let stop_reason = claude_stop_reason(finish_reason, self.used_tool);
        let usage_json = usage
            .map(|u| {
                json!({
                    "input_tokens": u.prompt_token_count.unwrap_or(0),
                    "output_tokens": u.candidates_token_count.unwrap_or(0)
                })
            })
            .unwrap_or_else(|| json!({"input_tokens": 0, "output_tokens": 0}));

        chunks.push(self.emit(
            "message_delta",
            json!({
                "type": "message_delta",
                "delta": {"stop_reason": stop_reason, "stop_sequence": null},
                "usage": usage_json
            }),
        ));

        if !self.message_stop_sent {
            chunks.push(Bytes::from(
                "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n",
            ));
            self.message_stop_sent = true;
        }
        chunks
    }

    // Best-effort error event; the stream keeps going afterwards.
    pub fn emit_error(&self, message: &str) -> Bytes {
        self.emit(
            "error",
            json!({
                "type": "error",
                "error": {"type": "api_error", "message": message}
            }),
        )
    }

    pub fn mark_tool_used(&mut self) {
        self.used_tool = true;
    }

    pub fn current_block_type(&self) -> BlockType {
        self.block_type
    }
}

/// Maps Gemini `parts` entries onto Anthropic content-block events, opening
/// and closing blocks at text/thinking/tool boundaries.
pub struct PartProcessor<'a> {
    state: &'a mut StreamingState,
}

impl<'a> PartProcessor<'a> {
    pub fn new(state: &'a mut StreamingState) -> Self {
        Self { state }
    }

    pub fn process(&mut self, part: &GeminiPart) -> Vec<Bytes> {
        let mut chunks = Vec::new();

        if let Some(fc) = &part.function_call {
            chunks.extend(self.state.start_block(
                BlockType::ToolUse,
                json!({
                    "type": "tool_use",
                    "id": format!("toolu_{}", uuid::Uuid::new_v4().simple()),
                    "name": fc.name,
                    "input": {}
                }),
            ));
            let args = serde_json::to_string(&fc.args).unwrap_or_else(|_| "{}".to_string());
            chunks.push(
                self.state
                    .emit_delta("input_json_delta", json!({"partial_json": args})),
            );
            chunks.extend(self.state.end_block());
            self.state.mark_tool_used();
            return chunks;
        }

        if let Some(code) = &part.executable_code {
            let fenced = format!("```{}\n{}\n```", code.language.to_lowercase(), code.code);
            chunks.extend(self.process_text(&fenced));
            return chunks;
        }

        if let Some(text) = &part.text {
            if part.thought.unwrap_or(false) {
                chunks.extend(self.process_thinking(text));
            } else {
                chunks.extend(self.process_text(text));
            }
        }
        chunks
    }

    fn process_text(&mut self, text: &str) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if self.state.current_block_type() != BlockType::Text {
            chunks.extend(
                self.state
                    .start_block(BlockType::Text, json!({"type": "text", "text": ""})),
            );
        }
        self.state.collected_text.push_str(text);
        chunks.push(self.state.emit_delta("text_delta", json!({"text": text})));
        chunks
    }

    fn process_thinking(&mut self, text: &str) -> Vec<Bytes> {
        let mut chunks = Vec::new();
        if self.state.current_block_type() != BlockType::Thinking {
            chunks.extend(self.state.start_block(
                BlockType::Thinking,
                json!({"type": "thinking", "thinking": ""}),
            ));
        }
        chunks.push(self.state.emit_delta("thinking_delta", json!({"thinking": text})));
        chunks
    }
}

/// Translate a Gemini SSE byte stream into the Anthropic event sequence.
/// Yields `EmptyStream` when the upstream closes before any data arrives so
/// the retry loop can try another account.
pub fn create_claude_sse_stream(
    mut upstream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    model: String,
    cache: Option<CacheSink>,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, AppError>> + Send>> {
    let stream = async_stream::stream! {
        let mut buffer = BytesMut::new();
        let mut state = StreamingState::new(model);
        let mut got_data = false;
        let mut finish_reason: Option<String> = None;
        let mut usage: Option<UsageMetadata> = None;

        while let Some(item) = upstream.next().await {
            let bytes = match item {
                Ok(b) => b,
                Err(e) => {
                    if !got_data {
                        yield Err(AppError::EmptyStream);
                        return;
                    }
                    yield Ok(state.emit_error(&format!("upstream stream error: {}", e)));
                    break;
                }
            };
            buffer.extend_from_slice(&bytes);

            for line in drain_sse_lines(&mut buffer) {
                let Some(payload) = line.strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim();
                if payload.is_empty() || payload == "[DONE]" {
                    continue;
                }
                match serde_json::from_str::<Value>(payload) {
                    Ok(event) => {
                        let parsed = parse_response(&event);
                        got_data = true;
                        if let Some(f) = &parsed.finish_reason {
                            finish_reason = Some(f.clone());
                        }
                        if let Some(u) = parsed.usage.clone() {
                            usage = Some(merge_usage(usage.take(), u));
                        }

                        let start = state.emit_message_start(&parsed);
                        if !start.is_empty() {
                            yield Ok(start);
                        }
                        let mut processor = PartProcessor::new(&mut state);
                        for part in &parsed.parts {
                            for chunk in processor.process(part) {
                                yield Ok(chunk);
                            }
                        }
                    }
                    Err(e) => {
                        // Parse errors do not tear the stream down.
                        warn!("[W-SSE-PARSE] skipping malformed event: {}", e);
                        yield Ok(state.emit_error("malformed upstream event"));
                    }
                }
            }
        }

        if !got_data {
            yield Err(AppError::EmptyStream);
            return;
        }

        for chunk in state.emit_finish(finish_reason.as_deref(), usage.as_ref()) {
            yield Ok(chunk);
        }
        if let Some(sink) = cache {
            sink.save(std::mem::take(&mut state.collected_text));
        }
    };
    Box::pin(stream)
}

// Later usage events override earlier ones field by field; Gemini repeats the
// prompt count and grows the candidate count.
fn merge_usage(previous: Option<UsageMetadata>, next: UsageMetadata) -> UsageMetadata {
    let prev = previous.unwrap_or_default();
    UsageMetadata {
        prompt_token_count: next.prompt_token_count.or(prev.prompt_token_count),
        candidates_token_count: next.candidates_token_count.or(prev.candidates_token_count),
        total_token_count: next.total_token_count.or(prev.total_token_count),
        cached_content_token_count: next
            .cached_content_token_count
            .or(prev.cached_content_token_count),
    }
}

/// The full Anthropic event sequence for a cache replay.
pub fn cached_claude_sse(model: &str, text: &str) -> Vec<Bytes> {
    let mut state = StreamingState::new(model.to_string());
    let mut chunks = Vec::new();
    chunks.push(state.emit_message_start(&ParsedResponse::default()));
    chunks.extend(state.start_block(BlockType::Text, json!({"type": "text", "text": ""})));
    chunks.push(state.emit_delta("text_delta", json!({"text": text})));
    chunks.extend(state.emit_finish(Some("STOP"), None));
    chunks
}

/// Translate a local provider's OpenAI-compatible SSE into Anthropic events.
pub fn create_claude_sse_from_openai_stream(
    mut upstream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    model: String,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, AppError>> + Send>> {
    let stream = async_stream::stream! {
        let mut buffer = BytesMut::new();
        let mut state = StreamingState::new(model);
        let mut got_data = false;

        while let Some(item) = upstream.next().await {
            let bytes = match item {
                Ok(b) => b,
                Err(e) => {
                    if !got_data {
                        yield Err(AppError::EmptyStream);
                        return;
                    }
                    yield Ok(state.emit_error(&format!("local stream error: {}", e)));
                    break;
                }
            };
            buffer.extend_from_slice(&bytes);

            for line in drain_sse_lines(&mut buffer) {
                let Some(payload) = line.strip_prefix("data:") else {
                    continue;
                };
                let payload = payload.trim();
                if payload.is_empty() || payload == "[DONE]" {
                    continue;
                }
                let Ok(chunk) = serde_json::from_str::<Value>(payload) else {
                    continue;
                };
                let Some(delta) = chunk
                    .pointer("/choices/0/delta/content")
                    .and_then(|c| c.as_str())
                else {
                    continue;
                };
                if delta.is_empty() {
                    continue;
                }
                got_data = true;
                let start = state.emit_message_start(&ParsedResponse::default());
                if !start.is_empty() {
                    yield Ok(start);
                }
                let mut processor = PartProcessor::new(&mut state);
                let part = GeminiPart {
                    text: Some(delta.to_string()),
                    ..Default::default()
                };
                for c in processor.process(&part) {
                    yield Ok(c);
                }
            }
        }

        if !got_data {
            yield Err(AppError::EmptyStream);
            return;
        }
        for chunk in state.emit_finish(Some("STOP"), None) {
            yield Ok(chunk);
        }
    };
    Box::pin(stream)
}

use crate::error::AppError;
use crate::proxy::mappers::gemini::{openai_finish_reason, parse_response, UsageMetadata};
use crate::proxy::mappers::{drain_sse_lines, CacheSink};
use bytes::{Bytes, BytesMut};
use futures::{Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;
use tracing::warn;

fn chunk_bytes(stream_id: &str, created: i64, model: &str, delta: Value, finish: Option<&str>) -> Bytes {
    let chunk = json!({
        "id": stream_id,
        "object": "chat.completion.chunk",
        "created": created,
        "model": model,
        "choices": [{
            "index": 0,
            "delta": delta,
            "finish_reason": finish
        }]
    });
    Bytes::from(format!("data: {}\n\n", chunk))
}

fn usage_json(usage: Option<&UsageMetadata>) -> Value {
    let (prompt, completion) = usage
        .map(|u| {
            (
                u.prompt_token_count.unwrap_or(0),
                u.candidates_token_count.unwrap_or(0),
            )
        })
        .unwrap_or((0, 0));
    json!({
        "prompt_tokens": prompt,
        "completion_tokens": completion,
        "total_tokens": prompt + completion
    })
}

/// Translate a Gemini SSE byte stream into OpenAI chat-completion chunks:
/// one chunk per upstream text delta, a terminal chunk carrying the finish
/// reason, then the literal `[DONE]` sentinel.
pub fn create_openai_sse_stream(
    mut upstream: Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>>,
    model: String,
    cache: Option<CacheSink>,
) -> Pin<Box<dyn Stream<Item = Result<Bytes, AppError>> + Send>> {
    let stream_id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
    let created = chrono::Utc::now().timestamp();

    let stream = async_stream::stream! {
        let mut buffer = BytesMut::new();
        let mut got_data = false;
        let mut sent_role = false;
        let mut used_tool = false;
        let mut collected = String::new();
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
                    warn!("[W-SSE-UPSTREAM] stream error after data: {}", e);
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
                let Ok(event) = serde_json::from_str::<Value>(payload) else {
                    warn!("[W-SSE-PARSE] skipping malformed event");
                    continue;
                };

                let parsed = parse_response(&event);
                got_data = true;
                if let Some(f) = &parsed.finish_reason {
                    finish_reason = Some(f.clone());
                }
                if parsed.usage.is_some() {
                    usage = parsed.usage;
                }

                for part in &parsed.parts {
                    if part.function_call.is_some() {
                        used_tool = true;
                        continue;
                    }
                    // Thinking is an Anthropic concept; OpenAI callers only
                    // see realised text.
                    if part.thought.unwrap_or(false) {
                        continue;
                    }
                    if let Some(text) = &part.text {
                        collected.push_str(text);
                        let mut delta = json!({"content": text});
                        if !sent_role {
                            delta["role"] = json!("assistant");
                            sent_role = true;
                        }
                        yield Ok(chunk_bytes(&stream_id, created, &model, delta, None));
                    }
                }
            }
        }

        if !got_data {
            yield Err(AppError::EmptyStream);
            return;
        }

        let final_chunk = json!({
            "id": stream_id,
            "object": "chat.completion.chunk",
            "created": created,
            "model": model,
            "choices": [{
                "index": 0,
                "delta": {},
                "finish_reason": openai_finish_reason(finish_reason.as_deref(), used_tool)
            }],
            "usage": usage_json(usage.as_ref())
        });
        yield Ok(Bytes::from(format!("data: {}\n\n", final_chunk)));
        yield Ok(Bytes::from("data: [DONE]\n\n"));

        if let Some(sink) = cache {
            sink.save(collected);
        }
    };
    Box::pin(stream)
}

/// Cache replay: one chunk with the whole content, a stop chunk, `[DONE]`.
pub fn cached_openai_sse(model: &str, text: &str) -> Vec<Bytes> {
    let stream_id = format!("chatcmpl-{}", uuid::Uuid::new_v4());
    let created = chrono::Utc::now().timestamp();
    vec![
        chunk_bytes(
            &stream_id,
            created,
            model,
            json!({"role": "assistant", "content": text}),
            None,
        ),
        chunk_bytes(&stream_id, created, model, json!({}), Some("stop")),
        Bytes::from("data: [DONE]\n\n"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::stream;

    fn upstream_of(events: Vec<&str>) -> Pin<Box<dyn Stream<Item = Result<Bytes, reqwest::Error>> + Send>> {
        let items: Vec<Result<Bytes, reqwest::Error>> = events
            .into_iter()
            .map(|e| Ok(Bytes::from(format!("data: {}\n\n", e))))
            .collect();
        Box::pin(stream::iter(items))
    }

    async fn collect_chunks(
        mut s: Pin<Box<dyn Stream<Item = Result<Bytes, AppError>> + Send>>,
    ) -> (Vec<Value>, bool, Vec<AppError>) {
        let mut chunks = Vec::new();
        let mut done = false;
        let mut errors = Vec::new();
        while let Some(item) = s.next().await {
            match item {
                Ok(bytes) => {
                    let text = String::from_utf8(bytes.to_vec()).unwrap();
                    for line in text.lines() {
                        let Some(payload) = line.strip_prefix("data: ") else {
                            continue;
                        };
                        if payload == "[DONE]" {
                            done = true;
                        } else {
                            chunks.push(serde_json::from_str(payload).unwrap());
                        }
                    }
                }
                Err(e) => errors.push(e),
            }
        }
        (chunks, done, errors)
    }

    #[tokio::test]
    async fn text_events_become_chunks_with_done_sentinel() {
        let upstream = upstream_of(vec![
            r#"{"candidates":[{"content":{"parts":[{"text":"Hello"}]}}]}"#,
            r#"{"candidates":[{"content":{"parts":[{"text":" world"}]},"finishReason":"STOP"}],"usageMetadata":{"promptTokenCount":1,"candidatesTokenCount":2}}"#,
        ]);
        let (chunks, done, errors) =
            collect_chunks(create_openai_sse_stream(upstream, "gpt-4".into(), None)).await;
        assert!(errors.is_empty());
        assert!(done);
        assert_eq!(chunks.len(), 3);

        assert_eq!(chunks[0]["object"], "chat.completion.chunk");
        assert_eq!(chunks[0]["choices"][0]["delta"]["role"], "assistant");
        let text: String = chunks[..2]
            .iter()
            .map(|c| c["choices"][0]["delta"]["content"].as_str().unwrap().to_string())
            .collect();
        assert_eq!(text, "Hello world");

        let last = &chunks[2];
        assert_eq!(last["choices"][0]["finish_reason"], "stop");
        assert_eq!(last["usage"]["completion_tokens"], 2);
    }

    #[tokio::test]
    async fn thought_parts_are_suppressed() {
        let upstream = upstream_of(vec![
            r#"{"candidates":[{"content":{"parts":[{"text":"internal","thought":true}]}}]}"#,
            r#"{"candidates":[{"content":{"parts":[{"text":"visible"}]},"finishReason":"STOP"}]}"#,
        ]);
        let (chunks, _, _) =
            collect_chunks(create_openai_sse_stream(upstream, "gpt-4".into(), None)).await;
        let content_chunks: Vec<&Value> = chunks
            .iter()
            .filter(|c| c["choices"][0]["delta"].get("content").is_some())
            .collect();
        assert_eq!(content_chunks.len(), 1);
        assert_eq!(content_chunks[0]["choices"][0]["delta"]["content"], "visible");
    }

    #[tokio::test]
    async fn empty_upstream_is_empty_stream_error() {
        let upstream = upstream_of(vec![]);
        let (chunks, done, errors) =
            collect_chunks(create_openai_sse_stream(upstream, "gpt-4".into(), None)).await;
        assert!(chunks.is_empty());
        assert!(!done);
        assert_eq!(errors.len(), 1);
        assert!(matches!(errors[0], AppError::EmptyStream));
    }

    #[tokio::test]
    async fn max_tokens_maps_to_length() {
        let upstream = upstream_of(vec![
            r#"{"candidates":[{"content":{"parts":[{"text":"cut"}]},"finishReason":"MAX_TOKENS"}]}"#,
        ]);
        let (chunks, _, _) =
            collect_chunks(create_openai_sse_stream(upstream, "gpt-4".into(), None)).await;
        assert_eq!(chunks.last().unwrap()["choices"][0]["finish_reason"], "length");
    }

    #[tokio::test]
    async fn cached_replay_has_full_content_and_done() {
        let chunks = cached_openai_sse("gpt-4", "cached answer");
        let stream: Pin<Box<dyn Stream<Item = Result<Bytes, AppError>> + Send>> =
            Box::pin(stream::iter(chunks.into_iter().map(Ok)));
        let (parsed, done, _) = collect_chunks(stream).await;
        assert!(done);
        assert_eq!(parsed[0]["choices"][0]["delta"]["content"], "cached answer");
        assert_eq!(parsed[1]["choices"][0]["finish_reason"], "stop");
    }
}

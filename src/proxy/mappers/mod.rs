pub mod claude;
pub mod gemini;
pub mod openai;

use crate::proxy::upstream::UpstreamClient;
use crate::store::{AccountStore, CacheEntry};
use bytes::BytesMut;
use std::sync::Arc;
use tracing::debug;

// SSE frames may split anywhere; complete lines are drained and partial
// tails stay buffered for the next chunk.
pub(crate) fn drain_sse_lines(buffer: &mut BytesMut) -> Vec<String> {
    let mut lines = Vec::new();
    while let Some(pos) = buffer.iter().position(|&b| b == b'\n') {
        let line = buffer.split_to(pos + 1);
        let text = String::from_utf8_lossy(&line[..pos])
            .trim_end_matches('\r')
            .to_string();
        lines.push(text);
    }
    lines
}

/// Deferred cache write attached to a response stream. The save only runs if
/// the stream reaches its terminal event; a disconnected client drops the
/// stream and the partial response is never persisted.
pub struct CacheSink {
    pub store: Arc<AccountStore>,
    pub upstream: Arc<UpstreamClient>,
    pub access_token: String,
    pub prompt: String,
    pub model: String,
}

impl CacheSink {
    /// Fire-and-forget: embedding and storage failures are logged only.
    pub fn save(self, response_text: String) {
        if response_text.is_empty() {
            return;
        }
        tokio::spawn(async move {
            let embedding = match self.upstream.embed_text(&self.access_token, &self.prompt).await {
                Ok(v) => v,
                Err(e) => {
                    debug!("cache embedding skipped: {}", e);
                    Vec::new()
                }
            };
            let entry = CacheEntry::new(self.prompt, embedding, response_text, self.model);
            if let Err(e) = self.store.cache_save(&entry) {
                debug!("cache write skipped: {}", e);
            }
        });
    }
}

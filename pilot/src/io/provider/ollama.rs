//! Ollama `/api/chat` (and the older `/api/generate` reply shape).

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use crate::core::types::Message;
use crate::io::config::ProviderConfig;

pub(super) fn request_body(history: &[Message], config: &ProviderConfig) -> Value {
    json!({
        "model": config.model,
        "messages": history,
        "stream": config.stream,
        "options": { "temperature": 0.7 },
    })
}

pub(super) fn reply_text(body: &Value) -> Result<String> {
    chunk_text(body)?.ok_or_else(|| anyhow!("reply has no message.content"))
}

/// One NDJSON line of a streamed reply.
pub(super) fn chunk_text(chunk: &Value) -> Result<Option<String>> {
    if let Some(message) = chunk.get("error").and_then(Value::as_str) {
        return Err(anyhow!("ollama error: {message}"));
    }
    Ok(chunk
        .pointer("/message/content")
        .or_else(|| chunk.get("response"))
        .and_then(Value::as_str)
        .map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn extracts_chat_and_generate_shapes() {
        let chat = json!({"message": {"role": "assistant", "content": "a"}, "done": false});
        assert_eq!(chunk_text(&chat).expect("chunk").as_deref(), Some("a"));
        let generate = json!({"response": "b", "done": false});
        assert_eq!(chunk_text(&generate).expect("chunk").as_deref(), Some("b"));
        let stats = json!({"done": true, "total_duration": 1});
        assert_eq!(chunk_text(&stats).expect("chunk"), None);
        assert!(reply_text(&stats).is_err());
    }

    #[test]
    fn error_lines_fail() {
        assert!(chunk_text(&json!({"error": "model not found"})).is_err());
    }
}

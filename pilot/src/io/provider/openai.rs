//! OpenAI-compatible chat completions (`/v1/chat/completions`).

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use crate::core::types::Message;
use crate::io::config::ProviderConfig;

pub(super) fn request_body(history: &[Message], config: &ProviderConfig) -> Value {
    json!({
        "model": config.model,
        "messages": history,
        "stream": config.stream,
    })
}

pub(super) fn reply_text(body: &Value) -> Result<String> {
    body.pointer("/choices/0/message/content")
        .and_then(Value::as_str)
        .map(str::to_string)
        .ok_or_else(|| anyhow!("reply has no choices[0].message.content"))
}

/// One `data:` object of a streamed completion.
pub(super) fn chunk_text(chunk: &Value) -> Result<Option<String>> {
    if let Some(message) = chunk.pointer("/error/message").and_then(Value::as_str) {
        return Err(anyhow!("stream error: {message}"));
    }
    Ok(chunk
        .pointer("/choices/0/delta/content")
        .and_then(Value::as_str)
        .map(str::to_string))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn body_carries_roles_and_stream_flag() {
        let config = ProviderConfig {
            model: "gpt-test".to_string(),
            stream: true,
            ..ProviderConfig::default()
        };
        let body = request_body(&[Message::system("s"), Message::user("u")], &config);
        assert_eq!(body["model"], "gpt-test");
        assert_eq!(body["stream"], true);
        assert_eq!(body["messages"][0]["role"], "system");
        assert_eq!(body["messages"][1]["content"], "u");
    }

    #[test]
    fn extracts_complete_and_streamed_text() {
        let reply = json!({"choices": [{"message": {"role": "assistant", "content": "hi"}}]});
        assert_eq!(reply_text(&reply).expect("text"), "hi");
        assert!(reply_text(&json!({"choices": []})).is_err());

        let chunk = json!({"choices": [{"delta": {"content": "par"}}]});
        assert_eq!(chunk_text(&chunk).expect("chunk").as_deref(), Some("par"));
        let role_only = json!({"choices": [{"delta": {"role": "assistant"}}]});
        assert_eq!(chunk_text(&role_only).expect("chunk"), None);
        assert!(chunk_text(&json!({"error": {"message": "quota"}})).is_err());
    }
}

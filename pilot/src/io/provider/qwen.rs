//! Alibaba DashScope (Qwen) text generation.

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use crate::core::types::Message;
use crate::io::config::ProviderConfig;

pub(super) fn request_body(history: &[Message], config: &ProviderConfig) -> Value {
    json!({
        "model": config.model,
        "input": { "messages": history },
    })
}

/// Accepts both `output.text` and the message-format
/// `output.choices[0].message.content`.
pub(super) fn reply_text(body: &Value) -> Result<String> {
    body.pointer("/output/text")
        .and_then(Value::as_str)
        .filter(|text| !text.is_empty())
        .or_else(|| {
            body.pointer("/output/choices/0/message/content")
                .and_then(Value::as_str)
        })
        .map(str::to_string)
        .ok_or_else(|| anyhow!("reply has no output.text or output.choices"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_both_output_shapes() {
        assert_eq!(
            reply_text(&json!({"output": {"text": "plain"}})).expect("text"),
            "plain"
        );
        let choices = json!({"output": {"choices": [{"message": {"content": "msg"}}]}});
        assert_eq!(reply_text(&choices).expect("text"), "msg");
        assert!(reply_text(&json!({"output": {}})).is_err());
    }

    #[test]
    fn nests_messages_under_input() {
        let config = ProviderConfig {
            model: "qwen-max".to_string(),
            ..ProviderConfig::default()
        };
        let body = request_body(&[Message::user("hi")], &config);
        assert_eq!(body["input"]["messages"][0]["role"], "user");
        assert_eq!(body["model"], "qwen-max");
    }
}

//! Google Gemini `generateContent`.

use anyhow::{Result, anyhow};
use serde_json::{Value, json};

use crate::core::types::{Message, Role};

/// System messages become `systemInstruction`; assistant turns use the
/// `model` role.
pub(super) fn request_body(history: &[Message]) -> Value {
    let system: Vec<Value> = history
        .iter()
        .filter(|m| m.role == Role::System)
        .map(|m| json!({ "text": m.content }))
        .collect();
    let contents: Vec<Value> = history
        .iter()
        .filter(|m| m.role != Role::System)
        .map(|m| {
            let role = match m.role {
                Role::Assistant => "model",
                _ => "user",
            };
            json!({ "role": role, "parts": [{ "text": m.content }] })
        })
        .collect();

    let mut body = json!({
        "contents": contents,
        "generationConfig": { "temperature": 0.7 },
    });
    if !system.is_empty() {
        body["systemInstruction"] = json!({ "parts": system });
    }
    body
}

pub(super) fn reply_text(body: &Value) -> Result<String> {
    let parts = body
        .pointer("/candidates/0/content/parts")
        .and_then(Value::as_array)
        .ok_or_else(|| anyhow!("reply has no candidates[0].content.parts"))?;
    let text: String = parts
        .iter()
        .filter_map(|part| part.get("text").and_then(Value::as_str))
        .collect();
    if text.is_empty() {
        return Err(anyhow!("reply candidate has no text parts"));
    }
    Ok(text)
}

//! Provider Adapter: sends the conversation to a model service.
//!
//! The [`Provider`] trait hides vendor wire formats from the session, which
//! only ever sees accumulated text or a sequence of text chunks. Tests use
//! scripted providers that replay canned replies.

mod gemini;
pub mod ndjson;
mod ollama;
mod openai;
mod qwen;

use std::io::BufReader;

use anyhow::{Context, Result, anyhow};
use reqwest::blocking::{Client, RequestBuilder, Response};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, info, instrument, warn};

use crate::core::types::Message;
use crate::io::config::ProviderConfig;
use crate::io::provider::ndjson::{ChunkExtractor, ChunkStream};

/// Incrementally readable reply text.
pub type TextStream = Box<dyn Iterator<Item = Result<String>> + Send>;

/// Model reply: either complete text or a stream of text chunks.
pub enum ModelReply {
    Complete(String),
    Stream(TextStream),
}

impl std::fmt::Debug for ModelReply {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModelReply::Complete(text) => f.debug_tuple("Complete").field(text).finish(),
            ModelReply::Stream(_) => f.write_str("Stream(..)"),
        }
    }
}

/// Abstraction over model services.
pub trait Provider {
    /// Send the full history and return the reply. Transport errors, non-2xx
    /// statuses and unreadable bodies are all `Err`.
    fn send_conversation(&self, history: &[Message], config: &ProviderConfig)
    -> Result<ModelReply>;
}

/// Wire format family, detected from the endpoint URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Vendor {
    OpenAi,
    Ollama,
    Gemini,
    Qwen,
}

impl Vendor {
    pub fn detect(api_url: &str) -> Self {
        let url = api_url.to_ascii_lowercase();
        if url.contains("dashscope") {
            Vendor::Qwen
        } else if url.contains("generativelanguage.googleapis.com")
            || url.contains(":generatecontent")
        {
            Vendor::Gemini
        } else if url.contains(":11434")
            || url.contains("ollama")
            || url.ends_with("/api/chat")
            || url.ends_with("/api/generate")
        {
            Vendor::Ollama
        } else {
            Vendor::OpenAi
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Vendor::OpenAi => "openai",
            Vendor::Ollama => "ollama",
            Vendor::Gemini => "gemini",
            Vendor::Qwen => "qwen",
        }
    }

    /// Whether this adapter honors `ProviderConfig::stream`.
    pub fn supports_streaming(self) -> bool {
        matches!(self, Vendor::OpenAi | Vendor::Ollama)
    }
}

/// Provider speaking HTTP to any supported vendor.
#[derive(Debug, Clone)]
pub struct HttpProvider {
    client: Client,
}

impl HttpProvider {
    pub fn new() -> Result<Self> {
        let client = Client::builder()
            .user_agent(concat!("pilot/", env!("CARGO_PKG_VERSION")))
            .build()
            .context("build http client")?;
        Ok(Self { client })
    }
}

impl Provider for HttpProvider {
    #[instrument(skip_all, fields(vendor = tracing::field::Empty, model = %config.model, messages = history.len()))]
    fn send_conversation(
        &self,
        history: &[Message],
        config: &ProviderConfig,
    ) -> Result<ModelReply> {
        let vendor = Vendor::detect(&config.api_url);
        tracing::Span::current().record("vendor", vendor.as_str());
        let streaming = config.stream && vendor.supports_streaming();

        let body = match vendor {
            Vendor::OpenAi => openai::request_body(history, config),
            Vendor::Ollama => ollama::request_body(history, config),
            Vendor::Gemini => gemini::request_body(history),
            Vendor::Qwen => qwen::request_body(history, config),
        };
        let request = authorize(
            vendor,
            self.client
                .post(&config.api_url)
                .timeout(config.request_timeout())
                .json(&body),
            &config.api_key,
        );

        info!(streaming, "sending conversation");
        let response = request
            .send()
            .with_context(|| format!("send request to {}", config.api_url))?;
        let response = check_status(vendor, response)?;

        if streaming {
            let extract: ChunkExtractor = match vendor {
                Vendor::Ollama => ollama::chunk_text,
                _ => openai::chunk_text,
            };
            debug!("reading streamed reply");
            let stream = ChunkStream::new(BufReader::new(response), extract);
            return Ok(ModelReply::Stream(Box::new(stream)));
        }

        let value: Value = response
            .json()
            .with_context(|| format!("decode {} reply", vendor.as_str()))?;
        let text = match vendor {
            Vendor::OpenAi => openai::reply_text(&value),
            Vendor::Ollama => ollama::reply_text(&value),
            Vendor::Gemini => gemini::reply_text(&value),
            Vendor::Qwen => qwen::reply_text(&value),
        }
        .with_context(|| format!("malformed {} reply", vendor.as_str()))?;
        debug!(bytes = text.len(), "received reply");
        Ok(ModelReply::Complete(text))
    }
}

fn authorize(vendor: Vendor, request: RequestBuilder, api_key: &str) -> RequestBuilder {
    if api_key.is_empty() {
        return request;
    }
    match vendor {
        Vendor::Gemini => request.header("x-goog-api-key", api_key),
        Vendor::OpenAi | Vendor::Ollama | Vendor::Qwen => request.bearer_auth(api_key),
    }
}

fn check_status(vendor: Vendor, response: Response) -> Result<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().unwrap_or_default();
    let detail = serde_json::from_str::<Value>(&body)
        .ok()
        .and_then(|v| error_message(&v))
        .unwrap_or(body);
    warn!(status = status.as_u16(), vendor = vendor.as_str(), "provider request failed");
    Err(anyhow!(
        "{} request failed with status {}: {}",
        vendor.as_str(),
        status,
        detail.trim()
    ))
}

fn error_message(value: &Value) -> Option<String> {
    value
        .pointer("/error/message")
        .or_else(|| value.get("message"))
        .or_else(|| value.get("error"))
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Drain a reply into one string, handing each chunk to `on_chunk` first.
pub fn collect_reply(reply: ModelReply, on_chunk: &mut dyn FnMut(&str)) -> Result<String> {
    match reply {
        ModelReply::Complete(text) => {
            on_chunk(&text);
            Ok(text)
        }
        ModelReply::Stream(stream) => {
            let mut text = String::new();
            for chunk in stream {
                let chunk = chunk.context("read streamed reply")?;
                on_chunk(&chunk);
                text.push_str(&chunk);
            }
            Ok(text)
        }
    }
}

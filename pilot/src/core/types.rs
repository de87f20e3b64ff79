//! Shared deterministic types for the agent core.
//!
//! These types define stable contracts between the parser, the command runner
//! and the conversation session. They carry no I/O handles.

use serde::{Deserialize, Serialize};

/// Speaker of a conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

impl Role {
    pub fn as_str(self) -> &'static str {
        match self {
            Role::System => "system",
            Role::User => "user",
            Role::Assistant => "assistant",
        }
    }
}

/// One entry of the conversation history sent to the model.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    pub role: Role,
    pub content: String,
}

impl Message {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: Role::User,
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: Role::Assistant,
            content: content.into(),
        }
    }
}

/// Classification of a reply segment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BlockKind {
    /// Prose outside any fenced block.
    Text,
    /// File contents (a fenced block in a non-shell language).
    Code,
    /// Executable shell or script content.
    Command,
}

/// A classified, contiguous segment of a model reply.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParsedBlock {
    pub kind: BlockKind,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target_path: Option<String>,
}

impl ParsedBlock {
    pub fn text(content: impl Into<String>) -> Self {
        Self {
            kind: BlockKind::Text,
            content: content.into(),
            language: None,
            target_path: None,
        }
    }

    /// Render the block back to the fenced form the parser accepts.
    pub fn render(&self) -> String {
        match self.kind {
            BlockKind::Text => self.content.clone(),
            BlockKind::Code | BlockKind::Command => {
                let mut out = String::from("```");
                if let Some(language) = &self.language {
                    out.push_str(language);
                }
                if let Some(path) = &self.target_path {
                    out.push(':');
                    out.push_str(path);
                }
                out.push('\n');
                if !self.content.is_empty() {
                    out.push_str(&self.content);
                    out.push('\n');
                }
                out.push_str("```");
                out
            }
        }
    }
}

/// Outcome of running one block, command, or check.
///
/// Produced once per execution and never mutated afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub succeeded: bool,
    /// Captured stdout/stderr in arrival order. Kept on failure.
    pub output: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_text: Option<String>,
}

impl ExecutionResult {
    pub fn success(output: impl Into<String>) -> Self {
        Self {
            succeeded: true,
            output: output.into(),
            error_text: None,
        }
    }

    pub fn failure(output: impl Into<String>, error_text: impl Into<String>) -> Self {
        Self {
            succeeded: false,
            output: output.into(),
            error_text: Some(error_text.into()),
        }
    }
}

/// A "do" command plus the check command that produces evidence for it.
///
/// The check is only meaningful after the do command ran in the same working
/// directory; the session never runs one without the other.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandPair {
    pub do_command: String,
    pub check_command: String,
    /// Interpreter hint recovered from a fence inside the tags, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub language: Option<String>,
}

/// Observable phase of a conversation turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnState {
    AwaitingModel,
    ExecutingCommands,
    AwaitingVerificationFeedback,
    Completed,
    FailedExhausted,
}

/// Coarse lifecycle of a session task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TaskState {
    Running,
    Completed,
    Failed,
}

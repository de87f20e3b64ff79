//! Test-only doubles for the provider, command runner and event sink seams.

use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use anyhow::{Result, anyhow};
use tempfile::TempDir;

use crate::core::types::{ExecutionResult, Message};
use crate::io::command::{CommandRequest, CommandRunner};
use crate::io::config::ProviderConfig;
use crate::io::provider::{ModelReply, Provider, TextStream};
use crate::relay::{EventSink, TurnEvent};

/// One canned provider response.
#[derive(Debug, Clone)]
pub enum ScriptedReply {
    Text(String),
    /// Delivered as a stream, one item per chunk.
    Chunks(Vec<String>),
    /// The call itself fails.
    Fail(String),
}

/// Provider replaying canned replies in order. Fails once the script runs
/// out.
#[derive(Debug, Default)]
pub struct ScriptedProvider {
    replies: Mutex<VecDeque<ScriptedReply>>,
    calls: Mutex<Vec<Vec<Message>>>,
}

impl ScriptedProvider {
    pub fn new(replies: Vec<ScriptedReply>) -> Self {
        Self {
            replies: Mutex::new(replies.into()),
            calls: Mutex::new(Vec::new()),
        }
    }

    pub fn texts<S: AsRef<str>>(replies: impl IntoIterator<Item = S>) -> Self {
        Self::new(
            replies
                .into_iter()
                .map(|r| ScriptedReply::Text(r.as_ref().to_string()))
                .collect(),
        )
    }

    /// History sent with each call, in call order.
    pub fn calls(&self) -> Vec<Vec<Message>> {
        self.calls.lock().expect("calls lock").clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().expect("calls lock").len()
    }
}

impl Provider for ScriptedProvider {
    fn send_conversation(
        &self,
        history: &[Message],
        _config: &ProviderConfig,
    ) -> Result<ModelReply> {
        self.calls
            .lock()
            .expect("calls lock")
            .push(history.to_vec());
        let next = self.replies.lock().expect("replies lock").pop_front();
        match next {
            Some(ScriptedReply::Text(text)) => Ok(ModelReply::Complete(text)),
            Some(ScriptedReply::Chunks(chunks)) => {
                let stream: TextStream = Box::new(chunks.into_iter().map(Ok));
                Ok(ModelReply::Stream(stream))
            }
            Some(ScriptedReply::Fail(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted provider has no more replies")),
        }
    }
}

/// One canned command result.
#[derive(Debug, Clone)]
pub enum ScriptedRun {
    Done(ExecutionResult),
    /// The runner itself fails.
    Error(String),
}

impl ScriptedRun {
    pub fn ok(output: &str) -> Self {
        ScriptedRun::Done(ExecutionResult::success(output))
    }

    pub fn fail(output: &str, error: &str) -> Self {
        ScriptedRun::Done(ExecutionResult::failure(output, error))
    }

    pub fn error(message: &str) -> Self {
        ScriptedRun::Error(message.to_string())
    }
}

/// Runner that records requests and returns canned results without
/// spawning anything. Output is handed to the chunk callback in one piece.
#[derive(Debug, Default)]
pub struct ScriptedRunner {
    results: Mutex<VecDeque<ScriptedRun>>,
    requests: Mutex<Vec<CommandRequest>>,
}

impl ScriptedRunner {
    pub fn new(results: Vec<ScriptedRun>) -> Self {
        Self {
            results: Mutex::new(results.into()),
            requests: Mutex::new(Vec::new()),
        }
    }

    pub fn requests(&self) -> Vec<CommandRequest> {
        self.requests.lock().expect("requests lock").clone()
    }

    /// Command texts in execution order.
    pub fn executed(&self) -> Vec<String> {
        self.requests().into_iter().map(|r| r.content).collect()
    }
}

impl CommandRunner for ScriptedRunner {
    fn execute(
        &self,
        request: &CommandRequest,
        on_chunk: &mut dyn FnMut(&str),
    ) -> Result<ExecutionResult> {
        self.requests
            .lock()
            .expect("requests lock")
            .push(request.clone());
        let next = self.results.lock().expect("results lock").pop_front();
        match next {
            Some(ScriptedRun::Done(result)) => {
                if !result.output.is_empty() {
                    on_chunk(&result.output);
                }
                Ok(result)
            }
            Some(ScriptedRun::Error(message)) => Err(anyhow!(message)),
            None => Err(anyhow!("scripted runner has no more results")),
        }
    }
}

/// Sink that records every event. With [`closing_after`](Self::closing_after)
/// it reports itself gone once `n` events were delivered, like a client
/// that disconnected.
#[derive(Debug, Default)]
pub struct RecordingSink {
    events: Mutex<Vec<TurnEvent>>,
    close_after: Option<usize>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn closing_after(n: usize) -> Self {
        Self {
            events: Mutex::new(Vec::new()),
            close_after: Some(n),
        }
    }

    pub fn events(&self) -> Vec<TurnEvent> {
        self.events.lock().expect("events lock").clone()
    }

    pub fn kinds(&self) -> Vec<&'static str> {
        self.events().iter().map(TurnEvent::kind).collect()
    }

    pub fn count(&self, kind: &str) -> usize {
        self.kinds().into_iter().filter(|k| *k == kind).count()
    }
}

impl EventSink for RecordingSink {
    fn deliver(&self, event: &TurnEvent) -> bool {
        let mut events = self.events.lock().expect("events lock");
        if self.close_after.is_some_and(|n| events.len() >= n) {
            return false;
        }
        events.push(event.clone());
        true
    }
}

/// Temporary working directory removed on drop.
pub struct TestWorkspace {
    dir: TempDir,
}

impl TestWorkspace {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().expect("create temp workspace"),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn join(&self, rel: &str) -> PathBuf {
        self.dir.path().join(rel)
    }

    pub fn read(&self, rel: &str) -> String {
        std::fs::read_to_string(self.join(rel)).expect("read workspace file")
    }
}

impl Default for TestWorkspace {
    fn default() -> Self {
        Self::new()
    }
}

/// Provider settings pointing nowhere; scripted providers ignore them.
pub fn provider_config(workdir: &Path) -> ProviderConfig {
    ProviderConfig {
        api_key: String::new(),
        api_url: "http://127.0.0.1:9/v1/chat/completions".to_string(),
        model: "scripted".to_string(),
        working_directory: workdir.to_path_buf(),
        ..ProviderConfig::default()
    }
}

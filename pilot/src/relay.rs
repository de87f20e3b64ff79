//! Live Relay: incremental turn events and their fan-out to observers.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use serde::{Deserialize, Serialize};
use tracing::debug;

/// Why a turn ended without completing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailureReason {
    RetryExhausted,
    ProviderFailure,
    ParseFailure,
    Cancelled,
    RoundLimit,
}

impl FailureReason {
    pub fn as_str(self) -> &'static str {
        match self {
            FailureReason::RetryExhausted => "retry-exhausted",
            FailureReason::ProviderFailure => "provider-failure",
            FailureReason::ParseFailure => "parse-failure",
            FailureReason::Cancelled => "cancelled",
            FailureReason::RoundLimit => "round-limit",
        }
    }
}

/// One item of the live event stream.
///
/// Every turn ends with exactly one terminal event: `Complete` or `Failed`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum TurnEvent {
    /// A chunk (or the whole) of the model's reply.
    ModelText { content: String },
    /// A chunk of a running command's stdout/stderr.
    CommandOutput { content: String },
    FileWrite {
        path: String,
        succeeded: bool,
        content: String,
    },
    /// Formatted summary of command, output, check and verdict.
    ExecutionResult { content: String, verified: bool },
    Diagnostic { content: String },
    Error { content: String },
    Complete,
    Failed {
        reason: FailureReason,
        content: String,
    },
}

impl TurnEvent {
    /// Wire name of the event kind.
    pub fn kind(&self) -> &'static str {
        match self {
            TurnEvent::ModelText { .. } => "model-text",
            TurnEvent::CommandOutput { .. } => "command-output",
            TurnEvent::FileWrite { .. } => "file-write",
            TurnEvent::ExecutionResult { .. } => "execution-result",
            TurnEvent::Diagnostic { .. } => "diagnostic",
            TurnEvent::Error { .. } => "error",
            TurnEvent::Complete => "complete",
            TurnEvent::Failed { .. } => "failed",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, TurnEvent::Complete | TurnEvent::Failed { .. })
    }
}

/// Receiver of turn events.
pub trait EventSink {
    /// Deliver one event. `false` means the observer is gone.
    fn deliver(&self, event: &TurnEvent) -> bool;
}

impl<F> EventSink for F
where
    F: Fn(&TurnEvent) -> bool,
{
    fn deliver(&self, event: &TurnEvent) -> bool {
        self(event)
    }
}

pub type SharedSink = Arc<dyn EventSink + Send + Sync>;

/// Fan-out from a turn to its primary observer (the client that started
/// it) and any secondary observers.
///
/// When the primary observer goes away the relay is marked cancelled. The
/// session checks this before each model call; a command that is already
/// running is not killed.
#[derive(Clone)]
pub struct Relay {
    primary: SharedSink,
    observers: Vec<SharedSink>,
    cancelled: Arc<AtomicBool>,
}

impl Relay {
    pub fn new(primary: SharedSink) -> Self {
        Self {
            primary,
            observers: Vec::new(),
            cancelled: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_observer(mut self, observer: SharedSink) -> Self {
        self.observers.push(observer);
        self
    }

    pub fn emit(&self, event: TurnEvent) {
        if !self.is_cancelled() && !self.primary.deliver(&event) {
            debug!(kind = event.kind(), "primary observer gone, cancelling turn");
            self.cancel();
        }
        for observer in &self.observers {
            observer.deliver(&event);
        }
    }

    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::SeqCst)
    }
}

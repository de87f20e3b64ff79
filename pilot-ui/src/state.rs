//! Shared application state for the chat server.

use std::sync::Arc;

use anyhow::Result;
use pilot::io::command::{CommandRunner, ShellRunner};
use pilot::io::config::{PilotConfig, SessionConfig};
use pilot::io::provider::{HttpProvider, Provider};
use pilot::relay::TurnEvent;
use serde::Serialize;
use tokio::sync::broadcast;

/// A turn event tagged with the task that produced it, as seen by
/// secondary observers on `/events`.
#[derive(Debug, Clone, Serialize)]
pub struct TaskEvent {
    pub task_id: String,
    #[serde(flatten)]
    pub event: TurnEvent,
}

/// Builds the provider and runner for one turn. Both are created on the
/// blocking worker that runs the turn.
pub trait Backend: Send + Sync {
    fn provider(&self) -> Result<Box<dyn Provider>>;
    fn runner(&self, session: &SessionConfig) -> Box<dyn CommandRunner>;
}

/// Real model service over HTTP and real shell execution.
pub struct HttpBackend;

impl Backend for HttpBackend {
    fn provider(&self) -> Result<Box<dyn Provider>> {
        Ok(Box::new(HttpProvider::new()?))
    }

    fn runner(&self, session: &SessionConfig) -> Box<dyn CommandRunner> {
        Box::new(ShellRunner::for_session(session))
    }
}

/// Shared state accessible from all request handlers.
#[derive(Clone)]
pub struct AppState {
    /// Loaded once at startup; read-only afterwards.
    pub config: Arc<PilotConfig>,
    pub backend: Arc<dyn Backend>,
    /// Broadcast sender for every turn's events.
    pub event_tx: Arc<broadcast::Sender<TaskEvent>>,
}

impl AppState {
    pub fn new(config: PilotConfig, backend: Arc<dyn Backend>) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            config: Arc::new(config),
            backend,
            event_tx: Arc::new(event_tx),
        }
    }
}

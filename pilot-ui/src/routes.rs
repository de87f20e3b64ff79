//! HTTP route handlers for the chat API.

use std::convert::Infallible;
use std::path::PathBuf;
use std::sync::Arc;

use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::response::sse::{Event, Sse};
use axum::routing::{get, post};
use futures::stream::Stream;
use pilot::io::config::{ParseMode, ProviderConfig};
use pilot::io::provider::Vendor;
use pilot::relay::{EventSink, FailureReason, Relay, TurnEvent};
use pilot::session::{Session, SessionTask};
use serde::{Deserialize, Serialize};
use tokio::sync::{broadcast, mpsc};
use tracing::{info, warn};

use crate::state::{AppState, TaskEvent};

/// Events buffered between the turn worker and a slow client.
const CHAT_BUFFER: usize = 256;

/// Build the API router.
pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/chat", post(chat))
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Serialize)]
pub struct StatusResponse {
    vendor: &'static str,
    model: String,
    streaming: bool,
    parse_mode: ParseMode,
    working_directory: PathBuf,
}

/// GET /api/status - configured default provider.
pub async fn status(State(state): State<AppState>) -> Result<Json<StatusResponse>, StatusCode> {
    let provider = state
        .config
        .provider
        .as_ref()
        .ok_or(StatusCode::SERVICE_UNAVAILABLE)?;
    let vendor = Vendor::detect(&provider.api_url);
    Ok(Json(StatusResponse {
        vendor: vendor.as_str(),
        model: provider.model.clone(),
        streaming: provider.stream && vendor.supports_streaming(),
        parse_mode: state.config.session.parse_mode,
        working_directory: provider.working_directory.clone(),
    }))
}

#[derive(Debug, Deserialize)]
pub struct ChatRequest {
    message: String,
    /// Per-request provider settings; the configured default otherwise.
    #[serde(default)]
    config: Option<ProviderConfig>,
}

/// Primary observer: the client that started the turn.
struct ChannelSink {
    tx: mpsc::Sender<TurnEvent>,
}

impl EventSink for ChannelSink {
    fn deliver(&self, event: &TurnEvent) -> bool {
        self.tx.blocking_send(event.clone()).is_ok()
    }
}

/// Secondary observer: everyone listening on `/events`.
struct BroadcastSink {
    task_id: String,
    tx: Arc<broadcast::Sender<TaskEvent>>,
}

impl EventSink for BroadcastSink {
    fn deliver(&self, event: &TurnEvent) -> bool {
        // No subscribers is fine.
        let _ = self.tx.send(TaskEvent {
            task_id: self.task_id.clone(),
            event: event.clone(),
        });
        true
    }
}

/// POST /api/chat - run one turn and stream its events.
pub async fn chat(
    State(state): State<AppState>,
    Json(request): Json<ChatRequest>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, (StatusCode, String)> {
    let goal = request.message.trim().to_string();
    if goal.is_empty() {
        return Err((
            StatusCode::BAD_REQUEST,
            "message must not be empty".to_string(),
        ));
    }
    let provider_config = request
        .config
        .or_else(|| state.config.provider.clone())
        .ok_or_else(|| {
            (
                StatusCode::BAD_REQUEST,
                "no provider configuration in request or server config".to_string(),
            )
        })?;
    provider_config
        .validate()
        .map_err(|err| (StatusCode::BAD_REQUEST, format!("{err:#}")))?;

    let task = SessionTask::new(provider_config.working_directory.clone());
    info!(task_id = %task.id, "starting turn");

    let (tx, mut rx) = mpsc::channel(CHAT_BUFFER);
    let relay = Relay::new(Arc::new(ChannelSink { tx })).with_observer(Arc::new(BroadcastSink {
        task_id: task.id.clone(),
        tx: Arc::clone(&state.event_tx),
    }));
    tokio::task::spawn_blocking(move || run_turn(state, provider_config, task, goal, relay));

    let stream = async_stream::stream! {
        while let Some(event) = rx.recv().await {
            yield Ok(sse_event(event.kind(), &event));
        }
    };
    Ok(Sse::new(stream))
}

fn run_turn(
    state: AppState,
    provider_config: ProviderConfig,
    mut task: SessionTask,
    goal: String,
    relay: Relay,
) {
    let provider = match state.backend.provider() {
        Ok(provider) => provider,
        Err(err) => {
            warn!(err = %format!("{err:#}"), "provider setup failed");
            let content = format!("provider setup failed: {err:#}");
            relay.emit(TurnEvent::Error {
                content: content.clone(),
            });
            relay.emit(TurnEvent::Failed {
                reason: FailureReason::ProviderFailure,
                content,
            });
            return;
        }
    };
    let runner = state.backend.runner(&state.config.session);
    let session = Session {
        provider: provider.as_ref(),
        runner: runner.as_ref(),
        provider_config: &provider_config,
        config: &state.config.session,
    };
    let outcome = session.run_turn(&mut task, &goal, &relay);
    info!(
        task_id = %outcome.task_id,
        stop = outcome.stop.as_str(),
        rounds = outcome.rounds,
        "turn ended"
    );
}

/// `event:` carries the kind, `data:` the JSON event.
pub fn sse_event<T: Serialize>(kind: &str, payload: &T) -> Event {
    let data = serde_json::to_string(payload).unwrap_or_else(|_| "{}".to_string());
    Event::default().event(kind).data(data)
}

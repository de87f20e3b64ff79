//! Server-Sent Events stream of every turn's events.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::State;
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::stream::Stream;
use tokio::sync::broadcast;
use tracing::warn;

use crate::routes::sse_event;
use crate::state::{AppState, TaskEvent};

/// GET /events - secondary observers. Each frame is a [`TaskEvent`].
pub async fn events_handler(
    State(state): State<AppState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    Sse::new(task_events(state.event_tx.subscribe())).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(15))
            .text("ping"),
    )
}

fn task_events(
    mut rx: broadcast::Receiver<TaskEvent>,
) -> impl Stream<Item = Result<Event, Infallible>> {
    async_stream::stream! {
        yield Ok(Event::default().event("connected").data("{}"));

        loop {
            match rx.recv().await {
                Ok(task_event) => {
                    yield Ok(sse_event(task_event.event.kind(), &task_event));
                }
                Err(broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "SSE client lagged, some events dropped");
                }
                Err(broadcast::error::RecvError::Closed) => {
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use pilot::relay::TurnEvent;

    #[test]
    fn task_event_flattens_the_turn_event() {
        let event = TaskEvent {
            task_id: "t-1".to_string(),
            event: TurnEvent::CommandOutput {
                content: "hi\n".to_string(),
            },
        };
        let json = serde_json::to_value(&event).expect("json");
        assert_eq!(
            json,
            serde_json::json!({"task_id": "t-1", "type": "command-output", "content": "hi\n"})
        );
    }

    #[tokio::test]
    async fn stream_relays_broadcast_until_closed() {
        let (tx, rx) = broadcast::channel(8);
        let stream = task_events(rx);
        tx.send(TaskEvent {
            task_id: "t-2".to_string(),
            event: TurnEvent::Complete,
        })
        .expect("send");
        drop(tx);

        let events: Vec<Result<Event, Infallible>> = stream.collect().await;
        // "connected" plus the one relayed event.
        assert_eq!(events.len(), 2);
    }
}

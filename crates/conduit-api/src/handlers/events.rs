//! Server-Sent Events notification channel.

use std::convert::Infallible;
use std::time::Duration;

use axum::extract::{Query, State};
use axum::response::sse::{Event, KeepAlive};
use axum::response::Sse;
use serde::Deserialize;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt as _;
use uuid::Uuid;

use conduit_core::defaults::SSE_KEEPALIVE_SECS;
use conduit_core::EventEnvelope;

use crate::AppState;

/// Optional subscription filters.
#[derive(Debug, Default, Deserialize)]
pub struct EventFilter {
    pub tenant_id: Option<Uuid>,
    pub job_id: Option<Uuid>,
}

impl EventFilter {
    fn matches(&self, envelope: &EventEnvelope) -> bool {
        let tenant_ok = self
            .tenant_id
            .map_or(true, |t| envelope.tenant_id == Some(t));
        let job_ok = self
            .job_id
            .map_or(true, |j| envelope.payload.job_id() == Some(j));
        tenant_ok && job_ok
    }
}

/// Clients connect to `/api/v1/events` and receive every status document
/// change and lifecycle event. Lagging clients silently miss events.
pub async fn sse_events(
    State(state): State<AppState>,
    Query(filter): Query<EventFilter>,
) -> Sse<impl futures::Stream<Item = Result<Event, Infallible>>> {
    let rx = state.pipeline.events.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(move |result| match result {
        Ok(envelope) if filter.matches(&envelope) => {
            let mut event = Event::default()
                .event(envelope.event_type.clone())
                .id(envelope.event_id.to_string());
            event = match serde_json::to_string(&envelope) {
                Ok(json) => event.data(json),
                Err(_) => return None,
            };
            Some(Ok(event))
        }
        // Filtered out, or lagged.
        _ => None,
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(SSE_KEEPALIVE_SECS))
            .text("keepalive"),
    )
}

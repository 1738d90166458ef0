//! Server-Sent Events for pipeline and review progress
//!
//! GET /events streams every event; `?session_id=` narrows it to one session.

use axum::{
    extract::{Query, State},
    response::sse::{Event, Sse},
};
use futures::stream::Stream;
use serde::Deserialize;
use std::convert::Infallible;
use uuid::Uuid;

use crate::AppState;

#[derive(Debug, Deserialize)]
pub struct EventStreamQuery {
    #[serde(default)]
    pub session_id: Option<Uuid>,
}

/// GET /events
pub async fn event_stream(
    State(state): State<AppState>,
    Query(query): Query<EventStreamQuery>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let session_filter = query.session_id;
    doccat_common::sse::event_bus_sse_stream("doccat-ingest", &state.event_bus, move |event| {
        session_filter.map_or(true, |id| event.session_id() == id)
    })
}

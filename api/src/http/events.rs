// ABOUTME: Server-Sent Events stream of bus topics
// ABOUTME: One broadcast subscriber per connection; laggards are dropped, not replayed

use crate::state::SharedState;
use axum::{
    extract::State,
    response::sse::{Event, KeepAlive, Sse},
};
use futures::stream::Stream;
use std::convert::Infallible;
use std::time::Duration;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

/// GET /events
pub async fn stream_events(
    State(state): State<SharedState>,
) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let rx = state.bus.subscribe();

    let stream = BroadcastStream::new(rx).filter_map(|result| match result {
        Ok(message) => Some(Ok(Event::default()
            .event(message.topic.as_str())
            .json_data(&message.payload)
            .unwrap_or_else(|_| Event::default().data("serialization error")))),
        // Lagged: the subscriber fell behind its buffer and gets reset
        // by the client reconnecting; drop the marker itself.
        Err(_) => None,
    });

    Sse::new(stream).keep_alive(
        KeepAlive::new()
            .interval(Duration::from_secs(30))
            .text("keep-alive"),
    )
}

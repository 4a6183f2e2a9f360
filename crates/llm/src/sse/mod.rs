pub(crate) mod parser;

use std::{convert::Infallible, time::Duration};

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};

use crate::{protocol::ClientEvent, stream::ClientEventStream};

/// Converts client events into an SSE response.
///
/// Events are flushed as produced. Idle connections get a comment every 30 seconds.
pub(crate) fn client_events_to_sse(stream: ClientEventStream) -> Sse<impl Stream<Item = Result<Event, Infallible>>> {
    let events = stream.map(|event| Ok(to_event(event)));

    Sse::new(events).keep_alive(KeepAlive::new().interval(Duration::from_secs(30)).text(""))
}

fn to_event(event: ClientEvent) -> Event {
    let sse = match event.event {
        Some(name) => Event::default().event(name),
        None => Event::default(),
    };

    sse.data(event.data)
}

//! Server-Sent Events framing for chat streams.
//!
//! Every [`NormalizedEvent`] becomes one frame whose `event:` line is the
//! event's wire name and whose `data:` line is its JSON encoding.

use crate::normalized::{NormalizedEvent, event_name};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures::{Stream, StreamExt};
use std::convert::Infallible;
use std::time::Duration;

/// Frame each event as `event: <name>` + `data: <json>`.
pub fn build_sse_response<S>(stream: S) -> Sse<impl Stream<Item = Result<Event, Infallible>> + Send>
where
    S: Stream<Item = NormalizedEvent> + Send + 'static,
{
    let stream = stream.map(|event| Ok(to_sse_event(&event)));

    Sse::new(stream).keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
}

fn to_sse_event(event: &NormalizedEvent) -> Event {
    let json = serde_json::to_string(event).unwrap_or_else(|e| {
        serde_json::json!({ "type": "error", "data": { "message": e.to_string() } }).to_string()
    });
    Event::default().event(event_name(event)).data(json)
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::response::IntoResponse;

    #[tokio::test]
    async fn test_frames_carry_event_name_and_json() {
        let events = futures::stream::iter(vec![
            NormalizedEvent::MessageDelta {
                text: "Hi".to_string(),
            },
            NormalizedEvent::Done,
        ]);
        let response = build_sse_response(events).into_response();
        let body = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        let body = String::from_utf8(body.to_vec()).unwrap();

        assert!(body.contains("event: message.delta\n"), "{body}");
        assert!(body.contains(r#"data: {"type":"message.delta","data":{"text":"Hi"}}"#), "{body}");
        assert!(body.contains("event: done\n"), "{body}");
    }
}

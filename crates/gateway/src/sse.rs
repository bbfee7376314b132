use axum::http::HeaderValue;
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use loomweave_pipeline::CompleteStream;
use std::convert::Infallible;
use tokio_stream::StreamExt;
use tokio_stream::wrappers::ReceiverStream;

/// Response header carrying the key for `POST /v1/conversations/{key}/cancel`.
pub const CANCEL_KEY_HEADER: &str = "x-loomweave-cancel-key";

/// Stream completion events as SSE. Dropping the response body (client
/// disconnect) drops the receiver, which the completion task notices.
pub(crate) fn sse_response(stream: CompleteStream) -> Response {
    let CompleteStream { key, events } = stream;
    let events = ReceiverStream::new(events).map(|event| {
        let data = serde_json::to_string(&event).unwrap_or_default();
        Ok::<_, Infallible>(SseEvent::default().event(event.event_type()).data(data))
    });

    let mut response = Sse::new(events)
        .keep_alive(KeepAlive::default())
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&key) {
        response.headers_mut().insert(CANCEL_KEY_HEADER, value);
    }
    response
}

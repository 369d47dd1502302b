//! Server-sent event framing for streamed operations.
//!
//! Event names: `connected`, `status`, `log`, `error`. Every payload is JSON;
//! log payloads are `{timestamp, type, message}`.

use axum::response::sse::{Event, KeepAlive, Sse};
use futures::Stream;
use serde_json::json;
use tokio::sync::mpsc;

use crate::supervisor::StreamEvent;

/// Turn a supervisor event feed into an SSE response body.
///
/// The response ends when the feed ends. Dropping the response (client
/// disconnect) drops the receiver, which stops the forwarding task.
pub(crate) fn sse(
    rx: mpsc::Receiver<StreamEvent>,
) -> Sse<impl Stream<Item = Result<Event, axum::Error>>> {
    let stream = futures::stream::unfold(rx, |mut rx| async move {
        let event = rx.recv().await?;
        Some((to_sse(&event), rx))
    });
    Sse::new(stream).keep_alive(KeepAlive::default())
}

fn to_sse(event: &StreamEvent) -> Result<Event, axum::Error> {
    match event {
        StreamEvent::Connected { world } => Event::default()
            .event("connected")
            .json_data(json!({ "world": world })),
        StreamEvent::Status { world, phase } => Event::default()
            .event("status")
            .json_data(json!({ "world": world, "status": phase })),
        StreamEvent::Log(log) => Event::default().event("log").json_data(log),
        StreamEvent::Error { message, code } => Event::default()
            .event("error")
            .json_data(json!({ "message": message, "code": code })),
    }
}

//! Event streaming handler.
//!
//! Bridges one long-lived HTTP connection to one broadcaster
//! subscription. The subscription is released on every exit path - client
//! disconnect drops the body stream, which drops the guard.

use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use async_stream::stream;
use axum::body::Body;
use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use serde::Deserialize;

use crate::events::{filter_from_query, Broadcaster, Event, SubscriptionId};

use super::AppState;

/// Idle interval between keep-alive events.
const KEEP_ALIVE_INTERVAL: Duration = Duration::from_secs(30);

/// Query parameters accepted by `GET /events`.
#[derive(Debug, Default, Deserialize)]
pub(super) struct StreamQuery {
    /// CSV of event type names.
    types: Option<String>,
    /// CSV of subsystem names.
    backend: Option<String>,
}

/// Releases the broadcaster subscription exactly once, on any exit path.
struct SubscriptionGuard {
    id: SubscriptionId,
    broadcaster: Arc<Broadcaster>,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        self.broadcaster.unsubscribe(self.id);
    }
}

pub(super) async fn events(
    State(state): State<AppState>,
    Query(query): Query<StreamQuery>,
) -> Response {
    let filter = filter_from_query(query.types.as_deref(), query.backend.as_deref());
    let (id, mut rx) = state.broadcaster.subscribe_filtered(filter);
    let guard = SubscriptionGuard {
        id,
        broadcaster: Arc::clone(&state.broadcaster),
    };
    // Derived from the server's root token so long-lived connections exit
    // on shutdown.
    let shutdown = state.shutdown.clone();
    log::debug!("[Events] stream {id} connected");

    let body = stream! {
        let _guard = guard;
        yield Ok::<Bytes, Infallible>(Bytes::from_static(b": connected\n\n"));

        let keep_alive = tokio::time::sleep(KEEP_ALIVE_INTERVAL);
        tokio::pin!(keep_alive);
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    if let Some(frame) = encode_event(&Event::server_info("bye")) {
                        yield Ok(frame);
                    }
                    break;
                }
                _ = keep_alive.as_mut() => {
                    if let Some(frame) = encode_event(&Event::server_info("love")) {
                        yield Ok(frame);
                    }
                    keep_alive
                        .as_mut()
                        .reset(tokio::time::Instant::now() + KEEP_ALIVE_INTERVAL);
                }
                event = rx.recv() => {
                    match event {
                        Some(event) => {
                            if let Some(frame) = encode_event(&event) {
                                yield Ok(frame);
                                keep_alive
                                    .as_mut()
                                    .reset(tokio::time::Instant::now() + KEEP_ALIVE_INTERVAL);
                            }
                        }
                        None => break,
                    }
                }
            }
        }
        log::debug!("[Events] stream closed");
    };

    match Response::builder()
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header(header::CONNECTION, "keep-alive")
        // Disables buffering in intermediate proxies.
        .header("X-Accel-Buffering", "no")
        .body(Body::from_stream(body))
    {
        Ok(response) => response,
        Err(e) => {
            log::error!("[Events] failed to build stream response: {e}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

/// Serialises one event into wire framing.
///
/// Encoding failures are logged and the event skipped; the stream lives on.
fn encode_event(event: &Event) -> Option<Bytes> {
    match serde_json::to_string(&event.data) {
        Ok(payload) => Some(Bytes::from(format!(
            "event: {}\ndata: {}\n\n",
            event.event_type, payload
        ))),
        Err(e) => {
            log::warn!("[Events] failed to encode {} payload: {e}", event.event_type);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventType;
    use serde_json::json;

    #[test]
    fn frames_carry_type_and_json_payload() {
        let event = Event::new(EventType::AudioUpdated, json!({"x": 1}));
        let frame = encode_event(&event).unwrap();
        assert_eq!(&frame[..], b"event: audio.updated\ndata: {\"x\":1}\n\n");
    }

    #[test]
    fn control_frames_use_server_info() {
        let frame = encode_event(&Event::server_info("love")).unwrap();
        assert_eq!(&frame[..], b"event: server.info\ndata: \"love\"\n\n");
    }

    #[tokio::test]
    async fn guard_unsubscribes_on_drop() {
        let broadcaster = Arc::new(Broadcaster::new());
        let (id, mut rx) = broadcaster.subscribe();
        let guard = SubscriptionGuard {
            id,
            broadcaster: Arc::clone(&broadcaster),
        };
        assert_eq!(broadcaster.subscriber_count(), 1);
        drop(guard);
        assert_eq!(broadcaster.subscriber_count(), 0);
        assert!(rx.recv().await.is_none());
    }
}

// `GET /{resource}/subscribe` (§4.H, §6 SSE event taxonomy): opens a
// resumable live-query stream over Server-Sent Events, grounded on the
// `Sse::new(receiver).keep_alive(KeepAlive::default())` shape used by the
// retrieval pack's record-subscription handler, with the keep-alive
// interval driven by `ResumableStreamManager::heartbeat_interval` instead
// of a hardcoded default, and a drop guard that calls `disconnect` when
// the client goes away (that pack's `CleanupSubscription` pattern).

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::Arc;

use axum::extract::{Path, Query, State};
use axum::response::sse::{Event, KeepAlive, Sse};
use futures_util::stream::{self, Stream};
use futures_util::StreamExt;
use uuid::Uuid;

use crate::error::EngineError;
use crate::router::{Envelope, RoutedEvent};
use crate::stream::{ConnectRequest, ResumableStreamManager};

use super::error_response::ApiError;
use super::AppState;

fn resource_error(state: &AppState, err: EngineError, instance: String) -> ApiError {
    ApiError::new(err, Some(instance), state.config.debug_mode)
}

/// Tears down the subscription when the SSE stream is dropped, whether
/// that's a client disconnect, a server shutdown, or backpressure-driven
/// cancellation (§5 Cancellation).
struct DisconnectGuard {
    manager: Arc<ResumableStreamManager>,
    metrics: Arc<crate::metrics::Metrics>,
    subscription_id: Uuid,
}

impl Drop for DisconnectGuard {
    fn drop(&mut self) {
        self.manager.disconnect(&self.subscription_id);
        self.metrics.subscription_closed();
    }
}

struct StreamState {
    receiver: tokio::sync::mpsc::Receiver<Envelope>,
    manager: Arc<ResumableStreamManager>,
    subscription_id: Uuid,
    _guard: DisconnectGuard,
}

fn event_name(event: &RoutedEvent) -> &'static str {
    match event {
        RoutedEvent::Connected { .. } => "connected",
        RoutedEvent::Existing { .. } => "existing",
        RoutedEvent::Added { .. } => "added",
        RoutedEvent::Changed { .. } => "changed",
        RoutedEvent::Removed { .. } => "removed",
        RoutedEvent::Invalidate { .. } => "invalidate",
    }
}

fn to_sse_event(envelope: Envelope) -> Result<Event, Infallible> {
    let name = event_name(&envelope.event);
    // Mutation-derived events carry the originating changelog `seq`; using
    // it as the wire id means a browser EventSource's native reconnect
    // (`Last-Event-ID`) round-trips straight into `resumeFrom` (§6).
    // Connection-lifecycle events (`connected`/`existing`/`invalidate`)
    // have no changelog seq of their own, so fall back to the event uuid.
    let id = envelope
        .changelog_seq
        .map(|seq| seq.to_string())
        .unwrap_or_else(|| envelope.event_id.to_string());
    let data = serde_json::to_string(&envelope).unwrap_or_else(|_| "{}".to_string());
    Ok(Event::default().event(name).id(id).data(data))
}

pub async fn subscribe(
    State(state): State<AppState>,
    Path(resource): Path<String>,
    headers: axum::http::HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Result<Sse<impl Stream<Item = Result<Event, Infallible>>>, ApiError> {
    let schema = state.schemas.get(&resource).ok_or_else(|| {
        ApiError::new(EngineError::NotFound(format!("unknown resource '{resource}'")), None, state.config.debug_mode)
    })?;
    let instance = format!("/{resource}/subscribe");

    let filter = match params.get("filter") {
        Some(expr) => crate::filter::compile(expr, schema, &state.config, &state.filter_cache)
            .map_err(|e| resource_error(&state, e, instance.clone()))?,
        None => Arc::new(crate::filter::FilterNode::True),
    };
    let scope_filter = match params.get("scopeFilter") {
        Some(expr) => Some(
            crate::filter::compile(expr, schema, &state.config, &state.filter_cache)
                .map_err(|e| resource_error(&state, e, instance.clone()))?,
        ),
        None => None,
    };

    // `resumeFrom` query param takes precedence; `Last-Event-ID` is the
    // browser EventSource's native reconnect header and carries the same
    // changelog `seq` as a fallback (§6 "resumeFrom/Last-Event-ID").
    let resume_from = params.get("resumeFrom").and_then(|v| v.parse::<u64>().ok()).or_else(|| {
        headers
            .get("last-event-id")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok())
    });
    let skip_existing = params.get("skipExisting").map(|v| v == "true").unwrap_or(false);
    let known_ids = params
        .get("knownIds")
        .map(|raw| raw.split(',').map(str::trim).filter(|s| !s.is_empty()).map(str::to_string).collect());
    let user_key = headers.get("x-user-id").and_then(|v| v.to_str().ok()).map(str::to_string);
    let ip_key = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()).map(str::to_string);

    let request = ConnectRequest {
        resource: resource.clone(),
        pk_field: schema.primary_key.clone(),
        filter,
        scope_filter,
        resume_from,
        skip_existing,
        known_ids,
        expires_at: None,
        user_key,
        ip_key,
    };

    let connection = state
        .stream_manager
        .connect(request)
        .await
        .map_err(|e| resource_error(&state, e, instance))?;
    state.metrics.subscription_opened();

    let manager = state.stream_manager.clone();
    let subscription_id = connection.subscription_id;
    let metrics = state.metrics.clone();
    let initial_state = StreamState {
        receiver: connection.receiver,
        manager: manager.clone(),
        subscription_id,
        _guard: DisconnectGuard { manager, metrics: metrics.clone(), subscription_id },
    };

    let stream = stream::unfold(initial_state, move |mut st| {
        let metrics = metrics.clone();
        async move {
            let envelope = st.receiver.recv().await?;
            metrics.record_event(&envelope.event);
            let drained_bytes = serde_json::to_vec(&envelope).map(|v| v.len()).unwrap_or(0);
            st.manager.note_drained(st.subscription_id, drained_bytes);
            st.manager.check_backpressure(st.subscription_id).await;
            Some((envelope, st))
        }
    })
    .map(to_sse_event);

    let keep_alive = KeepAlive::new().interval(state.stream_manager.heartbeat_interval()).text("heartbeat");
    Ok(Sse::new(stream).keep_alive(keep_alive))
}

//! Conditional-cache middleware.
//!
//! Runs the coordinator before the handler. A current client copy is answered
//! with `304 Not Modified` and the handler never runs; otherwise the handler
//! runs and the freshly issued `ETag`/`Cache-Control` are merged into its
//! response.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    body::Body,
    extract::State,
    http::{
        HeaderMap, Request, StatusCode,
        header::{CACHE_CONTROL, ETAG},
    },
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::MethodRouter,
};
use metrics::counter;
use tokio_util::sync::CancellationToken;
use tracing::{instrument, warn};

use crate::{
    application::error::HttpError,
    tracker::{
        Coordinator, Decision, ErrorKind, TrackSpec, TrackedEndpoint, TrackerError,
        coordinator::METRIC_ERROR,
    },
};

/// Per-route state for [`conditional_cache_layer`].
#[derive(Clone)]
pub struct TrackedRoute {
    coordinator: Arc<Coordinator>,
    endpoint: TrackedEndpoint,
    fetch_timeout: Option<Duration>,
}

impl TrackedRoute {
    pub fn new(coordinator: Arc<Coordinator>, spec: TrackSpec) -> Self {
        Self {
            coordinator,
            endpoint: TrackedEndpoint::new(spec),
            fetch_timeout: None,
        }
    }

    pub fn with_fetch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.fetch_timeout = timeout;
        self
    }

    pub fn endpoint(&self) -> &TrackedEndpoint {
        &self.endpoint
    }

    /// Build the endpoint's options now so misconfiguration fails at startup.
    pub fn prepare(&self) -> Result<(), TrackerError> {
        self.coordinator.prepare(&self.endpoint)
    }
}

/// Response headers chosen by an outer stage before the handler runs.
///
/// An outer middleware may insert this into the request extensions; the
/// coordinator treats it as the response-so-far when applying its gates.
#[derive(Debug, Clone, Default)]
pub struct PresetResponseHeaders(pub HeaderMap);

/// Attach conditional caching to a single method router.
pub fn track<S>(route: MethodRouter<S>, tracked: TrackedRoute) -> MethodRouter<S>
where
    S: Clone + Send + Sync + 'static,
{
    route.layer(middleware::from_fn_with_state(
        tracked,
        conditional_cache_layer,
    ))
}

#[instrument(skip_all, fields(path = %request.uri().path(), endpoint = %route.endpoint.id()))]
pub async fn conditional_cache_layer(
    State(route): State<TrackedRoute>,
    request: Request<Body>,
    next: Next,
) -> Response {
    let (parts, body) = request.into_parts();
    let preset = parts
        .extensions
        .get::<PresetResponseHeaders>()
        .map(|preset| preset.0.clone())
        .unwrap_or_default();
    let mut headers = preset.clone();

    // Fires on every exit path, including the client going away.
    let token = CancellationToken::new();
    let _guard = token.clone().drop_guard();

    let decision = with_deadline(
        route
            .coordinator
            .evaluate(&route.endpoint, &parts, &mut headers, &token),
        route.fetch_timeout,
        &token,
    )
    .await;

    match decision {
        Ok(Decision::NotModified { .. }) => not_modified(&headers),
        Ok(Decision::PassThrough) => {
            let issued = !preset.contains_key(ETAG) && headers.contains_key(ETAG);
            let mut response = next.run(Request::from_parts(parts, body)).await;
            if issued && response.status().is_success() {
                merge_cache_headers(response.headers_mut(), &headers);
            }
            response
        }
        Err(err) => HttpError::from(err).into_response(),
    }
}

/// Bound `evaluation` by `deadline`. On expiry the token is cancelled and the
/// evaluation dropped.
async fn with_deadline<T, F>(
    evaluation: F,
    deadline: Option<Duration>,
    token: &CancellationToken,
) -> Result<T, TrackerError>
where
    F: Future<Output = Result<T, TrackerError>>,
{
    let Some(deadline) = deadline else {
        return evaluation.await;
    };

    tokio::select! {
        biased;
        result = evaluation => result,
        _ = tokio::time::sleep(deadline) => {
            token.cancel();
            warn!(timeout_ms = deadline.as_millis() as u64, "freshness fetch deadline exceeded");
            counter!(METRIC_ERROR, "kind" => ErrorKind::Cancelled.as_str()).increment(1);
            Err(TrackerError::Cancelled)
        }
    }
}

fn not_modified(headers: &HeaderMap) -> Response {
    let mut kept = HeaderMap::new();
    for name in [ETAG, CACHE_CONTROL] {
        if let Some(value) = headers.get(&name) {
            kept.insert(name, value.clone());
        }
    }
    (StatusCode::NOT_MODIFIED, kept).into_response()
}

fn merge_cache_headers(target: &mut HeaderMap, issued: &HeaderMap) {
    for name in [ETAG, CACHE_CONTROL] {
        if target.contains_key(&name) {
            continue;
        }
        if let Some(value) = issued.get(&name) {
            target.insert(name, value.clone());
        }
    }
}

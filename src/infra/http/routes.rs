use std::sync::Arc;
use std::time::Duration;

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use futures::future::try_join_all;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

use super::{
    layer::{TrackedRoute, track},
    middleware::{log_responses, set_request_context},
};
use crate::{
    application::{
        error::{ErrorReport, HttpError},
        tracking::{TableStatus, TrackingService},
    },
    tracker::{Coordinator, ProviderRegistry, SourceError, TrackSpec, TrackerError},
};

pub const POSTS_TABLE: &str = "posts";
pub const COMMENTS_TABLE: &str = "comments";

/// Shared state for the demo read API.
#[derive(Clone)]
pub struct AppState {
    pub coordinator: Arc<Coordinator>,
    pub registry: Arc<ProviderRegistry>,
    pub tracking: TrackingService,
    pub fetch_timeout: Option<Duration>,
}

impl AppState {
    fn tracked(&self, spec: TrackSpec) -> TrackedRoute {
        TrackedRoute::new(self.coordinator.clone(), spec).with_fetch_timeout(self.fetch_timeout)
    }
}

/// Assemble the router. Every tracked endpoint's options are built here, so a
/// bad table list or provider id fails before the listener binds.
pub fn build_router(state: AppState) -> Result<Router, TrackerError> {
    let posts = state.tracked(TrackSpec::new("posts.index").tables([POSTS_TABLE]));
    let feed =
        state.tracked(TrackSpec::new("posts.feed").tables([POSTS_TABLE, COMMENTS_TABLE]));
    let activity = state.tracked(TrackSpec::new("activity"));

    for route in [&posts, &feed, &activity] {
        route.prepare()?;
    }

    let router = Router::new()
        .route("/health", get(health))
        .route("/api/posts", track(get(list_posts), posts))
        .route("/api/feed", track(get(feed_view), feed))
        .route("/api/activity", track(get(activity_view), activity))
        .route("/api/tables/{table}", get(table_status))
        .route(
            "/api/tables/{table}/tracking",
            post(enable_tracking).delete(disable_tracking),
        )
        .route("/api/tables/{table}/touch", post(touch_table))
        .with_state(state)
        .layer(middleware::from_fn(log_responses))
        .layer(middleware::from_fn(set_request_context));

    Ok(router)
}

#[derive(Serialize)]
struct HealthView {
    status: &'static str,
    sources: Vec<String>,
}

async fn health(State(state): State<AppState>) -> Json<HealthView> {
    Json(HealthView {
        status: "ok",
        sources: state.registry.ids().map(str::to_string).collect(),
    })
}

#[derive(Serialize)]
struct TablesView {
    tables: Vec<TableStatus>,
}

async fn list_posts(State(state): State<AppState>) -> Response {
    tables_view(&state, &[POSTS_TABLE]).await
}

async fn feed_view(State(state): State<AppState>) -> Response {
    tables_view(&state, &[POSTS_TABLE, COMMENTS_TABLE]).await
}

async fn tables_view(state: &AppState, tables: &[&str]) -> Response {
    let token = CancellationToken::new();
    let statuses = try_join_all(
        tables
            .iter()
            .map(|table| state.tracking.status(table, &token)),
    )
    .await;

    match statuses {
        Ok(tables) => Json(TablesView { tables }).into_response(),
        Err(err) => HttpError::from(err).into_response(),
    }
}

#[derive(Serialize)]
struct ActivityView {
    source: String,
}

async fn activity_view(State(state): State<AppState>) -> Json<ActivityView> {
    Json(ActivityView {
        source: state.tracking.source_id().to_string(),
    })
}

async fn table_status(State(state): State<AppState>, Path(table): Path<String>) -> Response {
    match state
        .tracking
        .status(&table, &CancellationToken::new())
        .await
    {
        Ok(status) => Json(status).into_response(),
        Err(err) => HttpError::from(err).into_response(),
    }
}

#[derive(Serialize)]
struct ChangeView {
    table: String,
    changed: bool,
}

async fn enable_tracking(State(state): State<AppState>, Path(table): Path<String>) -> Response {
    let result = state
        .tracking
        .enable(&table, &CancellationToken::new())
        .await;
    change_response(table, result)
}

async fn disable_tracking(State(state): State<AppState>, Path(table): Path<String>) -> Response {
    let result = state
        .tracking
        .disable(&table, &CancellationToken::new())
        .await;
    change_response(table, result)
}

fn change_response(table: String, result: Result<bool, SourceError>) -> Response {
    match result {
        Ok(changed) => Json(ChangeView { table, changed }).into_response(),
        Err(err) => HttpError::from(err).into_response(),
    }
}

#[derive(Serialize)]
struct TouchView {
    table: String,
    version: i64,
}

async fn touch_table(State(state): State<AppState>, Path(table): Path<String>) -> Response {
    match state
        .tracking
        .touch(&table, &CancellationToken::new())
        .await
    {
        Ok(Some(version)) => Json(TouchView { table, version }).into_response(),
        Ok(None) => {
            let mut response = (StatusCode::NOT_FOUND, "Table is not tracked").into_response();
            ErrorReport::from_message(
                "infra::http::touch",
                StatusCode::NOT_FOUND,
                format!("table `{table}` is not tracked"),
            )
            .attach(&mut response);
            response
        }
        Err(err) => HttpError::from(err).into_response(),
    }
}

use crate::refresh::{RefreshCoordinator, RefreshStatus, TriggerOutcome};
use crate::stats_cache::StatsCache;
use crate::util::normalize_isbn;
use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse, Response},
    routing::get,
};
use std::sync::Arc;
use tracing::error;

const PROVIDER: &str = "goodreads";

#[derive(Clone)]
pub struct AppState {
    pub cache: Arc<dyn StatsCache>,
    pub refresher: Arc<RefreshCoordinator>,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(banner))
        .route("/goodreads/refresh", get(trigger_refresh))
        .route("/goodreads/status", get(refresh_status))
        .route("/{provider}/{isbn}", get(read_statistic))
        .with_state(state)
}

async fn banner() -> Html<&'static str> {
    Html("<h1>Integrator</h1>")
}

async fn trigger_refresh(State(state): State<AppState>) -> StatusCode {
    match state.refresher.trigger().await {
        TriggerOutcome::Started => StatusCode::CREATED,
        TriggerOutcome::AlreadyRunning => StatusCode::CONFLICT,
        TriggerOutcome::Fresh => StatusCode::NOT_MODIFIED,
    }
}

async fn refresh_status(State(state): State<AppState>) -> Json<RefreshStatus> {
    Json(state.refresher.status().await)
}

async fn read_statistic(
    Path((provider, isbn)): Path<(String, String)>,
    State(state): State<AppState>,
) -> Response {
    if provider != PROVIDER {
        return StatusCode::BAD_REQUEST.into_response();
    }

    let key = normalize_isbn(&isbn);
    match state.cache.get(&key).await {
        Ok(Some(stats)) => Json(stats).into_response(),
        Ok(None) => StatusCode::NOT_FOUND.into_response(),
        Err(err) => {
            error!("cache lookup failed for {key}: {err:#}");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{Html, IntoResponse},
    routing::get,
    Json, Router,
};
use serde::Serialize;
use tokio::sync::Mutex;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use thermorelay_common::{
    config::{format_limit, KEY_TEMP_LIMIT},
    ConfigStore, ControlMachine, LimitView, TempView,
};

const HELLO_HTML: &str = "<h1>Hello world</h1>";
const NOT_FOUND_HTML: &str = "404 Not Found";

#[derive(Clone)]
pub struct AppState {
    pub machine: Arc<Mutex<ControlMachine>>,
    pub store: Arc<dyn ConfigStore>,
    pub last_reading_epoch: Arc<Mutex<Option<i64>>>,
}

#[derive(Debug, Serialize)]
struct ErrorBody {
    error: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/hello", get(handle_hello))
        .route("/temp", get(handle_get_temp))
        .route("/temp/limit", get(handle_get_limit))
        .route("/temp/limit/", get(handle_missing_limit))
        .route("/temp/limit/{*value}", get(handle_set_limit))
        .route("/status", get(handle_get_status))
        .fallback(handle_not_found)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn handle_hello() -> Html<&'static str> {
    Html(HELLO_HTML)
}

async fn handle_not_found() -> impl IntoResponse {
    (StatusCode::NOT_FOUND, Html(NOT_FOUND_HTML))
}

async fn handle_get_temp(State(state): State<AppState>) -> impl IntoResponse {
    let machine = state.machine.lock().await;
    Json(TempView {
        t: machine.last_reading_c(),
    })
}

async fn handle_get_limit(State(state): State<AppState>) -> impl IntoResponse {
    let machine = state.machine.lock().await;
    Json(LimitView {
        limit: machine.limit_c(),
    })
}

async fn handle_missing_limit() -> StatusCode {
    warn!("rejected limit update: no value");
    StatusCode::BAD_REQUEST
}

async fn handle_set_limit(
    State(state): State<AppState>,
    Path(value): Path<String>,
) -> axum::response::Response {
    let limit = match ControlMachine::validate_limit(&value) {
        Ok(limit) => limit,
        Err(err) => {
            warn!("rejected limit update: {err}");
            return StatusCode::BAD_REQUEST.into_response();
        }
    };

    // Held across the write so the stored and live limits never diverge.
    let mut machine = state.machine.lock().await;
    if let Err(err) = state.store.set(KEY_TEMP_LIMIT, &format_limit(limit)) {
        warn!("failed to persist limit: {err}");
        return error_response(StatusCode::INTERNAL_SERVER_ERROR, "failed to persist limit");
    }
    machine.commit_limit(limit);
    info!(limit, "temperature limit updated");

    Json(LimitView { limit }).into_response()
}

async fn handle_get_status(State(state): State<AppState>) -> impl IntoResponse {
    let last_reading_epoch = *state.last_reading_epoch.lock().await;
    let machine = state.machine.lock().await;
    Json(machine.status(last_reading_epoch))
}

fn error_response(status: StatusCode, message: &str) -> axum::response::Response {
    (
        status,
        Json(ErrorBody {
            error: message.to_string(),
        }),
    )
        .into_response()
}

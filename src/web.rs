//! Local HTTP control surface: progress, recently displayed photos, photo
//! deletion and screen switching.

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::{get, post};
use frame_link::{ChannelMessage, Command, Publisher, ScreenState};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::tasks::{SharedDisplayed, StatusReporter};
use crate::{SharedCache, SharedRejections, lock};

#[derive(Clone)]
pub struct ControlState {
    pub cache: SharedCache,
    pub rejections: SharedRejections,
    pub reporter: StatusReporter,
    pub displayed: SharedDisplayed,
    pub publisher: Option<Arc<Publisher>>,
    pub album: Arc<str>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
struct StatusResponse {
    status: frame_link::WorkerState,
    album: String,
    num_photos: u64,
    num_photos_processed: u64,
    num_failed_photos: u64,
    cache_use_percent: f64,
}

pub fn router(state: ControlState) -> Router {
    Router::new()
        .route("/status", get(status))
        .route("/displayed", get(displayed))
        .route("/photos/{id}/delete", post(delete_photo))
        .route("/screen/{state}", post(switch_screen))
        .with_state(state)
}

pub async fn serve(bind_addr: &str, state: ControlState, cancel: CancellationToken) -> Result<()> {
    let listener = TcpListener::bind(bind_addr)
        .await
        .with_context(|| format!("failed to bind control surface on {bind_addr}"))?;
    info!(addr = %listener.local_addr()?, "control surface listening");

    axum::serve(listener, router(state).into_make_service())
        .with_graceful_shutdown(cancel.cancelled_owned())
        .await
        .context("control surface exited")?;
    Ok(())
}

async fn status(State(state): State<ControlState>) -> Json<StatusResponse> {
    let snapshot = state.reporter.latest();
    let cache_use_percent = lock(&state.cache).usage_percent();
    Json(StatusResponse {
        status: snapshot.status,
        album: state.album.to_string(),
        num_photos: snapshot.num_total_photos,
        num_photos_processed: snapshot.num_processed_photos,
        num_failed_photos: snapshot.num_failed_photos,
        cache_use_percent,
    })
}

async fn displayed(State(state): State<ControlState>) -> Json<Vec<String>> {
    Json(lock(&state.displayed).snapshot())
}

/// Cache ids are `[A-Za-z0-9_-]` stems with an extension.
fn valid_file_id(id: &str) -> bool {
    !id.is_empty()
        && !id.starts_with('.')
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
}

async fn delete_photo(State(state): State<ControlState>, Path(id): Path<String>) -> Response {
    if !valid_file_id(&id) {
        return (StatusCode::BAD_REQUEST, "invalid photo id").into_response();
    }
    let cache = state.cache.clone();
    let rejections = state.rejections.clone();
    let file_id = id.clone();
    let outcome = tokio::task::spawn_blocking(move || -> Result<bool> {
        lock(&rejections)
            .insert(&file_id)
            .with_context(|| format!("failed to record rejection of {file_id}"))?;
        let removed = lock(&cache)
            .delete(&file_id)
            .with_context(|| format!("failed to delete {file_id}"))?;
        Ok(removed)
    })
    .await;

    match outcome {
        Ok(Ok(removed)) => {
            lock(&state.displayed).remove(&id);
            info!(file_id = %id, removed, "photo deleted by user");
            StatusCode::NO_CONTENT.into_response()
        }
        Ok(Err(err)) => {
            warn!(file_id = %id, error = ?err, "photo deletion failed");
            (StatusCode::INTERNAL_SERVER_ERROR, format!("{err:#}")).into_response()
        }
        Err(err) => {
            warn!(file_id = %id, error = %err, "photo deletion task failed");
            StatusCode::INTERNAL_SERVER_ERROR.into_response()
        }
    }
}

async fn switch_screen(State(state): State<ControlState>, Path(raw): Path<String>) -> Response {
    let screen = match raw.as_str() {
        "on" => ScreenState::On,
        "off" => ScreenState::Off,
        _ => return (StatusCode::BAD_REQUEST, "expected on or off").into_response(),
    };
    let Some(publisher) = &state.publisher else {
        return (StatusCode::SERVICE_UNAVAILABLE, "status channel disabled").into_response();
    };
    match publisher.publish(&ChannelMessage::from(Command::Screen(screen))) {
        Ok(receivers) => {
            info!(?screen, receivers, "screen command published");
            StatusCode::NO_CONTENT.into_response()
        }
        Err(err) => {
            warn!(error = %err, "failed to publish screen command");
            (StatusCode::INTERNAL_SERVER_ERROR, err.to_string()).into_response()
        }
    }
}

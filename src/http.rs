use std::{convert::Infallible, sync::Arc};

use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{
        IntoResponse, Response,
        sse::{Event, KeepAlive, Sse},
    },
    routing::{get, post},
};
use futures::{Stream, StreamExt, channel::mpsc};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use crate::{
    error::CompletionError,
    orchestrator::{CompletionOrchestrator, CompletionRequest},
    types::{CompletionMode, ModelConfig, Profile},
};

#[derive(Clone)]
pub struct AppState {
    pub orchestrator: Arc<CompletionOrchestrator>,
}

#[derive(Debug, Deserialize)]
pub struct CompleteRequest {
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub images: Vec<String>,
    #[serde(default)]
    pub mode: CompletionMode,
    #[serde(default)]
    pub stream: bool,
}

#[derive(Debug, Serialize)]
struct CompleteResponse {
    text: String,
}

#[derive(Serialize)]
struct DeltaPayload<'a> {
    delta: &'a str,
    text: &'a str,
}

#[derive(Serialize)]
struct ErrorPayload {
    message: String,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route(
            "/api/profiles/{profile}",
            get(api_get_profile).put(api_update_profile),
        )
        .route("/api/complete", post(api_complete))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn api_get_profile(
    State(state): State<AppState>,
    Path(profile): Path<String>,
) -> Result<Json<ModelConfig>, (StatusCode, String)> {
    let profile = parse_profile(&profile)?;
    let config = state
        .orchestrator
        .profile(profile)
        .await
        .map_err(internal_error)?;
    Ok(Json(config))
}

async fn api_update_profile(
    State(state): State<AppState>,
    Path(profile): Path<String>,
    Json(config): Json<ModelConfig>,
) -> Result<Json<ModelConfig>, (StatusCode, String)> {
    let profile = parse_profile(&profile)?;
    state
        .orchestrator
        .update_profile(profile, config.clone())
        .await
        .map_err(internal_error)?;
    Ok(Json(config))
}

async fn api_complete(
    State(state): State<AppState>,
    Json(request): Json<CompleteRequest>,
) -> Result<Response, (StatusCode, String)> {
    if request.stream {
        return Ok(stream_completion(state, request).into_response());
    }

    let mut completion = CompletionRequest::new(request.mode).with_images(request.images);
    completion.text = request.text;

    let text = state
        .orchestrator
        .complete(completion)
        .await
        .map_err(completion_error)?;
    Ok(Json(CompleteResponse { text }).into_response())
}

fn stream_completion(state: AppState, request: CompleteRequest) -> impl IntoResponse {
    Sse::new(completion_events(state, request)).keep_alive(KeepAlive::default())
}

/// Runs the completion on its own task and relays updates as SSE events.
/// Dropping the returned stream cancels the completion.
fn completion_events(
    state: AppState,
    request: CompleteRequest,
) -> impl Stream<Item = Result<Event, Infallible>> + Send + 'static {
    let (tx, rx) = mpsc::unbounded::<Event>();
    let token = CancellationToken::new();
    let guard = token.clone().drop_guard();

    let delta_tx = tx.clone();
    let mut completion = CompletionRequest::new(request.mode)
        .with_images(request.images)
        .with_cancellation(token)
        .streaming(move |delta, text| {
            let _ = delta_tx.unbounded_send(json_event("delta", &DeltaPayload { delta, text }));
        });
    completion.text = request.text;

    tokio::spawn(async move {
        let event = match state.orchestrator.complete(completion).await {
            Ok(text) => json_event("done", &CompleteResponse { text }),
            Err(error) => json_event(
                "error",
                &ErrorPayload {
                    message: error.to_string(),
                },
            ),
        };
        let _ = tx.unbounded_send(event);
    });

    futures::stream::unfold((rx, guard), |(mut rx, guard)| async move {
        rx.next()
            .await
            .map(|event| (Ok::<_, Infallible>(event), (rx, guard)))
    })
}

fn json_event(name: &'static str, payload: &impl Serialize) -> Event {
    Event::default()
        .event(name)
        .json_data(payload)
        .unwrap_or_else(|_| Event::default().event("error").data("unencodable event"))
}

fn parse_profile(raw: &str) -> Result<Profile, (StatusCode, String)> {
    Profile::parse(raw).ok_or_else(|| {
        (
            StatusCode::NOT_FOUND,
            format!("unknown profile: {raw} (expected text or vision)"),
        )
    })
}

fn completion_error(error: CompletionError) -> (StatusCode, String) {
    let status = match &error {
        CompletionError::Aborted => StatusCode::REQUEST_TIMEOUT,
        CompletionError::Api { .. }
        | CompletionError::Transport(_)
        | CompletionError::Decode(_)
        | CompletionError::EmptyResponse => StatusCode::BAD_GATEWAY,
        CompletionError::Settings(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (status, error.to_string())
}

fn internal_error(error: anyhow::Error) -> (StatusCode, String) {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("internal error: {error:#}"),
    )
}

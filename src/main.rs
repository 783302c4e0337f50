use axum::{
    Json, Router,
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use shoppable_ingest::{
    config::ClientConfig,
    error::{StageError, StageErrorKind},
    http::build_client,
    matching::{Candidate, TracingFeedback},
    models::ApiError,
    orchestrator::{Services, UploadOrchestrator},
    registry::{SessionEntry, SessionRegistry},
    session::{ConfirmOutcome, TrackedItem, VideoHandle},
    storage::store_from_env,
};
use std::{net::SocketAddr, sync::Arc};
use tokio::sync::OwnedMutexGuard;
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::{error, info};
use tracing_subscriber::{EnvFilter, fmt};
use uuid::Uuid;

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        error!(target = "shoppable.bridge", "bridge crashed: {err:?}");
    }
}

async fn run() -> eyre::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing();

    let config = ClientConfig::from_env();
    info!(
        target = "shoppable.bridge",
        candidates = ?config.candidates,
        variant = %config.variant.name,
        "config_loaded"
    );
    let store = store_from_env(build_client(&config));
    let services = Services::new(config, store, Arc::new(TracingFeedback));
    let app = router(AppState {
        registry: SessionRegistry::new(services),
    });

    let port: u16 = std::env::var("PORT")
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(8080);
    let addr: SocketAddr = ([0, 0, 0, 0], port).into();
    info!(target = "shoppable.bridge", "listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app.into_make_service()).await?;
    Ok(())
}

#[derive(Clone)]
struct AppState {
    registry: SessionRegistry,
}

fn router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_headers(Any)
        .allow_methods(Any)
        .allow_origin(Any);

    Router::new()
        .route("/health", get(health))
        .route("/sessions", post(create_session))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .route("/sessions/{id}/video", post(select_video))
        .route("/sessions/{id}/details", post(set_details))
        .route("/sessions/{id}/tracking", post(tracking))
        .route("/sessions/{id}/upload", post(upload))
        .route("/sessions/{id}/match", post(run_matching))
        .route("/sessions/{id}/manual", post(set_manual))
        .route("/sessions/{id}/confirm", post(confirm))
        .route("/sessions/{id}/finalize", post(finalize))
        .route("/sessions/{id}/back", post(back))
        .route("/sessions/{id}/retry", post(retry))
        .route("/sessions/{id}/cancel", post(cancel))
        .route("/sessions/{id}/start-over", post(start_over))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .layer(axum::extract::DefaultBodyLimit::max(body_limit_from_env()))
}

fn body_limit_from_env() -> usize {
    std::env::var("REQUEST_MAX_BYTES")
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .filter(|v| *v > 0)
        .unwrap_or(256 * 1024)
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,tower_http=debug"));
    let _ = fmt().with_env_filter(filter).try_init();
}

/// Health check.
///
/// - Method: `GET`
/// - Path: `/health`
async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "service": "shoppable-bridge",
        "sessions": state.registry.count().await,
    }))
}

async fn create_session(State(state): State<AppState>) -> Result<(StatusCode, Json<Value>), AppError> {
    let id = state.registry.create().await;
    let entry = lookup(&state, id).await?;
    let orchestrator = claim(&entry)?;
    Ok((StatusCode::CREATED, Json(json!(orchestrator.view()))))
}

/// Full session while idle; only live progress while an action runs.
async fn get_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>, AppError> {
    let entry = lookup(&state, id).await?;
    let session = entry.try_claim().map(|orchestrator| orchestrator.view());
    Ok(Json(json!({
        "progress": entry.progress(),
        "session": session,
    })))
}

async fn delete_session(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<StatusCode, AppError> {
    if state.registry.remove(id).await {
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(AppError::NotFound(id))
    }
}

async fn select_video(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(video): Json<VideoHandle>,
) -> Result<Json<Value>, AppError> {
    let mut orchestrator = claim(&lookup(&state, id).await?)?;
    orchestrator.select_video(video)?;
    Ok(view(&orchestrator))
}

#[derive(Debug, Deserialize)]
struct DetailsRequest {
    title: String,
    #[serde(default)]
    description: Option<String>,
}

async fn set_details(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<DetailsRequest>,
) -> Result<Json<Value>, AppError> {
    let mut orchestrator = claim(&lookup(&state, id).await?)?;
    orchestrator.set_details(&body.title, body.description.as_deref())?;
    Ok(view(&orchestrator))
}

#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
enum TrackingRequest {
    Toggle { item_id: String },
    Add { item: TrackedItem },
    Finish,
}

async fn tracking(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<TrackingRequest>,
) -> Result<Json<Value>, AppError> {
    let mut orchestrator = claim(&lookup(&state, id).await?)?;
    match body {
        TrackingRequest::Toggle { item_id } => {
            orchestrator.toggle_item(&item_id)?;
        }
        TrackingRequest::Add { item } => {
            orchestrator.add_item(item)?;
        }
        TrackingRequest::Finish => orchestrator.finish_tracking()?,
    }
    Ok(view(&orchestrator))
}

async fn upload(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>, AppError> {
    let mut orchestrator = claim(&lookup(&state, id).await?)?;
    orchestrator.upload().await?;
    Ok(view(&orchestrator))
}

async fn run_matching(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>, AppError> {
    let mut orchestrator = claim(&lookup(&state, id).await?)?;
    orchestrator.run_matching().await?;
    Ok(view(&orchestrator))
}

#[derive(Debug, Deserialize)]
struct ManualRequest {
    name: String,
    #[serde(default)]
    affiliate_link: Option<String>,
}

async fn set_manual(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<ManualRequest>,
) -> Result<Json<Value>, AppError> {
    let mut orchestrator = claim(&lookup(&state, id).await?)?;
    orchestrator.set_manual_product(&body.name, body.affiliate_link.as_deref())?;
    Ok(view(&orchestrator))
}

async fn confirm(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(choice): Json<Candidate>,
) -> Result<Json<Value>, AppError> {
    let mut orchestrator = claim(&lookup(&state, id).await?)?;
    let outcome = orchestrator.confirm_match(&choice).await?;
    let changed = matches!(outcome, ConfirmOutcome::Recorded(_));
    Ok(Json(json!({
        "changed": changed,
        "session": orchestrator.view(),
    })))
}

async fn finalize(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>, AppError> {
    let mut orchestrator = claim(&lookup(&state, id).await?)?;
    let record_id = orchestrator.finalize().await?;
    Ok(Json(json!({
        "record_id": record_id,
        "session": orchestrator.view(),
    })))
}

async fn back(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>, AppError> {
    let mut orchestrator = claim(&lookup(&state, id).await?)?;
    orchestrator.back()?;
    Ok(view(&orchestrator))
}

async fn retry(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>, AppError> {
    let mut orchestrator = claim(&lookup(&state, id).await?)?;
    orchestrator.retry().await?;
    Ok(view(&orchestrator))
}

/// Cancels the running action without waiting for it.
async fn cancel(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<(StatusCode, Json<Value>), AppError> {
    let entry = lookup(&state, id).await?;
    entry.cancel();
    Ok((StatusCode::ACCEPTED, Json(json!({ "progress": entry.progress() }))))
}

async fn start_over(State(state): State<AppState>, Path(id): Path<Uuid>) -> Result<Json<Value>, AppError> {
    let mut orchestrator = claim(&lookup(&state, id).await?)?;
    orchestrator.start_over()?;
    Ok(view(&orchestrator))
}

async fn lookup(state: &AppState, id: Uuid) -> Result<SessionEntry, AppError> {
    state.registry.get(id).await.ok_or(AppError::NotFound(id))
}

fn claim(entry: &SessionEntry) -> Result<OwnedMutexGuard<UploadOrchestrator>, AppError> {
    entry.try_claim().ok_or(AppError::Busy)
}

fn view(orchestrator: &UploadOrchestrator) -> Json<Value> {
    Json(json!(orchestrator.view()))
}

#[derive(Debug)]
enum AppError {
    NotFound(Uuid),
    Busy,
    Stage(StageError),
}

impl From<StageError> for AppError {
    fn from(value: StageError) -> Self {
        Self::Stage(value)
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        match self {
            AppError::NotFound(id) => (
                StatusCode::NOT_FOUND,
                Json(ApiError {
                    error: "session_not_found".into(),
                    detail: Some(id.to_string()),
                }),
            )
                .into_response(),
            AppError::Busy => (
                StatusCode::CONFLICT,
                Json(ApiError {
                    error: "session_busy".into(),
                    detail: Some("another action is still running for this session".into()),
                }),
            )
                .into_response(),
            AppError::Stage(err) => {
                let status = match err.kind() {
                    StageErrorKind::Validation => StatusCode::UNPROCESSABLE_ENTITY,
                    StageErrorKind::InvalidTransition | StageErrorKind::Cancelled => StatusCode::CONFLICT,
                    StageErrorKind::PollTimeout => StatusCode::GATEWAY_TIMEOUT,
                    StageErrorKind::Upload
                    | StageErrorKind::Detection
                    | StageErrorKind::Match
                    | StageErrorKind::Persist => StatusCode::BAD_GATEWAY,
                };
                let body = json!({
                    "error": err.kind(),
                    "step": err.step(),
                    "detail": err.detail(),
                    "retryable": err.is_retryable(),
                });
                (status, Json(body)).into_response()
            }
        }
    }
}

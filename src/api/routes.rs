//! REST endpoints + WebSocket event stream for jobs and batch sessions.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{
        Path, State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::backend::GenerationBackend;
use crate::error::JobError;
use crate::jobs::batch::{BatchSession, BatchSessions, Occupancy, SlotView};
use crate::jobs::model::{GenerationRequest, JobKey, JobKind, JobRecord};
use crate::jobs::registry::JobRegistry;

/// Application state shared across handlers.
#[derive(Clone)]
pub struct AppState {
    pub registry: JobRegistry,
    pub backend: Arc<dyn GenerationBackend>,
    pub batches: Arc<BatchSessions>,
}

/// Build the Axum router with job/batch REST routes and the event socket.
pub fn api_routes(state: AppState) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .route("/health", get(health))
        .route("/api/jobs", get(list_jobs))
        .route(
            "/api/jobs/{key}",
            get(get_job).post(start_job).delete(delete_job),
        )
        .route("/api/jobs/{key}/cancel", post(cancel_job))
        .route("/api/batches", post(create_batch))
        .route("/api/batches/{id}", get(get_batch).delete(close_batch))
        .route("/api/batches/{id}/more", post(request_more))
        .route(
            "/api/batches/{id}/slots/{slot}/carousel",
            post(create_carousel),
        )
        .with_state(state)
}

/// Messages sent to WebSocket clients besides raw job events.
#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WsMessage {
    JobsSync { jobs: Vec<JobRecord> },
}

/// Actions a WebSocket client may send.
#[derive(Debug, Deserialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum ClientAction {
    Cancel { key: JobKey },
}

fn error_body(status: StatusCode, message: impl Into<String>) -> Response {
    (status, Json(json!({ "error": message.into() }))).into_response()
}

fn job_error(e: JobError) -> Response {
    let status = match e {
        JobError::Validation { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        JobError::NotFound { .. }
        | JobError::BatchNotFound { .. }
        | JobError::SlotOutOfRange { .. } => StatusCode::NOT_FOUND,
        JobError::CarouselUnavailable { .. }
        | JobError::Superseded { .. }
        | JobError::InvalidTransition { .. } => StatusCode::CONFLICT,
    };
    error_body(status, e.to_string())
}

// ── Health ──────────────────────────────────────────────────────────────

async fn health(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "ok",
        "service": "gen-orchestrator",
        "active_pollers": state.registry.active_pollers(),
    }))
}

// ── WebSocket ───────────────────────────────────────────────────────────

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    info!("WebSocket client connecting");
    ws.on_upgrade(|socket| handle_socket(socket, state.registry))
}

async fn send_sync(socket: &mut WebSocket, registry: &JobRegistry) -> bool {
    let sync = WsMessage::JobsSync {
        jobs: registry.list(),
    };
    match serde_json::to_string(&sync) {
        Ok(json) => socket.send(Message::Text(json.into())).await.is_ok(),
        Err(e) => {
            warn!(error = %e, "Failed to encode job sync");
            true
        }
    }
}

async fn handle_socket(mut socket: WebSocket, registry: JobRegistry) {
    info!("WebSocket client connected");

    // Subscribe before the sync so nothing falls between the two.
    let mut rx = registry.subscribe();
    if !send_sync(&mut socket, &registry).await {
        warn!("Failed to send initial sync, client disconnected");
        return;
    }

    loop {
        tokio::select! {
            result = rx.recv() => {
                match result {
                    Ok(event) => {
                        if let Ok(json) = serde_json::to_string(&event) {
                            if socket.send(Message::Text(json.into())).await.is_err() {
                                debug!("Client disconnected during send");
                                break;
                            }
                        }
                    }
                    Err(RecvError::Lagged(n)) => {
                        warn!(missed = n, "WS client lagged behind broadcast");
                        if !send_sync(&mut socket, &registry).await {
                            break;
                        }
                    }
                    Err(RecvError::Closed) => {
                        debug!("Broadcast channel closed");
                        break;
                    }
                }
            }

            result = socket.recv() => {
                match result {
                    Some(Ok(Message::Text(text))) => handle_client_message(&text, &registry),
                    Some(Ok(Message::Ping(data))) => {
                        if socket.send(Message::Pong(data)).await.is_err() {
                            break;
                        }
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        info!("WebSocket client disconnected");
                        break;
                    }
                    Some(Err(e)) => {
                        warn!(error = %e, "WebSocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }
    }

    info!("WebSocket connection closed");
}

fn handle_client_message(text: &str, registry: &JobRegistry) {
    match serde_json::from_str::<ClientAction>(text) {
        Ok(ClientAction::Cancel { key }) => match registry.cancel(&key) {
            Some(record) => info!(key = %key, status = %record.status, "Cancel via WS"),
            None => warn!(key = %key, "Cancel via WS for unknown key"),
        },
        Err(e) => debug!(error = %e, text = text, "Unrecognized WS message from client"),
    }
}

// ── Jobs ────────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct StartJobRequest {
    kind: JobKind,
    #[serde(flatten)]
    request: GenerationRequest,
}

async fn list_jobs(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.registry.list())
}

async fn get_job(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    let key = JobKey::new(key);
    match state.registry.get(&key) {
        Some(record) => Json(record).into_response(),
        None => job_error(JobError::NotFound { key }),
    }
}

async fn start_job(
    State(state): State<AppState>,
    Path(key): Path<String>,
    Json(body): Json<StartJobRequest>,
) -> Response {
    let key = JobKey::new(key);
    match state
        .registry
        .start(key, body.kind, body.request, Arc::clone(&state.backend))
        .await
    {
        Ok(record) => (StatusCode::ACCEPTED, Json(record)).into_response(),
        Err(e) => job_error(e),
    }
}

async fn cancel_job(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    let key = JobKey::new(key);
    match state.registry.cancel(&key) {
        Some(record) => Json(record).into_response(),
        None => job_error(JobError::NotFound { key }),
    }
}

async fn delete_job(State(state): State<AppState>, Path(key): Path<String>) -> Response {
    let key = JobKey::new(key);
    match state.registry.delete_owner(&key) {
        Some(_) => Json(json!({ "status": "deleted", "key": key })).into_response(),
        None => job_error(JobError::NotFound { key }),
    }
}

// ── Batches ─────────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct CreateBatchRequest {
    kind: JobKind,
}

#[derive(Debug, Deserialize)]
struct MoreRequest {
    count: usize,
    #[serde(flatten)]
    request: GenerationRequest,
}

#[derive(Debug, Serialize)]
struct BatchView {
    id: Uuid,
    kind: JobKind,
    total_slots: usize,
    concurrency_limit: usize,
    occupancy: Occupancy,
    slots: Vec<SlotView>,
    #[serde(skip_serializing_if = "Option::is_none")]
    carousel: Option<JobRecord>,
}

impl BatchView {
    fn of(session: &BatchSession) -> Self {
        Self {
            id: session.id(),
            kind: session.kind(),
            total_slots: session.total_slots(),
            concurrency_limit: session.concurrency_limit(),
            occupancy: session.occupancy(),
            slots: session.slots(),
            carousel: session.carousel(),
        }
    }
}

/// The batch request for one slot: the shared request tagged with its slot.
fn request_for_slot(template: &GenerationRequest, slot: usize) -> GenerationRequest {
    let mut request = template.clone();
    if request.params.is_null() {
        request.params = json!({});
    }
    if let Some(params) = request.params.as_object_mut() {
        params.insert("slot".into(), json!(slot));
    }
    request
}

async fn create_batch(
    State(state): State<AppState>,
    Json(body): Json<CreateBatchRequest>,
) -> Response {
    let session = state.batches.create(body.kind).await;
    (StatusCode::CREATED, Json(BatchView::of(&session))).into_response()
}

async fn get_batch(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.batches.get(id).await {
        Ok(session) => Json(BatchView::of(&session)).into_response(),
        Err(e) => job_error(e),
    }
}

async fn close_batch(State(state): State<AppState>, Path(id): Path<Uuid>) -> Response {
    match state.batches.close(id).await {
        Ok(()) => Json(json!({ "status": "closed", "id": id })).into_response(),
        Err(e) => job_error(e),
    }
}

async fn request_more(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
    Json(body): Json<MoreRequest>,
) -> Response {
    let session = match state.batches.get(id).await {
        Ok(session) => session,
        Err(e) => return job_error(e),
    };

    let template = body.request;
    match session
        .request_more(body.count, Arc::clone(&state.backend), |slot| {
            request_for_slot(&template, slot)
        })
        .await
    {
        Ok(admitted) => Json(json!({
            "admitted": admitted,
            "occupancy": session.occupancy(),
        }))
        .into_response(),
        Err(e) => job_error(e),
    }
}

async fn create_carousel(
    State(state): State<AppState>,
    Path((id, slot)): Path<(Uuid, usize)>,
) -> Response {
    let session = match state.batches.get(id).await {
        Ok(session) => session,
        Err(e) => return job_error(e),
    };

    match session
        .create_carousel(slot, Arc::clone(&state.backend))
        .await
    {
        Ok(record) => (StatusCode::ACCEPTED, Json(record)).into_response(),
        Err(e) => job_error(e),
    }
}

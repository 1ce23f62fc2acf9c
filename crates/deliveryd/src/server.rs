//! HTTP control plane for deliveryd.
//!
//! Local-only API: inbound pushes and status events, operator actions on
//! goals, executions with their logs, and managed deployments.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{Path, Query, State},
    http::{header, HeaderMap, StatusCode},
    response::{
        sse::{Event as SseEvent, KeepAlive, Sse},
        IntoResponse, Response,
    },
    routing::{delete, get, post},
    Json, Router,
};
use delivery_core::{CommitRef, DeploymentKey, Id, StatusEntry, StatusSnapshot};
use futures_util::stream::{self, Stream};
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::deployer::Deployer;
use crate::deployments::ManagedDeploymentRegistry;
use crate::dispatch::{DispatchError, DispatchSummary, Dispatcher};
use crate::reporter::StatusSource;
use crate::storage::{Storage, StorageError};

const LOG_POLL_INTERVAL: Duration = Duration::from_millis(500);

/// Shared state for HTTP handlers.
pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub storage: Arc<Storage>,
    pub source: Arc<dyn StatusSource>,
    pub deployer: Arc<dyn Deployer>,
    pub registry: Arc<ManagedDeploymentRegistry>,
    pub auth_token: Option<String>,
}

impl std::fmt::Debug for AppState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AppState")
            .field("dispatcher", &self.dispatcher)
            .field("auth", &self.auth_token.is_some())
            .finish_non_exhaustive()
    }
}

/// Create the HTTP router with all endpoints.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        // Inbound events
        .route("/pushes", post(push))
        .route("/statuses", post(receive_status))
        .route("/repos/{owner}/{repo}/commits/{sha}/statuses", get(list_statuses))
        // Operator actions
        .route("/goals/approve", post(approve_goal))
        .route("/goals/retry", post(retry_goal))
        // Executions and logs
        .route("/executions", get(list_executions))
        .route("/executions/{id}", get(get_execution))
        .route("/logs/{id}", get(get_log))
        .route("/logs/{id}/stream", get(stream_log))
        // Deployments
        .route("/deployments", get(list_deployments))
        .route("/deployments/{owner}/{repo}/{branch}", delete(undeploy))
        .route("/health", get(health_check))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Serve the API on 127.0.0.1 until the task is dropped.
pub async fn start_server(
    state: Arc<AppState>,
    port: u16,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let router = create_router(state);

    let addr = SocketAddr::from(([127, 0, 0, 1], port));
    info!("HTTP server listening on http://{}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, router).await?;

    Ok(())
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn check_auth(state: &AppState, headers: &HeaderMap) -> Result<(), ApiError> {
    if let Some(expected) = &state.auth_token {
        let provided = headers
            .get(header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.strip_prefix("Bearer ").unwrap_or(s));

        match provided {
            Some(token) if token == expected => Ok(()),
            Some(_) => Err(api_error(StatusCode::UNAUTHORIZED, "invalid auth token")),
            None => Err(api_error(StatusCode::UNAUTHORIZED, "missing auth token")),
        }
    } else {
        Ok(())
    }
}

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (
        status,
        Json(ErrorResponse {
            error: message.into(),
        }),
    )
}

fn storage_error(e: StorageError) -> ApiError {
    match e {
        StorageError::ExecutionNotFound(id) => {
            api_error(StatusCode::NOT_FOUND, format!("execution not found: {id}"))
        }
        other => {
            error!("storage error: {}", other);
            api_error(StatusCode::INTERNAL_SERVER_ERROR, other.to_string())
        }
    }
}

fn dispatch_error(e: DispatchError) -> ApiError {
    match e {
        DispatchError::UnknownGoal(_) => api_error(StatusCode::BAD_REQUEST, e.to_string()),
        DispatchError::NotWaiting { .. } | DispatchError::NotRetryable { .. } => {
            api_error(StatusCode::CONFLICT, e.to_string())
        }
        DispatchError::Reporter(_) => {
            error!("status reporting failed: {}", e);
            api_error(StatusCode::BAD_GATEWAY, e.to_string())
        }
    }
}

// --- Request/Response types ---

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

/// `wait=true` dispatches inline and returns the summary; otherwise the
/// goals run in the background and the request returns 202.
#[derive(Debug, Default, Deserialize)]
pub struct DispatchQuery {
    #[serde(default)]
    pub wait: bool,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct PushRequest {
    pub commit: CommitRef,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct StatusEventRequest {
    pub commit: CommitRef,
    pub status: StatusEntry,
}

#[derive(Debug, Deserialize, Serialize)]
pub struct GoalActionRequest {
    pub commit: CommitRef,
    pub context: String,
}

#[derive(Debug, Deserialize)]
pub struct ExecutionsQuery {
    pub sha: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct StreamQuery {
    #[serde(default)]
    pub offset: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LogChunk {
    pub offset: u64,
    pub content: String,
}

// --- Handlers ---

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

/// Run the dispatcher for a commit either inline or detached.
async fn dispatch(state: &AppState, commit: CommitRef, wait: bool) -> Response {
    if wait {
        let summary = state.dispatcher.evaluate(&commit).await;
        return Json(summary).into_response();
    }
    let dispatcher = Arc::clone(&state.dispatcher);
    tokio::spawn(async move {
        let summary = dispatcher.evaluate(&commit).await;
        info!(
            commit = %commit,
            finished = summary.finished.len(),
            suppressed = summary.suppressed,
            "background dispatch finished"
        );
    });
    (StatusCode::ACCEPTED, Json(DispatchSummary::default())).into_response()
}

async fn push(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<DispatchQuery>,
    Json(req): Json<PushRequest>,
) -> Result<Response, ApiError> {
    check_auth(&state, &headers)?;
    state.dispatcher.plan(&req.commit).await.map_err(dispatch_error)?;
    Ok(dispatch(&state, req.commit, query.wait).await)
}

async fn receive_status(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<DispatchQuery>,
    Json(req): Json<StatusEventRequest>,
) -> Result<Response, ApiError> {
    check_auth(&state, &headers)?;
    state
        .dispatcher
        .record(&req.commit, &req.status)
        .await
        .map_err(dispatch_error)?;
    Ok(dispatch(&state, req.commit, query.wait).await)
}

async fn list_statuses(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((owner, repo, sha)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    // Statuses are keyed by owner, repo and sha; the branch is not needed.
    let commit = CommitRef::new(owner, repo, sha, "");
    let snapshot: StatusSnapshot = state.source.snapshot(&commit, "").await.map_err(|e| {
        error!("failed to read statuses: {}", e);
        api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string())
    })?;
    Ok(Json(snapshot.current()))
}

async fn approve_goal(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<DispatchQuery>,
    Json(req): Json<GoalActionRequest>,
) -> Result<Response, ApiError> {
    check_auth(&state, &headers)?;
    state
        .dispatcher
        .sign_off(&req.commit, &req.context)
        .await
        .map_err(dispatch_error)?;
    Ok(dispatch(&state, req.commit, query.wait).await)
}

async fn retry_goal(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<DispatchQuery>,
    Json(req): Json<GoalActionRequest>,
) -> Result<Response, ApiError> {
    check_auth(&state, &headers)?;
    state
        .dispatcher
        .reopen(&req.commit, &req.context)
        .await
        .map_err(dispatch_error)?;
    Ok(dispatch(&state, req.commit, query.wait).await)
}

async fn list_executions(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Query(query): Query<ExecutionsQuery>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let executions = state
        .storage
        .list_executions(query.sha.as_deref())
        .await
        .map_err(storage_error)?;
    Ok(Json(executions))
}

async fn get_execution(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let execution = state
        .storage
        .get_execution(&Id::from_string(id))
        .await
        .map_err(storage_error)?;
    Ok(Json(execution))
}

/// Log file of an execution. Only paths recorded in storage are served.
async fn execution_log_path(state: &AppState, id: &Id) -> Result<PathBuf, ApiError> {
    let execution = state.storage.get_execution(id).await.map_err(storage_error)?;
    execution
        .log_path
        .map(PathBuf::from)
        .ok_or_else(|| api_error(StatusCode::NOT_FOUND, format!("execution {id} has no log")))
}

async fn get_log(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let id = Id::from_string(id);
    let path = execution_log_path(&state, &id).await?;
    let content = tokio::fs::read(&path).await.map_err(|e| {
        warn!(execution_id = %id, path = %path.display(), error = %e, "failed to read log");
        api_error(StatusCode::NOT_FOUND, format!("log for {id} is unavailable"))
    })?;
    Ok((
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        String::from_utf8_lossy(&content).into_owned(),
    ))
}

/// Bytes appended to the log since `offset`, with the number of bytes the
/// chunk consumed, or `None` if nothing can be sent yet.
///
/// An incomplete UTF-8 sequence at the end is held back for the next read
/// unless `flush` is set.
async fn read_from(
    path: &std::path::Path,
    offset: u64,
    flush: bool,
) -> std::io::Result<Option<(LogChunk, u64)>> {
    let mut file = tokio::fs::File::open(path).await?;
    let len = file.metadata().await?.len();
    if len <= offset {
        return Ok(None);
    }
    file.seek(std::io::SeekFrom::Start(offset)).await?;
    let mut buf = Vec::new();
    file.take(len - offset).read_to_end(&mut buf).await?;

    let sendable = if flush { buf.len() } else { complete_utf8_len(&buf) };
    if sendable == 0 {
        return Ok(None);
    }
    buf.truncate(sendable);
    let chunk = LogChunk {
        offset,
        content: String::from_utf8_lossy(&buf).into_owned(),
    };
    Ok(Some((chunk, sendable as u64)))
}

/// Length of `buf` without a trailing partial UTF-8 sequence. Invalid bytes
/// elsewhere count as complete.
fn complete_utf8_len(buf: &[u8]) -> usize {
    let mut start = 0;
    loop {
        match std::str::from_utf8(&buf[start..]) {
            Ok(_) => return buf.len(),
            Err(e) => match e.error_len() {
                Some(bad) => start += e.valid_up_to() + bad,
                None => return start + e.valid_up_to(),
            },
        }
    }
}

/// Tail an execution log as SSE `output` events. The stream ends once the
/// execution is terminal and everything written has been sent.
async fn stream_log(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path(id): Path<String>,
    Query(query): Query<StreamQuery>,
) -> Result<Sse<impl Stream<Item = Result<SseEvent, Infallible>>>, ApiError> {
    check_auth(&state, &headers)?;
    let id = Id::from_string(id);
    let path = execution_log_path(&state, &id).await?;
    let storage = Arc::clone(&state.storage);

    let stream = stream::unfold(
        (storage, id, path, query.offset),
        move |(storage, id, path, offset)| async move {
            loop {
                // Read state before the file: a terminal execution has closed its log.
                let terminal = match storage.get_execution(&id).await {
                    Ok(execution) => execution.state.is_terminal(),
                    Err(_) => return None,
                };

                match read_from(&path, offset, terminal).await {
                    Ok(Some((chunk, consumed))) => {
                        let next = offset + consumed;
                        let event = Ok(SseEvent::default()
                            .event("output")
                            .data(serde_json::to_string(&chunk).unwrap_or_default()));
                        return Some((event, (storage, id, path, next)));
                    }
                    Ok(None) => {}
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => {
                        warn!(execution_id = %id, error = %e, "log tail failed");
                        return None;
                    }
                }

                if terminal {
                    return None;
                }
                tokio::time::sleep(LOG_POLL_INTERVAL).await;
            }
        },
    );

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

async fn list_deployments(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    Ok(Json(state.registry.list()))
}

async fn undeploy(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Path((owner, repo, branch)): Path<(String, String, String)>,
) -> Result<impl IntoResponse, ApiError> {
    check_auth(&state, &headers)?;
    let key = DeploymentKey::new(owner, repo, branch);
    if state.deployer.undeploy(&key).await {
        info!(key = %key, "undeployed on request");
        Ok(StatusCode::NO_CONTENT)
    } else {
        Err(api_error(
            StatusCode::NOT_FOUND,
            format!("no deployment for {key}"),
        ))
    }
}

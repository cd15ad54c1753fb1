use std::convert::Infallible;
use std::sync::Arc;
use std::time::Duration;

use acp2_error::{BridgeError, ErrorBody, ErrorDetail, ErrorKind};
use axum::extract::{Path, Query, Request, State};
use axum::http::{header, HeaderValue, StatusCode};
use axum::middleware::{self, Next};
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use futures::StreamExt;
use serde::Deserialize;
use serde_json::json;
use tokio_stream::wrappers::ReceiverStream;

use crate::registry::AgentRegistry;
use crate::run::{RunManager, RunRequest, RunStatus};
use crate::session::SessionManager;
use crate::store::{SessionFilter, SessionStatus, SessionStore};

pub const RUN_ID_HEADER: &str = "x-acp2-run-id";

pub struct AppState {
    pub registry: Arc<AgentRegistry>,
    pub store: Arc<SessionStore>,
    pub sessions: Arc<SessionManager>,
    pub runs: Arc<RunManager>,
    pub auth_token: Option<String>,
}

pub fn build_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/ping", get(get_ping))
        .route("/agents", get(get_agents))
        .route("/agents/{name}", get(get_agent))
        .route("/runs", post(post_runs))
        .route("/runs/{id}/cancel", post(post_cancel))
        .route("/sessions", get(get_sessions))
        .route("/sessions/{id}", get(get_session).delete(delete_session))
        .layer(middleware::from_fn_with_state(state.clone(), require_bearer))
        .with_state(state)
}

/// Bearer-token check applied to every route. An unset token disables the
/// check entirely.
async fn require_bearer(
    State(state): State<Arc<AppState>>,
    request: Request,
    next: Next,
) -> Response {
    let Some(expected) = state.auth_token.as_deref() else {
        return next.run(request).await;
    };

    let provided = request
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "));

    match provided {
        None => auth_failure("missing credentials"),
        Some(token) if token != expected => auth_failure("invalid credentials"),
        Some(_) => next.run(request).await,
    }
}

fn auth_failure(message: &str) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        Json(ErrorBody {
            error: ErrorDetail::new(ErrorKind::AuthError, message),
        }),
    )
        .into_response()
}

fn error_response(err: &BridgeError) -> Response {
    let status =
        StatusCode::from_u16(err.kind().status_code()).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR);
    (status, Json(err.to_body())).into_response()
}

async fn get_ping() -> Json<serde_json::Value> {
    Json(json!({"status": "ok"}))
}

async fn get_agents(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({"agents": state.registry.summaries()}))
}

async fn get_agent(State(state): State<Arc<AppState>>, Path(name): Path<String>) -> Response {
    match state.registry.manifest(&name) {
        Ok(manifest) => Json(manifest).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn post_runs(State(state): State<Arc<AppState>>, Json(request): Json<RunRequest>) -> Response {
    let mode = request.mode;
    let (run_id, rx) = match state.runs.start(request) {
        Ok(started) => started,
        Err(err) => return error_response(&err),
    };

    match mode {
        crate::run::RunMode::Sync => sync_response(&state, run_id, rx).await,
        crate::run::RunMode::Stream => stream_response(run_id, rx),
    }
}

/// Await the run's terminal state and answer with a single JSON body.
/// Intermediate events are discarded.
async fn sync_response(
    state: &Arc<AppState>,
    run_id: String,
    mut rx: tokio::sync::mpsc::Receiver<crate::events::UpdateEvent>,
) -> Response {
    while rx.recv().await.is_some() {}

    let Some(run) = state.runs.get(&run_id) else {
        return error_response(&BridgeError::internal("run vanished from the table"));
    };
    match run.status {
        RunStatus::Completed => Json(json!({
            "run_id": run.id,
            "status": run.status,
            "output": run.output,
            "stop_reason": run.stop_reason,
        }))
        .into_response(),
        RunStatus::Cancelled => {
            Json(json!({"run_id": run.id, "status": run.status})).into_response()
        }
        RunStatus::Failed => {
            let detail = run.error.unwrap_or_else(|| {
                ErrorDetail::new(ErrorKind::Internal, "run failed without an error record")
            });
            let status = ErrorKind::parse(&detail.kind)
                .map(|kind| kind.status_code())
                .unwrap_or(500);
            (
                StatusCode::from_u16(status).unwrap_or(StatusCode::INTERNAL_SERVER_ERROR),
                Json(ErrorBody { error: detail }),
            )
                .into_response()
        }
        status => error_response(&BridgeError::internal(format!(
            "run finished in non-terminal status {status:?}"
        ))),
    }
}

/// Forward every UpdateEvent as one SSE frame; the terminal frame closes the
/// stream. The run id travels in a response header so the client can cancel
/// mid-stream.
fn stream_response(
    run_id: String,
    rx: tokio::sync::mpsc::Receiver<crate::events::UpdateEvent>,
) -> Response {
    let frame_run_id = run_id.clone();
    let stream = ReceiverStream::new(rx).map(move |event| {
        Ok::<Event, Infallible>(
            Event::default()
                .event(event.sse_event())
                .data(event.sse_data(&frame_run_id).to_string()),
        )
    });

    let mut response = Sse::new(stream)
        .keep_alive(KeepAlive::new().interval(Duration::from_secs(15)))
        .into_response();
    if let Ok(value) = HeaderValue::from_str(&run_id) {
        response.headers_mut().insert(RUN_ID_HEADER, value);
    }
    response
}

async fn post_cancel(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    match state.runs.cancel(&id) {
        Ok(run) => Json(json!({"run_id": run.id, "status": run.status})).into_response(),
        Err(err) => error_response(&err),
    }
}

#[derive(Debug, Deserialize)]
struct SessionQuery {
    agent: Option<String>,
    status: Option<String>,
    limit: Option<i64>,
    offset: Option<i64>,
}

async fn get_sessions(
    State(state): State<Arc<AppState>>,
    Query(query): Query<SessionQuery>,
) -> Response {
    let status = match query.status.as_deref().map(SessionStatus::parse) {
        Some(Ok(status)) => Some(status),
        Some(Err(_)) => {
            return error_response(&BridgeError::Config {
                message: format!("unknown status filter '{}'", query.status.unwrap_or_default()),
            })
        }
        None => None,
    };
    let filter = SessionFilter {
        agent_name: query.agent,
        status,
    };
    match state.store.list_sessions(&filter, query.limit, query.offset) {
        Ok(sessions) => Json(json!({"sessions": sessions})).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn get_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    let session = match state.store.get_session(&id) {
        Ok(Some(session)) => session,
        Ok(None) => return error_response(&BridgeError::not_found(format!("session '{id}'"))),
        Err(err) => return error_response(&err),
    };
    match state.store.list_messages(&id, None, None) {
        Ok(messages) => Json(json!({"session": session, "messages": messages})).into_response(),
        Err(err) => error_response(&err),
    }
}

async fn delete_session(State(state): State<Arc<AppState>>, Path(id): Path<String>) -> Response {
    if state.sessions.is_running(&id) {
        return error_response(&BridgeError::conflict(format!(
            "session '{id}' has a run in flight"
        )));
    }
    match state.store.get_session(&id) {
        Ok(Some(_)) => {}
        Ok(None) => return error_response(&BridgeError::not_found(format!("session '{id}'"))),
        Err(err) => return error_response(&err),
    }
    state.sessions.evict(&id).await;
    match state.store.delete_session(&id) {
        Ok(_) => StatusCode::NO_CONTENT.into_response(),
        Err(err) => error_response(&err),
    }
}

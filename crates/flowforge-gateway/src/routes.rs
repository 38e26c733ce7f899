use std::sync::Arc;

use axum::body::Body;
use axum::extract::{Path, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::StreamExt;
use serde::Deserialize;
use serde_json::{json, Value};
use tracing::{info, warn};

use flowforge_core::error::FlowError;
use flowforge_core::frame::encode_frame;
use flowforge_core::graph::{Edge, GraphSubmission, GraphValidation, Node};
use flowforge_core::types::RunId;
use flowforge_engine::{ConnectionCheck, Engine, RunHandle, RunView};

use crate::state::AppState;

/// Error side of every handler, mapped onto a status code.
pub enum ApiError {
    Flow(FlowError),
    NotFound(String),
}

impl From<FlowError> for ApiError {
    fn from(e: FlowError) -> Self {
        Self::Flow(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            Self::NotFound(message) => {
                (StatusCode::NOT_FOUND, Json(json!({ "error": message }))).into_response()
            }
            Self::Flow(FlowError::InvalidGraph(report)) => {
                (StatusCode::UNPROCESSABLE_ENTITY, Json(report)).into_response()
            }
            Self::Flow(e) => {
                let status = match &e {
                    FlowError::RunNotFound(_) => StatusCode::NOT_FOUND,
                    FlowError::InvalidParams { .. } => StatusCode::BAD_REQUEST,
                    _ => StatusCode::INTERNAL_SERVER_ERROR,
                };
                if status == StatusCode::INTERNAL_SERVER_ERROR {
                    warn!(error = %e, "Request failed");
                }
                (status, Json(json!({ "error": e.to_string() }))).into_response()
            }
        }
    }
}

type ApiResult<T> = std::result::Result<T, ApiError>;

// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "activeRuns": state.engine.active_runs().len(),
    }))
}

// POST /api/validate
pub async fn validate_graph(Json(submission): Json<GraphSubmission>) -> Json<GraphValidation> {
    Json(Engine::validate(&submission))
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionRequest {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
    pub source_node_id: String,
    pub source_port_id: String,
    pub target_node_id: String,
    pub target_port_id: String,
}

// POST /api/connections/validate
pub async fn validate_connection(Json(req): Json<ConnectionRequest>) -> Json<ConnectionCheck> {
    let find = |id: &str| req.nodes.iter().find(|n| n.id == id);
    let check = match (find(&req.source_node_id), find(&req.target_node_id)) {
        (Some(source), Some(target)) => flowforge_engine::validate_connection(
            source,
            target,
            &req.source_port_id,
            &req.target_port_id,
            &req.edges,
        ),
        (None, _) => ConnectionCheck {
            valid: false,
            reason: Some(format!("unknown node '{}'", req.source_node_id)),
        },
        (_, None) => ConnectionCheck {
            valid: false,
            reason: Some(format!("unknown node '{}'", req.target_node_id)),
        },
    };
    Json(check)
}

/// Graph body for project routes; the project id comes from the path.
#[derive(Deserialize)]
pub struct GraphBody {
    #[serde(default)]
    pub nodes: Vec<Node>,
    #[serde(default)]
    pub edges: Vec<Edge>,
}

// PUT /api/projects/{id}/graph: saved even when invalid, the report says so
pub async fn save_graph(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
    Json(body): Json<GraphBody>,
) -> ApiResult<Json<GraphValidation>> {
    let submission = GraphSubmission {
        project_id,
        nodes: body.nodes,
        edges: body.edges,
    };
    state.graphs.save_graph(&submission).await?;
    Ok(Json(Engine::validate(&submission)))
}

// GET /api/projects/{id}/graph
pub async fn get_graph(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Json<GraphSubmission>> {
    state
        .graphs
        .load_graph(&project_id)
        .await?
        .map(Json)
        .ok_or_else(|| ApiError::NotFound(format!("no graph saved for project '{}'", project_id)))
}

// POST /api/projects/{id}/runs: run the saved graph, stream progress
pub async fn run_project(
    State(state): State<Arc<AppState>>,
    Path(project_id): Path<String>,
) -> ApiResult<Response> {
    let submission = state
        .graphs
        .load_graph(&project_id)
        .await?
        .ok_or_else(|| ApiError::NotFound(format!("no graph saved for project '{}'", project_id)))?;
    let handle = state.engine.start(submission)?;
    Ok(event_stream(handle))
}

// POST /api/runs: save the submitted graph, then run it
pub async fn submit_run(
    State(state): State<Arc<AppState>>,
    Json(submission): Json<GraphSubmission>,
) -> ApiResult<Response> {
    let report = Engine::validate(&submission);
    if !report.valid {
        return Err(FlowError::InvalidGraph(report).into());
    }
    state.graphs.save_graph(&submission).await?;
    let handle = state.engine.start(submission)?;
    Ok(event_stream(handle))
}

// POST /api/runs/{id}/cancel
pub async fn cancel_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let run_id = RunId::from_string(&id);
    if !state.engine.cancel(&run_id) {
        return Err(ApiError::NotFound(format!("run '{}' is not active", id)));
    }
    info!(run_id = %run_id, "Run cancel requested over HTTP");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "runId": run_id, "canceled": true })),
    ))
}

// GET /api/runs/{id}
pub async fn get_run(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let run_id = RunId::from_string(&id);
    let run = state
        .runs
        .get_run(&run_id)
        .await?
        .ok_or(FlowError::RunNotFound(id))?;
    Ok(Json(json!({
        "run": run,
        "active": state.engine.is_active(&run_id),
    })))
}

// GET /api/runs/{id}/events: stored log plus its projection, for late observers
pub async fn run_events(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Value>> {
    let run_id = RunId::from_string(&id);
    let run = state
        .runs
        .get_run(&run_id)
        .await?
        .ok_or(FlowError::RunNotFound(id))?;
    let events = state.runs.run_events(&run_id).await?;
    let view = RunView::from_record(&run, &events);
    Ok(Json(json!({
        "runId": run_id,
        "events": events,
        "view": view,
    })))
}

/// Stream a run's progress as `event:`/`data:` frames. Dropping the response
/// does not stop the run.
fn event_stream(handle: RunHandle) -> Response {
    let run_id = handle.run_id.to_string();
    let frames = handle.into_stream().map(|event| encode_frame(&event));
    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, "text/event-stream")
        .header(header::CACHE_CONTROL, "no-cache")
        .header("x-run-id", run_id)
        .body(Body::from_stream(frames))
        .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
}

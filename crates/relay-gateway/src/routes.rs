use std::sync::Arc;

use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::sse::{Event, Sse};
use axum::response::{IntoResponse, Response};
use axum::Json;
use futures::stream::{Stream, StreamExt};
use serde::Deserialize;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use relay_core::types::{ExecuteRequest, Message};
use relay_engine::{MetricsFormat, Workflow};

use crate::state::AppState;

type ApiError = (StatusCode, Json<serde_json::Value>);

fn api_error(status: StatusCode, message: impl Into<String>) -> ApiError {
    (status, Json(serde_json::json!({ "error": message.into() })))
}

#[derive(Deserialize)]
pub struct ExecuteBody {
    pub input: String,
    #[serde(default)]
    pub history: Vec<Message>,
    #[serde(default)]
    pub resume_agent_id: Option<String>,
}

impl ExecuteBody {
    /// A fresh conversation seeded with the posted history.
    fn into_parts(self, state: &AppState) -> Result<(Workflow, ExecuteRequest), ApiError> {
        if self.input.trim().is_empty() {
            return Err(api_error(StatusCode::BAD_REQUEST, "input must not be empty"));
        }
        let workflow = Workflow::with_history(state.crew.clone(), self.history);
        let request = ExecuteRequest {
            input: self.input,
            resume_agent_id: self.resume_agent_id,
        };
        Ok((workflow, request))
    }
}

// GET /api/health
pub async fn health(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "workflow": state.crew.settings().name,
    }))
}

// POST /api/execute
pub async fn execute(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExecuteBody>,
) -> Result<Response, ApiError> {
    let (workflow, request) = body.into_parts(&state)?;
    info!(resume = ?request.resume_agent_id, "Execute request");
    match workflow.execute(request, &CancellationToken::new()).await {
        Ok(response) => Ok(Json(response).into_response()),
        Err(e) => {
            error!(error = %e, "Workflow execution failed");
            Err(api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))
        }
    }
}

// POST /api/stream: one `data:` JSON frame per stream event.
pub async fn stream(
    State(state): State<Arc<AppState>>,
    Json(body): Json<ExecuteBody>,
) -> Result<Sse<impl Stream<Item = Result<Event, axum::Error>>>, ApiError> {
    let (workflow, request) = body.into_parts(&state)?;
    let (tx, rx) = mpsc::channel(state.crew.settings().stream_buffer_size);

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    tokio::spawn(async move {
        if let Err(e) = workflow.execute_stream(request, tx, &run_cancel).await {
            debug!(error = %e, "Streamed workflow ended with an error");
        }
    });

    // Dropping the response stream (client gone) cancels the workflow.
    let guard = cancel.drop_guard();
    let events = ReceiverStream::new(rx).map(move |event| {
        let _ = &guard;
        Event::default().json_data(&event)
    });
    Ok(Sse::new(events))
}

#[derive(Deserialize)]
pub struct MetricsQuery {
    #[serde(default)]
    pub format: Option<String>,
}

// GET /api/metrics?format=json|prometheus
pub async fn metrics(
    State(state): State<Arc<AppState>>,
    Query(q): Query<MetricsQuery>,
) -> Result<Response, ApiError> {
    let format: MetricsFormat = match q.format.as_deref() {
        None => MetricsFormat::Json,
        Some(f) => f
            .parse()
            .map_err(|e: relay_core::error::RelayError| api_error(StatusCode::BAD_REQUEST, e.to_string()))?,
    };
    let body = state
        .crew
        .metrics()
        .export(format)
        .map_err(|e| api_error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;
    let content_type = match format {
        MetricsFormat::Json => "application/json",
        MetricsFormat::Prometheus => "text/plain; version=0.0.4",
    };
    Ok(([(header::CONTENT_TYPE, content_type)], body).into_response())
}

use std::sync::Arc;

use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::sse::{Event, KeepAlive, Sse};
use axum::response::IntoResponse;
use axum::Json;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio_stream::wrappers::errors::BroadcastStreamRecvError;
use tokio_stream::wrappers::BroadcastStream;
use tokio_stream::StreamExt;

use crate::enrichment::EnrichmentOrchestrator;
use crate::errors::AppError;
use crate::jobs::JobTracker;
use crate::models::Operation;
use crate::progress::ProgressBus;
use crate::providers::ProviderRegistry;
use crate::store::LeadStore;

/// Shared application state.
pub struct AppState {
    pub store: Arc<dyn LeadStore>,
    pub orchestrator: Arc<EnrichmentOrchestrator>,
    pub jobs: Arc<JobTracker>,
    pub bus: Arc<ProgressBus>,
    pub registry: Arc<ProviderRegistry>,
}

/// Health check endpoint
pub async fn health() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::OK,
        Json(json!({
            "status": "healthy",
            "service": "leadflow-api",
            "version": "0.1.0"
        })),
    )
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentRequest {
    pub lead_ids: Vec<i64>,
    pub operations: Vec<Operation>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EnrichmentResponse {
    pub job_id: String,
}

/// Accepts an enrichment batch and returns its job id immediately. The batch
/// itself runs in the background; progress is observable on the job's event
/// stream.
pub async fn enrich_leads(
    State(state): State<Arc<AppState>>,
    Json(request): Json<EnrichmentRequest>,
) -> Result<(StatusCode, Json<EnrichmentResponse>), AppError> {
    if request.lead_ids.is_empty() {
        return Err(AppError::BadRequest("leadIds must not be empty".to_string()));
    }
    if request.operations.is_empty() {
        return Err(AppError::BadRequest(
            "operations must not be empty".to_string(),
        ));
    }

    // Operations are a set; drop duplicates but keep the requested order.
    let mut operations: Vec<Operation> = Vec::new();
    for op in request.operations {
        if !operations.contains(&op) {
            operations.push(op);
        }
    }

    let leads = state.store.find_many_by_ids(&request.lead_ids).await?;
    if leads.is_empty() {
        return Err(AppError::NotFound("No leads found for the given ids".to_string()));
    }
    if leads.len() < request.lead_ids.len() {
        tracing::warn!(
            "Enrichment request referenced {} lead(s), found {}",
            request.lead_ids.len(),
            leads.len()
        );
    }

    let job_id = state
        .jobs
        .create_enrichment_job(leads.len() as u32, operations.clone());

    let orchestrator = Arc::clone(&state.orchestrator);
    tokio::spawn(orchestrator.run_batch(leads, operations, job_id.clone()));

    Ok((StatusCode::ACCEPTED, Json(EnrichmentResponse { job_id })))
}

/// Returns a snapshot of a job's progress.
pub async fn get_job(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    match state.jobs.get_job(&job_id) {
        Some(job) => Ok(Json(job)),
        None => Err(AppError::NotFound(format!("Job {} not found", job_id))),
    }
}

/// Server-sent events stream of a job's progress room. The stream ends when
/// the room is closed by job cleanup.
pub async fn job_events(
    State(state): State<Arc<AppState>>,
    Path(job_id): Path<String>,
) -> Result<impl IntoResponse, AppError> {
    if state.jobs.get_job(&job_id).is_none() {
        return Err(AppError::NotFound(format!("Job {} not found", job_id)));
    }

    let receiver = state.bus.subscribe(&job_id);
    let stream = BroadcastStream::new(receiver).filter_map(|item| match item {
        Ok(event) => match Event::default().event(event.name()).json_data(&event) {
            Ok(sse_event) => Some(Ok::<_, std::convert::Infallible>(sse_event)),
            Err(e) => {
                tracing::error!("Failed to encode progress event: {}", e);
                None
            }
        },
        Err(BroadcastStreamRecvError::Lagged(skipped)) => {
            tracing::warn!("Progress subscriber lagged; skipped {} event(s)", skipped);
            None
        }
    });

    Ok(Sse::new(stream).keep_alive(KeepAlive::default()))
}

/// Per-provider limiter statistics.
pub async fn provider_stats(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    Json(state.registry.stats())
}

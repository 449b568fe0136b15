use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::Json;
use serde::{Deserialize, Serialize};
use tracing::error;

use ingestion_common::bulk_export::{AuthMode, ExportParams, PipelineContext};
use ingestion_common::job::Job;
use ingestion_common::registry::{JobSummary, KickOffResponse, ResumeResponse};

use crate::AppState;

#[derive(Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type HandlerError = (StatusCode, Json<ErrorResponse>);

/// Closed request record for kick-off (DESIGN NOTES §9: dynamic
/// configuration objects become explicit request records with enumerated
/// fields; unknown fields are rejected rather than silently ignored).
#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct KickOffRequest {
    pub fhir_server_url: String,
    pub resource_types: Vec<String>,
    pub since: Option<String>,
    pub bearer_token: Option<String>,
}

#[derive(Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ResumeRequest {
    pub status_url: String,
    pub bearer_token: Option<String>,
}

#[derive(Serialize)]
pub struct JobStatusResponse {
    #[serde(flatten)]
    pub job: Job,
    pub elapsed_seconds: i64,
    pub elapsed_minutes: f64,
}

pub async fn kick_off(
    State(state): State<AppState>,
    Json(request): Json<KickOffRequest>,
) -> Result<Json<KickOffResponse>, HandlerError> {
    if request.resource_types.is_empty() {
        return Err(bad_request("resource_types must not be empty"));
    }

    let auth = resolve_auth(&state, request.bearer_token.as_deref())?;
    let ctx = state.pipeline_context(auth);
    let params = ExportParams {
        fhir_server_url: request.fhir_server_url,
        resource_types: request.resource_types,
        since: request.since,
    };

    state
        .registry
        .kick_off(params, ctx)
        .await
        .map(Json)
        .map_err(internal_error)
}

pub async fn resume(
    State(state): State<AppState>,
    Json(request): Json<ResumeRequest>,
) -> Result<Json<ResumeResponse>, HandlerError> {
    let auth = resolve_auth(&state, request.bearer_token.as_deref())?;
    let ctx = state.pipeline_context(auth);

    state
        .registry
        .resume(request.status_url, request.bearer_token, ctx)
        .await
        .map(Json)
        .map_err(internal_error)
}

pub async fn status(
    State(state): State<AppState>,
    Path(job_id): Path<String>,
) -> Result<Json<JobStatusResponse>, HandlerError> {
    let job = state
        .registry
        .status(&job_id)
        .await
        .map_err(|err| (StatusCode::NOT_FOUND, Json(ErrorResponse { error: err.to_string() })))?;

    Ok(Json(JobStatusResponse {
        elapsed_seconds: job.elapsed_seconds(),
        elapsed_minutes: job.elapsed_minutes(),
        job,
    }))
}

pub async fn list(State(state): State<AppState>) -> Json<Vec<JobSummary>> {
    Json(state.registry.list().await)
}

/// A caller-supplied bearer token always wins; otherwise the configured
/// SMART signer (if any) is used. Kick-off-time auth failures (here: no
/// usable auth configuration at all) propagate synchronously to the
/// caller per spec.md §7's "authentication failure" error kind.
fn resolve_auth(state: &AppState, bearer_token: Option<&str>) -> Result<AuthMode, HandlerError> {
    if let Some(token) = bearer_token {
        return Ok(AuthMode::Bearer(token.to_string()));
    }
    if let Some(signer) = &state.smart_signer {
        return Ok(AuthMode::Smart(signer.clone()));
    }
    Err(bad_request(
        "no bearer_token supplied and no SMART Backend Services signer is configured",
    ))
}

impl AppState {
    fn pipeline_context(&self, auth: AuthMode) -> PipelineContext {
        PipelineContext {
            http: self.http.clone(),
            auth,
            bulk_data_dir: self.bulk_data_dir.clone(),
            db: self.db.clone(),
            download_concurrency: self.download_concurrency,
            progress_log_interval_pct: self.progress_log_interval,
            fhir_server_url_hint: self.fhir_server_url_hint.clone(),
            health: self.liveness.clone(),
        }
    }
}

fn bad_request(msg: &str) -> HandlerError {
    error!(msg);
    (StatusCode::BAD_REQUEST, Json(ErrorResponse { error: msg.to_owned() }))
}

fn internal_error<E: std::error::Error>(err: E) -> HandlerError {
    error!("internal error: {}", err);
    (StatusCode::INTERNAL_SERVER_ERROR, Json(ErrorResponse { error: err.to_string() }))
}

use std::path::PathBuf;
use std::sync::Arc;

use health::{HealthHandle, HealthRegistry};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, ACCEPT, CONTENT_LOCATION};
use reqwest::{Method, StatusCode};
use serde_json::Value;
use sqlx::PgPool;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::{info, warn};
use url::Url;

use crate::db::{self, LoadSummary};
use crate::download::{self, DownloadError};
use crate::http_client::{HttpClient, HttpError};
use crate::job::{DownloadedFile, JobStatus};
use crate::registry::JobHandle;
use crate::search_fallback::{self, SearchError};
use crate::smart_auth::{SmartAssertionSigner, SmartAuthError};
use crate::transform::{self, TransformError};

const DEFAULT_SCOPE: &str = "system/*.read";
const POLL_INTERVAL: std::time::Duration = std::time::Duration::from_secs(5);
const STILL_IN_PROGRESS_LOG_EVERY: u32 = 6;

#[derive(Error, Debug)]
pub enum BulkExportError {
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error(transparent)]
    Auth(#[from] SmartAuthError),
    #[error("malformed server url: {0}")]
    InvalidUrl(#[from] url::ParseError),
    #[error("server returned a non-UTF8 header")]
    InvalidHeader,
    #[error(transparent)]
    Download(#[from] DownloadError),
    #[error(transparent)]
    Search(#[from] SearchError),
    #[error(transparent)]
    Transform(#[from] TransformError),
    #[error(transparent)]
    Db(#[from] crate::db::DbError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub enum AuthMode {
    Bearer(String),
    Smart(Arc<SmartAssertionSigner>),
}

impl AuthMode {
    async fn header_value(&self) -> Result<HeaderValue, BulkExportError> {
        let token = match self {
            AuthMode::Bearer(token) => token.clone(),
            AuthMode::Smart(signer) => signer.get_access_token(DEFAULT_SCOPE).await?,
        };
        HeaderValue::from_str(&format!("Bearer {token}")).map_err(|_| BulkExportError::InvalidHeader)
    }
}

#[derive(Clone)]
pub struct PipelineContext {
    pub http: HttpClient,
    pub auth: AuthMode,
    pub bulk_data_dir: PathBuf,
    pub db: PgPool,
    pub download_concurrency: usize,
    /// Percent-of-total granularity for download progress logging; forwarded
    /// to `ProgressTracker::with_log_interval`.
    pub progress_log_interval_pct: u64,
    /// Only used to populate `Job::fhir_server_url` when resuming from a bare
    /// status URL, where the original kick-off request is not recoverable.
    pub fhir_server_url_hint: Option<String>,
    /// Every job-driving task registers its own component here and reports
    /// healthy at each suspension point, mirroring `hook-worker`'s dequeue
    /// loop reporting through its single `HealthHandle`.
    pub health: HealthRegistry,
}

#[derive(Clone)]
pub struct ExportParams {
    pub fhir_server_url: String,
    pub resource_types: Vec<String>,
    pub since: Option<String>,
}

pub enum KickOffOutcome {
    Async { job_id: String, status_url: String },
    Fallback { job_id: String },
}

#[derive(Debug)]
pub struct Manifest {
    pub output: Vec<ManifestOutputEntry>,
}

#[derive(Debug)]
pub struct ManifestOutputEntry {
    pub resource_type: String,
    pub url: Option<String>,
}

/// Result of classifying a status-poll response body. A genuine enum per
/// the design note against exception-driven control flow: callers branch on
/// the tag, never on substring matches outside this function.
#[derive(Debug)]
#[allow(dead_code)]
pub enum ManifestOutcome {
    Success(Manifest),
    RealError(String),
    TooManyFiles(String),
}

/// Phase 1: kick off the async export. Synchronous from the caller's point
/// of view so the derived `job_id` is known before `kick_off` returns.
pub async fn kick_off(
    ctx: &PipelineContext,
    params: &ExportParams,
) -> Result<KickOffOutcome, BulkExportError> {
    let url = build_export_url(&params.fhir_server_url, &params.resource_types, params.since.as_deref())?;

    let mut headers = HeaderMap::new();
    headers.insert(ACCEPT, HeaderValue::from_static("application/fhir+json"));
    headers.insert(
        HeaderName::from_static("prefer"),
        HeaderValue::from_static("respond-async"),
    );
    headers.insert(reqwest::header::AUTHORIZATION, ctx.auth.header_value().await?);

    let response = ctx.http.request(Method::GET, url.as_str(), headers, None).await?;

    if response.status() == StatusCode::ACCEPTED {
        let status_url = response
            .headers()
            .get(CONTENT_LOCATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(BulkExportError::InvalidHeader)?
            .to_string();
        let job_id = last_path_segment(&status_url);
        info!(job_id = job_id.as_str(), status_url = status_url.as_str(), "bulk export kicked off");
        metrics::counter!("ingestion_jobs_kicked_off_total", "method" => "bulk_export").increment(1);
        Ok(KickOffOutcome::Async { job_id, status_url })
    } else {
        let job_id = format!("search_{}", OffsetDateTime::now_utc().unix_timestamp());
        warn!(
            status = response.status().as_u16(),
            job_id = job_id.as_str(),
            "server did not accept async export, falling back to paginated search"
        );
        metrics::counter!("ingestion_jobs_kicked_off_total", "method" => "fhir_search").increment(1);
        Ok(KickOffOutcome::Fallback { job_id })
    }
}

pub fn derive_resume_job_id(status_url: &str) -> String {
    format!("resume_{}", last_path_segment(status_url))
}

fn last_path_segment(url: &str) -> String {
    url.rsplit('/').find(|s| !s.is_empty()).unwrap_or(url).to_string()
}

fn build_export_url(base: &str, resource_types: &[String], since: Option<&str>) -> Result<Url, url::ParseError> {
    let mut url = Url::parse(&format!("{}/$export", base.trim_end_matches('/')))?;
    {
        let mut query = url.query_pairs_mut();
        query.append_pair("_type", &resource_types.join(","));
        if let Some(since) = since {
            query.append_pair("_since", since);
        }
    }
    Ok(url)
}

/// Pure classification of a status-poll response body. Empty-string errors
/// are treated as success (boundary behavior B1); "too many files" (any
/// case) triggers the search fallback rather than failing the job.
pub fn classify_manifest(body: &Value) -> ManifestOutcome {
    if let Some(text) = real_error_text(body) {
        return if text.to_lowercase().contains("too many files") {
            ManifestOutcome::TooManyFiles(text)
        } else {
            ManifestOutcome::RealError(text)
        };
    }

    if body.get("resourceType").and_then(Value::as_str) == Some("OperationOutcome") {
        return ManifestOutcome::RealError(body.to_string());
    }

    let output = body
        .get("output")
        .and_then(Value::as_array)
        .map(|entries| {
            entries
                .iter()
                .filter_map(|entry| {
                    let resource_type = entry.get("type").and_then(Value::as_str)?.to_string();
                    let url = entry.get("url").and_then(Value::as_str).map(str::to_string);
                    if url.is_none() {
                        warn!(resource_type = resource_type.as_str(), "manifest entry missing url, skipping");
                    }
                    Some(ManifestOutputEntry { resource_type, url })
                })
                .collect()
        })
        .unwrap_or_default();

    ManifestOutcome::Success(Manifest { output })
}

fn real_error_text(body: &Value) -> Option<String> {
    match body.get("error") {
        Some(Value::String(s)) if !s.is_empty() => Some(s.clone()),
        Some(Value::Array(items)) if !items.is_empty() => Some(serde_json::to_string(items).unwrap_or_default()),
        _ => None,
    }
}

/// Background task body: drives a job from phase 2 (or straight into the
/// search fallback) through completion. Errors never escape this task; they
/// are captured onto the job's `error` field instead.
///
/// Registers its own health component for the lifetime of the job, reporting
/// healthy at each suspension point (poll, download, commit) the way
/// `hook-worker::worker::WebhookWorker` reports through its dequeue loop's
/// single `HealthHandle` — here specialized to one handle per job since jobs,
/// not a shared dequeue loop, are this pipeline's unit of concurrency.
pub async fn drive(handle: JobHandle, ctx: PipelineContext, params: ExportParams, outcome: KickOffOutcome) {
    let liveness = ctx
        .health
        .register(format!("job:{}", handle.id()), time::Duration::seconds(120))
        .await;
    liveness.report_healthy().await;

    let result = match outcome {
        KickOffOutcome::Async { status_url, .. } => {
            poll_until_done(&handle, &ctx, &params, &status_url, &liveness).await
        }
        KickOffOutcome::Fallback { .. } => run_fallback(&handle, &ctx, &params).await,
    };

    if let Err(err) = result {
        warn!(job_id = handle.id(), error = %err, "job failed");
        handle.mutate(|job| job.fail(err.to_string())).await;
    }
    liveness.report_healthy().await;
}

async fn poll_until_done(
    handle: &JobHandle,
    ctx: &PipelineContext,
    params: &ExportParams,
    status_url: &str,
    liveness: &HealthHandle,
) -> Result<(), BulkExportError> {
    let mut poll_count: u32 = 0;
    loop {
        liveness.report_healthy().await;
        let mut headers = HeaderMap::new();
        headers.insert(ACCEPT, HeaderValue::from_static("application/fhir+json"));
        headers.insert(reqwest::header::AUTHORIZATION, ctx.auth.header_value().await?);

        let response = ctx.http.request(Method::GET, status_url, headers, None).await?;
        poll_count += 1;
        metrics::counter!("ingestion_poll_round_trips_total").increment(1);

        match response.status() {
            StatusCode::ACCEPTED => {
                if let Some(progress) = response
                    .headers()
                    .get("x-progress")
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_string)
                {
                    handle.mutate(|job| job.progress = Some(progress)).await;
                }
                if poll_count % STILL_IN_PROGRESS_LOG_EVERY == 0 {
                    info!(job_id = handle.id(), poll_count, "export still in progress");
                }
                tokio::time::sleep(POLL_INTERVAL).await;
                continue;
            }
            StatusCode::OK => {
                let body: Value = response.json().await.map_err(|source| HttpError::Request {
                    url: status_url.to_string(),
                    source,
                })?;
                return match classify_manifest(&body) {
                    ManifestOutcome::Success(manifest) => download_transform_load(handle, ctx, manifest).await,
                    ManifestOutcome::TooManyFiles(text) => {
                        warn!(job_id = handle.id(), reason = text.as_str(), "falling back to paginated search");
                        handle
                            .mutate(|job| job.method = crate::job::IngestMethod::FhirSearch)
                            .await;
                        run_fallback(handle, ctx, params).await
                    }
                    ManifestOutcome::RealError(text) => {
                        handle.mutate(|job| job.fail(text)).await;
                        Ok(())
                    }
                };
            }
            other => {
                let body = response.text().await.unwrap_or_default();
                if body.to_lowercase().contains("too many files") {
                    handle
                        .mutate(|job| job.method = crate::job::IngestMethod::FhirSearch)
                        .await;
                    return run_fallback(handle, ctx, params).await;
                }
                handle
                    .mutate(|job| job.fail(format!("status poll returned {other}: {body}")))
                    .await;
                return Ok(());
            }
        }
    }
}

async fn download_transform_load(
    handle: &JobHandle,
    ctx: &PipelineContext,
    manifest: Manifest,
) -> Result<(), BulkExportError> {
    handle.mutate(|job| job.advance(JobStatus::Downloading)).await;

    let job_dir = ctx.bulk_data_dir.join(handle.id());
    let auth_header = ctx.auth.header_value().await?;

    let files = download::run(
        &ctx.http,
        &job_dir,
        &manifest.output,
        &auth_header,
        ctx.download_concurrency,
        ctx.progress_log_interval_pct,
    )
    .await?;
    finish_job(handle, ctx, &job_dir, files).await
}

async fn run_fallback(
    handle: &JobHandle,
    ctx: &PipelineContext,
    params: &ExportParams,
) -> Result<(), BulkExportError> {
    let job_dir = ctx.bulk_data_dir.join(handle.id());
    let auth_header = ctx.auth.header_value().await?;

    let files = search_fallback::run(
        &ctx.http,
        &job_dir,
        &params.fhir_server_url,
        &params.resource_types,
        params.since.as_deref(),
        &auth_header,
    )
    .await?;
    finish_job(handle, ctx, &job_dir, files).await
}

async fn finish_job(
    handle: &JobHandle,
    ctx: &PipelineContext,
    job_dir: &PathBuf,
    files: Vec<DownloadedFile>,
) -> Result<(), BulkExportError> {
    handle.mutate(|job| job.files = files.clone()).await;

    let summary = transform::transform_job_files(job_dir, &files).await?;
    handle
        .mutate(|job| job.records_transformed = summary.total_transformed)
        .await;

    let LoadSummary { loaded, .. } = db::load_job_files(&ctx.db, handle.id(), &summary.transformed_files).await?;
    handle.mutate(|job| job.records_loaded = loaded).await;

    handle.mutate(|job| job.advance(JobStatus::Completed)).await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn empty_error_string_is_success() {
        let body = json!({ "output": [], "error": "" });
        assert!(matches!(classify_manifest(&body), ManifestOutcome::Success(_)));
    }

    #[test]
    fn too_many_files_triggers_fallback_case_insensitively() {
        let body = json!({ "error": "Export aborted: TOO MANY FILES requested" });
        assert!(matches!(classify_manifest(&body), ManifestOutcome::TooManyFiles(_)));
    }

    #[test]
    fn other_error_text_fails_the_job() {
        let body = json!({ "error": "internal server meltdown" });
        assert!(matches!(classify_manifest(&body), ManifestOutcome::RealError(_)));
    }

    #[test]
    fn operation_outcome_is_a_real_error() {
        let body = json!({ "resourceType": "OperationOutcome", "issue": [] });
        assert!(matches!(classify_manifest(&body), ManifestOutcome::RealError(_)));
    }

    #[test]
    fn missing_url_entries_are_skipped_not_fatal() {
        let body = json!({ "output": [
            { "type": "Patient", "url": "https://example.org/p.ndjson" },
            { "type": "Condition" },
        ]});
        match classify_manifest(&body) {
            ManifestOutcome::Success(manifest) => {
                assert_eq!(manifest.output.len(), 2);
                assert!(manifest.output[1].url.is_none());
            }
            other => panic!("expected success, got {other:?}"),
        }
    }

    #[test]
    fn derives_resume_job_id_from_last_segment() {
        assert_eq!(
            derive_resume_job_id("https://fhir.example.org/status/abc123"),
            "resume_abc123"
        );
    }

    #[test]
    fn export_url_carries_type_and_since() {
        let url = build_export_url(
            "https://fhir.example.org/",
            &["Patient".to_string(), "Condition".to_string()],
            Some("2024-01-01T00:00:00Z"),
        )
        .unwrap();
        assert_eq!(url.path(), "/$export");
        let query: std::collections::HashMap<_, _> = url.query_pairs().into_owned().collect();
        assert_eq!(query.get("_type").unwrap(), "Patient,Condition");
        assert_eq!(query.get("_since").unwrap(), "2024-01-01T00:00:00Z");
    }
}

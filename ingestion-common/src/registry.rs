use std::collections::HashMap;
use std::sync::Arc;

use serde::Serialize;
use thiserror::Error;
use tokio::sync::Mutex;

use crate::bulk_export::{self, ExportParams, KickOffOutcome, PipelineContext};
use crate::job::{IngestMethod, Job, JobStatus};

#[derive(Error, Debug)]
pub enum RegistryError {
    #[error("job {0} not found")]
    NotFound(String),
    #[error(transparent)]
    Export(#[from] bulk_export::BulkExportError),
}

struct RegistryState {
    jobs: HashMap<String, Job>,
    insertion_order: Vec<String>,
}

/// Process-wide map of job id to lifecycle state, guarded for concurrent
/// mutation. Generalized from the shared crate's `HealthRegistry`
/// (`Arc<RwLock<HashMap<...>>>` plus a cheaply cloneable handle type) from
/// read-mostly health status to read/write job state — hence a `Mutex`
/// rather than a `RwLock`, since job entries here are written far more often
/// relative to reads than component health ever is.
#[derive(Clone)]
pub struct JobRegistry {
    state: Arc<Mutex<RegistryState>>,
}

/// A cheaply cloneable handle into exactly one job's slot. The task that
/// owns a job (its driving `tokio::spawn`) is the sole writer; everyone else
/// only reads through `JobRegistry::status`/`list`.
#[derive(Clone)]
pub struct JobHandle {
    id: String,
    state: Arc<Mutex<RegistryState>>,
}

impl JobHandle {
    pub fn id(&self) -> &str {
        &self.id
    }

    pub async fn mutate<F: FnOnce(&mut Job)>(&self, f: F) {
        let mut state = self.state.lock().await;
        if let Some(job) = state.jobs.get_mut(&self.id) {
            f(job);
        }
    }

    pub async fn snapshot(&self) -> Option<Job> {
        self.state.lock().await.jobs.get(&self.id).cloned()
    }
}

#[derive(Serialize)]
pub struct KickOffResponse {
    pub job_id: String,
    pub status: String,
    pub method: IngestMethod,
    pub status_url: Option<String>,
}

#[derive(Serialize)]
pub struct ResumeResponse {
    pub job_id: String,
    pub status: String,
}

#[derive(Serialize)]
pub struct JobSummary {
    pub job_id: String,
    pub status: JobStatus,
    pub method: IngestMethod,
    pub files: usize,
    pub records_loaded: u64,
    pub status_url: Option<String>,
}

impl JobRegistry {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(RegistryState {
                jobs: HashMap::new(),
                insertion_order: Vec::new(),
            })),
        }
    }

    async fn insert(&self, job: Job) -> JobHandle {
        let id = job.id.clone();
        let mut state = self.state.lock().await;
        state.insertion_order.push(id.clone());
        state.jobs.insert(id.clone(), job);
        JobHandle {
            id,
            state: self.state.clone(),
        }
    }

    async fn contains(&self, id: &str) -> bool {
        self.state.lock().await.jobs.contains_key(id)
    }

    /// Runs phase 1 of the export synchronously (so the caller learns the
    /// derived `job_id` immediately), registers the job, then spawns the
    /// background task that drives phases 2-3 (or the search fallback) to
    /// completion.
    pub async fn kick_off(
        &self,
        params: ExportParams,
        ctx: PipelineContext,
    ) -> Result<KickOffResponse, RegistryError> {
        let outcome = bulk_export::kick_off(&ctx, &params).await?;

        let (job_id, method, status_url) = match &outcome {
            KickOffOutcome::Async { job_id, status_url } => {
                (job_id.clone(), IngestMethod::BulkExport, Some(status_url.clone()))
            }
            KickOffOutcome::Fallback { job_id } => (job_id.clone(), IngestMethod::FhirSearch, None),
        };

        let job = Job::new(
            job_id.clone(),
            method,
            params.fhir_server_url.clone(),
            params.resource_types.clone(),
            status_url.clone(),
        );
        let handle = self.insert(job).await;

        tokio::spawn(async move {
            bulk_export::drive(handle, ctx, params, outcome).await;
        });

        Ok(KickOffResponse {
            job_id,
            status: "accepted".to_string(),
            method,
            status_url,
        })
    }

    /// Starts monitoring an export from only its `status_url`, as described
    /// for job recovery after a process restart. Idempotent: calling again
    /// with the same status_url returns the same derived job id without
    /// re-registering.
    pub async fn resume(
        &self,
        status_url: String,
        bearer: Option<String>,
        ctx: PipelineContext,
    ) -> Result<ResumeResponse, RegistryError> {
        let job_id = bulk_export::derive_resume_job_id(&status_url);

        if self.contains(&job_id).await {
            return Ok(ResumeResponse {
                job_id,
                status: "already monitoring".to_string(),
            });
        }

        let params = ExportParams {
            fhir_server_url: ctx.fhir_server_url_hint.clone().unwrap_or_default(),
            resource_types: Vec::new(),
            since: None,
        };
        let mut ctx = ctx;
        if let Some(bearer) = bearer {
            ctx.auth = bulk_export::AuthMode::Bearer(bearer);
        }

        let job = Job::new(
            job_id.clone(),
            IngestMethod::BulkExportResumed,
            params.fhir_server_url.clone(),
            params.resource_types.clone(),
            Some(status_url.clone()),
        );
        let handle = self.insert(job).await;

        let outcome = KickOffOutcome::Async {
            job_id: job_id.clone(),
            status_url,
        };
        tokio::spawn(async move {
            bulk_export::drive(handle, ctx, params, outcome).await;
        });

        Ok(ResumeResponse {
            job_id,
            status: "resumed".to_string(),
        })
    }

    pub async fn status(&self, job_id: &str) -> Result<Job, RegistryError> {
        self.state
            .lock()
            .await
            .jobs
            .get(job_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(job_id.to_string()))
    }

    pub async fn list(&self) -> Vec<JobSummary> {
        let state = self.state.lock().await;
        state
            .insertion_order
            .iter()
            .filter_map(|id| state.jobs.get(id))
            .map(|job| JobSummary {
                job_id: job.id.clone(),
                status: job.status,
                method: job.method,
                files: job.files.len(),
                records_loaded: job.records_loaded,
                status_url: job.status_url.clone(),
            })
            .collect()
    }
}

impl Default for JobRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::job::IngestMethod;

    #[tokio::test]
    async fn list_is_empty_for_fresh_registry() {
        let registry = JobRegistry::new();
        assert!(registry.list().await.is_empty());
    }

    #[tokio::test]
    async fn status_not_found_for_unknown_job() {
        let registry = JobRegistry::new();
        let result = registry.status("missing").await;
        assert!(matches!(result, Err(RegistryError::NotFound(_))));
    }

    #[tokio::test]
    async fn handle_mutation_is_visible_through_status() {
        let registry = JobRegistry::new();
        let job = Job::new(
            "job-1".to_string(),
            IngestMethod::BulkExport,
            "https://fhir.example.org".to_string(),
            vec!["Patient".to_string()],
            None,
        );
        let handle = registry.insert(job).await;
        handle
            .mutate(|job| job.records_loaded = 7)
            .await;
        let snapshot = registry.status("job-1").await.unwrap();
        assert_eq!(snapshot.records_loaded, 7);
    }
}

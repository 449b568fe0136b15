use serde::Serialize;
use time::OffsetDateTime;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    InProgress,
    Downloading,
    Completed,
    Failed,
    Timeout,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum IngestMethod {
    BulkExport,
    BulkExportResumed,
    FhirSearch,
}

#[derive(Clone, Debug, Serialize)]
pub struct DownloadedFile {
    pub resource_type: String,
    pub local_path: String,
    pub size_bytes: u64,
}

/// One end-to-end ingestion attempt, owned by the registry and mutated only
/// by the task driving it.
#[derive(Clone, Debug, Serialize)]
pub struct Job {
    pub id: String,
    pub status: JobStatus,
    pub method: IngestMethod,
    pub status_url: Option<String>,
    pub fhir_server_url: String,
    pub resource_types: Vec<String>,
    #[serde(with = "time::serde::rfc3339")]
    pub started_at: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    pub completed_at: Option<OffsetDateTime>,
    pub files: Vec<DownloadedFile>,
    pub records_transformed: u64,
    pub records_loaded: u64,
    pub progress: Option<String>,
    pub error: Option<String>,
}

impl Job {
    pub fn new(
        id: String,
        method: IngestMethod,
        fhir_server_url: String,
        resource_types: Vec<String>,
        status_url: Option<String>,
    ) -> Self {
        Self {
            id,
            status: JobStatus::InProgress,
            method,
            status_url,
            fhir_server_url,
            resource_types,
            started_at: OffsetDateTime::now_utc(),
            completed_at: None,
            files: Vec::new(),
            records_transformed: 0,
            records_loaded: 0,
            progress: None,
            error: None,
        }
    }

    /// Enforces the monotonic status progression from spec invariant 3.
    /// Callers that violate ordering get a logged no-op rather than a panic,
    /// since a job's own driving task is the only writer and a bug there
    /// should not take down the process.
    pub fn advance(&mut self, next: JobStatus) {
        let rank = |s: JobStatus| -> u8 {
            match s {
                JobStatus::InProgress => 0,
                JobStatus::Downloading => 1,
                JobStatus::Completed => 2,
                JobStatus::Failed => 2,
                JobStatus::Timeout => 2,
            }
        };
        if rank(next) >= rank(self.status) {
            self.status = next;
            if matches!(
                next,
                JobStatus::Completed | JobStatus::Failed | JobStatus::Timeout
            ) {
                self.completed_at = Some(OffsetDateTime::now_utc());
            }
        } else {
            tracing::warn!(
                job_id = self.id.as_str(),
                from = ?self.status,
                to = ?next,
                "refusing to regress job status"
            );
        }
    }

    pub fn fail(&mut self, error: impl Into<String>) {
        self.error = Some(error.into());
        self.advance(JobStatus::Failed);
    }

    pub fn elapsed_seconds(&self) -> i64 {
        let end = self.completed_at.unwrap_or_else(OffsetDateTime::now_utc);
        (end - self.started_at).whole_seconds().max(0)
    }

    pub fn elapsed_minutes(&self) -> f64 {
        self.elapsed_seconds() as f64 / 60.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn new_job() -> Job {
        Job::new(
            "job-1".to_string(),
            IngestMethod::BulkExport,
            "https://fhir.example.org".to_string(),
            vec!["Patient".to_string()],
            Some("https://fhir.example.org/status/1".to_string()),
        )
    }

    #[test]
    fn status_progresses_forward() {
        let mut job = new_job();
        job.advance(JobStatus::Downloading);
        assert_eq!(job.status, JobStatus::Downloading);
        job.advance(JobStatus::Completed);
        assert_eq!(job.status, JobStatus::Completed);
        assert!(job.completed_at.is_some());
    }

    #[test]
    fn status_never_regresses() {
        let mut job = new_job();
        job.advance(JobStatus::Completed);
        job.advance(JobStatus::InProgress);
        assert_eq!(job.status, JobStatus::Completed);
    }

    #[test]
    fn fail_sets_error_and_terminal_status() {
        let mut job = new_job();
        job.fail("boom");
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.as_deref(), Some("boom"));
    }
}

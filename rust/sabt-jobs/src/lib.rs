// sabt-jobs: Export job runner
//
// A job is owned by exactly one worker task. Two submissions with the same
// (namespace, idempotency key) resolve to the same job; the ownership claim
// lives in the key-value store under a 24h TTL.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use sabt_clock::{deterministic_jitter, AsyncSleeper, Clock};
use sabt_export::{
    ExportError, ExportFilters, ExportManifest, ExportOptions, ExportSnapshot, SabtExporter,
};
use sabt_metrics::ServiceMetrics;
use sabt_store::{KeyValueStore, StoreError};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::task::JoinHandle;
use uuid::Uuid;

const JOB_CLAIM_TTL_SECONDS: u64 = 86_400;

/// Result type for job operations
pub type JobResult<T> = Result<T, JobError>;

/// Job submission errors
#[derive(Debug, Error)]
pub enum JobError {
    /// Another submission owns this idempotency key but no job is tracked
    #[error("EXPORT_DUPLICATE")]
    Duplicate,

    #[error("store failure: {0}")]
    Store(#[from] StoreError),

    #[error("job {0} not found")]
    NotFound(String),
}

/// Job lifecycle states; terminal states never re-run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExportJobStatus {
    Pending,
    Running,
    Success,
    Failed,
}

impl ExportJobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExportJobStatus::Pending => "PENDING",
            ExportJobStatus::Running => "RUNNING",
            ExportJobStatus::Success => "SUCCESS",
            ExportJobStatus::Failed => "FAILED",
        }
    }
}

/// One export job
#[derive(Debug, Clone)]
pub struct ExportJob {
    pub id: String,
    pub status: ExportJobStatus,
    pub filters: ExportFilters,
    pub options: ExportOptions,
    pub snapshot: ExportSnapshot,
    pub namespace: String,
    pub started_at: Option<DateTime<Utc>>,
    pub finished_at: Option<DateTime<Utc>>,
    pub manifest: Option<ExportManifest>,
    pub error: Option<String>,
}

#[derive(Serialize, Deserialize)]
struct ClaimRecord {
    job_id: String,
    status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

enum FailureClass {
    Validation,
    Transient,
}

fn classify(error: &ExportError) -> FailureClass {
    match error {
        ExportError::Validation { .. } | ExportError::Empty | ExportError::ProfileUnknown => {
            FailureClass::Validation
        }
        ExportError::Io(_) | ExportError::RetryExhausted { .. } => FailureClass::Transient,
    }
}

/// Background runner executing one worker task per job
pub struct ExportJobRunner {
    exporter: Arc<SabtExporter>,
    store: Arc<dyn KeyValueStore>,
    metrics: Arc<ServiceMetrics>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn AsyncSleeper>,
    max_retries: u32,
    jobs: Arc<DashMap<String, ExportJob>>,
    handles: DashMap<String, JoinHandle<()>>,
}

impl ExportJobRunner {
    pub fn new(
        exporter: Arc<SabtExporter>,
        store: Arc<dyn KeyValueStore>,
        metrics: Arc<ServiceMetrics>,
        clock: Arc<dyn Clock>,
        sleeper: Arc<dyn AsyncSleeper>,
        max_retries: u32,
    ) -> Self {
        Self {
            exporter,
            store,
            metrics,
            clock,
            sleeper,
            max_retries,
            jobs: Arc::new(DashMap::new()),
            handles: DashMap::new(),
        }
    }

    fn claim_key(namespace: &str, idempotency_key: &str) -> String {
        format!("phase6:exports:{namespace}:{idempotency_key}")
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.clock.now().with_timezone(&Utc)
    }

    /// Submit a job; duplicate keys resolve to the already-tracked job.
    pub async fn submit(
        &self,
        filters: ExportFilters,
        options: ExportOptions,
        idempotency_key: &str,
        namespace: &str,
    ) -> JobResult<ExportJob> {
        let claim_key = Self::claim_key(namespace, idempotency_key);
        let acquired = self
            .store
            .set_if_not_exists(&claim_key, "RUNNING", JOB_CLAIM_TTL_SECONDS)
            .await?;
        if !acquired {
            if let Some(raw) = self.store.get(&claim_key).await? {
                if let Ok(record) = serde_json::from_str::<ClaimRecord>(&raw) {
                    if let Some(job) = self.jobs.get(&record.job_id) {
                        return Ok(job.clone());
                    }
                }
            }
            return Err(JobError::Duplicate);
        }

        let job_id = Uuid::new_v4().to_string();
        let snapshot = ExportSnapshot {
            marker: format!("snapshot-{job_id}"),
            created_at: self.now_utc(),
        };
        let job = ExportJob {
            id: job_id.clone(),
            status: ExportJobStatus::Pending,
            filters,
            options,
            snapshot,
            namespace: namespace.to_string(),
            started_at: None,
            finished_at: None,
            manifest: None,
            error: None,
        };
        self.jobs.insert(job_id.clone(), job.clone());
        self.write_claim(&claim_key, &job_id, ExportJobStatus::Pending, None)
            .await?;

        let handle = self.spawn_worker(job_id.clone(), claim_key);
        self.handles.insert(job_id, handle);
        Ok(job)
    }

    async fn write_claim(
        &self,
        claim_key: &str,
        job_id: &str,
        status: ExportJobStatus,
        error: Option<String>,
    ) -> JobResult<()> {
        let record = ClaimRecord {
            job_id: job_id.to_string(),
            status: status.as_str().to_string(),
            error,
        };
        let payload = serde_json::to_string(&record)
            .map_err(|err| StoreError::Backend(err.to_string()))?;
        self.store
            .set(claim_key, &payload, JOB_CLAIM_TTL_SECONDS)
            .await?;
        Ok(())
    }

    fn spawn_worker(&self, job_id: String, claim_key: String) -> JoinHandle<()> {
        let exporter = Arc::clone(&self.exporter);
        let store = Arc::clone(&self.store);
        let metrics = Arc::clone(&self.metrics);
        let clock = Arc::clone(&self.clock);
        let sleeper = Arc::clone(&self.sleeper);
        let jobs = Arc::clone(&self.jobs);
        let max_retries = self.max_retries;

        tokio::spawn(async move {
            let worker = Worker {
                exporter,
                store,
                metrics,
                clock,
                sleeper,
                jobs,
                max_retries,
            };
            worker.run(&job_id, &claim_key).await;
        })
    }

    pub fn get_job(&self, job_id: &str) -> Option<ExportJob> {
        self.jobs.get(job_id).map(|job| job.clone())
    }

    /// Snapshot of every tracked job, newest submissions last
    pub fn list_jobs(&self) -> Vec<ExportJob> {
        let mut jobs: Vec<ExportJob> = self.jobs.iter().map(|entry| entry.value().clone()).collect();
        jobs.sort_by(|a, b| a.snapshot.created_at.cmp(&b.snapshot.created_at).then(a.id.cmp(&b.id)));
        jobs
    }

    /// Wait for a job's worker to finish (test and shutdown helper)
    pub async fn await_completion(&self, job_id: &str) -> JobResult<ExportJob> {
        if let Some((_, handle)) = self.handles.remove(job_id) {
            let _ = handle.await;
        }
        self.get_job(job_id)
            .ok_or_else(|| JobError::NotFound(job_id.to_string()))
    }
}

struct Worker {
    exporter: Arc<SabtExporter>,
    store: Arc<dyn KeyValueStore>,
    metrics: Arc<ServiceMetrics>,
    clock: Arc<dyn Clock>,
    sleeper: Arc<dyn AsyncSleeper>,
    jobs: Arc<DashMap<String, ExportJob>>,
    max_retries: u32,
}

impl Worker {
    fn update_job(&self, job_id: &str, f: impl FnOnce(&mut ExportJob)) {
        if let Some(mut job) = self.jobs.get_mut(job_id) {
            f(&mut job);
        }
    }

    fn now_utc(&self) -> DateTime<Utc> {
        self.clock.now().with_timezone(&Utc)
    }

    async fn persist_status(
        &self,
        claim_key: &str,
        job_id: &str,
        status: ExportJobStatus,
        error: Option<String>,
    ) {
        let record = ClaimRecord {
            job_id: job_id.to_string(),
            status: status.as_str().to_string(),
            error,
        };
        if let Ok(payload) = serde_json::to_string(&record) {
            let _ = self
                .store
                .set(claim_key, &payload, JOB_CLAIM_TTL_SECONDS)
                .await;
        }
    }

    fn count_terminal(&self, status: ExportJobStatus) {
        self.metrics
            .export_jobs_total
            .with_label_values(&[status.as_str()])
            .inc();
    }

    async fn run(&self, job_id: &str, claim_key: &str) {
        let started_at = self.now_utc();
        self.update_job(job_id, |job| {
            job.status = ExportJobStatus::Running;
            job.started_at = Some(started_at);
        });
        self.persist_status(claim_key, job_id, ExportJobStatus::Running, None)
            .await;

        let (filters, options, snapshot) = match self.jobs.get(job_id) {
            Some(job) => (
                job.filters.clone(),
                job.options.clone(),
                job.snapshot.clone(),
            ),
            None => return,
        };

        let mut attempt = 0;
        loop {
            attempt += 1;
            let exporter = Arc::clone(&self.exporter);
            let run_filters = filters.clone();
            let run_options = options.clone();
            let run_snapshot = snapshot.clone();
            let run_now = self.now_utc();
            let correlation_id = job_id.to_string();

            let outcome = tokio::task::spawn_blocking(move || {
                exporter.run(
                    &run_filters,
                    &run_options,
                    &run_snapshot,
                    run_now,
                    &correlation_id,
                )
            })
            .await;

            let result = match outcome {
                Ok(result) => result,
                Err(join_error) => Err(ExportError::Io(join_error.to_string())),
            };

            match result {
                Ok(manifest) => {
                    self.finish_success(job_id, claim_key, manifest).await;
                    return;
                }
                Err(error) => match classify(&error) {
                    FailureClass::Validation => {
                        self.metrics
                            .export_errors_total
                            .with_label_values(&["validation"])
                            .inc();
                        self.finish_failed(job_id, claim_key, error.to_string()).await;
                        return;
                    }
                    FailureClass::Transient => {
                        self.metrics
                            .export_errors_total
                            .with_label_values(&["transient"])
                            .inc();
                        if attempt >= self.max_retries {
                            self.finish_failed(job_id, claim_key, error.to_string()).await;
                            return;
                        }
                        let delay = deterministic_jitter(0.1, attempt, job_id, 5.0);
                        self.sleeper.sleep(delay).await;
                    }
                },
            }
        }
    }

    async fn finish_success(&self, job_id: &str, claim_key: &str, manifest: ExportManifest) {
        let finished_at = self.now_utc();
        self.update_job(job_id, |job| {
            job.status = ExportJobStatus::Success;
            job.finished_at = Some(finished_at);
            job.manifest = Some(manifest.clone());
        });
        self.count_terminal(ExportJobStatus::Success);
        self.persist_status(claim_key, job_id, ExportJobStatus::Success, None)
            .await;
    }

    async fn finish_failed(&self, job_id: &str, claim_key: &str, error: String) {
        let finished_at = self.now_utc();
        self.update_job(job_id, |job| {
            job.status = ExportJobStatus::Failed;
            job.finished_at = Some(finished_at);
            job.error = Some(error.clone());
        });
        self.count_terminal(ExportJobStatus::Failed);
        self.persist_status(claim_key, job_id, ExportJobStatus::Failed, Some(error))
            .await;
    }
}

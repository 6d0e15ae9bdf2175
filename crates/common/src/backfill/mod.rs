//! Retry and backfill orchestration
//!
//! Operator-driven re-registration: one job by reference, or a bounded batch
//! of recent succeeded jobs that still lack an IP. Batches run one job at a
//! time with registration calls spaced by a [`RegistrationPacer`]. A dry run
//! walks the exact same candidate list without calling out or writing.

use crate::config::BackfillConfig;
use crate::engine::{RegistrationEngine, RegistrationOutcome, MAX_PARENT_IPS};
use crate::errors::{AppError, Result};
use crate::metrics;
use crate::ratelimit::RegistrationPacer;
use crate::store::{
    find_parent_ip_set, CandidateFilter, JobWithImages, ProvenanceFlow, ProvenanceStore,
    RegistrationSummary,
};
use chrono::{DateTime, Duration, FixedOffset, Utc};
use serde::Serialize;
use std::sync::Arc;
use tracing::{error, info, instrument};
use uuid::Uuid;

/// Batch selection parameters
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BatchOptions {
    pub limit: u64,
    /// Re-register jobs that already have an IP
    pub force: bool,
    pub max_age_days: i64,
}

impl BatchOptions {
    pub fn from_config(config: &BackfillConfig) -> Self {
        Self {
            limit: config.default_limit,
            force: false,
            max_age_days: config.max_age_days,
        }
    }

    pub fn candidate_filter(&self, now: DateTime<Utc>) -> CandidateFilter {
        CandidateFilter {
            limit: self.limit,
            include_registered: self.force,
            completed_after: now - Duration::days(self.max_age_days),
        }
    }
}

/// Per-job result inside a report
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(untagged)]
pub enum JobResult {
    Completed(RegistrationOutcome),
    /// The attempt aborted on an unexpected error
    Errored { outcome: &'static str, error: String },
}

impl JobResult {
    fn errored(error: &AppError) -> Self {
        JobResult::Errored {
            outcome: "error",
            error: error.to_string(),
        }
    }

    pub fn label(&self) -> &'static str {
        match self {
            JobResult::Completed(outcome) => outcome.label(),
            JobResult::Errored { .. } => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct JobReport {
    pub job_id: Uuid,
    pub external_id: Option<String>,
    pub result: JobResult,
}

impl JobReport {
    fn new(job: &JobWithImages, result: JobResult) -> Self {
        Self {
            job_id: job.job.id,
            external_id: job.external_id().map(str::to_string),
            result,
        }
    }
}

/// Outcome of a real batch
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct BatchReport {
    pub considered: usize,
    pub registered: usize,
    /// Already registered or claimed elsewhere
    pub skipped: usize,
    pub failed: usize,
    pub jobs: Vec<JobReport>,
}

impl BatchReport {
    fn push(&mut self, report: JobReport) {
        self.considered += 1;
        match &report.result {
            JobResult::Completed(RegistrationOutcome::Registered { .. }) => self.registered += 1,
            JobResult::Completed(RegistrationOutcome::AlreadyRegistered { .. })
            | JobResult::Completed(RegistrationOutcome::RegistrationInFlight) => self.skipped += 1,
            JobResult::Completed(RegistrationOutcome::Failed { .. }) | JobResult::Errored { .. } => {
                self.failed += 1
            }
        }
        self.jobs.push(report);
    }
}

/// What a real batch would do for one job
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DryRunEntry {
    pub job_id: Uuid,
    pub external_id: Option<String>,
    pub completed_at: Option<DateTime<FixedOffset>>,
    pub flow: Option<ProvenanceFlow>,
    pub parents_total: usize,
    pub parents_submitted: usize,
    pub already_registered: bool,
    pub would_attempt: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct DryRunReport {
    pub would_attempt: usize,
    pub would_fail_no_parents: usize,
    pub jobs: Vec<DryRunEntry>,
}

pub struct Orchestrator {
    store: Arc<dyn ProvenanceStore>,
    engine: Arc<RegistrationEngine>,
    pacer: RegistrationPacer,
}

impl Orchestrator {
    pub fn new(engine: Arc<RegistrationEngine>, pacer: RegistrationPacer) -> Self {
        Self {
            store: engine.store().clone(),
            engine,
            pacer,
        }
    }

    /// Register one job by internal or provider id
    #[instrument(skip(self))]
    pub async fn retry_one(&self, reference: &str, force: bool) -> Result<JobReport> {
        let job = self
            .store
            .resolve_job(reference)
            .await?
            .ok_or_else(|| AppError::JobNotFound {
                id: reference.to_string(),
            })?;

        let outcome = self.engine.register(&job, force, None).await?;
        info!(outcome = outcome.label(), "Retry finished");
        Ok(JobReport::new(&job, JobResult::Completed(outcome)))
    }

    /// Register up to `options.limit` candidates, one at a time. A failing
    /// job is reported and the batch moves on.
    #[instrument(skip(self), fields(limit = options.limit, force = options.force))]
    pub async fn retry_batch(&self, options: BatchOptions) -> Result<BatchReport> {
        let candidates = self.candidates(&options).await?;
        info!(candidates = candidates.len(), "Starting registration batch");

        let mut report = BatchReport::default();
        for job in &candidates {
            let result = match self.engine.register(job, options.force, Some(&self.pacer)).await {
                Ok(outcome) => JobResult::Completed(outcome),
                Err(e) => {
                    error!(job_id = %job.job.id, error = %e, "Registration aborted");
                    JobResult::errored(&e)
                }
            };
            metrics::record_backfill_job(result.label());
            report.push(JobReport::new(job, result));
        }

        info!(
            considered = report.considered,
            registered = report.registered,
            skipped = report.skipped,
            failed = report.failed,
            "Registration batch finished"
        );
        Ok(report)
    }

    /// Same selection as [`Orchestrator::retry_batch`], no calls, no writes
    #[instrument(skip(self), fields(limit = options.limit))]
    pub async fn dry_run_batch(&self, options: BatchOptions) -> Result<DryRunReport> {
        let candidates = self.candidates(&options).await?;

        let mut report = DryRunReport::default();
        for job in &candidates {
            let parents = find_parent_ip_set(job);
            let already_registered = job.job.ip_id.is_some();
            let would_attempt = !parents.is_empty() && (options.force || !already_registered);

            if would_attempt {
                report.would_attempt += 1;
            } else if parents.is_empty() {
                report.would_fail_no_parents += 1;
            }

            report.jobs.push(DryRunEntry {
                job_id: job.job.id,
                external_id: job.external_id().map(str::to_string),
                completed_at: job.job.completed_at,
                flow: parents.flow,
                parents_total: parents.len(),
                parents_submitted: parents.len().min(MAX_PARENT_IPS),
                already_registered,
                would_attempt,
            });
        }

        Ok(report)
    }

    /// Registration coverage, over the last `max_age_days` when given
    pub async fn summary(&self, max_age_days: Option<i64>) -> Result<RegistrationSummary> {
        let completed_after = max_age_days.map(|days| Utc::now() - Duration::days(days));
        self.store.registration_summary(completed_after).await
    }

    async fn candidates(&self, options: &BatchOptions) -> Result<Vec<JobWithImages>> {
        let filter = options.candidate_filter(Utc::now());
        self.store.find_registration_candidates(&filter).await
    }
}

//! Provenance store abstraction
//!
//! The store owns every persisted fact about a training job: its status as
//! reported by the training provider, its source images, the parent IP set
//! it was registered against and the IP it was registered as. Two backends
//! implement it:
//! - [`crate::db::Repository`] on PostgreSQL
//! - [`MemoryStore`] for tests and local dry runs
//!
//! Writes that decide `ip_id` are conditional at the storage layer, so the
//! webhook handler and the retry tool can run as separate processes without
//! double-registering a job.

mod memory;

pub use memory::MemoryStore;

use crate::db::models::{TrainingImage, TrainingJob, TrainingStatus};
use crate::errors::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use uuid::Uuid;

/// A training job together with its source images in display order
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobWithImages {
    pub job: TrainingJob,
    pub images: Vec<TrainingImage>,
}

impl JobWithImages {
    pub fn external_id(&self) -> Option<&str> {
        self.job.replicate_job_id.as_deref()
    }

    /// Identifier used in logs and reports: external id when known
    pub fn display_id(&self) -> String {
        self.external_id()
            .map(str::to_string)
            .unwrap_or_else(|| self.job.id.to_string())
    }
}

/// Where a job's parent IP set was found
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProvenanceFlow {
    /// Registered IPs of the job's own training images
    #[serde(rename = "A")]
    ChildRecords,
    /// The job's stored `parent_ip_ids` collection
    #[serde(rename = "B")]
    Collection,
}

impl fmt::Display for ProvenanceFlow {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProvenanceFlow::ChildRecords => f.write_str("A"),
            ProvenanceFlow::Collection => f.write_str("B"),
        }
    }
}

/// Resolved candidate parents for a derivative registration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ParentIpSet {
    pub ip_ids: Vec<String>,
    /// `None` when neither flow produced a parent
    pub flow: Option<ProvenanceFlow>,
}

impl ParentIpSet {
    pub fn is_empty(&self) -> bool {
        self.ip_ids.is_empty()
    }

    pub fn len(&self) -> usize {
        self.ip_ids.len()
    }
}

/// Derive a job's parent IP set.
///
/// Flow A (registered child images, in display order) wins whenever it
/// yields at least one id; otherwise Flow B (the stored collection) is used.
/// The two are never merged. Duplicates are passed through untouched.
pub fn find_parent_ip_set(job: &JobWithImages) -> ParentIpSet {
    let from_images: Vec<String> = job
        .images
        .iter()
        .filter_map(|image| image.registered_ip_id().map(str::to_string))
        .collect();

    if !from_images.is_empty() {
        return ParentIpSet {
            ip_ids: from_images,
            flow: Some(ProvenanceFlow::ChildRecords),
        };
    }

    let collection = job.job.parent_ip_ids();
    if !collection.is_empty() {
        return ParentIpSet {
            ip_ids: collection,
            flow: Some(ProvenanceFlow::Collection),
        };
    }

    ParentIpSet {
        ip_ids: Vec::new(),
        flow: None,
    }
}

/// Status-carrying fields from one provider notification
#[derive(Debug, Clone, PartialEq)]
pub struct NotificationUpdate {
    pub status: TrainingStatus,
    pub trigger_word: Option<String>,
    pub input_images_url: Option<String>,
    pub steps: Option<i32>,
    pub captioning: Option<String>,
    pub output_url: Option<String>,
    pub error_message: Option<String>,
    pub logs: Option<String>,
    pub predict_time: Option<f64>,
    pub total_time: Option<f64>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl NotificationUpdate {
    pub fn status_only(status: TrainingStatus) -> Self {
        Self {
            status,
            trigger_word: None,
            input_images_url: None,
            steps: None,
            captioning: None,
            output_url: None,
            error_message: None,
            logs: None,
            predict_time: None,
            total_time: None,
            started_at: None,
            completed_at: None,
        }
    }
}

/// Result of applying a notification to the store
#[derive(Debug, Clone, PartialEq)]
pub enum UpsertOutcome {
    /// No row existed for the external id; one was inserted
    Created(TrainingJob),
    /// The stored row accepted the new status
    Updated(TrainingJob),
    /// The stored status guard rejected the notification; row untouched
    Unchanged(TrainingJob),
}

impl UpsertOutcome {
    pub fn job(&self) -> &TrainingJob {
        match self {
            UpsertOutcome::Created(job)
            | UpsertOutcome::Updated(job)
            | UpsertOutcome::Unchanged(job) => job,
        }
    }

    pub fn applied(&self) -> bool {
        !matches!(self, UpsertOutcome::Unchanged(_))
    }
}

/// A training job as submitted by a client, before the provider reports on it
#[derive(Debug, Clone, Default)]
pub struct NewTrainingJob {
    pub replicate_job_id: Option<String>,
    pub model_name: Option<String>,
    pub trigger_word: Option<String>,
    pub steps: Option<i32>,
    pub captioning: Option<String>,
    pub input_images_url: Option<String>,
    pub parent_ip_ids: Vec<String>,
    pub images: Vec<NewTrainingImage>,
}

#[derive(Debug, Clone, Default)]
pub struct NewTrainingImage {
    pub image_url: Option<String>,
}

/// Final outcome of a source image's own registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ImageRegistration {
    Registered { ip_id: String },
    Failed,
}

/// A confirmed registration about to be persisted
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistrationRecord {
    pub ip_id: String,
    pub tx_hash: Option<String>,
    /// Exactly the parent ids submitted in the successful call
    pub parent_ip_ids: Vec<String>,
}

/// Selection criteria shared by real and dry-run backfill batches
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateFilter {
    pub limit: u64,
    /// Include jobs that already have an IP
    pub include_registered: bool,
    /// Only jobs completed at or after this instant
    pub completed_after: DateTime<Utc>,
}

/// Registration coverage over eligible jobs
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationSummary {
    /// Succeeded jobs with a trigger word and output
    pub eligible: u64,
    pub registered: u64,
    pub unregistered: u64,
    /// Unregistered jobs whose last attempt recorded a failure
    pub failed_attempts: u64,
}

/// Persistence operations used by the registration pipeline
#[async_trait]
pub trait ProvenanceStore: Send + Sync {
    /// Check connectivity
    async fn ping(&self) -> Result<()>;

    /// Insert a job submitted by a client, with its images in upload order
    async fn create_job(&self, new: NewTrainingJob) -> Result<JobWithImages>;

    /// Record the outcome of a source image's own registration. Images are
    /// mutated once: rows no longer pending are left alone.
    async fn record_image_registration(
        &self,
        image_id: Uuid,
        registration: ImageRegistration,
    ) -> Result<bool>;

    /// Insert or update the job for `external_id`, applying the status guard
    /// ([`TrainingJob::accepts`]) atomically against the stored row.
    async fn upsert_job_on_notification(
        &self,
        external_id: &str,
        update: &NotificationUpdate,
    ) -> Result<UpsertOutcome>;

    async fn find_job_by_id(&self, id: Uuid) -> Result<Option<JobWithImages>>;

    async fn find_job_by_external_id(&self, external_id: &str) -> Result<Option<JobWithImages>>;

    /// Atomically claim the right to register `job_id`. Succeeds only when
    /// the job's `ip_id` still equals `expected_ip_id` and no unexpired claim
    /// is held by another worker.
    async fn try_claim_registration(
        &self,
        job_id: Uuid,
        expected_ip_id: Option<&str>,
        lease: Duration,
    ) -> Result<bool>;

    /// Drop a claim without recording an outcome
    async fn release_registration_claim(&self, job_id: Uuid) -> Result<()>;

    /// Set `ip_id`, tx hash and parents used, clear failure bookkeeping and
    /// the claim. Applies only if `ip_id` still equals `expected_ip_id`;
    /// returns `false` when another writer got there first.
    async fn record_registration_success(
        &self,
        job_id: Uuid,
        expected_ip_id: Option<&str>,
        record: &RegistrationRecord,
    ) -> Result<bool>;

    /// Overwrite the last-failure bookkeeping and release the claim.
    /// Never touches `ip_id`.
    async fn record_registration_failure(&self, job_id: Uuid, reason: &str) -> Result<()>;

    /// Backfill candidates, ordered by `completed_at` descending then id
    async fn find_registration_candidates(
        &self,
        filter: &CandidateFilter,
    ) -> Result<Vec<JobWithImages>>;

    async fn registration_summary(
        &self,
        completed_after: Option<DateTime<Utc>>,
    ) -> Result<RegistrationSummary>;

    /// Resolve a job by internal id or provider id. Every entry point that
    /// accepts a caller-supplied job reference goes through here.
    async fn resolve_job(&self, id_or_external_id: &str) -> Result<Option<JobWithImages>> {
        let reference = id_or_external_id.trim();
        if let Ok(id) = Uuid::parse_str(reference) {
            if let Some(job) = self.find_job_by_id(id).await? {
                return Ok(Some(job));
            }
        }
        self.find_job_by_external_id(reference).await
    }
}

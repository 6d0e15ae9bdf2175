//! In-memory provenance store
//!
//! Mirrors the PostgreSQL repository's guards (status acceptance, conditional
//! `ip_id` writes, registration claims) under a single mutex so tests can
//! exercise the pipeline without a database.

use super::{
    CandidateFilter, ImageRegistration, JobWithImages, NewTrainingJob, NotificationUpdate,
    ProvenanceStore, RegistrationRecord, RegistrationSummary, UpsertOutcome,
};
use crate::db::models::{ImageRegistrationStatus, TrainingImage, TrainingJob, TrainingStatus};
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use uuid::Uuid;

#[derive(Default)]
struct Tables {
    jobs: HashMap<Uuid, TrainingJob>,
    images: Vec<TrainingImage>,
}

/// Provenance store backed by process memory
#[derive(Default)]
pub struct MemoryStore {
    tables: Mutex<Tables>,
    fail_writes: AtomicBool,
    fail_success_writes: AtomicBool,
    fail_failure_writes: AtomicBool,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every subsequent write fail, simulating a lost database
    pub fn fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    /// Make only `record_registration_success` fail, as if the database
    /// went away between the external call and the write
    pub fn fail_success_writes(&self, fail: bool) {
        self.fail_success_writes.store(fail, Ordering::SeqCst);
    }

    /// Make only `record_registration_failure` fail
    pub fn fail_failure_writes(&self, fail: bool) {
        self.fail_failure_writes.store(fail, Ordering::SeqCst);
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Tables> {
        // A poisoned lock only means a test panicked mid-write
        self.tables.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn check_writable(&self) -> Result<()> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseConnection {
                message: "memory store writes disabled".to_string(),
            });
        }
        Ok(())
    }

    fn with_images(tables: &Tables, job: &TrainingJob) -> JobWithImages {
        let mut images: Vec<TrainingImage> = tables
            .images
            .iter()
            .filter(|image| image.training_job_id == job.id)
            .cloned()
            .collect();
        images.sort_by_key(|image| image.display_order);
        JobWithImages {
            job: job.clone(),
            images,
        }
    }

    fn is_eligible(job: &TrainingJob) -> bool {
        job.training_status() == TrainingStatus::Succeeded
            && job.trigger_word.is_some()
            && job.output_url.is_some()
    }
}

fn blank_job(id: Uuid, status: TrainingStatus, now: DateTime<Utc>) -> TrainingJob {
    let now = now.fixed_offset();
    TrainingJob {
        id,
        replicate_job_id: None,
        model_name: None,
        trigger_word: None,
        status: status.as_str().to_string(),
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
        ip_id: None,
        registration_tx_hash: None,
        parent_ip_ids: serde_json::json!([]),
        registration_failed: false,
        registration_failure_reason: None,
        registration_failed_at: None,
        registration_claimed_at: None,
        hidden: false,
        created_at: now,
        updated_at: now,
    }
}

fn apply_update(job: &mut TrainingJob, update: &NotificationUpdate, now: DateTime<Utc>) {
    fn keep<T: Clone>(slot: &mut Option<T>, value: &Option<T>) {
        if value.is_some() {
            *slot = value.clone();
        }
    }

    job.status = update.status.as_str().to_string();
    keep(&mut job.trigger_word, &update.trigger_word);
    keep(&mut job.input_images_url, &update.input_images_url);
    keep(&mut job.steps, &update.steps);
    keep(&mut job.captioning, &update.captioning);
    keep(&mut job.output_url, &update.output_url);
    keep(&mut job.error_message, &update.error_message);
    keep(&mut job.logs, &update.logs);
    keep(&mut job.predict_time, &update.predict_time);
    keep(&mut job.total_time, &update.total_time);
    keep(&mut job.started_at, &update.started_at.map(|t| t.fixed_offset()));
    keep(&mut job.completed_at, &update.completed_at.map(|t| t.fixed_offset()));
    job.updated_at = now.fixed_offset();
}

#[async_trait]
impl ProvenanceStore for MemoryStore {
    async fn ping(&self) -> Result<()> {
        Ok(())
    }

    async fn create_job(&self, new: NewTrainingJob) -> Result<JobWithImages> {
        self.check_writable()?;
        let now = Utc::now();
        let mut tables = self.lock();

        if let Some(ref external_id) = new.replicate_job_id {
            let taken = tables
                .jobs
                .values()
                .any(|job| job.replicate_job_id.as_deref() == Some(external_id.as_str()));
            if taken {
                return Err(AppError::Conflict {
                    message: format!("training job {} already exists", external_id),
                });
            }
        }

        let mut job = blank_job(Uuid::new_v4(), TrainingStatus::Pending, now);
        job.replicate_job_id = new.replicate_job_id;
        job.model_name = new.model_name;
        job.trigger_word = new.trigger_word;
        job.steps = new.steps;
        job.captioning = new.captioning;
        job.input_images_url = new.input_images_url;
        job.parent_ip_ids = serde_json::json!(new.parent_ip_ids);

        for (order, image) in new.images.into_iter().enumerate() {
            tables.images.push(TrainingImage {
                id: Uuid::new_v4(),
                training_job_id: job.id,
                display_order: order as i32,
                image_url: image.image_url,
                story_ip_id: None,
                registration_status: ImageRegistrationStatus::Pending.into(),
                created_at: now.fixed_offset(),
            });
        }

        tables.jobs.insert(job.id, job.clone());
        Ok(Self::with_images(&tables, &job))
    }

    async fn record_image_registration(
        &self,
        image_id: Uuid,
        registration: ImageRegistration,
    ) -> Result<bool> {
        self.check_writable()?;
        let mut tables = self.lock();
        let Some(image) = tables.images.iter_mut().find(|image| image.id == image_id) else {
            return Ok(false);
        };
        if image.registration_status() != ImageRegistrationStatus::Pending {
            return Ok(false);
        }
        match registration {
            ImageRegistration::Registered { ip_id } => {
                image.story_ip_id = Some(ip_id);
                image.registration_status = ImageRegistrationStatus::Registered.into();
            }
            ImageRegistration::Failed => {
                image.registration_status = ImageRegistrationStatus::Failed.into();
            }
        }
        Ok(true)
    }

    async fn upsert_job_on_notification(
        &self,
        external_id: &str,
        update: &NotificationUpdate,
    ) -> Result<UpsertOutcome> {
        self.check_writable()?;
        let now = Utc::now();
        let mut tables = self.lock();

        let existing = tables
            .jobs
            .values_mut()
            .find(|job| job.replicate_job_id.as_deref() == Some(external_id));

        match existing {
            Some(job) => {
                if job.accepts(update.status) {
                    apply_update(job, update, now);
                    Ok(UpsertOutcome::Updated(job.clone()))
                } else {
                    Ok(UpsertOutcome::Unchanged(job.clone()))
                }
            }
            None => {
                let mut job = blank_job(Uuid::new_v4(), update.status, now);
                job.replicate_job_id = Some(external_id.to_string());
                apply_update(&mut job, update, now);
                tables.jobs.insert(job.id, job.clone());
                Ok(UpsertOutcome::Created(job))
            }
        }
    }

    async fn find_job_by_id(&self, id: Uuid) -> Result<Option<JobWithImages>> {
        let tables = self.lock();
        Ok(tables.jobs.get(&id).map(|job| Self::with_images(&tables, job)))
    }

    async fn find_job_by_external_id(&self, external_id: &str) -> Result<Option<JobWithImages>> {
        let tables = self.lock();
        Ok(tables
            .jobs
            .values()
            .find(|job| job.replicate_job_id.as_deref() == Some(external_id))
            .map(|job| Self::with_images(&tables, job)))
    }

    async fn try_claim_registration(
        &self,
        job_id: Uuid,
        expected_ip_id: Option<&str>,
        lease: Duration,
    ) -> Result<bool> {
        self.check_writable()?;
        let now = Utc::now();
        let lease = chrono::Duration::from_std(lease).unwrap_or(chrono::Duration::MAX);
        let mut tables = self.lock();
        let Some(job) = tables.jobs.get_mut(&job_id) else {
            return Ok(false);
        };

        let claim_free = job
            .registration_claimed_at
            .map(|claimed| {
                claimed
                    .with_timezone(&Utc)
                    .checked_add_signed(lease)
                    .is_some_and(|expiry| expiry <= now)
            })
            .unwrap_or(true);

        if job.ip_id.as_deref() == expected_ip_id && claim_free {
            job.registration_claimed_at = Some(now.fixed_offset());
            Ok(true)
        } else {
            Ok(false)
        }
    }

    async fn release_registration_claim(&self, job_id: Uuid) -> Result<()> {
        self.check_writable()?;
        if let Some(job) = self.lock().jobs.get_mut(&job_id) {
            job.registration_claimed_at = None;
        }
        Ok(())
    }

    async fn record_registration_success(
        &self,
        job_id: Uuid,
        expected_ip_id: Option<&str>,
        record: &RegistrationRecord,
    ) -> Result<bool> {
        self.check_writable()?;
        if self.fail_success_writes.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseConnection {
                message: "connection reset while recording registration".to_string(),
            });
        }
        let now = Utc::now().fixed_offset();
        let mut tables = self.lock();
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| AppError::JobNotFound { id: job_id.to_string() })?;

        if job.ip_id.as_deref() != expected_ip_id {
            return Ok(false);
        }

        job.ip_id = Some(record.ip_id.clone());
        job.registration_tx_hash = record.tx_hash.clone();
        job.parent_ip_ids = serde_json::json!(record.parent_ip_ids);
        job.registration_failed = false;
        job.registration_failure_reason = None;
        job.registration_failed_at = None;
        job.registration_claimed_at = None;
        job.updated_at = now;
        Ok(true)
    }

    async fn record_registration_failure(&self, job_id: Uuid, reason: &str) -> Result<()> {
        self.check_writable()?;
        if self.fail_failure_writes.load(Ordering::SeqCst) {
            return Err(AppError::DatabaseConnection {
                message: "connection reset while recording failure".to_string(),
            });
        }
        let now = Utc::now().fixed_offset();
        let mut tables = self.lock();
        let job = tables
            .jobs
            .get_mut(&job_id)
            .ok_or_else(|| AppError::JobNotFound { id: job_id.to_string() })?;

        job.registration_failed = true;
        job.registration_failure_reason = Some(reason.to_string());
        job.registration_failed_at = Some(now);
        job.registration_claimed_at = None;
        job.updated_at = now;
        Ok(())
    }

    async fn find_registration_candidates(
        &self,
        filter: &CandidateFilter,
    ) -> Result<Vec<JobWithImages>> {
        let tables = self.lock();
        let mut candidates: Vec<&TrainingJob> = tables
            .jobs
            .values()
            .filter(|job| Self::is_eligible(job))
            .filter(|job| {
                job.completed_at
                    .map(|at| at.with_timezone(&Utc) >= filter.completed_after)
                    .unwrap_or(false)
            })
            .filter(|job| filter.include_registered || job.ip_id.is_none())
            .collect();

        candidates.sort_by(|a, b| {
            b.completed_at
                .cmp(&a.completed_at)
                .then_with(|| a.id.cmp(&b.id))
        });

        Ok(candidates
            .into_iter()
            .take(filter.limit as usize)
            .map(|job| Self::with_images(&tables, job))
            .collect())
    }

    async fn registration_summary(
        &self,
        completed_after: Option<DateTime<Utc>>,
    ) -> Result<RegistrationSummary> {
        let tables = self.lock();
        let mut summary = RegistrationSummary::default();

        let eligible = tables.jobs.values().filter(|job| Self::is_eligible(job)).filter(|job| {
            match completed_after {
                Some(cutoff) => job
                    .completed_at
                    .map(|at| at.with_timezone(&Utc) >= cutoff)
                    .unwrap_or(false),
                None => true,
            }
        });

        for job in eligible {
            summary.eligible += 1;
            if job.ip_id.is_some() {
                summary.registered += 1;
            } else {
                summary.unregistered += 1;
                if job.registration_failed {
                    summary.failed_attempts += 1;
                }
            }
        }

        Ok(summary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::NewTrainingImage;

    fn update(status: TrainingStatus) -> NotificationUpdate {
        NotificationUpdate::status_only(status)
    }

    #[tokio::test]
    async fn test_upsert_creates_then_updates() {
        let store = MemoryStore::new();

        let created = store
            .upsert_job_on_notification("r8-1", &update(TrainingStatus::Starting))
            .await
            .unwrap();
        assert!(matches!(created, UpsertOutcome::Created(_)));

        let updated = store
            .upsert_job_on_notification("r8-1", &update(TrainingStatus::Processing))
            .await
            .unwrap();
        assert!(matches!(updated, UpsertOutcome::Updated(_)));
        assert_eq!(updated.job().status, "processing");
    }

    #[tokio::test]
    async fn test_upsert_guard_keeps_terminal_status() {
        let store = MemoryStore::new();
        store
            .upsert_job_on_notification("r8-2", &update(TrainingStatus::Succeeded))
            .await
            .unwrap();

        let late = store
            .upsert_job_on_notification("r8-2", &update(TrainingStatus::Processing))
            .await
            .unwrap();
        assert!(!late.applied());
        assert_eq!(late.job().status, "succeeded");
    }

    #[tokio::test]
    async fn test_registered_job_keeps_succeeded_status() {
        let store = MemoryStore::new();
        let created = store
            .upsert_job_on_notification("r8-reg", &update(TrainingStatus::Succeeded))
            .await
            .unwrap();
        let record = RegistrationRecord {
            ip_id: "0xip".to_string(),
            tx_hash: None,
            parent_ip_ids: vec!["P1".to_string()],
        };
        assert!(store
            .record_registration_success(created.job().id, None, &record)
            .await
            .unwrap());

        for late in [TrainingStatus::Failed, TrainingStatus::Canceled] {
            let outcome = store
                .upsert_job_on_notification("r8-reg", &update(late))
                .await
                .unwrap();
            assert!(!outcome.applied());
            assert_eq!(outcome.job().status, "succeeded");
            assert_eq!(outcome.job().ip_id.as_deref(), Some("0xip"));
        }

        let repeat = store
            .upsert_job_on_notification("r8-reg", &update(TrainingStatus::Succeeded))
            .await
            .unwrap();
        assert!(repeat.applied());
    }

    #[tokio::test]
    async fn test_unregistered_job_takes_late_failure() {
        let store = MemoryStore::new();
        store
            .upsert_job_on_notification("r8-late", &update(TrainingStatus::Succeeded))
            .await
            .unwrap();

        let outcome = store
            .upsert_job_on_notification("r8-late", &update(TrainingStatus::Failed))
            .await
            .unwrap();
        assert!(outcome.applied());
        assert_eq!(outcome.job().status, "failed");
    }

    #[tokio::test]
    async fn test_absent_fields_do_not_erase_stored_values() {
        let store = MemoryStore::new();
        let mut first = update(TrainingStatus::Starting);
        first.trigger_word = Some("TOK".to_string());
        store.upsert_job_on_notification("r8-3", &first).await.unwrap();

        let second = store
            .upsert_job_on_notification("r8-3", &update(TrainingStatus::Processing))
            .await
            .unwrap();
        assert_eq!(second.job().trigger_word.as_deref(), Some("TOK"));
    }

    #[tokio::test]
    async fn test_claim_is_exclusive_until_released() {
        let store = MemoryStore::new();
        let job = store.create_job(NewTrainingJob::default()).await.unwrap();
        let lease = Duration::from_secs(60);

        assert!(store.try_claim_registration(job.job.id, None, lease).await.unwrap());
        assert!(!store.try_claim_registration(job.job.id, None, lease).await.unwrap());

        store.release_registration_claim(job.job.id).await.unwrap();
        assert!(store.try_claim_registration(job.job.id, None, lease).await.unwrap());
    }

    #[tokio::test]
    async fn test_expired_claim_can_be_taken_over() {
        let store = MemoryStore::new();
        let job = store.create_job(NewTrainingJob::default()).await.unwrap();

        assert!(store
            .try_claim_registration(job.job.id, None, Duration::ZERO)
            .await
            .unwrap());
        assert!(store
            .try_claim_registration(job.job.id, None, Duration::ZERO)
            .await
            .unwrap());
    }

    #[tokio::test]
    async fn test_success_write_is_conditional() {
        let store = MemoryStore::new();
        let job = store.create_job(NewTrainingJob::default()).await.unwrap();
        let record = RegistrationRecord {
            ip_id: "0xip1".to_string(),
            tx_hash: Some("0xtx1".to_string()),
            parent_ip_ids: vec!["P1".to_string()],
        };

        assert!(store
            .record_registration_success(job.job.id, None, &record)
            .await
            .unwrap());

        let second = RegistrationRecord {
            ip_id: "0xip2".to_string(),
            ..record.clone()
        };
        assert!(!store
            .record_registration_success(job.job.id, None, &second)
            .await
            .unwrap());

        let stored = store.find_job_by_id(job.job.id).await.unwrap().unwrap();
        assert_eq!(stored.job.ip_id.as_deref(), Some("0xip1"));
        assert_eq!(stored.job.parent_ip_ids(), vec!["P1"]);
    }

    #[tokio::test]
    async fn test_failure_never_touches_ip() {
        let store = MemoryStore::new();
        let job = store.create_job(NewTrainingJob::default()).await.unwrap();
        let record = RegistrationRecord {
            ip_id: "0xip".to_string(),
            tx_hash: None,
            parent_ip_ids: vec![],
        };
        store
            .record_registration_success(job.job.id, None, &record)
            .await
            .unwrap();
        store
            .record_registration_failure(job.job.id, "reverted")
            .await
            .unwrap();

        let stored = store.find_job_by_id(job.job.id).await.unwrap().unwrap();
        assert_eq!(stored.job.ip_id.as_deref(), Some("0xip"));
        assert!(stored.job.registration_failed);
        assert_eq!(stored.job.registration_failure_reason.as_deref(), Some("reverted"));
    }

    #[tokio::test]
    async fn test_image_registration_is_written_once() {
        let store = MemoryStore::new();
        let job = store
            .create_job(NewTrainingJob {
                images: vec![NewTrainingImage::default()],
                ..Default::default()
            })
            .await
            .unwrap();
        let image_id = job.images[0].id;

        assert!(store
            .record_image_registration(
                image_id,
                ImageRegistration::Registered { ip_id: "P1".to_string() }
            )
            .await
            .unwrap());
        assert!(!store
            .record_image_registration(image_id, ImageRegistration::Failed)
            .await
            .unwrap());

        let stored = store.find_job_by_id(job.job.id).await.unwrap().unwrap();
        assert_eq!(stored.images[0].registered_ip_id(), Some("P1"));
    }

    #[tokio::test]
    async fn test_resolve_job_accepts_both_id_schemes() {
        let store = MemoryStore::new();
        let job = store
            .create_job(NewTrainingJob {
                replicate_job_id: Some("r8-resolve".to_string()),
                ..Default::default()
            })
            .await
            .unwrap();

        let by_internal = store.resolve_job(&job.job.id.to_string()).await.unwrap();
        let by_external = store.resolve_job("r8-resolve").await.unwrap();
        assert_eq!(by_internal.unwrap().job.id, job.job.id);
        assert_eq!(by_external.unwrap().job.id, job.job.id);
        assert!(store.resolve_job("missing").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_duplicate_external_id_rejected() {
        let store = MemoryStore::new();
        let new = NewTrainingJob {
            replicate_job_id: Some("r8-dup".to_string()),
            ..Default::default()
        };
        store.create_job(new.clone()).await.unwrap();
        assert!(matches!(
            store.create_job(new).await,
            Err(AppError::Conflict { .. })
        ));
    }
}

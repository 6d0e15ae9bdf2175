//! PostgreSQL provenance store
//!
//! Plain lookups go through SeaORM's query builder. Every write that must be
//! decided against the stored row (status guard, registration claim, `ip_id`
//! compare-and-set) is a single conditional SQL statement.

use crate::db::models::*;
use crate::db::DbPool;
use crate::errors::{AppError, Result};
use crate::store::{
    CandidateFilter, ImageRegistration, JobWithImages, NewTrainingJob, NotificationUpdate,
    ProvenanceStore, RegistrationRecord, RegistrationSummary, UpsertOutcome,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, DbBackend, EntityTrait,
    FromQueryResult, QueryFilter, QueryOrder, QuerySelect, Set, SqlErr, Statement,
    TransactionTrait,
};
use std::collections::HashMap;
use std::time::Duration;
use uuid::Uuid;

/// SQL expression ranking a status column; mirrors [`TrainingStatus::rank`]
fn status_rank(column: &str) -> String {
    format!(
        "(CASE {column} \
            WHEN 'pending' THEN 0 \
            WHEN 'starting' THEN 1 \
            WHEN 'processing' THEN 2 \
            WHEN 'succeeded' THEN 3 \
            WHEN 'failed' THEN 3 \
            WHEN 'canceled' THEN 3 \
            ELSE 0 END)"
    )
}

const TERMINAL_STATUSES: &str = "('succeeded', 'failed', 'canceled')";

/// Repository for data access operations
#[derive(Clone)]
pub struct Repository {
    pool: DbPool,
}

impl Repository {
    /// Create a new repository with the given connection pool
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    /// Get the read connection
    fn read_conn(&self) -> &DatabaseConnection {
        self.pool.read()
    }

    /// Get the write connection
    fn write_conn(&self) -> &DatabaseConnection {
        self.pool.write()
    }

    async fn images_for(&self, job_ids: &[Uuid]) -> Result<HashMap<Uuid, Vec<TrainingImage>>> {
        if job_ids.is_empty() {
            return Ok(HashMap::new());
        }

        let images = TrainingImageEntity::find()
            .filter(TrainingImageColumn::TrainingJobId.is_in(job_ids.iter().copied()))
            .order_by_asc(TrainingImageColumn::DisplayOrder)
            .all(self.read_conn())
            .await?;

        let mut grouped: HashMap<Uuid, Vec<TrainingImage>> = HashMap::new();
        for image in images {
            grouped.entry(image.training_job_id).or_default().push(image);
        }
        Ok(grouped)
    }

    async fn with_images(&self, job: Option<TrainingJob>) -> Result<Option<JobWithImages>> {
        let Some(job) = job else {
            return Ok(None);
        };
        let mut images = self.images_for(&[job.id]).await?;
        let images = images.remove(&job.id).unwrap_or_default();
        Ok(Some(JobWithImages { job, images }))
    }
}

#[async_trait]
impl ProvenanceStore for Repository {
    async fn ping(&self) -> Result<()> {
        self.pool.ping().await
    }

    async fn create_job(&self, new: NewTrainingJob) -> Result<JobWithImages> {
        let job_id = Uuid::new_v4();
        let now = Utc::now();
        let txn = self.write_conn().begin().await?;

        let job = TrainingJobActiveModel {
            id: Set(job_id),
            replicate_job_id: Set(new.replicate_job_id.clone()),
            model_name: Set(new.model_name),
            trigger_word: Set(new.trigger_word),
            status: Set(TrainingStatus::Pending.as_str().to_string()),
            input_images_url: Set(new.input_images_url),
            steps: Set(new.steps),
            captioning: Set(new.captioning),
            output_url: Set(None),
            error_message: Set(None),
            logs: Set(None),
            predict_time: Set(None),
            total_time: Set(None),
            started_at: Set(None),
            completed_at: Set(None),
            ip_id: Set(None),
            registration_tx_hash: Set(None),
            parent_ip_ids: Set(serde_json::json!(new.parent_ip_ids)),
            registration_failed: Set(false),
            registration_failure_reason: Set(None),
            registration_failed_at: Set(None),
            registration_claimed_at: Set(None),
            hidden: Set(false),
            created_at: Set(now.into()),
            updated_at: Set(now.into()),
        };

        let job = job.insert(&txn).await.map_err(|e| match e.sql_err() {
            Some(SqlErr::UniqueConstraintViolation(_)) => AppError::Conflict {
                message: format!(
                    "training job {} already exists",
                    new.replicate_job_id.as_deref().unwrap_or_default()
                ),
            },
            _ => AppError::Database(e),
        })?;

        let mut images = Vec::with_capacity(new.images.len());
        for (order, image) in new.images.into_iter().enumerate() {
            let image = TrainingImageActiveModel {
                id: Set(Uuid::new_v4()),
                training_job_id: Set(job_id),
                display_order: Set(order as i32),
                image_url: Set(image.image_url),
                story_ip_id: Set(None),
                registration_status: Set(ImageRegistrationStatus::Pending.into()),
                created_at: Set(now.into()),
            };
            images.push(image.insert(&txn).await?);
        }

        txn.commit().await?;

        Ok(JobWithImages { job, images })
    }

    async fn record_image_registration(
        &self,
        image_id: Uuid,
        registration: ImageRegistration,
    ) -> Result<bool> {
        let (ip_id, status): (Option<String>, String) = match registration {
            ImageRegistration::Registered { ip_id } => {
                (Some(ip_id), ImageRegistrationStatus::Registered.into())
            }
            ImageRegistration::Failed => (None, ImageRegistrationStatus::Failed.into()),
        };

        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE training_images
            SET story_ip_id = COALESCE($2, story_ip_id),
                registration_status = $3
            WHERE id = $1 AND registration_status = 'pending'
            "#,
            vec![image_id.into(), ip_id.into(), status.into()],
        );

        let result = self.write_conn().execute(stmt).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn upsert_job_on_notification(
        &self,
        external_id: &str,
        update: &NotificationUpdate,
    ) -> Result<UpsertOutcome> {
        let sql = format!(
            r#"
            INSERT INTO training_jobs (
                id, replicate_job_id, status, trigger_word, input_images_url, steps,
                captioning, output_url, error_message, logs, predict_time, total_time,
                started_at, completed_at, parent_ip_ids, registration_failed, hidden,
                created_at, updated_at
            )
            VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14,
                '[]'::jsonb, FALSE, FALSE, NOW(), NOW()
            )
            ON CONFLICT (replicate_job_id) DO UPDATE SET
                status = EXCLUDED.status,
                trigger_word = COALESCE(EXCLUDED.trigger_word, training_jobs.trigger_word),
                input_images_url = COALESCE(EXCLUDED.input_images_url, training_jobs.input_images_url),
                steps = COALESCE(EXCLUDED.steps, training_jobs.steps),
                captioning = COALESCE(EXCLUDED.captioning, training_jobs.captioning),
                output_url = COALESCE(EXCLUDED.output_url, training_jobs.output_url),
                error_message = COALESCE(EXCLUDED.error_message, training_jobs.error_message),
                logs = COALESCE(EXCLUDED.logs, training_jobs.logs),
                predict_time = COALESCE(EXCLUDED.predict_time, training_jobs.predict_time),
                total_time = COALESCE(EXCLUDED.total_time, training_jobs.total_time),
                started_at = COALESCE(EXCLUDED.started_at, training_jobs.started_at),
                completed_at = COALESCE(EXCLUDED.completed_at, training_jobs.completed_at),
                updated_at = NOW()
            WHERE (training_jobs.ip_id IS NULL OR EXCLUDED.status = training_jobs.status)
              AND (EXCLUDED.status IN {terminal}
                   OR (training_jobs.status NOT IN {terminal}
                       AND {incoming} > {stored}))
            RETURNING *, (xmax = 0) AS inserted
            "#,
            terminal = TERMINAL_STATUSES,
            incoming = status_rank("EXCLUDED.status"),
            stored = status_rank("training_jobs.status"),
        );

        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            &sql,
            vec![
                Uuid::new_v4().into(),
                external_id.into(),
                update.status.as_str().into(),
                update.trigger_word.clone().into(),
                update.input_images_url.clone().into(),
                update.steps.into(),
                update.captioning.clone().into(),
                update.output_url.clone().into(),
                update.error_message.clone().into(),
                update.logs.clone().into(),
                update.predict_time.into(),
                update.total_time.into(),
                update.started_at.into(),
                update.completed_at.into(),
            ],
        );

        if let Some(row) = self.write_conn().query_one(stmt).await? {
            let job = TrainingJob::from_query_result(&row, "")?;
            let inserted: bool = row.try_get("", "inserted")?;
            return Ok(if inserted {
                UpsertOutcome::Created(job)
            } else {
                UpsertOutcome::Updated(job)
            });
        }

        // Conflict target existed but the guard rejected the update
        let existing = TrainingJobEntity::find()
            .filter(TrainingJobColumn::ReplicateJobId.eq(external_id))
            .one(self.write_conn())
            .await?
            .ok_or_else(|| AppError::JobNotFound {
                id: external_id.to_string(),
            })?;

        Ok(UpsertOutcome::Unchanged(existing))
    }

    async fn find_job_by_id(&self, id: Uuid) -> Result<Option<JobWithImages>> {
        let job = TrainingJobEntity::find_by_id(id).one(self.read_conn()).await?;
        self.with_images(job).await
    }

    async fn find_job_by_external_id(&self, external_id: &str) -> Result<Option<JobWithImages>> {
        let job = TrainingJobEntity::find()
            .filter(TrainingJobColumn::ReplicateJobId.eq(external_id))
            .one(self.read_conn())
            .await?;
        self.with_images(job).await
    }

    async fn try_claim_registration(
        &self,
        job_id: Uuid,
        expected_ip_id: Option<&str>,
        lease: Duration,
    ) -> Result<bool> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE training_jobs
            SET registration_claimed_at = NOW()
            WHERE id = $1
              AND ip_id IS NOT DISTINCT FROM $2
              AND (registration_claimed_at IS NULL
                   OR registration_claimed_at <= NOW() - make_interval(secs => $3))
            "#,
            vec![
                job_id.into(),
                expected_ip_id.map(str::to_string).into(),
                lease.as_secs_f64().into(),
            ],
        );

        let result = self.write_conn().execute(stmt).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn release_registration_claim(&self, job_id: Uuid) -> Result<()> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            "UPDATE training_jobs SET registration_claimed_at = NULL WHERE id = $1",
            vec![job_id.into()],
        );
        self.write_conn().execute(stmt).await?;
        Ok(())
    }

    async fn record_registration_success(
        &self,
        job_id: Uuid,
        expected_ip_id: Option<&str>,
        record: &RegistrationRecord,
    ) -> Result<bool> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE training_jobs
            SET ip_id = $3,
                registration_tx_hash = $4,
                parent_ip_ids = $5,
                registration_failed = FALSE,
                registration_failure_reason = NULL,
                registration_failed_at = NULL,
                registration_claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1 AND ip_id IS NOT DISTINCT FROM $2
            "#,
            vec![
                job_id.into(),
                expected_ip_id.map(str::to_string).into(),
                record.ip_id.clone().into(),
                record.tx_hash.clone().into(),
                serde_json::json!(record.parent_ip_ids).into(),
            ],
        );

        let result = self.write_conn().execute(stmt).await?;
        Ok(result.rows_affected() == 1)
    }

    async fn record_registration_failure(&self, job_id: Uuid, reason: &str) -> Result<()> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            UPDATE training_jobs
            SET registration_failed = TRUE,
                registration_failure_reason = $2,
                registration_failed_at = NOW(),
                registration_claimed_at = NULL,
                updated_at = NOW()
            WHERE id = $1
            "#,
            vec![job_id.into(), reason.into()],
        );

        let result = self.write_conn().execute(stmt).await?;
        if result.rows_affected() == 0 {
            return Err(AppError::JobNotFound {
                id: job_id.to_string(),
            });
        }
        Ok(())
    }

    async fn find_registration_candidates(
        &self,
        filter: &CandidateFilter,
    ) -> Result<Vec<JobWithImages>> {
        let mut query = TrainingJobEntity::find()
            .filter(TrainingJobColumn::Status.eq(TrainingStatus::Succeeded.as_str()))
            .filter(TrainingJobColumn::TriggerWord.is_not_null())
            .filter(TrainingJobColumn::OutputUrl.is_not_null())
            .filter(TrainingJobColumn::CompletedAt.gte(filter.completed_after));

        if !filter.include_registered {
            query = query.filter(TrainingJobColumn::IpId.is_null());
        }

        let jobs = query
            .order_by_desc(TrainingJobColumn::CompletedAt)
            .order_by_asc(TrainingJobColumn::Id)
            .limit(filter.limit)
            .all(self.read_conn())
            .await?;

        let ids: Vec<Uuid> = jobs.iter().map(|job| job.id).collect();
        let mut images = self.images_for(&ids).await?;

        Ok(jobs
            .into_iter()
            .map(|job| {
                let images = images.remove(&job.id).unwrap_or_default();
                JobWithImages { job, images }
            })
            .collect())
    }

    async fn registration_summary(
        &self,
        completed_after: Option<DateTime<Utc>>,
    ) -> Result<RegistrationSummary> {
        let stmt = Statement::from_sql_and_values(
            DbBackend::Postgres,
            r#"
            SELECT
                COUNT(*) AS eligible,
                COUNT(*) FILTER (WHERE ip_id IS NOT NULL) AS registered,
                COUNT(*) FILTER (WHERE ip_id IS NULL) AS unregistered,
                COUNT(*) FILTER (WHERE ip_id IS NULL AND registration_failed) AS failed_attempts
            FROM training_jobs
            WHERE status = 'succeeded'
              AND trigger_word IS NOT NULL
              AND output_url IS NOT NULL
              AND ($1::timestamptz IS NULL OR completed_at >= $1)
            "#,
            vec![completed_after.into()],
        );

        let row = self
            .read_conn()
            .query_one(stmt)
            .await?
            .ok_or_else(|| AppError::Internal {
                message: "summary query returned no row".to_string(),
            })?;

        let count = |column: &str| -> Result<u64> {
            let value: i64 = row.try_get("", column)?;
            Ok(value.max(0) as u64)
        };

        Ok(RegistrationSummary {
            eligible: count("eligible")?,
            registered: count("registered")?,
            unregistered: count("unregistered")?,
            failed_attempts: count("failed_attempts")?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_rank_orders_lifecycle() {
        let sql = status_rank("EXCLUDED.status");
        assert!(sql.starts_with("(CASE EXCLUDED.status"));
        for status in ["pending", "starting", "processing", "succeeded", "failed", "canceled"] {
            assert!(sql.contains(&format!("'{}'", status)));
        }
    }

    #[test]
    fn test_terminal_list_matches_enum() {
        for status in TrainingStatus::TERMINAL {
            assert!(TERMINAL_STATUSES.contains(status.as_str()));
        }
    }
}

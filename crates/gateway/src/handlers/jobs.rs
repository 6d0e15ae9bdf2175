//! Training job lookup handlers

use crate::app::AppState;
use axum::{
    extract::{Path, State},
    Json,
};
use serde::Serialize;
use storyforge_common::{
    errors::{AppError, Result},
    store::{find_parent_ip_set, JobWithImages, ProvenanceFlow},
    MAX_PARENT_IPS,
};
use uuid::Uuid;

#[derive(Serialize)]
pub struct ImageResponse {
    pub id: Uuid,
    pub display_order: i32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    pub registration_status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub story_ip_id: Option<String>,
}

#[derive(Serialize)]
pub struct RegistrationState {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tx_hash: Option<String>,
    pub parent_ip_ids: Vec<String>,
    pub failed: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failure_reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub failed_at: Option<String>,
}

/// Job status response
#[derive(Serialize)]
pub struct JobResponse {
    pub job_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub status: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trigger_word: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub steps: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub captioning: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output_url: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error_message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<String>,
    pub created_at: String,
    pub registration: RegistrationState,
    pub images: Vec<ImageResponse>,
}

impl From<JobWithImages> for JobResponse {
    fn from(found: JobWithImages) -> Self {
        let job = found.job;
        let parent_ip_ids = job.parent_ip_ids();

        Self {
            job_id: job.id,
            external_id: job.replicate_job_id,
            status: job.status,
            trigger_word: job.trigger_word,
            steps: job.steps,
            captioning: job.captioning,
            output_url: job.output_url,
            error_message: job.error_message,
            started_at: job.started_at.map(|dt| dt.to_rfc3339()),
            completed_at: job.completed_at.map(|dt| dt.to_rfc3339()),
            created_at: job.created_at.to_rfc3339(),
            registration: RegistrationState {
                ip_id: job.ip_id,
                tx_hash: job.registration_tx_hash,
                parent_ip_ids,
                failed: job.registration_failed,
                failure_reason: job.registration_failure_reason,
                failed_at: job.registration_failed_at.map(|dt| dt.to_rfc3339()),
            },
            images: found
                .images
                .into_iter()
                .map(|image| ImageResponse {
                    id: image.id,
                    display_order: image.display_order,
                    image_url: image.image_url,
                    registration_status: image.registration_status,
                    story_ip_id: image.story_ip_id,
                })
                .collect(),
        }
    }
}

/// Resolved provenance for a job
#[derive(Serialize)]
pub struct ProvenanceResponse {
    pub job_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub flow: Option<ProvenanceFlow>,
    pub parent_ip_ids: Vec<String>,
    pub parents_total: usize,
    /// How many parents a registration would submit
    pub parents_submitted: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip_id: Option<String>,
}

async fn load(state: &AppState, reference: &str) -> Result<JobWithImages> {
    state
        .store
        .resolve_job(reference)
        .await?
        .ok_or_else(|| AppError::JobNotFound {
            id: reference.to_string(),
        })
}

/// Get a job by internal id or provider id
pub async fn get_job(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Json<JobResponse>> {
    let job = load(&state, &reference).await?;
    Ok(Json(job.into()))
}

pub async fn get_provenance(
    State(state): State<AppState>,
    Path(reference): Path<String>,
) -> Result<Json<ProvenanceResponse>> {
    let job = load(&state, &reference).await?;
    let parents = find_parent_ip_set(&job);

    Ok(Json(ProvenanceResponse {
        job_id: job.job.id,
        external_id: job.job.replicate_job_id.clone(),
        flow: parents.flow,
        parents_total: parents.len(),
        parents_submitted: parents.len().min(MAX_PARENT_IPS),
        parent_ip_ids: parents.ip_ids,
        ip_id: job.job.ip_id,
    }))
}

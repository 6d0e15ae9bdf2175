//! Operator endpoints for registration retries

use crate::app::AppState;
use axum::{
    extract::{Path, Query, State},
    Json,
};
use serde::{Deserialize, Serialize};
use storyforge_common::{
    auth::AdminGuard,
    backfill::{BatchOptions, BatchReport, DryRunReport, JobReport},
    errors::Result,
    store::RegistrationSummary,
};
use tracing::info;
use validator::Validate;

#[derive(Debug, Default, Deserialize)]
pub struct RegisterQuery {
    #[serde(default)]
    pub force: bool,
}

/// Retry a single job's registration
pub async fn register_job(
    State(state): State<AppState>,
    admin: AdminGuard,
    Path(reference): Path<String>,
    Query(query): Query<RegisterQuery>,
) -> Result<Json<JobReport>> {
    info!(request_id = %admin.request_id, reference, force = query.force, "Admin registration retry");
    let report = state.orchestrator.retry_one(&reference, query.force).await?;
    Ok(Json(report))
}

#[derive(Debug, Default, Deserialize, Validate)]
pub struct RetryRequest {
    #[validate(range(min = 1, max = 500))]
    pub limit: Option<u64>,

    #[serde(default)]
    pub force: bool,

    #[validate(range(min = 1, max = 365))]
    pub max_age_days: Option<i64>,

    #[serde(default)]
    pub dry_run: bool,
}

#[derive(Serialize)]
#[serde(untagged)]
pub enum RetryReport {
    Batch(BatchReport),
    DryRun(DryRunReport),
}

#[derive(Serialize)]
pub struct RetryResponse {
    pub dry_run: bool,
    pub limit: u64,
    pub force: bool,
    pub max_age_days: i64,
    pub report: RetryReport,
}

/// Run a registration batch, or preview it with `dry_run`
pub async fn retry_registrations(
    State(state): State<AppState>,
    admin: AdminGuard,
    Json(request): Json<RetryRequest>,
) -> Result<Json<RetryResponse>> {
    request.validate()?;

    let defaults = state.batch_defaults();
    let options = BatchOptions {
        limit: request.limit.unwrap_or(defaults.limit),
        force: request.force,
        max_age_days: request.max_age_days.unwrap_or(defaults.max_age_days),
    };

    info!(
        request_id = %admin.request_id,
        limit = options.limit,
        force = options.force,
        dry_run = request.dry_run,
        "Admin registration batch"
    );

    let report = if request.dry_run {
        RetryReport::DryRun(state.orchestrator.dry_run_batch(options).await?)
    } else {
        RetryReport::Batch(state.orchestrator.retry_batch(options).await?)
    };

    Ok(Json(RetryResponse {
        dry_run: request.dry_run,
        limit: options.limit,
        force: options.force,
        max_age_days: options.max_age_days,
        report,
    }))
}

#[derive(Debug, Default, Deserialize)]
pub struct StatusQuery {
    pub max_age_days: Option<i64>,
}

/// Registration coverage over eligible jobs
pub async fn registration_status(
    State(state): State<AppState>,
    _admin: AdminGuard,
    Query(query): Query<StatusQuery>,
) -> Result<Json<RegistrationSummary>> {
    let summary = state.orchestrator.summary(query.max_age_days).await?;
    Ok(Json(summary))
}

//! Training provider webhook

use crate::app::AppState;
use axum::{body::Bytes, extract::State, http::HeaderMap, Json};
use serde::Serialize;
use storyforge_common::{
    auth::{verify_webhook_token, WEBHOOK_TOKEN_HEADER},
    db::models::TrainingStatus,
    errors::Result,
    webhook::TrainingNotification,
};
use uuid::Uuid;

#[derive(Serialize)]
pub struct WebhookResponse {
    pub received: bool,
    pub job_id: Uuid,
    pub external_id: String,
    /// Stored status after reconciliation
    pub status: TrainingStatus,
    pub outcome: &'static str,
    pub registration_dispatched: bool,
}

/// Receive a training status notification.
///
/// Answers 200 as soon as the notification is stored; registration runs
/// detached so its failures never make the provider redeliver.
pub async fn training_notification(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Json<WebhookResponse>> {
    let presented = headers
        .get(WEBHOOK_TOKEN_HEADER)
        .and_then(|v| v.to_str().ok());
    verify_webhook_token(state.config.webhook.shared_token.as_deref(), presented)?;

    let notification = TrainingNotification::from_slice(&body)?;
    let result = state.reconciler.handle_notification(&notification).await?;

    Ok(Json(WebhookResponse {
        received: true,
        job_id: result.job_id,
        external_id: result.external_id,
        status: result.status,
        outcome: result.outcome.as_str(),
        registration_dispatched: result.registration_dispatched,
    }))
}

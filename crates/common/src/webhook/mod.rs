//! Training webhook reconciler
//!
//! Applies provider notifications to the store and kicks off derivative
//! registration once a job succeeds. Notifications may arrive duplicated,
//! late or out of order; the stored status only moves forward:
//!
//! | stored \ incoming | earlier | same (non-terminal) | later | terminal |
//! |-------------------|---------|---------------------|-------|----------|
//! | none              | create  | create              | create| create   |
//! | non-terminal      | stale   | duplicate           | apply | apply    |
//! | terminal          | after final state | after final state | after final state | apply |

use crate::db::models::TrainingStatus;
use crate::engine::{RegistrationEngine, RegistrationOutcome};
use crate::errors::{AppError, Result};
use crate::metrics;
use crate::store::{NotificationUpdate, ProvenanceStore, UpsertOutcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn, Instrument};
use uuid::Uuid;

/// Notification body as posted by the training provider
#[derive(Debug, Clone, Default, Deserialize)]
pub struct TrainingNotification {
    pub id: Option<String>,
    pub status: Option<String>,
    /// Weights reference: a string, an array of strings or `{"weights": ...}`
    #[serde(default)]
    pub output: Option<Value>,
    /// Failure reason: a string or a structured object
    #[serde(default)]
    pub error: Option<Value>,
    #[serde(default)]
    pub input: Option<Value>,
    #[serde(default)]
    pub metrics: Option<NotificationMetrics>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub logs: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NotificationMetrics {
    pub predict_time: Option<f64>,
    pub total_time: Option<f64>,
}

impl TrainingNotification {
    pub fn from_slice(body: &[u8]) -> Result<Self> {
        serde_json::from_slice(body).map_err(|e| AppError::InvalidFormat {
            message: format!("Malformed notification body: {}", e),
        })
    }

    /// The provider job id; notifications without one are rejected
    pub fn external_id(&self) -> Result<&str> {
        self.id
            .as_deref()
            .map(str::trim)
            .filter(|id| !id.is_empty())
            .ok_or_else(|| AppError::MissingField {
                field: "id".to_string(),
            })
    }

    pub fn training_status(&self) -> Result<TrainingStatus> {
        let raw = self.status.as_deref().ok_or_else(|| AppError::MissingField {
            field: "status".to_string(),
        })?;
        raw.trim()
            .to_ascii_lowercase()
            .parse()
            .map_err(|message| AppError::InvalidFormat { message })
    }

    pub fn output_url(&self) -> Option<String> {
        match self.output.as_ref()? {
            Value::String(url) => Some(url.clone()),
            Value::Array(items) => items.iter().find_map(|v| v.as_str().map(str::to_string)),
            Value::Object(fields) => fields
                .get("weights")
                .and_then(Value::as_str)
                .map(str::to_string),
            _ => None,
        }
    }

    pub fn error_message(&self) -> Option<String> {
        match self.error.as_ref()? {
            Value::Null => None,
            Value::String(message) => Some(message.clone()),
            other => Some(other.to_string()),
        }
    }

    fn input_field(&self, names: &[&str]) -> Option<&Value> {
        let input = self.input.as_ref()?;
        names
            .iter()
            .find_map(|name| input.get(*name).filter(|v| !v.is_null()))
    }

    pub fn trigger_word(&self) -> Option<String> {
        self.input_field(&["trigger_word"])
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    pub fn input_images_url(&self) -> Option<String> {
        self.input_field(&["input_images"])
            .and_then(Value::as_str)
            .map(str::to_string)
    }

    /// Captioning mode; the boolean `autocaption` flag maps to a mode name
    pub fn captioning(&self) -> Option<String> {
        match self.input_field(&["captioning", "autocaption"])? {
            Value::String(mode) => Some(mode.clone()),
            Value::Bool(true) => Some("automatic".to_string()),
            Value::Bool(false) => Some("none".to_string()),
            _ => None,
        }
    }

    pub fn steps(&self) -> Option<i32> {
        match self.input_field(&["steps", "training_steps"])? {
            Value::Number(n) => n.as_i64().and_then(|n| i32::try_from(n).ok()),
            Value::String(s) => s.trim().parse().ok(),
            _ => None,
        }
    }

    /// Everything in this notification the store keeps
    pub fn to_update(&self, status: TrainingStatus) -> NotificationUpdate {
        let metrics = self.metrics.clone().unwrap_or_default();
        NotificationUpdate {
            status,
            trigger_word: self.trigger_word(),
            input_images_url: self.input_images_url(),
            steps: self.steps(),
            captioning: self.captioning(),
            output_url: self.output_url(),
            error_message: self.error_message(),
            logs: self.logs.clone(),
            predict_time: metrics.predict_time,
            total_time: metrics.total_time,
            started_at: self.started_at,
            completed_at: self.completed_at,
        }
    }
}

/// What happened to one notification
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ReconcileOutcome {
    /// First notification for this job; row inserted
    Created,
    Applied,
    /// Same non-terminal status as stored
    IgnoredDuplicate,
    /// Non-terminal status after the job finished, or a different
    /// terminal status once the job is registered
    IgnoredAfterFinalState,
    /// Earlier lifecycle status than stored
    IgnoredStale,
}

impl ReconcileOutcome {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReconcileOutcome::Created => "created",
            ReconcileOutcome::Applied => "applied",
            ReconcileOutcome::IgnoredDuplicate => "ignored: duplicate",
            ReconcileOutcome::IgnoredAfterFinalState => "ignored: after final state",
            ReconcileOutcome::IgnoredStale => "ignored: stale",
        }
    }

    pub fn is_ignored(&self) -> bool {
        !matches!(self, ReconcileOutcome::Created | ReconcileOutcome::Applied)
    }

    /// Why `incoming` was rejected against `stored`
    fn rejected(stored: TrainingStatus, incoming: TrainingStatus) -> Self {
        if stored.is_terminal() {
            ReconcileOutcome::IgnoredAfterFinalState
        } else if stored == incoming {
            ReconcileOutcome::IgnoredDuplicate
        } else {
            ReconcileOutcome::IgnoredStale
        }
    }
}

/// Result of reconciling one notification
#[derive(Debug, Serialize)]
pub struct ReconcileResult {
    pub job_id: Uuid,
    pub external_id: String,
    pub status: TrainingStatus,
    pub outcome: ReconcileOutcome,
    /// A background registration was started
    pub registration_dispatched: bool,
    #[serde(skip)]
    pub registration_task: Option<JoinHandle<()>>,
}

pub struct Reconciler {
    store: Arc<dyn ProvenanceStore>,
    engine: Arc<RegistrationEngine>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn ProvenanceStore>, engine: Arc<RegistrationEngine>) -> Self {
        Self { store, engine }
    }

    /// Apply one notification. Returns once the notification is stored;
    /// registration, if needed, continues in a detached task.
    #[instrument(skip(self, notification), fields(external_id, status))]
    pub async fn handle_notification(
        &self,
        notification: &TrainingNotification,
    ) -> Result<ReconcileResult> {
        let external_id = notification.external_id()?.to_string();
        let status = notification.training_status()?;
        tracing::Span::current()
            .record("external_id", external_id.as_str())
            .record("status", status.as_str());

        if let Some(existing) = self.store.find_job_by_external_id(&external_id).await? {
            let stored = existing.job.training_status();
            if !existing.job.accepts(status) {
                return Ok(self.ignored(existing.job.id, external_id, stored, status));
            }
        }

        let update = notification.to_update(status);
        let upsert = self
            .store
            .upsert_job_on_notification(&external_id, &update)
            .await?;

        let outcome = match upsert {
            UpsertOutcome::Created(_) => ReconcileOutcome::Created,
            UpsertOutcome::Updated(_) => ReconcileOutcome::Applied,
            // Lost a race with a concurrent delivery
            UpsertOutcome::Unchanged(ref job) => {
                return Ok(self.ignored(job.id, external_id, job.training_status(), status));
            }
        };

        let job = upsert.job();
        info!(job_id = %job.id, outcome = outcome.as_str(), "Notification applied");
        metrics::record_notification(status.as_str(), outcome.as_str());

        let registration_task = match status {
            TrainingStatus::Succeeded if job.ip_id.is_none() => Some(self.dispatch(job.id)),
            TrainingStatus::Succeeded => {
                info!(ip_id = ?job.ip_id, "Job already registered");
                None
            }
            TrainingStatus::Failed => {
                warn!(error = ?update.error_message, "Training failed; no registration");
                None
            }
            _ => None,
        };

        Ok(ReconcileResult {
            job_id: job.id,
            external_id,
            status,
            outcome,
            registration_dispatched: registration_task.is_some(),
            registration_task,
        })
    }

    fn ignored(
        &self,
        job_id: Uuid,
        external_id: String,
        stored: TrainingStatus,
        incoming: TrainingStatus,
    ) -> ReconcileResult {
        let outcome = ReconcileOutcome::rejected(stored, incoming);
        info!(
            job_id = %job_id,
            stored = stored.as_str(),
            outcome = outcome.as_str(),
            "Notification ignored"
        );
        metrics::record_notification(incoming.as_str(), outcome.as_str());

        ReconcileResult {
            job_id,
            external_id,
            status: stored,
            outcome,
            registration_dispatched: false,
            registration_task: None,
        }
    }

    /// Register the job in the background from a fresh read of the store
    fn dispatch(&self, job_id: Uuid) -> JoinHandle<()> {
        let store = self.store.clone();
        let engine = self.engine.clone();

        tokio::spawn(
            async move {
                let job = match store.find_job_by_id(job_id).await {
                    Ok(Some(job)) => job,
                    Ok(None) => {
                        error!("Job vanished before registration");
                        return;
                    }
                    Err(e) => {
                        error!(error = %e, "Could not load job for registration");
                        return;
                    }
                };

                match engine.register_job_as_derivative(&job).await {
                    Ok(RegistrationOutcome::Failed { kind, reason }) => {
                        warn!(kind = kind.as_str(), reason, "Background registration failed");
                    }
                    Ok(outcome) => info!(outcome = outcome.label(), "Background registration finished"),
                    Err(e) => error!(error = %e, "Background registration aborted"),
                }
            }
            .instrument(tracing::info_span!("registration", job_id = %job_id)),
        )
    }
}

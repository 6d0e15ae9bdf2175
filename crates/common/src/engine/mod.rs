//! Derivative registration engine
//!
//! Registers a trained model as a derivative IP of the source images it was
//! trained on. A registration attempt runs:
//!
//! 1. short-circuit when the job already has an IP (unless forced)
//! 2. resolve the parent set; empty means `NoParentIps`, nothing is sent
//! 3. cap the parent set at [`MAX_PARENT_IPS`], keeping the first entries
//! 4. claim the job in the store so no other worker registers it
//! 5. one `mint_and_register_derivative` call with the default license terms
//! 6. persist the IP and the parents actually submitted, or the failure
//!
//! There is no standalone fallback and no internal retry. Expected failures
//! come back as [`RegistrationOutcome::Failed`]; store errors outside the
//! success write propagate.

use crate::config::AppConfig;
use crate::errors::Result;
use crate::metrics;
use crate::ratelimit::RegistrationPacer;
use crate::registration::{
    DerivativeRequest, MetadataAttribute, RegistrationClient, RegistrationMetadata,
    RegistrationResult,
};
use crate::store::{
    find_parent_ip_set, JobWithImages, ProvenanceFlow, ProvenanceStore, RegistrationRecord,
};
use serde::Serialize;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Most parents the registration service accepts in one call. Calls with
/// more than 16 to 21 parents have been seen to fail.
pub const MAX_PARENT_IPS: usize = 16;

pub const NO_PARENT_IPS_REASON: &str =
    "No parent IPs found: no registered training images and no stored parent collection";

/// Why an attempt did not produce a persisted IP
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    /// Neither provenance flow produced a parent
    NoParentIps,
    /// The registration service rejected or failed the call
    ExternalCallFailed,
    /// Registered externally but the store write failed
    PersistenceFailed,
}

impl FailureKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            FailureKind::NoParentIps => "no_parent_ips",
            FailureKind::ExternalCallFailed => "external_call_failed",
            FailureKind::PersistenceFailed => "persistence_failed",
        }
    }
}

/// Result of one registration attempt
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RegistrationOutcome {
    Registered {
        ip_id: String,
        tx_hash: Option<String>,
        parents_used: usize,
        parents_total: usize,
        flow: ProvenanceFlow,
    },
    /// The job already has an IP; nothing was sent
    AlreadyRegistered { ip_id: Option<String> },
    /// Another worker holds the registration claim; nothing was sent
    RegistrationInFlight,
    Failed { kind: FailureKind, reason: String },
}

impl RegistrationOutcome {
    pub fn label(&self) -> &'static str {
        match self {
            RegistrationOutcome::Registered { .. } => "registered",
            RegistrationOutcome::AlreadyRegistered { .. } => "already_registered",
            RegistrationOutcome::RegistrationInFlight => "in_flight",
            RegistrationOutcome::Failed { kind, .. } => kind.as_str(),
        }
    }

    pub fn is_failure(&self) -> bool {
        matches!(self, RegistrationOutcome::Failed { .. })
    }
}

/// Fixed parameters of every derivative registration
#[derive(Debug, Clone)]
pub struct EngineSettings {
    /// NFT collection the derivative token is minted in
    pub collection_ref: String,
    pub license_terms_id: String,
    pub claim_lease: Duration,
}

impl EngineSettings {
    pub fn from_config(config: &AppConfig) -> Self {
        Self {
            collection_ref: config.registration.collection_ref.clone(),
            license_terms_id: config.registration.default_license_terms_id.clone(),
            claim_lease: config.claim_lease(),
        }
    }
}

pub struct RegistrationEngine {
    store: Arc<dyn ProvenanceStore>,
    client: Arc<dyn RegistrationClient>,
    settings: EngineSettings,
}

impl RegistrationEngine {
    pub fn new(
        store: Arc<dyn ProvenanceStore>,
        client: Arc<dyn RegistrationClient>,
        settings: EngineSettings,
    ) -> Self {
        Self {
            store,
            client,
            settings,
        }
    }

    pub fn store(&self) -> &Arc<dyn ProvenanceStore> {
        &self.store
    }

    /// Register a job that has no IP yet
    pub async fn register_job_as_derivative(
        &self,
        job: &JobWithImages,
    ) -> Result<RegistrationOutcome> {
        self.register(job, false, None).await
    }

    /// Register `job`, replacing its current IP when `force` is set. The
    /// pacer, when given, is awaited right before the external call.
    #[instrument(
        skip(self, job, pacer),
        fields(job_id = %job.job.id, external_id = %job.display_id())
    )]
    pub async fn register(
        &self,
        job: &JobWithImages,
        force: bool,
        pacer: Option<&RegistrationPacer>,
    ) -> Result<RegistrationOutcome> {
        let job_id = job.job.id;
        let expected_ip = job.job.ip_id.as_deref();

        if let (Some(ip_id), false) = (expected_ip, force) {
            info!(ip_id, "Job already registered, skipping");
            metrics::record_registration("already_registered", None);
            return Ok(RegistrationOutcome::AlreadyRegistered {
                ip_id: Some(ip_id.to_string()),
            });
        }

        let parents = find_parent_ip_set(job);
        let Some(flow) = parents.flow else {
            warn!("No parent IPs resolved; derivative registration needs provenance");
            self.store
                .record_registration_failure(job_id, NO_PARENT_IPS_REASON)
                .await?;
            metrics::record_registration(FailureKind::NoParentIps.as_str(), None);
            return Ok(RegistrationOutcome::Failed {
                kind: FailureKind::NoParentIps,
                reason: NO_PARENT_IPS_REASON.to_string(),
            });
        };

        let parents_total = parents.len();
        let mut parent_ip_ids = parents.ip_ids;
        if parents_total > MAX_PARENT_IPS {
            warn!(
                parents_total,
                max = MAX_PARENT_IPS,
                %flow,
                "Parent set exceeds registration limit; submitting the first {}",
                MAX_PARENT_IPS
            );
            metrics::record_parent_truncation();
            parent_ip_ids.truncate(MAX_PARENT_IPS);
        }

        if !self
            .store
            .try_claim_registration(job_id, expected_ip, self.settings.claim_lease)
            .await?
        {
            info!("Registration already in flight for this job");
            metrics::record_registration("in_flight", None);
            return Ok(RegistrationOutcome::RegistrationInFlight);
        }

        if let Some(pacer) = pacer {
            pacer.until_ready().await;
        }

        let request = DerivativeRequest {
            collection_ref: self.settings.collection_ref.clone(),
            parent_ip_ids,
            license_terms_id: self.settings.license_terms_id.clone(),
            metadata: build_metadata(job, parents_total.min(MAX_PARENT_IPS)),
        };

        info!(
            parents_used = request.parent_ip_ids.len(),
            parents_total,
            %flow,
            provider = self.client.provider(),
            "Registering derivative IP"
        );

        let started = Instant::now();
        let result = match self.client.mint_and_register_derivative(&request).await {
            Ok(result) => result,
            Err(e) => RegistrationResult::failure(e.to_string()),
        };
        let elapsed = started.elapsed().as_secs_f64();

        let ip_id = match (result.success, result.ip_id) {
            (true, Some(ip_id)) => ip_id,
            (true, None) => {
                error!(
                    tx_hash = ?result.tx_hash,
                    "Registration reported success without an IP id; check the transaction"
                );
                let reason = match result.tx_hash.as_deref() {
                    Some(tx_hash) => format!(
                        "Registration reported success without an IP id (tx {})",
                        tx_hash
                    ),
                    None => "Registration reported success without an IP id".to_string(),
                };
                return self.fail(job_id, &reason, elapsed).await;
            }
            (false, _) => {
                let reason = result
                    .error
                    .unwrap_or_else(|| "Registration failed without an error message".to_string());
                return self.fail(job_id, &reason, elapsed).await;
            }
        };

        let parents_used = request.parent_ip_ids.len();
        let record = RegistrationRecord {
            ip_id: ip_id.clone(),
            tx_hash: result.tx_hash.clone(),
            parent_ip_ids: request.parent_ip_ids,
        };

        match self
            .store
            .record_registration_success(job_id, expected_ip, &record)
            .await
        {
            Ok(true) => {
                info!(ip_id = %ip_id, tx_hash = ?result.tx_hash, parents_used, "Derivative IP registered");
                metrics::record_registration("registered", Some(elapsed));
                Ok(RegistrationOutcome::Registered {
                    ip_id,
                    tx_hash: result.tx_hash,
                    parents_used,
                    parents_total,
                    flow,
                })
            }
            Ok(false) => {
                error!(
                    orphan_ip_id = %ip_id,
                    tx_hash = ?result.tx_hash,
                    "Job was registered by another writer; the new IP is orphaned"
                );
                self.release(job_id).await;
                metrics::record_registration("already_registered", Some(elapsed));
                let current = self
                    .store
                    .find_job_by_id(job_id)
                    .await
                    .ok()
                    .flatten()
                    .and_then(|j| j.job.ip_id);
                Ok(RegistrationOutcome::AlreadyRegistered { ip_id: current })
            }
            Err(e) => {
                error!(
                    ip_id = %ip_id,
                    tx_hash = ?result.tx_hash,
                    error = %e,
                    "REGISTERED BUT NOT PERSISTED: record ip_id and tx_hash manually"
                );
                self.release(job_id).await;
                metrics::record_registration(FailureKind::PersistenceFailed.as_str(), Some(elapsed));
                Ok(RegistrationOutcome::Failed {
                    kind: FailureKind::PersistenceFailed,
                    reason: e.to_string(),
                })
            }
        }
    }

    async fn fail(&self, job_id: Uuid, reason: &str, elapsed: f64) -> Result<RegistrationOutcome> {
        warn!(reason, "Derivative registration failed");
        if let Err(e) = self.store.record_registration_failure(job_id, reason).await {
            self.release(job_id).await;
            return Err(e);
        }
        metrics::record_registration(FailureKind::ExternalCallFailed.as_str(), Some(elapsed));
        Ok(RegistrationOutcome::Failed {
            kind: FailureKind::ExternalCallFailed,
            reason: reason.to_string(),
        })
    }

    async fn release(&self, job_id: Uuid) {
        if let Err(e) = self.store.release_registration_claim(job_id).await {
            warn!(error = %e, "Could not release registration claim; it will expire");
        }
    }
}

/// Metadata attached to the derivative token
pub fn build_metadata(job: &JobWithImages, parent_count: usize) -> RegistrationMetadata {
    let model = &job.job;
    let label = model
        .trigger_word
        .as_deref()
        .or(model.model_name.as_deref())
        .unwrap_or("Untitled");

    let steps = model
        .steps
        .map(|s| s.to_string())
        .unwrap_or_else(|| "an unrecorded number of".to_string());
    let captioning = model.captioning.as_deref().unwrap_or("default");

    RegistrationMetadata {
        title: format!("{} LoRA", label),
        description: format!(
            "Fine-tuned model trained for {} steps with {} captioning on {} source images.",
            steps,
            captioning,
            job.images.len()
        ),
        attributes: vec![
            MetadataAttribute::new("Replicate Job ID", job.display_id()),
            MetadataAttribute::new("Trigger Word", model.trigger_word.clone().unwrap_or_default()),
            MetadataAttribute::new("Parent IP Count", parent_count.to_string()),
        ],
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use crate::registration::{MockBehavior, MockRegistrationClient};
    use crate::store::MemoryStore;
    use crate::test_support::SeededJob;

    fn settings() -> EngineSettings {
        EngineSettings {
            collection_ref: "0xcollection".to_string(),
            license_terms_id: "1".to_string(),
            claim_lease: Duration::from_secs(300),
        }
    }

    fn engine() -> (Arc<MemoryStore>, Arc<MockRegistrationClient>, RegistrationEngine) {
        let store = Arc::new(MemoryStore::new());
        let client = Arc::new(MockRegistrationClient::new());
        let engine = RegistrationEngine::new(store.clone(), client.clone(), settings());
        (store, client, engine)
    }

    #[tokio::test]
    async fn test_registers_with_child_records() {
        let (store, client, engine) = engine();
        let job = SeededJob::new("r8-a")
            .collection(&["X1"])
            .registered_images(&["P1", "P2", "P3"])
            .insert(&store)
            .await;

        let outcome = engine.register_job_as_derivative(&job).await.unwrap();
        let RegistrationOutcome::Registered { ip_id, parents_used, parents_total, flow, .. } =
            outcome.clone()
        else {
            panic!("expected registration, got {:?}", outcome);
        };
        assert_eq!((parents_used, parents_total), (3, 3));
        assert_eq!(flow, ProvenanceFlow::ChildRecords);

        let calls = client.derivative_calls();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0].parent_ip_ids, vec!["P1", "P2", "P3"]);
        assert_eq!(calls[0].license_terms_id, "1");
        assert_eq!(calls[0].collection_ref, "0xcollection");

        let stored = store.find_job_by_id(job.job.id).await.unwrap().unwrap();
        assert_eq!(stored.job.ip_id, Some(ip_id));
        assert_eq!(stored.job.parent_ip_ids(), vec!["P1", "P2", "P3"]);
        assert!(stored.job.registration_claimed_at.is_none());
    }

    #[tokio::test]
    async fn test_already_registered_makes_no_call() {
        let (store, client, engine) = engine();
        let job = SeededJob::new("r8-p1").collection(&["X1"]).insert(&store).await;
        engine.register_job_as_derivative(&job).await.unwrap();

        let job = store.find_job_by_id(job.job.id).await.unwrap().unwrap();
        let outcome = engine.register_job_as_derivative(&job).await.unwrap();

        assert_eq!(
            outcome,
            RegistrationOutcome::AlreadyRegistered { ip_id: job.job.ip_id.clone() }
        );
        assert_eq!(client.call_count(), 1);
    }

    #[tokio::test]
    async fn test_no_parents_fails_fast() {
        let (store, client, engine) = engine();
        let job = SeededJob::new("r8-p3").insert(&store).await;

        let outcome = engine.register_job_as_derivative(&job).await.unwrap();

        assert!(matches!(
            outcome,
            RegistrationOutcome::Failed { kind: FailureKind::NoParentIps, .. }
        ));
        assert_eq!(client.call_count(), 0);

        let stored = store.find_job_by_id(job.job.id).await.unwrap().unwrap();
        assert!(stored.job.registration_failed);
        assert!(stored.job.ip_id.is_none());
    }

    #[tokio::test]
    async fn test_parent_set_truncated_to_first_sixteen() {
        let (store, client, engine) = engine();
        let parents: Vec<String> = (1..=18).map(|i| format!("Q{}", i)).collect();
        let refs: Vec<&str> = parents.iter().map(String::as_str).collect();
        let job = SeededJob::new("r8-c").collection(&refs).insert(&store).await;

        let outcome = engine.register_job_as_derivative(&job).await.unwrap();

        assert!(matches!(
            outcome,
            RegistrationOutcome::Registered { parents_used: 16, parents_total: 18, .. }
        ));
        let submitted = &client.derivative_calls()[0].parent_ip_ids;
        assert_eq!(submitted.as_slice(), &parents[..16]);

        let stored = store.find_job_by_id(job.job.id).await.unwrap().unwrap();
        assert_eq!(stored.job.parent_ip_ids(), parents[..16].to_vec());
    }

    #[tokio::test]
    async fn test_external_failure_recorded_verbatim() {
        let (store, client, engine) = engine();
        client.set_behavior(MockBehavior::Fail("execution reverted: 0x1234".to_string()));
        let job = SeededJob::new("r8-fail").collection(&["X1"]).insert(&store).await;

        let outcome = engine.register_job_as_derivative(&job).await.unwrap();

        assert_eq!(
            outcome,
            RegistrationOutcome::Failed {
                kind: FailureKind::ExternalCallFailed,
                reason: "execution reverted: 0x1234".to_string(),
            }
        );
        let stored = store.find_job_by_id(job.job.id).await.unwrap().unwrap();
        assert!(stored.job.ip_id.is_none());
        assert_eq!(
            stored.job.registration_failure_reason.as_deref(),
            Some("execution reverted: 0x1234")
        );
        assert!(stored.job.registration_claimed_at.is_none());
    }

    #[tokio::test]
    async fn test_unrecorded_failure_releases_claim() {
        let (store, client, engine) = engine();
        client.set_behavior(MockBehavior::Fail("reverted".to_string()));
        let job = SeededJob::new("r8-unrecorded").collection(&["X1"]).insert(&store).await;
        store.fail_failure_writes(true);

        let result = engine.register_job_as_derivative(&job).await;

        assert!(matches!(result, Err(AppError::DatabaseConnection { .. })));
        let stored = store.find_job_by_id(job.job.id).await.unwrap().unwrap();
        assert!(stored.job.registration_claimed_at.is_none());

        store.fail_failure_writes(false);
        let retry = engine.register_job_as_derivative(&job).await.unwrap();
        assert_ne!(retry, RegistrationOutcome::RegistrationInFlight);
        assert_eq!(client.call_count(), 2);
    }

    #[tokio::test]
    async fn test_success_without_ip_keeps_tx_hash() {
        let (store, client, engine) = engine();
        client.set_behavior(MockBehavior::SucceedWithoutIp("0xfeed".to_string()));
        let job = SeededJob::new("r8-noip").collection(&["X1"]).insert(&store).await;

        let outcome = engine.register_job_as_derivative(&job).await.unwrap();

        assert!(matches!(
            outcome,
            RegistrationOutcome::Failed { kind: FailureKind::ExternalCallFailed, ref reason }
                if reason.contains("0xfeed")
        ));
        let stored = store.find_job_by_id(job.job.id).await.unwrap().unwrap();
        assert!(stored.job.ip_id.is_none());
        assert!(stored
            .job
            .registration_failure_reason
            .unwrap()
            .contains("0xfeed"));
    }

    #[tokio::test]
    async fn test_transport_error_is_external_failure() {
        let (store, client, engine) = engine();
        client.set_behavior(MockBehavior::Error("connection refused".to_string()));
        let job = SeededJob::new("r8-err").collection(&["X1"]).insert(&store).await;

        let outcome = engine.register_job_as_derivative(&job).await.unwrap();

        assert!(matches!(
            outcome,
            RegistrationOutcome::Failed { kind: FailureKind::ExternalCallFailed, ref reason }
                if reason.contains("connection refused")
        ));
    }

    #[tokio::test]
    async fn test_persistence_failure_after_registration() {
        let (store, client, engine) = engine();
        let job = SeededJob::new("r8-persist").collection(&["X1"]).insert(&store).await;
        store.fail_success_writes(true);

        let outcome = engine.register_job_as_derivative(&job).await.unwrap();

        assert!(matches!(
            outcome,
            RegistrationOutcome::Failed { kind: FailureKind::PersistenceFailed, .. }
        ));
        assert_eq!(client.call_count(), 1);
        let stored = store.find_job_by_id(job.job.id).await.unwrap().unwrap();
        assert!(stored.job.ip_id.is_none());
        assert!(stored.job.registration_claimed_at.is_none());
    }

    #[tokio::test]
    async fn test_held_claim_blocks_second_worker() {
        let (store, client, engine) = engine();
        let job = SeededJob::new("r8-claim").collection(&["X1"]).insert(&store).await;
        assert!(store
            .try_claim_registration(job.job.id, None, Duration::from_secs(300))
            .await
            .unwrap());

        let outcome = engine.register_job_as_derivative(&job).await.unwrap();

        assert_eq!(outcome, RegistrationOutcome::RegistrationInFlight);
        assert_eq!(client.call_count(), 0);
    }

    #[tokio::test]
    async fn test_forced_reregistration_replaces_ip() {
        let (store, client, engine) = engine();
        let job = SeededJob::new("r8-force").collection(&["X1"]).insert(&store).await;
        engine.register_job_as_derivative(&job).await.unwrap();
        let first = store.find_job_by_id(job.job.id).await.unwrap().unwrap();

        let outcome = engine.register(&first, true, None).await.unwrap();

        let RegistrationOutcome::Registered { ip_id, .. } = outcome.clone() else {
            panic!("expected registration, got {:?}", outcome);
        };
        assert_ne!(Some(ip_id.clone()), first.job.ip_id);
        assert_eq!(client.call_count(), 2);
        let stored = store.find_job_by_id(job.job.id).await.unwrap().unwrap();
        assert_eq!(stored.job.ip_id, Some(ip_id));
    }

    #[tokio::test]
    async fn test_forced_with_stale_view_does_not_overwrite() {
        let (store, _client, engine) = engine();
        let job = SeededJob::new("r8-stale").collection(&["X1"]).insert(&store).await;
        // Registered by someone else after `job` was read
        let other = crate::store::RegistrationRecord {
            ip_id: "0xother".to_string(),
            tx_hash: None,
            parent_ip_ids: vec!["X1".to_string()],
        };
        store
            .record_registration_success(job.job.id, None, &other)
            .await
            .unwrap();

        let outcome = engine.register(&job, true, None).await.unwrap();

        assert_eq!(outcome, RegistrationOutcome::RegistrationInFlight);
        let stored = store.find_job_by_id(job.job.id).await.unwrap().unwrap();
        assert_eq!(stored.job.ip_id.as_deref(), Some("0xother"));
    }

    #[tokio::test]
    async fn test_metadata_describes_training() {
        let store = MemoryStore::new();
        let job = SeededJob::new("r8-meta")
            .registered_images(&["P1", "P2"])
            .insert(&store)
            .await;

        let metadata = build_metadata(&job, 2);

        assert_eq!(metadata.title, "TOK LoRA");
        assert!(metadata.description.contains("1000 steps"));
        assert!(metadata.description.contains("automatic captioning"));
        assert!(metadata.description.contains("2 source images"));
        assert_eq!(metadata.attribute("Replicate Job ID"), Some("r8-meta"));
        assert_eq!(metadata.attribute("Trigger Word"), Some("TOK"));
        assert_eq!(metadata.attribute("Parent IP Count"), Some("2"));
    }

    #[test]
    fn test_outcome_serializes_with_tag() {
        let outcome = RegistrationOutcome::Failed {
            kind: FailureKind::NoParentIps,
            reason: "none".to_string(),
        };
        let json = serde_json::to_value(&outcome).unwrap();
        assert_eq!(json["outcome"], "failed");
        assert_eq!(json["kind"], "no_parent_ips");
    }
}

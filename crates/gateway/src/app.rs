//! Application state and routing

use crate::handlers;
use crate::middleware::{rate_limit, track_metrics};
use axum::{
    extract::FromRef,
    middleware,
    routing::{get, post},
    Router,
};
use std::sync::Arc;
use storyforge_common::{
    config::{AppConfig, AuthConfig},
    engine::EngineSettings,
    ratelimit::RegistrationPacer,
    BatchOptions, Orchestrator, ProvenanceStore, Reconciler, RegistrationClient,
    RegistrationEngine,
};
use tower_http::{
    cors::{Any, CorsLayer},
    request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
    timeout::TimeoutLayer,
    trace::TraceLayer,
};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<AppConfig>,
    pub auth: Arc<AuthConfig>,
    pub store: Arc<dyn ProvenanceStore>,
    pub reconciler: Arc<Reconciler>,
    pub orchestrator: Arc<Orchestrator>,
}

impl AppState {
    /// Wire the engine, reconciler and orchestrator around one store and
    /// one registration client
    pub fn build(
        config: Arc<AppConfig>,
        store: Arc<dyn ProvenanceStore>,
        client: Arc<dyn RegistrationClient>,
    ) -> Self {
        let engine = Arc::new(RegistrationEngine::new(
            store.clone(),
            client,
            EngineSettings::from_config(&config),
        ));
        let pacer = RegistrationPacer::new(config.pacing_interval(), config.backfill.pacing_burst);

        Self {
            auth: Arc::new(config.auth.clone()),
            reconciler: Arc::new(Reconciler::new(store.clone(), engine.clone())),
            orchestrator: Arc::new(Orchestrator::new(engine, pacer)),
            store,
            config,
        }
    }

    pub fn batch_defaults(&self) -> BatchOptions {
        BatchOptions::from_config(&self.config.backfill)
    }
}

impl FromRef<AppState> for Arc<AuthConfig> {
    fn from_ref(state: &AppState) -> Self {
        state.auth.clone()
    }
}

/// Create the main application router
pub fn create_router(state: AppState) -> Router {
    // CORS configuration
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    // Request ID propagation
    let request_id = SetRequestIdLayer::x_request_id(MakeRequestUuid);
    let propagate_id = PropagateRequestIdLayer::x_request_id();

    let mut api_routes = Router::new()
        // Provider webhook (optional shared token)
        .route("/webhooks/replicate", post(handlers::webhooks::training_notification))
        // Job endpoints
        .route("/jobs/{id}", get(handlers::jobs::get_job))
        .route("/jobs/{id}/provenance", get(handlers::jobs::get_provenance))
        // Admin endpoints (admin key)
        .route("/admin/jobs/{id}/register", post(handlers::admin::register_job))
        .route("/admin/registrations/retry", post(handlers::admin::retry_registrations))
        .route("/admin/registrations/status", get(handlers::admin::registration_status));

    let limits = &state.config.rate_limit;
    if limits.enabled {
        if let Some(limiter) = rate_limit::create_rate_limiter(limits.requests_per_second, limits.burst) {
            let limit = limits.requests_per_second;
            api_routes = api_routes.layer(middleware::from_fn(move |request, next| {
                rate_limit::rate_limit_middleware(limiter.clone(), limit, request, next)
            }));
        }
    }

    // Compose the app
    Router::new()
        .route("/health", get(handlers::health::health))
        .route("/ready", get(handlers::health::ready))
        .nest("/v1", api_routes)
        .layer(middleware::from_fn(track_metrics))
        .layer(TimeoutLayer::new(state.config.request_timeout()))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .layer(propagate_id)
        .layer(request_id)
        .with_state(state)
}

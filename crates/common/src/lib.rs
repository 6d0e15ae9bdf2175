//! StoryForge Common Library
//!
//! Shared code for the StoryForge gateway and retry tool:
//! - Database models and the provenance store
//! - External registration client abstraction
//! - Derivative registration engine
//! - Webhook reconciliation and backfill orchestration
//! - Error types, configuration, authentication and metrics

pub mod auth;
pub mod backfill;
pub mod config;
pub mod db;
pub mod engine;
pub mod errors;
pub mod metrics;
pub mod ratelimit;
pub mod registration;
pub mod store;
pub mod webhook;

#[cfg(test)]
mod test_support;

// Re-export commonly used types
pub use backfill::{BatchOptions, Orchestrator};
pub use config::AppConfig;
pub use db::{DbPool, Repository};
pub use engine::{RegistrationEngine, RegistrationOutcome, MAX_PARENT_IPS};
pub use errors::{AppError, Result};
pub use registration::RegistrationClient;
pub use store::{MemoryStore, ProvenanceStore};
pub use webhook::Reconciler;

/// Application version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

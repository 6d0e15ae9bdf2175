//! Configuration management for StoryForge services
//!
//! Supports loading configuration from:
//! - Environment variables (prefixed with APP__)
//! - Configuration files (config.toml, config.yaml)
//! - Default values

use config::{Config, ConfigError, Environment, File};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Main application configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AppConfig {
    /// Server configuration
    #[serde(default)]
    pub server: ServerConfig,

    /// Database configuration
    pub database: DatabaseConfig,

    /// IP registration service configuration
    #[serde(default)]
    pub registration: RegistrationConfig,

    /// Inbound webhook configuration
    #[serde(default)]
    pub webhook: WebhookConfig,

    /// Retry/backfill pacing and selection defaults
    #[serde(default)]
    pub backfill: BackfillConfig,

    /// Admin authentication configuration
    #[serde(default)]
    pub auth: AuthConfig,

    /// Observability configuration
    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Rate limiting configuration
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerConfig {
    /// Host to bind to
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on
    #[serde(default = "default_port")]
    pub port: u16,

    /// Request timeout in seconds
    #[serde(default = "default_request_timeout")]
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DatabaseConfig {
    /// Primary database URL (for writes)
    pub url: String,

    /// Read replica URL (optional, falls back to primary)
    pub read_url: Option<String>,

    /// Maximum number of connections
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,

    /// Minimum number of connections
    #[serde(default = "default_min_connections")]
    pub min_connections: u32,

    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_secs: u64,

    /// Idle timeout in seconds
    #[serde(default = "default_idle_timeout")]
    pub idle_timeout_secs: u64,

    /// Apply pending migrations on startup
    #[serde(default)]
    pub run_migrations: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RegistrationConfig {
    /// Registration provider: http, mock
    #[serde(default = "default_registration_provider")]
    pub provider: String,

    /// Base URL of the registration service
    pub api_base: Option<String>,

    /// Bearer key for the registration service
    pub api_key: Option<String>,

    /// SPG NFT collection the derivative tokens are minted into
    #[serde(default = "default_collection_ref")]
    pub collection_ref: String,

    /// License terms attached to every derivative registration
    #[serde(default = "default_license_terms_id")]
    pub default_license_terms_id: String,

    /// Request timeout in seconds
    #[serde(default = "default_registration_timeout")]
    pub timeout_secs: u64,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct WebhookConfig {
    /// Shared token expected in X-Webhook-Token. Unset accepts unsigned
    /// notifications, which is only appropriate for trusted deployments.
    pub shared_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct BackfillConfig {
    /// Minimum spacing between external registration calls (0 disables pacing)
    #[serde(default = "default_pacing_interval")]
    pub pacing_interval_ms: u64,

    /// Calls allowed back-to-back before pacing kicks in
    #[serde(default = "default_pacing_burst")]
    pub pacing_burst: u32,

    /// Default batch size for retry runs
    #[serde(default = "default_backfill_limit")]
    pub default_limit: u64,

    /// Only jobs completed within this many days are eligible
    #[serde(default = "default_max_age_days")]
    pub max_age_days: i64,

    /// How long a registration claim blocks other workers
    #[serde(default = "default_claim_lease")]
    pub claim_lease_secs: u64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuthConfig {
    /// SHA-256 hex digest of the admin API key (admin routes disabled when unset)
    pub admin_key_hash: Option<String>,

    /// Header carrying the admin API key
    #[serde(default = "default_admin_header")]
    pub admin_header: String,

    /// Request ID header name
    #[serde(default = "default_request_id_header")]
    pub request_id_header: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ObservabilityConfig {
    /// Log level / filter directive (debug, info, storyforge_common=debug)
    #[serde(default = "default_log_level")]
    pub log_level: String,

    /// Enable JSON logging
    #[serde(default = "default_json_logging")]
    pub json_logging: bool,

    /// Metrics port (0 to disable)
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct RateLimitConfig {
    /// Requests per second
    #[serde(default = "default_rate_limit")]
    pub requests_per_second: u32,

    /// Burst capacity
    #[serde(default = "default_burst")]
    pub burst: u32,

    /// Enable rate limiting
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// Default value functions
fn default_host() -> String { "0.0.0.0".to_string() }
fn default_port() -> u16 { 8080 }
fn default_request_timeout() -> u64 { 30 }
fn default_max_connections() -> u32 { 20 }
fn default_min_connections() -> u32 { 2 }
fn default_connect_timeout() -> u64 { 10 }
fn default_idle_timeout() -> u64 { 300 }
fn default_registration_provider() -> String { "http".to_string() }
fn default_collection_ref() -> String { "0xc32A8a0FF3beDDDa58393d022aF433e78739FAbc".to_string() }
fn default_license_terms_id() -> String { "1".to_string() }
fn default_registration_timeout() -> u64 { 120 }
fn default_pacing_interval() -> u64 { 2000 }
fn default_pacing_burst() -> u32 { 1 }
fn default_backfill_limit() -> u64 { 10 }
fn default_max_age_days() -> i64 { 7 }
fn default_claim_lease() -> u64 { 300 }
fn default_admin_header() -> String { "X-Admin-Key".to_string() }
fn default_request_id_header() -> String { "X-Request-ID".to_string() }
fn default_log_level() -> String { "info".to_string() }
fn default_json_logging() -> bool { true }
fn default_metrics_port() -> u16 { 9090 }
fn default_rate_limit() -> u32 { 50 }
fn default_burst() -> u32 { 100 }
fn default_enabled() -> bool { true }

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            request_timeout_secs: default_request_timeout(),
        }
    }
}

impl Default for RegistrationConfig {
    fn default() -> Self {
        Self {
            provider: default_registration_provider(),
            api_base: None,
            api_key: None,
            collection_ref: default_collection_ref(),
            default_license_terms_id: default_license_terms_id(),
            timeout_secs: default_registration_timeout(),
        }
    }
}

impl Default for BackfillConfig {
    fn default() -> Self {
        Self {
            pacing_interval_ms: default_pacing_interval(),
            pacing_burst: default_pacing_burst(),
            default_limit: default_backfill_limit(),
            max_age_days: default_max_age_days(),
            claim_lease_secs: default_claim_lease(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            admin_key_hash: None,
            admin_header: default_admin_header(),
            request_id_header: default_request_id_header(),
        }
    }
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            json_logging: default_json_logging(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            requests_per_second: default_rate_limit(),
            burst: default_burst(),
            enabled: default_enabled(),
        }
    }
}

impl AppConfig {
    /// Load configuration from environment and files
    pub fn load() -> Result<Self, ConfigError> {
        let env = std::env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        let config = Config::builder()
            // Load base config file
            .add_source(File::with_name("config/default").required(false))

            // Load environment-specific config
            .add_source(File::with_name(&format!("config/{}", env)).required(false))

            // Load local overrides
            .add_source(File::with_name("config/local").required(false))

            // Load from environment variables with APP__ prefix
            // e.g., APP__DATABASE__URL=postgres://...
            .add_source(
                Environment::with_prefix("APP")
                    .separator("__")
                    .try_parsing(true)
            )

            .build()?;

        config.try_deserialize()
    }

    /// Get request timeout as Duration
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.server.request_timeout_secs)
    }

    /// Spacing between paced registration calls, `None` when pacing is off
    pub fn pacing_interval(&self) -> Option<Duration> {
        match self.backfill.pacing_interval_ms {
            0 => None,
            ms => Some(Duration::from_millis(ms)),
        }
    }

    pub fn claim_lease(&self) -> Duration {
        Duration::from_secs(self.backfill.claim_lease_secs)
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            server: ServerConfig::default(),
            database: DatabaseConfig {
                url: "postgres://localhost/storyforge".to_string(),
                read_url: None,
                max_connections: default_max_connections(),
                min_connections: default_min_connections(),
                connect_timeout_secs: default_connect_timeout(),
                idle_timeout_secs: default_idle_timeout(),
                run_migrations: false,
            },
            registration: RegistrationConfig::default(),
            webhook: WebhookConfig::default(),
            backfill: BackfillConfig::default(),
            auth: AuthConfig::default(),
            observability: ObservabilityConfig::default(),
            rate_limit: RateLimitConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::default();
        assert_eq!(config.server.port, 8080);
        assert_eq!(config.backfill.max_age_days, 7);
        assert_eq!(config.registration.default_license_terms_id, "1");
    }

    #[test]
    fn test_zero_interval_disables_pacing() {
        let mut config = AppConfig::default();
        assert_eq!(config.pacing_interval(), Some(Duration::from_millis(2000)));

        config.backfill.pacing_interval_ms = 0;
        assert_eq!(config.pacing_interval(), None);
    }

    #[test]
    fn test_partial_sections_fill_defaults() {
        let config: AppConfig = Config::builder()
            .set_override("database.url", "postgres://db/test")
            .unwrap()
            .set_override("backfill.pacing_interval_ms", 1500)
            .unwrap()
            .build()
            .unwrap()
            .try_deserialize()
            .unwrap();

        assert_eq!(config.database.url, "postgres://db/test");
        assert_eq!(config.backfill.pacing_interval_ms, 1500);
        assert_eq!(config.backfill.claim_lease_secs, 300);
        assert_eq!(config.auth.admin_header, "X-Admin-Key");
    }
}

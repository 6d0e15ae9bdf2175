//! External registration client
//!
//! Thin boundary over the service that mints an NFT in the configured
//! collection and registers it as an IP asset. Providers:
//! - `http`: JSON over HTTP to a registration service
//! - `mock`: in-process, records every call
//!
//! Clients are constructed explicitly and injected as
//! `Arc<dyn RegistrationClient>`; nothing here is global.

use crate::config::RegistrationConfig;
use crate::errors::{AppError, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// One `trait_type`/`value` pair in the metadata attribute list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetadataAttribute {
    pub trait_type: String,
    pub value: String,
}

impl MetadataAttribute {
    pub fn new(trait_type: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            trait_type: trait_type.into(),
            value: value.into(),
        }
    }
}

/// Descriptive payload attached to the minted token and the IP asset
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegistrationMetadata {
    pub title: String,
    pub description: String,
    pub attributes: Vec<MetadataAttribute>,
}

impl RegistrationMetadata {
    pub fn attribute(&self, trait_type: &str) -> Option<&str> {
        self.attributes
            .iter()
            .find(|a| a.trait_type == trait_type)
            .map(|a| a.value.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DerivativeRequest {
    pub collection_ref: String,
    pub parent_ip_ids: Vec<String>,
    pub license_terms_id: String,
    pub metadata: RegistrationMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StandaloneRequest {
    pub collection_ref: String,
    pub metadata: RegistrationMetadata,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LicenseTokenRequest {
    pub licensor_ip_id: String,
    pub license_terms_id: String,
    pub amount: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub receiver: Option<String>,
}

/// What the registration service reported for one call
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegistrationResult {
    pub success: bool,
    #[serde(default)]
    pub ip_id: Option<String>,
    #[serde(default)]
    pub tx_hash: Option<String>,
    #[serde(default)]
    pub error: Option<String>,
}

impl RegistrationResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            ip_id: None,
            tx_hash: None,
            error: Some(error.into()),
        }
    }
}

/// Operations offered by the registration service
#[async_trait]
pub trait RegistrationClient: Send + Sync {
    /// Mint a token and register it as a derivative of `parent_ip_ids`
    async fn mint_and_register_derivative(
        &self,
        request: &DerivativeRequest,
    ) -> Result<RegistrationResult>;

    /// Mint a token and register it as an IP with no parents
    async fn mint_and_register_standalone(
        &self,
        request: &StandaloneRequest,
    ) -> Result<RegistrationResult>;

    async fn mint_license_tokens(&self, request: &LicenseTokenRequest)
        -> Result<RegistrationResult>;

    /// Provider name for logs
    fn provider(&self) -> &str;
}

/// Registration service reached over HTTP
pub struct HttpRegistrationClient {
    client: reqwest::Client,
    base_url: String,
    api_key: Option<String>,
}

impl HttpRegistrationClient {
    pub fn new(base_url: String, api_key: Option<String>, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder().timeout(timeout).build()?;

        Ok(Self {
            client,
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key,
        })
    }

    async fn post<T: Serialize + Sync>(&self, path: &str, body: &T) -> Result<RegistrationResult> {
        let url = format!("{}{}", self.base_url, path);

        let mut request = self.client.post(&url).json(body);
        if let Some(ref key) = self.api_key {
            request = request.bearer_auth(key);
        }

        let response = request.send().await.map_err(|e| AppError::Registration {
            message: format!("Request to {} failed: {}", path, e),
        })?;

        let status = response.status();
        let body = response.text().await.map_err(|e| AppError::Registration {
            message: format!("Reading {} response from {} failed: {}", status, path, e),
        })?;

        match serde_json::from_str::<RegistrationResult>(&body) {
            Ok(result) if status.is_success() => Ok(result),
            // Error bodies in the service's own shape carry the real reason
            Ok(result) if result.error.is_some() => Ok(RegistrationResult {
                success: false,
                ..result
            }),
            _ if status.is_success() => Err(AppError::Registration {
                message: format!("Unparseable response from {}: {}", path, body),
            }),
            _ => Ok(RegistrationResult::failure(format!(
                "Registration service returned {}: {}",
                status, body
            ))),
        }
    }
}

#[async_trait]
impl RegistrationClient for HttpRegistrationClient {
    async fn mint_and_register_derivative(
        &self,
        request: &DerivativeRequest,
    ) -> Result<RegistrationResult> {
        self.post("/ip/derivative", request).await
    }

    async fn mint_and_register_standalone(
        &self,
        request: &StandaloneRequest,
    ) -> Result<RegistrationResult> {
        self.post("/ip/standalone", request).await
    }

    async fn mint_license_tokens(
        &self,
        request: &LicenseTokenRequest,
    ) -> Result<RegistrationResult> {
        self.post("/license/tokens", request).await
    }

    fn provider(&self) -> &str {
        "http"
    }
}

/// A call seen by [`MockRegistrationClient`]
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RecordedCall {
    Derivative(DerivativeRequest),
    Standalone(StandaloneRequest),
    LicenseTokens(LicenseTokenRequest),
}

/// How the mock answers
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockBehavior {
    Succeed,
    /// Report success with this tx hash but no IP id
    SucceedWithoutIp(String),
    /// Report a failure with this reason
    Fail(String),
    /// Return a transport-level error
    Error(String),
}

/// Registration client that never leaves the process
pub struct MockRegistrationClient {
    calls: Mutex<Vec<RecordedCall>>,
    behavior: Mutex<MockBehavior>,
    latency: Duration,
}

impl Default for MockRegistrationClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockRegistrationClient {
    pub fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            behavior: Mutex::new(MockBehavior::Succeed),
            latency: Duration::ZERO,
        }
    }

    /// Hold every call open for `latency` before answering
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    pub fn set_behavior(&self, behavior: MockBehavior) {
        *self.behavior.lock().unwrap_or_else(|p| p.into_inner()) = behavior;
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).clone()
    }

    pub fn derivative_calls(&self) -> Vec<DerivativeRequest> {
        self.calls()
            .into_iter()
            .filter_map(|call| match call {
                RecordedCall::Derivative(request) => Some(request),
                _ => None,
            })
            .collect()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap_or_else(|p| p.into_inner()).len()
    }

    async fn answer(&self, call: RecordedCall) -> Result<RegistrationResult> {
        self.calls
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .push(call);

        if !self.latency.is_zero() {
            tokio::time::sleep(self.latency).await;
        }

        let behavior = self.behavior.lock().unwrap_or_else(|p| p.into_inner()).clone();
        match behavior {
            MockBehavior::Succeed => {
                use rand::Rng;
                let mut rng = rand::thread_rng();
                Ok(RegistrationResult {
                    success: true,
                    ip_id: Some(format!("0x{:040x}", rng.gen::<u128>())),
                    tx_hash: Some(format!("0x{:032x}{:032x}", rng.gen::<u128>(), rng.gen::<u128>())),
                    error: None,
                })
            }
            MockBehavior::SucceedWithoutIp(tx_hash) => Ok(RegistrationResult {
                success: true,
                ip_id: None,
                tx_hash: Some(tx_hash),
                error: None,
            }),
            MockBehavior::Fail(reason) => Ok(RegistrationResult::failure(reason)),
            MockBehavior::Error(message) => Err(AppError::Registration { message }),
        }
    }
}

#[async_trait]
impl RegistrationClient for MockRegistrationClient {
    async fn mint_and_register_derivative(
        &self,
        request: &DerivativeRequest,
    ) -> Result<RegistrationResult> {
        self.answer(RecordedCall::Derivative(request.clone())).await
    }

    async fn mint_and_register_standalone(
        &self,
        request: &StandaloneRequest,
    ) -> Result<RegistrationResult> {
        self.answer(RecordedCall::Standalone(request.clone())).await
    }

    async fn mint_license_tokens(
        &self,
        request: &LicenseTokenRequest,
    ) -> Result<RegistrationResult> {
        self.answer(RecordedCall::LicenseTokens(request.clone())).await
    }

    fn provider(&self) -> &str {
        "mock"
    }
}

/// Create a registration client based on configuration
pub fn create_registration_client(
    config: &RegistrationConfig,
) -> Result<Arc<dyn RegistrationClient>> {
    match config.provider.as_str() {
        "http" => {
            let base_url = config.api_base.clone().ok_or_else(|| AppError::Configuration {
                message: "registration.api_base is required for the http provider".to_string(),
            })?;
            Ok(Arc::new(HttpRegistrationClient::new(
                base_url,
                config.api_key.clone(),
                Duration::from_secs(config.timeout_secs),
            )?))
        }
        "mock" => {
            tracing::warn!("Using mock registration client; nothing will be registered");
            Ok(Arc::new(MockRegistrationClient::new()))
        }
        other => Err(AppError::Configuration {
            message: format!("unknown registration provider '{}'", other),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn metadata() -> RegistrationMetadata {
        RegistrationMetadata {
            title: "Model".to_string(),
            description: "desc".to_string(),
            attributes: vec![MetadataAttribute::new("Trigger Word", "TOK")],
        }
    }

    #[tokio::test]
    async fn test_mock_records_derivative_calls() {
        let client = MockRegistrationClient::new();
        let request = DerivativeRequest {
            collection_ref: "0xcollection".to_string(),
            parent_ip_ids: vec!["P1".to_string()],
            license_terms_id: "1".to_string(),
            metadata: metadata(),
        };

        let result = client.mint_and_register_derivative(&request).await.unwrap();
        assert!(result.success);
        assert!(result.ip_id.unwrap().starts_with("0x"));
        assert_eq!(client.derivative_calls(), vec![request]);
    }

    #[tokio::test]
    async fn test_mock_failure_keeps_reason() {
        let client = MockRegistrationClient::new();
        client.set_behavior(MockBehavior::Fail("execution reverted".to_string()));

        let result = client
            .mint_and_register_standalone(&StandaloneRequest {
                collection_ref: "0xcollection".to_string(),
                metadata: metadata(),
            })
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("execution reverted"));
        assert_eq!(client.call_count(), 1);
    }

    /// Answer one request with a 200 whose body is cut short
    async fn truncated_response_server() -> String {
        use tokio::io::{AsyncReadExt, AsyncWriteExt};

        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut request = Vec::new();
            let mut chunk = [0u8; 1024];
            loop {
                let n = socket.read(&mut chunk).await.unwrap();
                if n == 0 {
                    break;
                }
                request.extend_from_slice(&chunk[..n]);
                let text = String::from_utf8_lossy(&request);
                if let Some(end) = text.find("\r\n\r\n") {
                    let length = text[..end]
                        .lines()
                        .find_map(|line| {
                            line.to_ascii_lowercase()
                                .strip_prefix("content-length:")
                                .map(|v| v.trim().parse::<usize>().unwrap_or(0))
                        })
                        .unwrap_or(0);
                    if request.len() >= end + 4 + length {
                        break;
                    }
                }
            }
            socket
                .write_all(b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 64\r\n\r\n{\"success\":")
                .await
                .unwrap();
            socket.shutdown().await.ok();
        });
        format!("http://{}", addr)
    }

    #[tokio::test]
    async fn test_truncated_body_is_registration_error() {
        let base_url = truncated_response_server().await;
        let client = HttpRegistrationClient::new(base_url, None, Duration::from_secs(5)).unwrap();

        let result = client
            .mint_and_register_standalone(&StandaloneRequest {
                collection_ref: "0xcollection".to_string(),
                metadata: metadata(),
            })
            .await;

        assert!(matches!(
            result,
            Err(AppError::Registration { ref message }) if message.contains("/ip/standalone")
        ));
    }

    #[test]
    fn test_request_wire_format() {
        let request = DerivativeRequest {
            collection_ref: "0xc".to_string(),
            parent_ip_ids: vec!["P1".to_string()],
            license_terms_id: "1".to_string(),
            metadata: metadata(),
        };
        let json = serde_json::to_value(&request).unwrap();
        assert_eq!(json["collectionRef"], "0xc");
        assert_eq!(json["parentIpIds"][0], "P1");
        assert_eq!(json["licenseTermsId"], "1");
        assert_eq!(json["metadata"]["attributes"][0]["trait_type"], "Trigger Word");
    }

    #[test]
    fn test_result_parses_partial_body() {
        let result: RegistrationResult =
            serde_json::from_str(r#"{"success":false,"error":"boom"}"#).unwrap();
        assert_eq!(result, RegistrationResult::failure("boom"));
    }

    #[test]
    fn test_factory_rejects_unknown_provider() {
        let config = RegistrationConfig {
            provider: "carrier-pigeon".to_string(),
            ..Default::default()
        };
        assert!(matches!(
            create_registration_client(&config),
            Err(AppError::Configuration { .. })
        ));
    }

    #[test]
    fn test_http_provider_requires_base_url() {
        let config = RegistrationConfig::default();
        assert!(create_registration_client(&config).is_err());

        let config = RegistrationConfig {
            api_base: Some("http://localhost:4000/".to_string()),
            ..Default::default()
        };
        let client = create_registration_client(&config).unwrap();
        assert_eq!(client.provider(), "http");
    }
}

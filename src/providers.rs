use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::errors::AppError;
use crate::models::{LookupParams, PhoneResult, ProviderConfig, ProviderKind};
use crate::rate_limiter::{QueuedRateLimiter, RateLimiterStats};

/// Attempts per limiter admission. Retries happen inside one token spend.
const LOOKUP_ATTEMPTS: u32 = 3;

/// Failure of a single wire call, classified for the retry policy.
#[derive(Debug)]
pub struct LookupError {
    pub message: String,
    /// `None` for transport-level failures (connect, timeout, decode).
    pub status: Option<StatusCode>,
}

impl LookupError {
    fn transport(err: reqwest::Error) -> Self {
        Self {
            message: err.to_string(),
            status: None,
        }
    }

    fn status(status: StatusCode, body: String) -> Self {
        Self {
            message: format!("status {}: {}", status, body),
            status: Some(status),
        }
    }

    /// Transport errors and 5xx responses are worth retrying; 4xx means the
    /// request itself is wrong and terminates the attempt sequence.
    fn is_retryable(&self) -> bool {
        match self.status {
            Some(status) => status.is_server_error(),
            None => true,
        }
    }
}

impl fmt::Display for LookupError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// One external lookup backend: a single wire call, no retry, no limiter.
/// Implementations differ only in request shape, auth placement and the field
/// the phone is extracted from.
#[async_trait]
pub trait PhoneLookupBackend: Send + Sync {
    async fn lookup(&self, params: &LookupParams) -> Result<Option<String>, LookupError>;
}

// ============ Orion Connect ============

/// POST with the key in an `x-auth-me` header; phone at `response.phone`.
pub struct OrionConnect {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl OrionConnect {
    pub fn new(endpoint: String, api_key: String, timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl PhoneLookupBackend for OrionConnect {
    async fn lookup(&self, params: &LookupParams) -> Result<Option<String>, LookupError> {
        #[derive(Deserialize)]
        struct OrionResponse {
            phone: Option<String>,
        }

        let body = json!({
            "fullName": params.full_name,
            "companyWebsite": params.company_website,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .header("x-auth-me", &self.api_key)
            .json(&body)
            .send()
            .await
            .map_err(LookupError::transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LookupError::status(status, body));
        }

        let parsed: OrionResponse = response.json().await.map_err(LookupError::transport)?;
        Ok(parsed.phone.filter(|p| !p.is_empty()))
    }
}

// ============ Astra Dialer ============

/// GET with the key and parameters in the query string; phone at
/// `response.phoneNumber`.
pub struct AstraDialer {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl AstraDialer {
    pub fn new(endpoint: String, api_key: String, timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl PhoneLookupBackend for AstraDialer {
    async fn lookup(&self, params: &LookupParams) -> Result<Option<String>, LookupError> {
        #[derive(Deserialize)]
        #[serde(rename_all = "camelCase")]
        struct AstraResponse {
            phone_number: Option<String>,
        }

        let response = self
            .client
            .get(&self.endpoint)
            .query(&[
                ("apiKey", self.api_key.as_str()),
                ("fullName", params.full_name.as_str()),
                ("companyWebsite", params.company_website.as_str()),
            ])
            .send()
            .await
            .map_err(LookupError::transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LookupError::status(status, body));
        }

        let parsed: AstraResponse = response.json().await.map_err(LookupError::transport)?;
        Ok(parsed.phone_number.filter(|p| !p.is_empty()))
    }
}

// ============ Nimbus Lookup ============

/// POST with the key as the `api` body field; phone at
/// `response.contact.phone`. The only backend that wants the job title.
pub struct NimbusLookup {
    client: reqwest::Client,
    endpoint: String,
    api_key: String,
}

impl NimbusLookup {
    pub fn new(endpoint: String, api_key: String, timeout: Duration) -> Result<Self, AppError> {
        Ok(Self {
            client: build_client(timeout)?,
            endpoint,
            api_key,
        })
    }
}

#[async_trait]
impl PhoneLookupBackend for NimbusLookup {
    async fn lookup(&self, params: &LookupParams) -> Result<Option<String>, LookupError> {
        #[derive(Deserialize)]
        struct NimbusContact {
            phone: Option<String>,
        }

        #[derive(Deserialize)]
        struct NimbusResponse {
            contact: Option<NimbusContact>,
        }

        let body = json!({
            "api": self.api_key,
            "fullName": params.full_name,
            "companyWebsite": params.company_website,
            "jobTitle": params.job_title,
        });

        let response = self
            .client
            .post(&self.endpoint)
            .json(&body)
            .send()
            .await
            .map_err(LookupError::transport)?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(LookupError::status(status, body));
        }

        let parsed: NimbusResponse = response.json().await.map_err(LookupError::transport)?;
        Ok(parsed
            .contact
            .and_then(|c| c.phone)
            .filter(|p| !p.is_empty()))
    }
}

fn build_client(timeout: Duration) -> Result<reqwest::Client, AppError> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| AppError::Provider(format!("Failed to create lookup client: {}", e)))
}

// ============ Provider combinator ============

/// Limiter stats merged with the provider's static attributes, for the stats
/// surface.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderStats {
    pub provider: String,
    pub cost_per_request: f64,
    pub priority: u32,
    pub enabled: bool,
    #[serde(flatten)]
    pub limiter: RateLimiterStats,
}

/// One configured provider: the backend plus its owned rate limiter and cost
/// decoration.
///
/// Every run of the backend is billed at `cost_per_request`, whether or not a
/// phone came back; that models the external API's per-request billing.
pub struct Provider {
    config: ProviderConfig,
    limiter: QueuedRateLimiter,
    backend: Box<dyn PhoneLookupBackend>,
}

impl Provider {
    pub fn new(config: ProviderConfig, backend: Box<dyn PhoneLookupBackend>) -> Self {
        let limiter = QueuedRateLimiter::new(
            config.rate_limit,
            config.time_window,
            config.max_concurrent,
        );
        Self {
            config,
            limiter,
            backend,
        }
    }

    /// Builds the backend matching `config.kind`.
    pub fn from_config(config: ProviderConfig) -> Result<Self, AppError> {
        let backend: Box<dyn PhoneLookupBackend> = match config.kind {
            ProviderKind::OrionConnect => Box::new(OrionConnect::new(
                config.endpoint.clone(),
                config.api_key.clone(),
                config.timeout,
            )?),
            ProviderKind::AstraDialer => Box::new(AstraDialer::new(
                config.endpoint.clone(),
                config.api_key.clone(),
                config.timeout,
            )?),
            ProviderKind::NimbusLookup => Box::new(NimbusLookup::new(
                config.endpoint.clone(),
                config.api_key.clone(),
                config.timeout,
            )?),
        };
        Ok(Self::new(config, backend))
    }

    pub fn name(&self) -> &str {
        &self.config.name
    }

    /// Defensive copy of the immutable configuration.
    pub fn config(&self) -> ProviderConfig {
        self.config.clone()
    }

    /// Runs the lookup under this provider's rate limiter. One admission
    /// covers the full retry sequence. An empty outcome is still a successful
    /// (and billed) run; only an unexpected internal failure surfaces as an
    /// error.
    pub async fn execute(&self, params: &LookupParams) -> Result<PhoneResult, AppError> {
        let phone = self
            .limiter
            .execute(|| self.lookup_with_retry(params))
            .await?;
        Ok(PhoneResult {
            phone,
            provider: self.config.name.clone(),
            cost: self.config.cost_per_request,
            timestamp: Utc::now(),
        })
    }

    /// Up to three attempts with exponential backoff (1s, 2s). Retries only
    /// on transport errors and 5xx; a 4xx terminates immediately with no
    /// phone. Exhaustion also resolves to no phone so the waterfall can fall
    /// through to the next provider.
    async fn lookup_with_retry(&self, params: &LookupParams) -> Result<Option<String>, AppError> {
        for attempt in 0..LOOKUP_ATTEMPTS {
            if attempt > 0 {
                let backoff = Duration::from_secs(1u64 << (attempt - 1));
                tokio::time::sleep(backoff).await;
            }
            match self.backend.lookup(params).await {
                Ok(phone) => return Ok(phone),
                Err(err) if !err.is_retryable() => {
                    tracing::warn!(
                        "Provider {} rejected the request ({}); not retrying",
                        self.config.name,
                        err
                    );
                    return Ok(None);
                }
                Err(err) => {
                    tracing::warn!(
                        "Provider {} attempt {}/{} failed: {}",
                        self.config.name,
                        attempt + 1,
                        LOOKUP_ATTEMPTS,
                        err
                    );
                }
            }
        }
        tracing::warn!(
            "Provider {} exhausted {} attempts without a response",
            self.config.name,
            LOOKUP_ATTEMPTS
        );
        Ok(None)
    }

    pub fn stats(&self) -> ProviderStats {
        ProviderStats {
            provider: self.config.name.clone(),
            cost_per_request: self.config.cost_per_request,
            priority: self.config.priority,
            enabled: self.config.enabled,
            limiter: self.limiter.stats(),
        }
    }
}

// ============ Registry ============

/// Owns the enabled providers, sorted by priority ascending. Immutable after
/// construction.
pub struct ProviderRegistry {
    providers: Vec<Arc<Provider>>,
}

impl ProviderRegistry {
    /// Filters out disabled configs, builds each provider with its limiter,
    /// and orders the result by priority (1 = tried first).
    pub fn from_configs(configs: Vec<ProviderConfig>) -> Result<Self, AppError> {
        let mut providers = configs
            .into_iter()
            .filter(|c| c.enabled)
            .map(Provider::from_config)
            .collect::<Result<Vec<_>, _>>()?;
        providers.sort_by_key(|p| p.config.priority);
        tracing::info!(
            "Provider registry initialized with {} enabled provider(s)",
            providers.len()
        );
        Ok(Self {
            providers: providers.into_iter().map(Arc::new).collect(),
        })
    }

    /// For tests and custom wiring: takes pre-built providers, applies the
    /// same ordering.
    pub fn new(mut providers: Vec<Provider>) -> Self {
        providers.sort_by_key(|p| p.config.priority);
        Self {
            providers: providers.into_iter().map(Arc::new).collect(),
        }
    }

    /// Providers in waterfall order.
    pub fn iter(&self) -> impl Iterator<Item = &Arc<Provider>> {
        self.providers.iter()
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    /// Linear scan by name over the enabled providers.
    pub fn get(&self, name: &str) -> Option<&Arc<Provider>> {
        self.providers.iter().find(|p| p.config.name == name)
    }

    pub fn stats(&self) -> Vec<ProviderStats> {
        self.providers.iter().map(|p| p.stats()).collect()
    }
}

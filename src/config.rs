use std::time::Duration;

use crate::models::{ProviderConfig, ProviderKind};

/// Runtime configuration, loaded once at startup.
#[derive(Debug, Clone)]
pub struct Config {
    pub database_url: String,
    pub port: u16,

    pub orion_endpoint: String,
    pub orion_api_key: String,
    pub astra_endpoint: String,
    pub astra_api_key: String,
    pub nimbus_endpoint: String,
    pub nimbus_api_key: String,

    pub email_verifier_endpoint: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        dotenvy::dotenv().ok();

        let config = Self {
            database_url: std::env::var("DB_URL")
                .or_else(|_| std::env::var("DATABASE_URL"))
                .map_err(|_| {
                    anyhow::anyhow!("DB_URL or DATABASE_URL environment variable required")
                })
                .and_then(|url| {
                    if url.trim().is_empty() {
                        anyhow::bail!("DB_URL cannot be empty");
                    }
                    if !url.starts_with("postgresql://") && !url.starts_with("postgres://") {
                        anyhow::bail!("DB_URL must start with postgresql:// or postgres://");
                    }
                    Ok(url)
                })?,
            port: std::env::var("PORT")
                .unwrap_or_else(|_| "3000".to_string())
                .parse()
                .map_err(|_| anyhow::anyhow!("PORT must be a valid number between 1-65535"))?,
            orion_endpoint: env_url(
                "ORION_ENDPOINT",
                "https://api.genesy.ai/api/tmp/orionConnect",
            )?,
            orion_api_key: env_or("ORION_API_KEY", "mySecretKey123"),
            astra_endpoint: env_url("ASTRA_ENDPOINT", "https://api.genesy.ai/api/tmp/astraDialer")?,
            astra_api_key: env_or("ASTRA_API_KEY", "1234jhgf"),
            nimbus_endpoint: env_url(
                "NIMBUS_ENDPOINT",
                "https://api.genesy.ai/api/tmp/numbusLookup",
            )?,
            nimbus_api_key: env_or("NIMBUS_API_KEY", "000099998888"),
            email_verifier_endpoint: env_url(
                "EMAIL_VERIFIER_ENDPOINT",
                "https://api.genesy.ai/api/tmp/verifyEmail",
            )?,
        };

        // Log successful configuration load (without sensitive values)
        tracing::info!("Configuration loaded successfully");
        tracing::debug!(
            "Database URL: {}...",
            &config.database_url[..20.min(config.database_url.len())]
        );
        tracing::debug!("Orion endpoint: {}", config.orion_endpoint);
        tracing::debug!("Astra endpoint: {}", config.astra_endpoint);
        tracing::debug!("Nimbus endpoint: {}", config.nimbus_endpoint);
        tracing::debug!("Server port: {}", config.port);

        Ok(config)
    }

    /// Static provider set: the three phone-lookup backends with their
    /// priorities, per-window token budgets, concurrency caps and per-request
    /// prices.
    pub fn provider_configs(&self) -> Vec<ProviderConfig> {
        vec![
            ProviderConfig {
                name: "Orion Connect".to_string(),
                kind: ProviderKind::OrionConnect,
                endpoint: self.orion_endpoint.clone(),
                api_key: self.orion_api_key.clone(),
                priority: 1,
                cost_per_request: 0.02,
                rate_limit: 5,
                time_window: Duration::from_millis(1000),
                max_concurrent: 3,
                enabled: true,
                timeout: Duration::from_millis(10_000),
            },
            ProviderConfig {
                name: "Astra Dialer".to_string(),
                kind: ProviderKind::AstraDialer,
                endpoint: self.astra_endpoint.clone(),
                api_key: self.astra_api_key.clone(),
                priority: 2,
                cost_per_request: 0.01,
                rate_limit: 10,
                time_window: Duration::from_millis(1000),
                max_concurrent: 10,
                enabled: true,
                timeout: Duration::from_millis(10_000),
            },
            ProviderConfig {
                name: "Nimbus Lookup".to_string(),
                kind: ProviderKind::NimbusLookup,
                endpoint: self.nimbus_endpoint.clone(),
                api_key: self.nimbus_api_key.clone(),
                priority: 3,
                cost_per_request: 0.015,
                rate_limit: 2,
                time_window: Duration::from_millis(1000),
                max_concurrent: 2,
                enabled: true,
                timeout: Duration::from_millis(10_000),
            },
        ]
    }
}

fn env_or(name: &str, default: &str) -> String {
    std::env::var(name)
        .ok()
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| default.to_string())
}

fn env_url(name: &str, default: &str) -> anyhow::Result<String> {
    let url = env_or(name, default);
    if !url.starts_with("http://") && !url.starts_with("https://") {
        anyhow::bail!("{} must start with http:// or https://", name);
    }
    Ok(url)
}

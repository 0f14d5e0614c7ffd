use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use serde_json::json;

use crate::errors::AppError;

/// Opaque boolean-returning email verification call.
#[async_trait]
pub trait EmailVerifier: Send + Sync {
    async fn verify(&self, email: &str) -> Result<bool, AppError>;
}

/// HTTP-backed verifier: POST the address, read back `{ "verified": bool }`.
pub struct HttpEmailVerifier {
    client: reqwest::Client,
    endpoint: String,
}

impl HttpEmailVerifier {
    pub fn new(endpoint: String) -> Result<Self, AppError> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(30))
            .build()
            .map_err(|e| {
                AppError::Provider(format!("Failed to create verifier client: {}", e))
            })?;
        Ok(Self { client, endpoint })
    }
}

#[async_trait]
impl EmailVerifier for HttpEmailVerifier {
    async fn verify(&self, email: &str) -> Result<bool, AppError> {
        #[derive(Deserialize)]
        struct VerifyResponse {
            verified: bool,
        }

        tracing::info!("Verifying email {}", email);

        let response = self
            .client
            .post(&self.endpoint)
            .json(&json!({ "email": email }))
            .send()
            .await
            .map_err(|e| AppError::Provider(format!("Verifier request failed: {}", e)))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(AppError::Provider(format!(
                "Verifier returned {}: {}",
                status, body
            )));
        }

        let parsed: VerifyResponse = response.json().await.map_err(|e| {
            AppError::Provider(format!("Failed to parse verifier response: {}", e))
        })?;

        Ok(parsed.verified)
    }
}

/// Fixed-outcome verifier for tests and local development.
pub struct StaticEmailVerifier {
    pub verified: bool,
}

#[async_trait]
impl EmailVerifier for StaticEmailVerifier {
    async fn verify(&self, _email: &str) -> Result<bool, AppError> {
        Ok(self.verified)
    }
}

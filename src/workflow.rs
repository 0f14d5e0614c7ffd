use std::sync::Arc;
use std::time::Duration;

use moka::future::Cache;

use crate::email_verifier::EmailVerifier;
use crate::errors::AppError;
use crate::models::{Lead, LookupParams, PhoneResult};
use crate::providers::ProviderRegistry;

/// Outer bound on one provider attempt, covering its internal retries.
pub const PROVIDER_STEP_TIMEOUT: Duration = Duration::from_secs(30);

/// Fallback when the lead has no company to look up against.
pub const DEFAULT_COMPANY_WEBSITE: &str = "example.com";

/// Fallback job title for backends that require one.
pub const DEFAULT_JOB_TITLE: &str = "Unknown";

/// Raw input to a phone lookup, before normalization.
#[derive(Debug, Clone)]
pub struct PhoneLookupInput {
    pub first_name: String,
    pub last_name: String,
    pub company_website: Option<String>,
    pub job_title: Option<String>,
}

impl PhoneLookupInput {
    pub fn from_lead(lead: &Lead) -> Self {
        Self {
            first_name: lead.first_name.clone(),
            last_name: lead.last_name.clone(),
            company_website: lead.company_name.clone(),
            job_title: lead.job_title.clone(),
        }
    }

    /// Applies the lookup defaults: empty company and title fields collapse
    /// to their placeholders.
    pub fn normalize(&self) -> LookupParams {
        LookupParams {
            full_name: format!("{} {}", self.first_name, self.last_name),
            company_website: self
                .company_website
                .as_deref()
                .filter(|w| !w.trim().is_empty())
                .unwrap_or(DEFAULT_COMPANY_WEBSITE)
                .to_string(),
            job_title: self
                .job_title
                .as_deref()
                .filter(|t| !t.trim().is_empty())
                .unwrap_or(DEFAULT_JOB_TITLE)
                .to_string(),
        }
    }
}

/// Waterfall phone lookup: providers are tried in priority order and the
/// first non-empty phone wins. A single provider failing (or timing out at
/// the step level) is not terminal; the next provider is tried. Exhausting
/// every provider yields the terminal no-result outcome.
pub struct PhoneLookupWorkflow {
    registry: Arc<ProviderRegistry>,
}

impl PhoneLookupWorkflow {
    pub fn new(registry: Arc<ProviderRegistry>) -> Self {
        Self { registry }
    }

    pub async fn run(&self, input: &PhoneLookupInput) -> PhoneResult {
        let params = input.normalize();
        tracing::info!("Starting phone lookup for {}", params.full_name);

        for provider in self.registry.iter() {
            match tokio::time::timeout(PROVIDER_STEP_TIMEOUT, provider.execute(&params)).await {
                Ok(Ok(result)) if result.phone.is_some() => {
                    tracing::info!(
                        "Provider {} found a phone for {} (cost {})",
                        result.provider,
                        params.full_name,
                        result.cost
                    );
                    return result;
                }
                Ok(Ok(result)) => {
                    tracing::info!(
                        "Provider {} had no phone for {}; falling through",
                        result.provider,
                        params.full_name
                    );
                }
                Ok(Err(err)) => {
                    tracing::warn!(
                        "Provider {} failed for {}: {}; falling through",
                        provider.name(),
                        params.full_name,
                        err
                    );
                }
                Err(_) => {
                    tracing::warn!(
                        "Provider {} step timed out for {}; falling through",
                        provider.name(),
                        params.full_name
                    );
                }
            }
        }

        tracing::info!("All providers exhausted for {}", params.full_name);
        PhoneResult::none()
    }
}

/// Idempotent execution layer over the workflows.
///
/// Every external dispatch carries a workflow id deterministic in the
/// (operation, lead, job) triple. Concurrent or re-delivered invocations of
/// the same id coalesce onto one in-flight run and share its result, so a
/// redelivery neither double-charges a provider nor re-runs a verification.
pub struct WorkflowRunner {
    phone_workflow: Arc<PhoneLookupWorkflow>,
    verifier: Arc<dyn EmailVerifier>,
    phone_results: Cache<String, PhoneResult>,
    email_results: Cache<String, bool>,
}

impl WorkflowRunner {
    pub fn new(phone_workflow: Arc<PhoneLookupWorkflow>, verifier: Arc<dyn EmailVerifier>) -> Self {
        // Results are only needed for the redelivery window; they are not a
        // durable store.
        let phone_results = Cache::builder()
            .time_to_live(Duration::from_secs(600))
            .max_capacity(10_000)
            .build();
        let email_results = Cache::builder()
            .time_to_live(Duration::from_secs(600))
            .max_capacity(10_000)
            .build();
        Self {
            phone_workflow,
            verifier,
            phone_results,
            email_results,
        }
    }

    /// Runs (or joins) the waterfall for `workflow_id`.
    pub async fn phone_lookup(&self, workflow_id: &str, input: PhoneLookupInput) -> PhoneResult {
        let workflow = Arc::clone(&self.phone_workflow);
        self.phone_results
            .get_with(workflow_id.to_string(), async move {
                workflow.run(&input).await
            })
            .await
    }

    /// Runs (or joins) an email verification for `workflow_id`. Failures are
    /// not cached, so a later redelivery can retry.
    pub async fn verify_email(&self, workflow_id: &str, email: &str) -> Result<bool, AppError> {
        let verifier = Arc::clone(&self.verifier);
        let email = email.to_string();
        self.email_results
            .try_get_with(workflow_id.to_string(), async move {
                verifier.verify(&email).await
            })
            .await
            .map_err(|e| e.as_ref().clone())
    }
}

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Provider name reported when no provider produced a phone.
pub const NO_PROVIDER: &str = "None";

/// Provider name reported when the lead already carried a phone number.
pub const EXISTING_PROVIDER: &str = "Existing";

// ============ Lead records ============

/// A lead as read from the persistence store.
///
/// The enrichment pipeline only ever writes back `phone_number` and
/// `email_verified`; everything else is owned by the ingestion side.
#[derive(Debug, Clone, FromRow, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Lead {
    pub id: i64,
    pub first_name: String,
    pub last_name: String,
    pub email: String,
    pub company_name: Option<String>,
    pub job_title: Option<String>,
    pub phone_number: Option<String>,
    /// Tri-state: `None` = never verified, `Some(v)` = verified with outcome `v`.
    pub email_verified: Option<bool>,
}

impl Lead {
    /// Display name used when building lookup parameters.
    pub fn full_name(&self) -> String {
        format!("{} {}", self.first_name, self.last_name)
    }

    /// Whether the lead already carries a non-empty phone number.
    pub fn has_phone(&self) -> bool {
        self.phone_number
            .as_deref()
            .map(|p| !p.trim().is_empty())
            .unwrap_or(false)
    }
}

/// Partial update written back to the store. `None` fields are left untouched.
#[derive(Debug, Clone, Default)]
pub struct LeadUpdate {
    pub phone_number: Option<String>,
    pub email_verified: Option<bool>,
}

// ============ Provider configuration ============

/// Which wire protocol a provider speaks. Determines request shape, auth
/// placement and result field extraction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProviderKind {
    OrionConnect,
    AstraDialer,
    NimbusLookup,
}

/// Static configuration for one phone-lookup provider.
///
/// Built once at process start and never mutated; provider names are unique
/// and priorities totally order the enabled providers.
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    pub name: String,
    pub kind: ProviderKind,
    pub endpoint: String,
    pub api_key: String,
    /// 1 = tried first.
    pub priority: u32,
    pub cost_per_request: f64,
    /// Tokens granted per `time_window`.
    pub rate_limit: u32,
    pub time_window: Duration,
    pub max_concurrent: usize,
    pub enabled: bool,
    /// Per-attempt HTTP timeout.
    pub timeout: Duration,
}

// ============ Lookup input / output ============

/// Normalized parameters handed to every provider backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LookupParams {
    pub full_name: String,
    pub company_website: String,
    pub job_title: String,
}

/// Outcome of one phone lookup, successful or not.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct PhoneResult {
    pub phone: Option<String>,
    pub provider: String,
    pub cost: f64,
    pub timestamp: DateTime<Utc>,
}

impl PhoneResult {
    /// Terminal "no provider found anything" result.
    pub fn none() -> Self {
        Self {
            phone: None,
            provider: NO_PROVIDER.to_string(),
            cost: 0.0,
            timestamp: Utc::now(),
        }
    }

    /// Synthetic result for a lead that already had a phone on record.
    pub fn existing(phone: String) -> Self {
        Self {
            phone: Some(phone),
            provider: EXISTING_PROVIDER.to_string(),
            cost: 0.0,
            timestamp: Utc::now(),
        }
    }
}

// ============ Jobs ============

/// Enrichment operation applied to a lead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum Operation {
    VerifyEmail,
    PhoneLookup,
}

/// What kind of batch a job tracks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobType {
    EmailVerification,
    PhoneLookup,
    Enrichment,
}

/// Per-batch progress record.
///
/// `total_leads` counts work units: one per lead for the single-operation job
/// types, one per (lead, operation) cell for enrichment jobs. `completed_at`
/// is stamped exactly once, when `processed_leads` first reaches the total.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Job {
    pub id: String,
    #[serde(rename = "type")]
    pub job_type: JobType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub operations: Option<Vec<Operation>>,
    pub total_leads: u32,
    pub processed_leads: u32,
    pub started_at: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
}

/// Point-in-time progress counters carried on completion events.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct ProgressSnapshot {
    pub completed: u32,
    pub total: u32,
}

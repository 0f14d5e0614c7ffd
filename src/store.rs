use std::collections::HashMap;
use std::sync::{Mutex, PoisonError};

use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::PgPool;

use crate::circuit_breaker::{create_store_circuit_breaker, StoreCircuitBreaker};
use crate::errors::AppError;
use crate::models::{Lead, LeadUpdate};

/// Record-by-id access to leads. The enrichment pipeline only reads leads and
/// writes back `phone_number` / `email_verified`; no transactions required.
#[async_trait]
pub trait LeadStore: Send + Sync {
    async fn find_by_id(&self, id: i64) -> Result<Option<Lead>, AppError>;
    async fn find_many_by_ids(&self, ids: &[i64]) -> Result<Vec<Lead>, AppError>;
    async fn update_fields(&self, id: i64, update: LeadUpdate) -> Result<(), AppError>;
}

/// Postgres-backed lead store. Every query runs through a circuit breaker so
/// a dead database fails fast instead of piling up batch work.
pub struct PgLeadStore {
    pool: PgPool,
    breaker: StoreCircuitBreaker,
}

impl PgLeadStore {
    pub async fn connect(database_url: &str) -> anyhow::Result<Self> {
        let pool = PgPoolOptions::new()
            .max_connections(10)
            .connect(database_url)
            .await?;

        // Fail early on an unusable connection string.
        sqlx::query("SELECT 1").execute(&pool).await?;

        Ok(Self::with_pool(pool))
    }

    pub fn with_pool(pool: PgPool) -> Self {
        Self {
            pool,
            breaker: create_store_circuit_breaker(),
        }
    }

    fn map_breaker_err(err: failsafe::Error<sqlx::Error>) -> AppError {
        match err {
            failsafe::Error::Inner(e) => AppError::from(e),
            failsafe::Error::Rejected => {
                AppError::StoreUnavailable("lead store circuit breaker open".to_string())
            }
        }
    }
}

#[async_trait]
impl LeadStore for PgLeadStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<Lead>, AppError> {
        use failsafe::futures::CircuitBreaker;

        self.breaker
            .call(
                sqlx::query_as::<_, Lead>(
                    "SELECT id, first_name, last_name, email, company_name, job_title, \
                     phone_number, email_verified FROM leads WHERE id = $1",
                )
                .bind(id)
                .fetch_optional(&self.pool),
            )
            .await
            .map_err(Self::map_breaker_err)
    }

    async fn find_many_by_ids(&self, ids: &[i64]) -> Result<Vec<Lead>, AppError> {
        use failsafe::futures::CircuitBreaker;

        self.breaker
            .call(
                sqlx::query_as::<_, Lead>(
                    "SELECT id, first_name, last_name, email, company_name, job_title, \
                     phone_number, email_verified FROM leads WHERE id = ANY($1) ORDER BY id",
                )
                .bind(ids.to_vec())
                .fetch_all(&self.pool),
            )
            .await
            .map_err(Self::map_breaker_err)
    }

    async fn update_fields(&self, id: i64, update: LeadUpdate) -> Result<(), AppError> {
        use failsafe::futures::CircuitBreaker;

        self.breaker
            .call(
                sqlx::query(
                    "UPDATE leads SET phone_number = COALESCE($2, phone_number), \
                     email_verified = COALESCE($3, email_verified) WHERE id = $1",
                )
                .bind(id)
                .bind(update.phone_number)
                .bind(update.email_verified)
                .execute(&self.pool),
            )
            .await
            .map(|_| ())
            .map_err(Self::map_breaker_err)
    }
}

/// In-memory lead store for tests and local development.
pub struct MemoryLeadStore {
    leads: Mutex<HashMap<i64, Lead>>,
}

impl MemoryLeadStore {
    pub fn new(seed: impl IntoIterator<Item = Lead>) -> Self {
        Self {
            leads: Mutex::new(seed.into_iter().map(|l| (l.id, l)).collect()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<i64, Lead>> {
        self.leads.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[async_trait]
impl LeadStore for MemoryLeadStore {
    async fn find_by_id(&self, id: i64) -> Result<Option<Lead>, AppError> {
        Ok(self.lock().get(&id).cloned())
    }

    async fn find_many_by_ids(&self, ids: &[i64]) -> Result<Vec<Lead>, AppError> {
        let leads = self.lock();
        let mut found: Vec<Lead> = ids.iter().filter_map(|id| leads.get(id).cloned()).collect();
        found.sort_by_key(|l| l.id);
        Ok(found)
    }

    async fn update_fields(&self, id: i64, update: LeadUpdate) -> Result<(), AppError> {
        let mut leads = self.lock();
        let lead = leads
            .get_mut(&id)
            .ok_or_else(|| AppError::NotFound(format!("lead {} not found", id)))?;
        if let Some(phone) = update.phone_number {
            lead.phone_number = Some(phone);
        }
        if let Some(verified) = update.email_verified {
            lead.email_verified = Some(verified);
        }
        Ok(())
    }
}

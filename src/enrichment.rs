//! Batch enrichment orchestration.
//!
//! Given a set of leads and the operations to apply, every (lead, operation)
//! cell is dispatched in parallel. The orchestrator imposes no throttle of
//! its own: all external pressure is absorbed by the per-provider rate
//! limiters, whose FIFO queues serialize bursts. Per-cell results are
//! persisted, progress is counted per cell, and each outcome is published to
//! the job's progress room.

use std::collections::HashSet;
use std::sync::Arc;

use crate::errors::AppError;
use crate::jobs::{JobTracker, JOB_CLEANUP_DELAY};
use crate::models::{JobType, Lead, LeadUpdate, Operation, PhoneResult};
use crate::progress::{OperationData, ProgressBus, ProgressEvent};
use crate::store::LeadStore;
use crate::workflow::{PhoneLookupInput, WorkflowRunner};

/// Outcome of one (lead, operation) cell, fed into the terminal tally.
struct CellOutcome {
    lead_id: i64,
    succeeded: bool,
}

pub struct EnrichmentOrchestrator {
    store: Arc<dyn LeadStore>,
    runner: Arc<WorkflowRunner>,
    jobs: Arc<JobTracker>,
    bus: Arc<ProgressBus>,
}

impl EnrichmentOrchestrator {
    pub fn new(
        store: Arc<dyn LeadStore>,
        runner: Arc<WorkflowRunner>,
        jobs: Arc<JobTracker>,
        bus: Arc<ProgressBus>,
    ) -> Self {
        Self {
            store,
            runner,
            jobs,
            bus,
        }
    }

    /// Runs every selected operation over every lead, returning once all
    /// cells have terminated and the terminal job-complete event is out.
    ///
    /// A failing cell emits an `operation-error` for itself and never cancels
    /// its siblings; its progress unit is still counted so the job always
    /// reaches its terminal state.
    pub async fn run_batch(
        self: Arc<Self>,
        leads: Vec<Lead>,
        operations: Vec<Operation>,
        job_id: String,
    ) {
        let total_cells = leads.len() * operations.len();
        tracing::info!(
            "Starting enrichment job {}: {} lead(s) x {} operation(s) = {} cell(s)",
            job_id,
            leads.len(),
            operations.len(),
            total_cells
        );

        let mut handles = Vec::with_capacity(total_cells);
        for lead in leads {
            for operation in &operations {
                let this = Arc::clone(&self);
                let lead = lead.clone();
                let operation = *operation;
                let job_id = job_id.clone();
                handles.push(tokio::spawn(async move {
                    this.process_cell(lead, operation, &job_id).await
                }));
            }
        }

        // Distinct leads with at least one successful operation.
        let mut processed: HashSet<i64> = HashSet::new();
        for handle in handles {
            match handle.await {
                Ok(outcome) => {
                    if outcome.succeeded {
                        processed.insert(outcome.lead_id);
                    }
                }
                Err(e) => tracing::error!("Enrichment cell task panicked: {}", e),
            }
        }

        let total_processed = processed.len();
        tracing::info!(
            "Enrichment job {} finished: {} lead(s) processed",
            job_id,
            total_processed
        );
        self.bus.publish(
            &job_id,
            ProgressEvent::JobComplete {
                job_id: job_id.clone(),
                job_type: JobType::Enrichment,
                total_processed,
            },
        );

        self.jobs.cleanup(&job_id);
        self.bus.schedule_close(&job_id, JOB_CLEANUP_DELAY);
    }

    async fn process_cell(&self, lead: Lead, operation: Operation, job_id: &str) -> CellOutcome {
        let lead_id = lead.id;
        let result = match operation {
            Operation::VerifyEmail => self.verify_email_cell(&lead, job_id).await,
            Operation::PhoneLookup => self.phone_lookup_cell(&lead, job_id).await,
        };

        // Progress counts the cell whether it succeeded or not, so the job
        // always terminates.
        let progress = self.jobs.increment_progress(job_id);

        match result {
            Ok(data) => {
                if let Some(progress) = progress {
                    self.bus.publish(
                        job_id,
                        ProgressEvent::OperationComplete {
                            lead_id,
                            operation,
                            data,
                            progress,
                        },
                    );
                }
                CellOutcome {
                    lead_id,
                    succeeded: true,
                }
            }
            Err(err) => {
                tracing::error!(
                    "Enrichment cell ({}, {:?}) failed: {}",
                    lead_id,
                    operation,
                    err
                );
                self.bus.publish(
                    job_id,
                    ProgressEvent::OperationError {
                        lead_id,
                        operation,
                        error: err.to_string(),
                    },
                );
                CellOutcome {
                    lead_id,
                    succeeded: false,
                }
            }
        }
    }

    /// Verifies the lead's email unless a verdict is already on record, in
    /// which case the existing value is replayed without an external call.
    async fn verify_email_cell(&self, lead: &Lead, job_id: &str) -> Result<OperationData, AppError> {
        if let Some(existing) = lead.email_verified {
            tracing::debug!("Lead {} already verified ({}); skipping", lead.id, existing);
            return Ok(OperationData::EmailVerified {
                email_verified: existing,
            });
        }

        let workflow_id = workflow_id(Operation::VerifyEmail, lead.id, job_id);
        let verified = self.runner.verify_email(&workflow_id, &lead.email).await?;

        self.store
            .update_fields(
                lead.id,
                LeadUpdate {
                    email_verified: Some(verified),
                    ..LeadUpdate::default()
                },
            )
            .await?;

        Ok(OperationData::EmailVerified {
            email_verified: verified,
        })
    }

    /// Looks up a phone through the provider waterfall unless the lead
    /// already has one, in which case a free synthetic result is replayed.
    async fn phone_lookup_cell(&self, lead: &Lead, job_id: &str) -> Result<OperationData, AppError> {
        if lead.has_phone() {
            let phone = lead.phone_number.clone().unwrap_or_default();
            tracing::debug!("Lead {} already has a phone; skipping lookup", lead.id);
            let existing = PhoneResult::existing(phone);
            return Ok(OperationData::Phone {
                phone: existing.phone,
                provider: existing.provider,
                cost: existing.cost,
            });
        }

        let workflow_id = workflow_id(Operation::PhoneLookup, lead.id, job_id);
        let input = PhoneLookupInput::from_lead(lead);
        let result = self.runner.phone_lookup(&workflow_id, input).await;

        if let Some(phone) = &result.phone {
            self.store
                .update_fields(
                    lead.id,
                    LeadUpdate {
                        phone_number: Some(phone.clone()),
                        ..LeadUpdate::default()
                    },
                )
                .await?;
        }

        Ok(OperationData::Phone {
            phone: result.phone,
            provider: result.provider,
            cost: result.cost,
        })
    }
}

/// Deterministic workflow id for a cell, so redelivery by the execution layer
/// deduplicates instead of double-charging.
fn workflow_id(operation: Operation, lead_id: i64, job_id: &str) -> String {
    let op = match operation {
        Operation::VerifyEmail => "verify-email",
        Operation::PhoneLookup => "phone-lookup",
    };
    format!("{}-{}-{}", op, lead_id, job_id)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn workflow_ids_are_deterministic_per_cell() {
        let a = workflow_id(Operation::PhoneLookup, 7, "job-1");
        let b = workflow_id(Operation::PhoneLookup, 7, "job-1");
        assert_eq!(a, b);
        assert_eq!(a, "phone-lookup-7-job-1");

        assert_ne!(a, workflow_id(Operation::VerifyEmail, 7, "job-1"));
        assert_ne!(a, workflow_id(Operation::PhoneLookup, 8, "job-1"));
        assert_ne!(a, workflow_id(Operation::PhoneLookup, 7, "job-2"));
    }
}

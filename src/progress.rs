use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use serde::Serialize;
use tokio::sync::broadcast;

use crate::models::{JobType, Operation, ProgressSnapshot};

/// Buffered events per room before slow subscribers start losing the oldest.
const ROOM_CAPACITY: usize = 256;

/// Payload of an `operation-complete` event: either the verification outcome
/// or the phone lookup outcome, fields inlined.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum OperationData {
    #[serde(rename_all = "camelCase")]
    EmailVerified { email_verified: bool },
    Phone {
        phone: Option<String>,
        provider: String,
        cost: f64,
    },
}

/// Events published to a job's room.
#[derive(Debug, Clone, Serialize)]
#[serde(untagged)]
pub enum ProgressEvent {
    #[serde(rename_all = "camelCase")]
    OperationComplete {
        lead_id: i64,
        operation: Operation,
        data: OperationData,
        progress: ProgressSnapshot,
    },
    #[serde(rename_all = "camelCase")]
    OperationError {
        lead_id: i64,
        operation: Operation,
        error: String,
    },
    #[serde(rename_all = "camelCase")]
    JobComplete {
        job_id: String,
        #[serde(rename = "type")]
        job_type: JobType,
        total_processed: usize,
    },
}

impl ProgressEvent {
    /// Wire-level event name, used as the SSE event field.
    pub fn name(&self) -> &'static str {
        match self {
            ProgressEvent::OperationComplete { .. } => "operation-complete",
            ProgressEvent::OperationError { .. } => "operation-error",
            ProgressEvent::JobComplete { .. } => "job-complete",
        }
    }
}

/// Job-scoped multicast: one room per job id, no persistence. Late
/// subscribers miss everything published before they joined, which is why job
/// cleanup is delayed.
pub struct ProgressBus {
    rooms: Mutex<HashMap<String, broadcast::Sender<ProgressEvent>>>,
}

impl Default for ProgressBus {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressBus {
    pub fn new() -> Self {
        Self {
            rooms: Mutex::new(HashMap::new()),
        }
    }

    /// Joins the room for `job_id`, creating it on first subscription.
    pub fn subscribe(&self, job_id: &str) -> broadcast::Receiver<ProgressEvent> {
        let mut rooms = self.lock();
        rooms
            .entry(job_id.to_string())
            .or_insert_with(|| broadcast::channel(ROOM_CAPACITY).0)
            .subscribe()
    }

    /// Delivers an event to the room's current subscribers. Publishing to a
    /// room nobody joined is a no-op.
    pub fn publish(&self, job_id: &str, event: ProgressEvent) {
        let sender = self.lock().get(job_id).cloned();
        if let Some(sender) = sender {
            // send only fails when every receiver is gone; those events are
            // intentionally lost.
            let _ = sender.send(event);
        }
    }

    /// Tears the room down; open subscriber streams terminate.
    pub fn close_room(&self, job_id: &str) {
        self.lock().remove(job_id);
    }

    /// Schedules `close_room` after `delay`, mirroring job cleanup.
    pub fn schedule_close(self: &Arc<Self>, job_id: &str, delay: Duration) {
        let bus = Arc::clone(self);
        let job_id = job_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            bus.close_room(&job_id);
        });
    }

    pub fn room_count(&self) -> usize {
        self.lock().len()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<String, broadcast::Sender<ProgressEvent>>> {
        self.rooms.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

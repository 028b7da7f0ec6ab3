use std::sync::Arc;

use log::{debug, info};

use crate::db::{InsertOutcome, QueueStore};
use crate::error::Result;
use crate::models::{CanonicalEvent, EventOrigin};

pub const DEFAULT_MAX_ATTEMPTS: u32 = 7;

/// Submits canonical events to the queue under their identity.
///
/// Repeated sightings of one identity collapse into a single job; only a job
/// that already failed terminally is reset and given a fresh attempt budget.
#[derive(Clone)]
pub struct Enqueuer {
    store: Arc<dyn QueueStore>,
    max_attempts: u32,
}

impl Enqueuer {
    pub fn new(store: Arc<dyn QueueStore>) -> Self {
        Self::with_max_attempts(store, DEFAULT_MAX_ATTEMPTS)
    }

    pub fn with_max_attempts(store: Arc<dyn QueueStore>, max_attempts: u32) -> Self {
        Self {
            store,
            max_attempts: max_attempts.max(1),
        }
    }

    pub async fn enqueue(&self, event: &CanonicalEvent, origin: EventOrigin) -> Result<InsertOutcome> {
        let outcome = self.store.insert_if_absent(event, self.max_attempts).await?;
        match outcome {
            InsertOutcome::Created => {
                info!("[{}] enqueue transfer for hash {}.", origin, event.identity)
            }
            InsertOutcome::Requeued => info!(
                "[{}] re-enqueue previously failed transfer {}.",
                origin, event.identity
            ),
            InsertOutcome::Duplicate(state) => debug!(
                "[{}] transfer {} already queued ({}).",
                origin, event.identity, state
            ),
        }
        Ok(outcome)
    }
}

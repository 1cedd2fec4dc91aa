//! Batch operations for bulk state changes.
//!
//! Each batch applies its per-record operation independently and keeps
//! going on failure; the outcome carries both the records that changed
//! and, per failed id, the error that stopped it.

use crate::error::StoreError;
use crate::store::Store;
use crate::types::{Context, EventKind, Node, NodeUpdate};
use chrono::Utc;

/// One record a batch could not change.
#[derive(Debug)]
pub struct BatchFailure {
    pub id: String,
    pub error: StoreError,
}

/// Result of a batch operation.
#[derive(Debug)]
pub struct BatchOutcome {
    /// Records changed, in request order.
    pub succeeded: Vec<Node>,
    /// Records left untouched, with the error for each.
    pub failed: Vec<BatchFailure>,
}

impl BatchOutcome {
    pub fn all_succeeded(&self) -> bool {
        self.failed.is_empty()
    }
}

/// Extension trait for batch operations on [`Store`].
pub trait StoreBatchExt {
    /// Complete each record, skipping over per-record failures.
    fn mark_done(&self, ctx: &Context, ids: &[&str]) -> Result<BatchOutcome, StoreError>;

    /// Hand the claim on each record to `assignee`.
    ///
    /// The claim is written in the assignee's name with no session; the
    /// `Claim` events stay attributed to the caller doing the assigning.
    fn assign(&self, ctx: &Context, assignee: &str, ids: &[&str])
    -> Result<BatchOutcome, StoreError>;

    /// Apply one field patch to each record.
    fn batch_update(
        &self,
        ctx: &Context,
        ids: &[&str],
        patch: &NodeUpdate,
    ) -> Result<BatchOutcome, StoreError>;
}

impl StoreBatchExt for Store {
    fn mark_done(&self, ctx: &Context, ids: &[&str]) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        for id in ids {
            match self.complete(ctx, id) {
                Ok(node) => outcome.succeeded.push(node),
                Err(error) => outcome.failed.push(BatchFailure {
                    id: id.to_string(),
                    error,
                }),
            }
        }
        Ok(outcome)
    }

    fn assign(
        &self,
        ctx: &Context,
        assignee: &str,
        ids: &[&str],
    ) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        for id in ids {
            match assign_one(self, ctx, assignee, id) {
                Ok(node) => outcome.succeeded.push(node),
                Err(error) => outcome.failed.push(BatchFailure {
                    id: id.to_string(),
                    error,
                }),
            }
        }
        Ok(outcome)
    }

    fn batch_update(
        &self,
        ctx: &Context,
        ids: &[&str],
        patch: &NodeUpdate,
    ) -> Result<BatchOutcome, StoreError> {
        let mut outcome = BatchOutcome {
            succeeded: Vec::new(),
            failed: Vec::new(),
        };
        for id in ids {
            match self.update(ctx, id, patch.clone()) {
                Ok(node) => outcome.succeeded.push(node),
                Err(error) => outcome.failed.push(BatchFailure {
                    id: id.to_string(),
                    error,
                }),
            }
        }
        Ok(outcome)
    }
}

fn assign_one(store: &Store, ctx: &Context, assignee: &str, id: &str) -> Result<Node, StoreError> {
    let storage = store.storage();
    let _lock = storage.lock(id)?;
    let node = storage
        .get(id)?
        .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
    let now = Utc::now();
    if let Some(holder) = node.live_claimant(store.config().claim_ttl_secs, now) {
        return Err(StoreError::ClaimConflict {
            id: id.to_string(),
            holder: holder.to_string(),
        });
    }

    let updated = Node {
        claimed_by: Some(assignee.to_string()),
        claimed_at: Some(now),
        claiming_session: None,
        updated_at: now,
        ..node
    };
    storage.write_node(&updated)?;
    storage.record_event(id, EventKind::Claim, ctx)?;
    Ok(updated)
}

use crate::{CorrelationId, Result};
use serde_json::Value;
use std::collections::hash_map::Entry;
use std::collections::HashMap;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;

/// Outcome delivered to a waiting call: the decoded response body, or the
/// decode failure.
pub(super) type CallOutcome = Result<Value>;

/// One in-flight call.
struct PendingCall {
    // ---
    tx: oneshot::Sender<CallOutcome>,
    created_at: Instant,
}

/// Tracks calls waiting for responses.
///
/// Maps correlation IDs to oneshot channels. The entry is removed before the
/// channel is used, so each call is settled at most once.
pub(super) struct PendingCalls {
    // ---
    calls: HashMap<CorrelationId, PendingCall>,
}

impl PendingCalls {
    // ---

    /// Create a new empty tracker.
    pub fn new() -> Self {
        // ---
        Self {
            calls: HashMap::new(),
        }
    }

    /// Register a new pending call under a freshly generated correlation ID.
    ///
    /// The ID is unique among calls currently pending on this tracker.
    pub fn register(&mut self) -> (CorrelationId, oneshot::Receiver<CallOutcome>) {
        // ---
        let (tx, rx) = oneshot::channel();
        let call = PendingCall {
            tx,
            created_at: Instant::now(),
        };

        loop {
            match self.calls.entry(CorrelationId::generate()) {
                Entry::Vacant(slot) => {
                    let id = slot.key().clone();
                    slot.insert(call);
                    return (id, rx);
                }
                Entry::Occupied(_) => continue,
            }
        }
    }

    /// Settle a pending call.
    ///
    /// Returns how long the call was pending, or `None` when the ID is
    /// unknown (already settled, timed out, or never issued here).
    pub fn complete(
        &mut self,
        correlation_id: &CorrelationId,
        outcome: CallOutcome,
    ) -> Option<Duration> {
        // ---
        let call = self.calls.remove(correlation_id)?;

        // Receiver may already be gone if the caller was cancelled.
        let _ = call.tx.send(outcome);
        Some(call.created_at.elapsed())
    }

    /// Remove a pending call without settling it.
    ///
    /// Used for timeout and publish-failure cleanup.
    pub fn remove(&mut self, correlation_id: &CorrelationId) -> bool {
        // ---
        self.calls.remove(correlation_id).is_some()
    }

    /// Drop every pending call; their receivers observe a closed channel.
    pub fn clear(&mut self) -> usize {
        // ---
        let n = self.calls.len();
        self.calls.clear();
        n
    }

    #[cfg(test)]
    pub fn contains(&self, correlation_id: &CorrelationId) -> bool {
        self.calls.contains_key(correlation_id)
    }

    pub fn len(&self) -> usize {
        self.calls.len()
    }
}

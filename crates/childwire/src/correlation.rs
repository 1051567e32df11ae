//! Correlation table: request id → pending response handler.
//!
//! Ids come from a wrapping counter. The counter starts at 1, issues
//! [`MAX_SAFE_ID`] and then wraps back to 1; zero is never issued. After a
//! wrap, ids that are still outstanding are skipped so a late response can
//! never be routed to a newer request.

use std::collections::HashMap;

use crate::bridge::protocol::RequestId;

/// Largest id ever issued (2^53 - 1), so ids survive a round trip through
/// peers that store numbers as IEEE doubles.
pub const MAX_SAFE_ID: u64 = (1 << 53) - 1;

/// Why a request finished without a response body.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum RequestError {
    /// The worker exited before responding.
    #[error("request aborted: worker exited before responding")]
    Aborted,

    /// The request could not be handed to the worker.
    #[error("worker channel closed")]
    Closed,
}

/// Single-use callback receiving a response body (or the reason there is none).
pub type ResponseHandler =
    Box<dyn FnOnce(Result<serde_json::Value, RequestError>) + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CorrelationError {
    #[error("request id {0} is already registered")]
    Duplicate(RequestId),
}

#[derive(Default)]
pub struct CorrelationTable {
    last_id: u64,
    pending: HashMap<RequestId, ResponseHandler>,
}

impl CorrelationTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issue the next id. Only advances the counter; nothing is registered.
    pub fn allocate(&mut self) -> RequestId {
        loop {
            self.last_id = next_id(self.last_id);
            let id = RequestId::new(self.last_id);
            if !self.pending.contains_key(&id) {
                return id;
            }
            tracing::debug!(%id, "Skipping id still outstanding after wraparound");
        }
    }

    pub fn register(&mut self, id: RequestId, handler: ResponseHandler) -> Result<(), CorrelationError> {
        if self.pending.contains_key(&id) {
            return Err(CorrelationError::Duplicate(id));
        }
        self.pending.insert(id, handler);
        Ok(())
    }

    /// Invoke and remove the handler for `id`.
    ///
    /// Returns false (and does nothing) for unknown, late or duplicate ids.
    pub fn resolve(&mut self, id: RequestId, body: serde_json::Value) -> bool {
        match self.take(id) {
            Some(handler) => {
                handler(Ok(body));
                true
            }
            None => false,
        }
    }

    /// Remove the handler for `id` without invoking it.
    ///
    /// Callers that hold the table behind a lock use this to run the handler
    /// after the lock is released.
    pub fn take(&mut self, id: RequestId) -> Option<ResponseHandler> {
        self.pending.remove(&id)
    }

    pub fn contains(&self, id: RequestId) -> bool {
        self.pending.contains_key(&id)
    }

    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Remove every entry, returning the handlers in id order.
    pub fn drain(&mut self) -> Vec<(RequestId, ResponseHandler)> {
        let mut drained: Vec<_> = self.pending.drain().collect();
        drained.sort_by_key(|(id, _)| *id);
        drained
    }

    /// Invoke every pending handler with [`RequestError::Aborted`]. Returns how many ran.
    pub fn abort_all(&mut self) -> usize {
        let drained = self.drain();
        let count = drained.len();
        for (_, handler) in drained {
            handler(Err(RequestError::Aborted));
        }
        count
    }

    #[cfg(test)]
    fn with_last_id(last_id: u64) -> Self {
        Self {
            last_id,
            pending: HashMap::new(),
        }
    }
}

impl std::fmt::Debug for CorrelationTable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mut ids: Vec<_> = self.pending.keys().copied().collect();
        ids.sort();
        f.debug_struct("CorrelationTable")
            .field("last_id", &self.last_id)
            .field("pending", &ids)
            .finish()
    }
}

/// Successor of `id` in the issue order: 1, 2, ..., MAX_SAFE_ID, 1, ...
fn next_id(id: u64) -> u64 {
    if id >= MAX_SAFE_ID { 1 } else { id + 1 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::collections::HashSet;
    use std::sync::{Arc, Mutex};

    type Calls = Arc<Mutex<Vec<Result<serde_json::Value, RequestError>>>>;

    fn recording_handler(calls: &Calls) -> ResponseHandler {
        let calls = Arc::clone(calls);
        Box::new(move |result| calls.lock().unwrap().push(result))
    }

    #[test]
    fn first_id_is_one() {
        let mut table = CorrelationTable::new();
        assert_eq!(table.allocate(), RequestId::new(1));
        assert_eq!(table.allocate(), RequestId::new(2));
    }

    #[test]
    fn allocate_does_not_register() {
        let mut table = CorrelationTable::new();
        let id = table.allocate();
        assert!(!table.contains(id));
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn max_safe_id_is_issued_then_wraps_to_one() {
        let mut table = CorrelationTable::with_last_id(MAX_SAFE_ID - 1);
        assert_eq!(table.allocate(), RequestId::new(MAX_SAFE_ID));
        assert_eq!(table.allocate(), RequestId::new(1));
        assert_eq!(table.allocate(), RequestId::new(2));
    }

    #[test]
    fn next_id_never_yields_zero() {
        assert_eq!(next_id(0), 1);
        assert_eq!(next_id(MAX_SAFE_ID), 1);
        assert_eq!(next_id(u64::MAX), 1);
        assert_eq!(MAX_SAFE_ID, 9_007_199_254_740_991);
    }

    #[test]
    fn wraparound_skips_outstanding_ids() {
        let calls = Calls::default();
        let mut table = CorrelationTable::with_last_id(MAX_SAFE_ID);
        table.register(RequestId::new(1), recording_handler(&calls)).unwrap();
        table.register(RequestId::new(2), recording_handler(&calls)).unwrap();

        table.last_id = MAX_SAFE_ID;
        assert_eq!(table.allocate(), RequestId::new(3));
    }

    #[test]
    fn ids_are_distinct() {
        let calls = Calls::default();
        let mut table = CorrelationTable::new();
        let mut seen = HashSet::new();
        for _ in 0..1000 {
            let id = table.allocate();
            table.register(id, recording_handler(&calls)).unwrap();
            assert!(seen.insert(id));
        }
        assert_eq!(table.pending_count(), 1000);
    }

    #[test]
    fn register_rejects_duplicate() {
        let calls = Calls::default();
        let mut table = CorrelationTable::new();
        let id = table.allocate();
        table.register(id, recording_handler(&calls)).unwrap();
        let err = table.register(id, recording_handler(&calls)).unwrap_err();
        assert!(matches!(err, CorrelationError::Duplicate(dup) if dup == id));
        assert_eq!(table.pending_count(), 1);
    }

    #[test]
    fn resolve_invokes_once_and_removes() {
        let calls = Calls::default();
        let mut table = CorrelationTable::new();
        let id = table.allocate();
        table.register(id, recording_handler(&calls)).unwrap();

        assert!(table.resolve(id, json!({"sup": "buddy 420"})));
        assert!(!table.resolve(id, json!("again")));

        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 1);
        assert_eq!(calls[0], Ok(json!({"sup": "buddy 420"})));
        assert_eq!(table.pending_count(), 0);
    }

    #[test]
    fn resolve_unknown_is_noop() {
        let mut table = CorrelationTable::new();
        assert!(!table.resolve(RequestId::new(77), json!(null)));
        assert!(!table.resolve(RequestId::new(0), json!(null)));
    }

    #[test]
    fn responses_route_by_id_in_any_order() {
        let mut table = CorrelationTable::new();
        let results: Arc<Mutex<Vec<(u64, serde_json::Value)>>> = Arc::default();
        let mut ids = Vec::new();
        for n in 0..10u64 {
            let id = table.allocate();
            let results = Arc::clone(&results);
            table
                .register(
                    id,
                    Box::new(move |r| results.lock().unwrap().push((n, r.unwrap()))),
                )
                .unwrap();
            ids.push((id, n));
        }

        for (id, n) in ids.iter().rev() {
            assert!(table.resolve(*id, json!(n)));
        }

        for (n, body) in results.lock().unwrap().iter() {
            assert_eq!(body, &json!(n));
        }
    }

    #[test]
    fn take_removes_without_invoking() {
        let calls = Calls::default();
        let mut table = CorrelationTable::new();
        let id = table.allocate();
        table.register(id, recording_handler(&calls)).unwrap();

        assert!(table.take(id).is_some());
        assert!(table.take(id).is_none());
        assert!(calls.lock().unwrap().is_empty());
    }

    #[test]
    fn abort_all_signals_every_pending_handler() {
        let calls = Calls::default();
        let mut table = CorrelationTable::new();
        for _ in 0..3 {
            let id = table.allocate();
            table.register(id, recording_handler(&calls)).unwrap();
        }

        assert_eq!(table.abort_all(), 3);
        assert_eq!(table.pending_count(), 0);
        let calls = calls.lock().unwrap();
        assert_eq!(calls.len(), 3);
        assert!(calls.iter().all(|c| *c == Err(RequestError::Aborted)));
    }

    #[test]
    fn drain_is_sorted_by_id() {
        let calls = Calls::default();
        let mut table = CorrelationTable::new();
        for _ in 0..5 {
            let id = table.allocate();
            table.register(id, recording_handler(&calls)).unwrap();
        }
        let ids: Vec<u64> = table.drain().into_iter().map(|(id, _)| id.get()).collect();
        assert_eq!(ids, vec![1, 2, 3, 4, 5]);
    }
}

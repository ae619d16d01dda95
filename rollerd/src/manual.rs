//! Manual roll requests.
//!
//! Operators can ask for a one-off roll to a specific revision; the
//! controller consumes pending requests whenever the state machine is
//! idle with nothing of its own to roll. Requests live in a bounded
//! in-memory map; durability is the embedding application's concern.

use chrono::Utc;
use roller_common::{ManualRollRequest, ManualRollStatus, Result, RollerError, truncate_to_micros};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;

/// Queue of operator-requested rolls with CAS-guarded updates.
#[derive(Clone, Default)]
pub struct ManualRollQueue {
    requests: Arc<RwLock<HashMap<String, ManualRollRequest>>>,
}

impl ManualRollQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a request.
    ///
    /// A brand-new request (empty id) must not carry a CAS token; an
    /// update must carry the token of the snapshot it read. Returns the
    /// stored request with its fresh token.
    pub fn put(&self, request: ManualRollRequest) -> Result<ManualRollRequest> {
        request.validate()?;

        let mut requests = self.requests.write().unwrap_or_else(|e| e.into_inner());

        let mut stored = request;
        if stored.id.is_empty() {
            if stored.db_modified.is_some() {
                return Err(RollerError::validation(
                    "new manual roll must not carry a db_modified timestamp",
                ));
            }
            stored.id = Uuid::new_v4().to_string();
            stored.timestamp = truncate_to_micros(stored.timestamp);
            stored.db_modified = Some(truncate_to_micros(Utc::now()));
            debug!(id = %stored.id, revision = %stored.revision, "manual roll requested");
            requests.insert(stored.id.clone(), stored.clone());
            return Ok(stored);
        }

        let existing = requests
            .get(&stored.id)
            .ok_or_else(|| RollerError::not_found("manual roll", &stored.id))?;
        if stored.db_modified.is_none() {
            return Err(RollerError::validation(
                "existing manual roll must carry its db_modified timestamp",
            ));
        }
        if stored.db_modified != existing.db_modified {
            return Err(RollerError::concurrent_update("manual roll", &stored.id));
        }

        let mut token = truncate_to_micros(Utc::now());
        if let Some(prev) = existing.db_modified {
            if token <= prev {
                token = prev + chrono::Duration::microseconds(1);
            }
        }
        stored.db_modified = Some(token);
        requests.insert(stored.id.clone(), stored.clone());
        Ok(stored)
    }

    pub fn get(&self, id: &str) -> Result<ManualRollRequest> {
        self.requests
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(id)
            .cloned()
            .ok_or_else(|| RollerError::not_found("manual roll", id))
    }

    /// Recent requests, newest first.
    pub fn get_recent(&self, limit: usize) -> Vec<ManualRollRequest> {
        let requests = self.requests.read().unwrap_or_else(|e| e.into_inner());
        let mut all: Vec<_> = requests.values().cloned().collect();
        all.sort_by(|a, b| b.timestamp.cmp(&a.timestamp));
        all.truncate(limit);
        all
    }

    /// Requests that have not completed, oldest first so the controller
    /// serves them in arrival order.
    pub fn get_incomplete(&self) -> Vec<ManualRollRequest> {
        let requests = self.requests.read().unwrap_or_else(|e| e.into_inner());
        let mut open: Vec<_> = requests
            .values()
            .filter(|r| r.status != ManualRollStatus::Complete)
            .cloned()
            .collect();
        open.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        open
    }

    /// Next pending request, if any.
    pub fn next_pending(&self) -> Option<ManualRollRequest> {
        self.get_incomplete()
            .into_iter()
            .find(|r| r.status == ManualRollStatus::Pending)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use roller_common::{ManualRollResult, RevisionId};

    fn request() -> ManualRollRequest {
        ManualRollRequest::new("alice", RevisionId::new("cccc"), "child-roller")
    }

    #[test]
    fn put_assigns_id_and_token() {
        let queue = ManualRollQueue::new();
        let stored = queue.put(request()).unwrap();
        assert!(!stored.id.is_empty());
        assert!(stored.db_modified.is_some());
        assert_eq!(queue.get(&stored.id).unwrap().requester, "alice");
    }

    #[test]
    fn put_rejects_new_request_with_token() {
        let queue = ManualRollQueue::new();
        let mut req = request();
        req.db_modified = Some(Utc::now());
        assert!(matches!(
            queue.put(req).unwrap_err(),
            RollerError::Validation(_)
        ));
    }

    #[test]
    fn put_rejects_update_without_token() {
        let queue = ManualRollQueue::new();
        let mut stored = queue.put(request()).unwrap();
        stored.db_modified = None;
        assert!(matches!(
            queue.put(stored).unwrap_err(),
            RollerError::Validation(_)
        ));
    }

    #[test]
    fn put_rejects_invalid_lifecycle_combinations() {
        let queue = ManualRollQueue::new();

        // Pending with a result.
        let mut req = request();
        req.result = ManualRollResult::Success;
        assert!(queue.put(req).is_err());

        // Running without a url.
        let mut req = request();
        req.status = ManualRollStatus::Running;
        assert!(queue.put(req).is_err());

        // Complete without a result.
        let mut req = request();
        req.status = ManualRollStatus::Complete;
        req.url = Some("https://review.example.com/c/1".to_string());
        assert!(queue.put(req).is_err());
    }

    #[test]
    fn concurrent_updates_cannot_both_win() {
        let queue = ManualRollQueue::new();
        let stored = queue.put(request()).unwrap();

        let mut first = stored.clone();
        first.status = ManualRollStatus::Running;
        first.url = Some("https://review.example.com/c/1".to_string());

        let mut second = stored;
        second.status = ManualRollStatus::Running;
        second.url = Some("https://review.example.com/c/2".to_string());

        queue.put(first).unwrap();
        assert!(matches!(
            queue.put(second).unwrap_err(),
            RollerError::ConcurrentUpdate { .. }
        ));
    }

    #[test]
    fn incomplete_excludes_completed_and_orders_by_age() {
        let queue = ManualRollQueue::new();
        let a = queue.put(request()).unwrap();
        let mut b = request();
        b.timestamp = a.timestamp + chrono::Duration::seconds(5);
        let b = queue.put(b).unwrap();

        // Complete the first request.
        let mut done = a.clone();
        done.status = ManualRollStatus::Running;
        done.url = Some("https://review.example.com/c/1".to_string());
        let mut done = queue.put(done).unwrap();
        done.status = ManualRollStatus::Complete;
        done.result = ManualRollResult::Success;
        queue.put(done).unwrap();

        let open = queue.get_incomplete();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].id, b.id);
        assert_eq!(queue.next_pending().unwrap().id, b.id);
    }
}

//! Landed-commit reconciliation.
//!
//! Whenever the parent repository gains new commits, each one is
//! correlated with a previously uploaded roll: the matching record is
//! marked landed and its expectation overrides are merged into the shared
//! expectations store. Changes the review system still reports as open
//! are left for a later batch; the review side must settle first.

use roller_common::{
    ChangeState, CodeReviewSystem, Result, RevisionId, RollStatus, RollerError,
};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex, RwLock};
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::metrics;
use crate::store::RollRecordStore;

/// Number of reconciliation workers per batch.
const RECONCILE_WORKERS: usize = 4;

// ── Expectations Store ───────────────────────────────────────────────────

/// Shared overlay of per-roll expectation overrides, keyed by
/// `(changelist id, review-system id)`. Writes within a key are last-wins
/// and serialized by the store's lock.
#[derive(Clone, Default)]
pub struct ExpectationsStore {
    inner: Arc<RwLock<HashMap<(String, i64), BTreeMap<String, String>>>>,
}

impl ExpectationsStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Merge `overrides` into the expectations for the given key.
    pub fn apply(&self, changelist_id: &str, crs_id: i64, overrides: &BTreeMap<String, String>) {
        if overrides.is_empty() {
            return;
        }
        let mut inner = self.inner.write().unwrap_or_else(|e| e.into_inner());
        let entry = inner
            .entry((changelist_id.to_string(), crs_id))
            .or_default();
        for (key, value) in overrides {
            entry.insert(key.clone(), value.clone());
        }
        debug!(
            changelist = changelist_id,
            crs_id,
            count = overrides.len(),
            "merged expectation overrides"
        );
    }

    pub fn get(&self, changelist_id: &str, crs_id: i64) -> Option<BTreeMap<String, String>> {
        self.inner
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .get(&(changelist_id.to_string(), crs_id))
            .cloned()
    }

    /// Full snapshot for the status surface.
    pub fn snapshot(&self) -> Vec<((String, i64), BTreeMap<String, String>)> {
        let inner = self.inner.read().unwrap_or_else(|e| e.into_inner());
        let mut entries: Vec<_> = inner
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }
}

// ── Reconciler ───────────────────────────────────────────────────────────

/// Outcome of reconciling one parent commit.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// No change, no record, already landed, or a duplicate in this batch.
    Skipped,
    /// The review system still reports the change open; try next batch.
    StillOpen,
    /// Marked landed; expectations merged.
    Landed,
    /// The change was abandoned; record refreshed, expectations untouched.
    Abandoned,
}

impl ReconcileOutcome {
    fn label(self) -> &'static str {
        match self {
            Self::Skipped => "skipped",
            Self::StillOpen => "still_open",
            Self::Landed => "landed",
            Self::Abandoned => "abandoned",
        }
    }
}

/// Per-batch counts, for logs and the status surface.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ReconcileSummary {
    pub landed: usize,
    pub abandoned: usize,
    pub still_open: usize,
    pub skipped: usize,
}

/// Correlates newly landed parent commits with uploaded rolls.
#[derive(Clone)]
pub struct Reconciler {
    review: Arc<dyn CodeReviewSystem>,
    store: RollRecordStore,
    expectations: ExpectationsStore,
    events: EventBus,
}

impl Reconciler {
    pub fn new(
        review: Arc<dyn CodeReviewSystem>,
        store: RollRecordStore,
        expectations: ExpectationsStore,
        events: EventBus,
    ) -> Self {
        Self {
            review,
            store,
            expectations,
            events,
        }
    }

    /// Process a batch of newly observed parent commits, sharded over a
    /// small fixed worker count. Commits within a shard are processed in
    /// order; a shared seen-set deduplicates changes that appear under
    /// more than one commit (overlapping pages).
    pub async fn reconcile(&self, commits: Vec<RevisionId>) -> ReconcileSummary {
        if commits.is_empty() {
            return ReconcileSummary::default();
        }
        let seen: Arc<Mutex<HashSet<i64>>> = Arc::new(Mutex::new(HashSet::new()));
        let shard_len = commits.len().div_ceil(RECONCILE_WORKERS);

        let mut handles = Vec::new();
        for shard in commits.chunks(shard_len) {
            let reconciler = self.clone();
            let seen = Arc::clone(&seen);
            let shard = shard.to_vec();
            handles.push(tokio::spawn(async move {
                let mut summary = ReconcileSummary::default();
                for commit in shard {
                    let outcome = match reconciler.reconcile_commit(&commit, &seen).await {
                        Ok(outcome) => outcome,
                        Err(err) => {
                            warn!(commit = %commit, "reconciliation failed: {err}");
                            ReconcileOutcome::Skipped
                        }
                    };
                    metrics::RECONCILED_COMMITS_TOTAL
                        .with_label_values(&[outcome.label()])
                        .inc();
                    match outcome {
                        ReconcileOutcome::Landed => summary.landed += 1,
                        ReconcileOutcome::Abandoned => summary.abandoned += 1,
                        ReconcileOutcome::StillOpen => summary.still_open += 1,
                        ReconcileOutcome::Skipped => summary.skipped += 1,
                    }
                }
                summary
            }));
        }

        let mut total = ReconcileSummary::default();
        for handle in handles {
            match handle.await {
                Ok(summary) => {
                    total.landed += summary.landed;
                    total.abandoned += summary.abandoned;
                    total.still_open += summary.still_open;
                    total.skipped += summary.skipped;
                }
                Err(err) => warn!("reconcile worker panicked: {err}"),
            }
        }
        if total.landed + total.abandoned > 0 {
            info!(
                landed = total.landed,
                abandoned = total.abandoned,
                still_open = total.still_open,
                skipped = total.skipped,
                "reconciled parent commits"
            );
        }
        total
    }

    async fn reconcile_commit(
        &self,
        commit: &RevisionId,
        seen: &Mutex<HashSet<i64>>,
    ) -> Result<ReconcileOutcome> {
        // 1. Which change produced this commit?
        let Some(mut handle) = self.review.get_change_for_commit(commit).await? else {
            debug!(commit = %commit, "no change for commit");
            return Ok(ReconcileOutcome::Skipped);
        };

        // Overlapping pages: process each change at most once per batch.
        {
            let mut seen = seen.lock().unwrap_or_else(|e| e.into_inner());
            if !seen.insert(handle.issue) {
                return Ok(ReconcileOutcome::Skipped);
            }
        }

        // 2. Load our record of it.
        let record = match self.store.get(&handle.issue.to_string()).await {
            Ok(record) => record,
            Err(err) if err.is_not_found() => {
                debug!(issue = handle.issue, "no roll record for change");
                return Ok(ReconcileOutcome::Skipped);
            }
            Err(err) => return Err(err),
        };

        // 3. Nothing to do twice.
        if record.landed {
            return Ok(ReconcileOutcome::Skipped);
        }

        // 4. Refresh; the review system must settle before we merge
        //    expectations.
        self.review.update(&mut handle).await?;
        match handle.state {
            ChangeState::Open => Ok(ReconcileOutcome::StillOpen),
            ChangeState::Landed => {
                // 5. Merge overrides, then mark the record landed.
                self.expectations.apply(
                    &record.roll_id,
                    record.issue,
                    &record.expectation_overrides,
                );
                self.put_with_one_retry(&record.roll_id, |r| {
                    if !r.status.is_terminal() {
                        r.status = RollStatus::Success;
                    }
                    r.landed = true;
                    r.modified = handle.updated;
                    r.subject = handle.subject.clone();
                })
                .await?;
                self.events.emit_roll_landed(record.issue);
                Ok(ReconcileOutcome::Landed)
            }
            ChangeState::Abandoned => {
                // 6. Refresh the record; expectations stay untouched.
                self.put_with_one_retry(&record.roll_id, |r| {
                    r.modified = handle.updated;
                    r.subject = handle.subject.clone();
                })
                .await?;
                Ok(ReconcileOutcome::Abandoned)
            }
        }
    }

    /// Persist a mutation of the named record, retrying a lost CAS race
    /// once with a fresh read.
    async fn put_with_one_retry<F>(&self, roll_id: &str, mutate: F) -> Result<()>
    where
        F: Fn(&mut roller_common::RollRecord),
    {
        let mut record = self.store.get(roll_id).await?;
        mutate(&mut record);
        match self.store.put_if_fresh(record).await {
            Ok(_) => Ok(()),
            Err(RollerError::ConcurrentUpdate { .. }) => {
                let mut fresh = self.store.get(roll_id).await?;
                mutate(&mut fresh);
                self.store.put_if_fresh(fresh).await?;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }
}

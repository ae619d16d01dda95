//! The controller loop.
//!
//! Single-instance tick driver: on each tick it runs the state machine's
//! decision pipeline, reconciles any newly landed parent commits, serves
//! pending manual-roll requests when the roller is idle, and publishes a
//! status snapshot for the HTTP surface. A coarser repo tick refreshes
//! the repository view between decision ticks.

use roller_common::{
    CodeReviewSystem, ManualRollRequest, ManualRollResult, ManualRollStatus, Mode, RepoInspector,
    Result, RollRecord, RollStatus, RollerError,
};
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::events::EventBus;
use crate::manual::ManualRollQueue;
use crate::metrics;
use crate::mode::ModeSource;
use crate::reconciler::{ExpectationsStore, Reconciler};
use crate::state::{RollState, RollStateMachine};
use crate::store::RollRecordStore;

/// Read-only status snapshot served over HTTP.
#[derive(Debug, Clone, Default, Serialize)]
pub struct RollerStatus {
    pub roller_name: String,
    pub state: String,
    pub mode: String,
    /// The roll currently tracked by the state machine, if any.
    pub current_roll: Option<RollRecord>,
    /// Most recent roll that reached a terminal status.
    pub last_roll: Option<RollRecord>,
    /// Most recent tick error; empty when the roller is healthy. Kept
    /// across later successful ticks until explicitly reset.
    pub error: String,
    /// Child revisions not yet rolled into the parent.
    pub unrolled_count: usize,
}

impl RollerStatus {
    /// Strip fields that should not leave the deployment (issue numbers,
    /// subjects, try results).
    pub fn redacted(&self) -> Self {
        let mut status = self.clone();
        for roll in [status.current_roll.as_mut(), status.last_roll.as_mut()]
            .into_iter()
            .flatten()
        {
            roll.issue = 0;
            roll.subject.clear();
            roll.try_results.clear();
        }
        status
    }
}

/// Ties the state machine, reconciler, and manual queue together and owns
/// the tick cadences.
pub struct Controller {
    machine: tokio::sync::Mutex<RollStateMachine>,
    repo: Arc<dyn RepoInspector>,
    review: Arc<dyn CodeReviewSystem>,
    store: RollRecordStore,
    manual: ManualRollQueue,
    mode: Arc<ModeSource>,
    reconciler: Reconciler,
    events: EventBus,
    status: RwLock<RollerStatus>,
    cancel: CancellationToken,
    started: AtomicBool,
    roller_name: String,
}

impl Controller {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        roller_name: String,
        machine: RollStateMachine,
        repo: Arc<dyn RepoInspector>,
        review: Arc<dyn CodeReviewSystem>,
        store: RollRecordStore,
        manual: ManualRollQueue,
        mode: Arc<ModeSource>,
        expectations: ExpectationsStore,
        events: EventBus,
    ) -> Arc<Self> {
        let reconciler = Reconciler::new(
            Arc::clone(&review),
            store.clone(),
            expectations,
            events.clone(),
        );
        Arc::new(Self {
            machine: tokio::sync::Mutex::new(machine),
            repo,
            review,
            store,
            manual,
            mode,
            reconciler,
            events,
            status: RwLock::new(RollerStatus {
                roller_name: roller_name.clone(),
                ..Default::default()
            }),
            cancel: CancellationToken::new(),
            started: AtomicBool::new(false),
            roller_name,
        })
    }

    /// Cancellation token propagated to every effect.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Stop the loop and abort in-flight effect I/O.
    pub fn shutdown(&self) {
        self.cancel.cancel();
    }

    /// Run the controller until cancellation. Idempotent: a second call
    /// returns immediately.
    pub async fn start(self: &Arc<Self>, tick: Duration, repo_tick: Duration) -> Result<()> {
        if self.started.swap(true, Ordering::SeqCst) {
            debug!("controller already started");
            return Ok(());
        }
        info!(
            roller = %self.roller_name,
            tick_secs = tick.as_secs(),
            repo_tick_secs = repo_tick.as_secs(),
            "controller loop starting"
        );

        let mut tick_timer = tokio::time::interval(tick);
        let mut repo_timer = tokio::time::interval(repo_tick);
        // The first interval fire is immediate for both; let the decision
        // tick own startup work.
        repo_timer.tick().await;

        loop {
            tokio::select! {
                _ = self.cancel.cancelled() => {
                    info!("controller loop cancelled");
                    return Ok(());
                }
                _ = tick_timer.tick() => {
                    self.tick_once().await;
                }
                _ = repo_timer.tick() => {
                    if let Err(err) = self.repo.update_repos(&self.cancel).await {
                        warn!("repo refresh failed: {err}");
                    }
                }
            }
        }
    }

    /// Execute one full decision tick. Public so embedders and tests can
    /// drive the controller without timers.
    pub async fn tick_once(&self) {
        let started = Instant::now();
        let mode = self.mode.get();

        let tick_result = {
            let mut machine = self.machine.lock().await;
            machine.tick(mode, &self.cancel).await
        };
        let outcome = match &tick_result {
            Ok(()) => "ok",
            Err(_) => "error",
        };
        metrics::TICKS_TOTAL.with_label_values(&[outcome]).inc();
        metrics::TICK_DURATION_SECONDS.observe(started.elapsed().as_secs_f64());

        if let Err(err) = &tick_result {
            warn!("tick failed: {err}");
            self.events.emit(
                crate::events::EVENT_TICK_ERROR,
                &serde_json::json!({ "error": err.to_string() }),
            );
        }

        // Reconcile any parent commits that appeared since the last tick.
        let commits = self.repo.new_parent_commits().await;
        if !commits.is_empty() {
            debug!(count = commits.len(), "new parent commits");
            self.reconciler.reconcile(commits).await;
        }

        // Serve manual requests while the roller has nothing of its own
        // to do, and settle any in-flight ones.
        self.complete_running_manual_rolls().await;
        if let Err(err) = self.maybe_start_manual_roll().await {
            warn!("manual roll handoff failed: {err}");
        }

        self.publish_status(mode, tick_result.err()).await;
    }

    /// Upload the next pending manual request when the state machine is
    /// idle and the parent is already up to date.
    async fn maybe_start_manual_roll(&self) -> Result<()> {
        {
            let machine = self.machine.lock().await;
            if machine.current() != RollState::NormalIdle || machine.active().is_some() {
                return Ok(());
            }
        }
        let current = self.repo.current_rev().await;
        let next = self.repo.next_roll_rev().await;
        if current != next {
            return Ok(());
        }
        let Some(request) = self.manual.next_pending() else {
            return Ok(());
        };

        // One-off upload, bypassing next-revision selection.
        let handle = self
            .review
            .upload_new_roll(&current, &request.revision, false)
            .await?;
        info!(
            issue = handle.issue,
            requester = %request.requester,
            revision = %request.revision,
            "uploaded manual roll"
        );
        let note = format!("Roll requested by {}.", request.requester);
        if let Err(err) = self.review.add_comment(&handle, &note).await {
            warn!("failed to attach requester comment: {err}");
        }

        let now = chrono::Utc::now();
        self.store
            .put_if_fresh(RollRecord {
                roll_id: handle.issue.to_string(),
                issue: handle.issue,
                url: handle.url.clone(),
                subject: handle.subject.clone(),
                rolling_from: current,
                rolling_to: request.revision.clone(),
                created: now,
                modified: now,
                db_modified: None,
                status: RollStatus::InProgress,
                dry_run: false,
                landed: false,
                try_results: Vec::new(),
                expectation_overrides: Default::default(),
            })
            .await?;

        let mut running = request;
        running.status = ManualRollStatus::Running;
        running.url = Some(handle.url.clone());
        let stored = self.manual.put(running)?;
        self.events.emit(
            crate::events::EVENT_MANUAL_ROLL_STARTED,
            &serde_json::json!({ "id": stored.id, "issue": handle.issue, "url": handle.url }),
        );
        Ok(())
    }

    /// Move running manual requests to complete once their roll record
    /// reaches a terminal state.
    async fn complete_running_manual_rolls(&self) {
        let running: Vec<ManualRollRequest> = self
            .manual
            .get_incomplete()
            .into_iter()
            .filter(|r| r.status == ManualRollStatus::Running)
            .collect();
        if running.is_empty() {
            return;
        }

        let recent = self.store.get_recent(usize::MAX).await;
        for request in running {
            let Some(url) = request.url.clone() else {
                continue;
            };
            let Some(record) = recent.iter().find(|r| r.url == url) else {
                continue;
            };
            let result = if record.landed || record.status == RollStatus::Success {
                ManualRollResult::Success
            } else if record.is_terminal() {
                ManualRollResult::Failure
            } else {
                continue;
            };

            let mut done = request;
            done.status = ManualRollStatus::Complete;
            done.result = result;
            match self.manual.put(done) {
                Ok(done) => {
                    info!(id = %done.id, result = ?result, "manual roll complete");
                }
                Err(RollerError::ConcurrentUpdate { id, .. }) => {
                    debug!(id = %id, "manual roll advanced concurrently; will retry");
                }
                Err(err) => warn!("failed to complete manual roll: {err}"),
            }
        }
    }

    async fn publish_status(&self, mode: Mode, tick_error: Option<RollerError>) {
        let (state, current_roll) = {
            let machine = self.machine.lock().await;
            (
                machine.current(),
                machine.active().map(|a| a.record.clone()),
            )
        };
        let last_roll = self
            .store
            .get_recent(usize::MAX)
            .await
            .into_iter()
            .find(|r| r.is_terminal());
        let unrolled = self.repo.not_rolled_count().await;

        metrics::UNROLLED_REVISIONS.set(unrolled as i64);
        metrics::MANUAL_QUEUE_DEPTH.set(self.manual.get_incomplete().len() as i64);

        let mut status = self.status.write().unwrap_or_else(|e| e.into_inner());
        status.state = state.to_string();
        status.mode = mode.to_string();
        status.current_roll = current_roll;
        status.last_roll = last_roll;
        status.unrolled_count = unrolled;
        // The last error sticks around until a reset so operators see
        // intermittent failures.
        if let Some(err) = tick_error {
            status.error = err.to_string();
        }
    }

    /// Current state label.
    pub async fn current_state(&self) -> String {
        self.machine.lock().await.current().to_string()
    }

    /// Status snapshot; sensitive fields are stripped unless asked for.
    pub fn status(&self, include_sensitive: bool) -> RollerStatus {
        let status = self.status.read().unwrap_or_else(|e| e.into_inner());
        if include_sensitive {
            status.clone()
        } else {
            status.redacted()
        }
    }

    /// Clear the sticky tick-error string.
    pub fn reset_error(&self) {
        self.status
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .error
            .clear();
    }

    /// Validate and enqueue a manual roll request.
    pub fn add_manual_roll(&self, request: ManualRollRequest) -> Result<ManualRollRequest> {
        if request.roller_name != self.roller_name {
            return Err(RollerError::validation(format!(
                "manual roll addressed to {:?}, this roller is {:?}",
                request.roller_name, self.roller_name
            )));
        }
        self.manual.put(request)
    }

    pub fn manual_queue(&self) -> &ManualRollQueue {
        &self.manual
    }
}

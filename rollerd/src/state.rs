//! The roll state machine.
//!
//! Fifteen states drive the roller: a stopped state plus normal and
//! dry-run families of idle/active/success/failure/throttled states. On
//! each tick the decision function picks the next state from the current
//! inputs (mode, repo view, throttles, active-roll verdicts), the closed
//! transition table names the effect that carries the machine there, and
//! consecutive no-op transitions are collapsed greedily so multi-hop
//! routes (e.g. safety-throttled -> idle -> stopped) complete in one tick.
//!
//! The current state is persisted as a single human-readable line so a
//! restarted roller resumes where it left off.

use chrono::Utc;
use roller_common::{
    CodeReviewSystem, ErrorCode, Mode, RepoInspector, Result, RollHandle, RollRecord, RollStatus,
    RollerError, ChangeState, CheckState,
};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::events::EventBus;
use crate::store::RollRecordStore;
use crate::throttle::Throttler;

/// Poll cadence inside `wait-for-land`.
const DEFAULT_LAND_POLL_INTERVAL: Duration = Duration::from_secs(10);

/// Cap on greedy no-op collapsing per tick. Exceeding it indicates a
/// decision-function bug; the tick is ended, not the process.
const MAX_NOOP_COLLAPSE: usize = 10;

const STATE_FILE: &str = "fsm_state";

// ── States ───────────────────────────────────────────────────────────────

/// The fifteen roller states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum RollState {
    Stopped,
    NormalIdle,
    NormalActive,
    NormalSuccess,
    NormalSuccessThrottled,
    NormalFailure,
    NormalFailureThrottled,
    NormalSafetyThrottled,
    DryRunIdle,
    DryRunActive,
    DryRunSuccess,
    DryRunSuccessLeavingOpen,
    DryRunFailure,
    DryRunFailureThrottled,
    DryRunSafetyThrottled,
}

/// Every state, for exhaustive tests and gauge labels.
pub const ALL_STATES: [RollState; 15] = [
    RollState::Stopped,
    RollState::NormalIdle,
    RollState::NormalActive,
    RollState::NormalSuccess,
    RollState::NormalSuccessThrottled,
    RollState::NormalFailure,
    RollState::NormalFailureThrottled,
    RollState::NormalSafetyThrottled,
    RollState::DryRunIdle,
    RollState::DryRunActive,
    RollState::DryRunSuccess,
    RollState::DryRunSuccessLeavingOpen,
    RollState::DryRunFailure,
    RollState::DryRunFailureThrottled,
    RollState::DryRunSafetyThrottled,
];

impl RollState {
    /// States that track an open change at the review system.
    pub fn requires_active_roll(self) -> bool {
        matches!(
            self,
            Self::NormalActive
                | Self::NormalSuccess
                | Self::NormalFailure
                | Self::NormalFailureThrottled
                | Self::DryRunActive
                | Self::DryRunSuccess
                | Self::DryRunSuccessLeavingOpen
                | Self::DryRunFailure
                | Self::DryRunFailureThrottled
        )
    }
}

impl std::fmt::Display for RollState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Stopped => "stopped",
            Self::NormalIdle => "normal-idle",
            Self::NormalActive => "normal-active",
            Self::NormalSuccess => "normal-success",
            Self::NormalSuccessThrottled => "normal-success-throttled",
            Self::NormalFailure => "normal-failure",
            Self::NormalFailureThrottled => "normal-failure-throttled",
            Self::NormalSafetyThrottled => "normal-safety-throttled",
            Self::DryRunIdle => "dry-run-idle",
            Self::DryRunActive => "dry-run-active",
            Self::DryRunSuccess => "dry-run-success",
            Self::DryRunSuccessLeavingOpen => "dry-run-success-leaving-open",
            Self::DryRunFailure => "dry-run-failure",
            Self::DryRunFailureThrottled => "dry-run-failure-throttled",
            Self::DryRunSafetyThrottled => "dry-run-safety-throttled",
        };
        write!(f, "{label}")
    }
}

impl std::str::FromStr for RollState {
    type Err = RollerError;

    fn from_str(s: &str) -> Result<Self> {
        ALL_STATES
            .into_iter()
            .find(|state| state.to_string() == s.trim())
            .ok_or_else(|| {
                RollerError::validation(format!(
                    "{}: unknown state label {s:?}",
                    ErrorCode::StateParseError.code_str()
                ))
            })
    }
}

// ── Effects ──────────────────────────────────────────────────────────────

/// Effect functions attached to transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Effect {
    Noop,
    UpdateRepos,
    UploadRoll,
    UploadDryRun,
    UpdateRoll,
    SwitchToDryRun,
    SwitchToNormal,
    CloseFailed,
    CloseStopped,
    CloseDryRunFailed,
    CloseDryRunOutdated,
    WaitForLand,
    RetryFailedNormal,
    RetryFailedDryRun,
}

impl std::fmt::Display for Effect {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::Noop => "noop",
            Self::UpdateRepos => "update-repos",
            Self::UploadRoll => "upload-roll",
            Self::UploadDryRun => "upload-dry-run",
            Self::UpdateRoll => "update-roll",
            Self::SwitchToDryRun => "switch-to-dry-run",
            Self::SwitchToNormal => "switch-to-normal",
            Self::CloseFailed => "close-failed",
            Self::CloseStopped => "close-stopped",
            Self::CloseDryRunFailed => "close-dry-run-failed",
            Self::CloseDryRunOutdated => "close-dry-run-outdated",
            Self::WaitForLand => "wait-for-land",
            Self::RetryFailedNormal => "retry-failed-normal",
            Self::RetryFailedDryRun => "retry-failed-dry-run",
        };
        write!(f, "{label}")
    }
}

/// The closed transition table. Any (from, to) pair without an entry is a
/// fatal error at tick time.
pub fn transition_effect(from: RollState, to: RollState) -> Option<Effect> {
    use Effect::*;
    use RollState::*;
    let effect = match (from, to) {
        (Stopped, Stopped) => UpdateRepos,
        (Stopped, NormalIdle) | (Stopped, DryRunIdle) => Noop,

        (NormalIdle, NormalIdle) => UpdateRepos,
        (NormalIdle, Stopped)
        | (NormalIdle, DryRunIdle)
        | (NormalIdle, NormalSuccessThrottled)
        | (NormalIdle, NormalSafetyThrottled) => Noop,
        (NormalIdle, NormalActive) => UploadRoll,

        (NormalActive, NormalActive) => UpdateRoll,
        (NormalActive, DryRunActive) => SwitchToDryRun,
        (NormalActive, NormalSuccess) | (NormalActive, NormalFailure) => Noop,
        (NormalActive, Stopped) => CloseStopped,

        (NormalSuccess, NormalIdle) | (NormalSuccess, NormalSuccessThrottled) => WaitForLand,

        (NormalSuccessThrottled, NormalSuccessThrottled) => UpdateRepos,
        (NormalSuccessThrottled, NormalIdle)
        | (NormalSuccessThrottled, DryRunIdle)
        | (NormalSuccessThrottled, Stopped) => Noop,

        (NormalFailure, NormalIdle) => CloseFailed,
        (NormalFailure, NormalFailureThrottled) => Noop,

        (NormalFailureThrottled, NormalFailureThrottled) => UpdateRepos,
        (NormalFailureThrottled, NormalActive) => RetryFailedNormal,
        (NormalFailureThrottled, DryRunActive) => SwitchToDryRun,
        (NormalFailureThrottled, NormalIdle) => CloseFailed,
        (NormalFailureThrottled, Stopped) => CloseStopped,

        (NormalSafetyThrottled, NormalSafetyThrottled) => UpdateRepos,
        (NormalSafetyThrottled, NormalIdle) => Noop,

        (DryRunIdle, DryRunIdle) => UpdateRepos,
        (DryRunIdle, Stopped)
        | (DryRunIdle, NormalIdle)
        | (DryRunIdle, DryRunSafetyThrottled) => Noop,
        (DryRunIdle, DryRunActive) => UploadDryRun,

        (DryRunActive, DryRunActive) => UpdateRoll,
        (DryRunActive, NormalActive) => SwitchToNormal,
        (DryRunActive, DryRunSuccess) | (DryRunActive, DryRunFailure) => Noop,
        (DryRunActive, Stopped) => CloseStopped,

        (DryRunSuccess, DryRunSuccessLeavingOpen) => Noop,
        (DryRunSuccess, DryRunIdle) => CloseDryRunOutdated,

        (DryRunSuccessLeavingOpen, DryRunSuccessLeavingOpen) => UpdateRepos,
        (DryRunSuccessLeavingOpen, NormalActive) => SwitchToNormal,
        (DryRunSuccessLeavingOpen, DryRunIdle) => CloseDryRunOutdated,
        (DryRunSuccessLeavingOpen, Stopped) => CloseStopped,

        (DryRunFailure, DryRunIdle) => CloseDryRunFailed,
        (DryRunFailure, DryRunFailureThrottled) => Noop,

        (DryRunFailureThrottled, DryRunFailureThrottled) => UpdateRepos,
        (DryRunFailureThrottled, DryRunActive) => RetryFailedDryRun,
        (DryRunFailureThrottled, NormalActive) => SwitchToNormal,
        (DryRunFailureThrottled, DryRunIdle) => CloseDryRunFailed,
        (DryRunFailureThrottled, Stopped) => CloseStopped,

        (DryRunSafetyThrottled, DryRunSafetyThrottled) => UpdateRepos,
        (DryRunSafetyThrottled, DryRunIdle) => Noop,

        _ => return None,
    };
    Some(effect)
}

// ── Decision ─────────────────────────────────────────────────────────────

/// Snapshot of everything the decision function reads.
#[derive(Debug, Clone, Copy)]
pub struct DecisionInputs {
    pub mode: Mode,
    /// The parent already pins the revision we would roll to.
    pub up_to_date: bool,
    pub safety_throttled: bool,
    pub success_throttled: bool,
    pub failure_throttled: bool,
    /// Verdicts of the active roll, if any.
    pub active_finished: bool,
    pub active_success: bool,
    pub active_dry_finished: bool,
    pub active_dry_success: bool,
    /// The active roll still targets the revision we want next.
    pub active_matches_next: bool,
    /// A nonzero max roll frequency is configured.
    pub max_roll_frequency_set: bool,
    /// The review system can flip a dry-run change into a full CQ run.
    pub supports_promotion: bool,
}

/// Pick the next state. Pure over its inputs; every returned state is
/// reachable from `state` through the transition table.
pub fn decide(state: RollState, inputs: &DecisionInputs) -> RollState {
    use RollState::*;
    match state {
        Stopped => match inputs.mode {
            Mode::Stopped => Stopped,
            Mode::Running => NormalIdle,
            Mode::DryRun => DryRunIdle,
        },

        NormalIdle => match inputs.mode {
            Mode::Stopped => Stopped,
            Mode::DryRun => DryRunIdle,
            Mode::Running => {
                if inputs.up_to_date {
                    NormalIdle
                } else if inputs.safety_throttled {
                    // Safety strictly dominates success throttling.
                    NormalSafetyThrottled
                } else if inputs.success_throttled {
                    NormalSuccessThrottled
                } else {
                    NormalActive
                }
            }
        },

        DryRunIdle => match inputs.mode {
            Mode::Stopped => Stopped,
            Mode::Running => NormalIdle,
            Mode::DryRun => {
                if inputs.up_to_date {
                    DryRunIdle
                } else if inputs.safety_throttled {
                    DryRunSafetyThrottled
                } else {
                    DryRunActive
                }
            }
        },

        NormalActive => match inputs.mode {
            Mode::Stopped => Stopped,
            Mode::DryRun => DryRunActive,
            Mode::Running => {
                if !inputs.active_finished {
                    NormalActive
                } else if inputs.active_success {
                    NormalSuccess
                } else {
                    NormalFailure
                }
            }
        },

        DryRunActive => match inputs.mode {
            Mode::Stopped => Stopped,
            Mode::Running if inputs.supports_promotion => NormalActive,
            // Without in-place promotion the active dry run is allowed to
            // finish; the success/failure paths then re-upload for CQ.
            Mode::Running | Mode::DryRun => {
                if !inputs.active_dry_finished {
                    DryRunActive
                } else if inputs.active_dry_success {
                    DryRunSuccess
                } else {
                    DryRunFailure
                }
            }
        },

        NormalSuccess => {
            if inputs.max_roll_frequency_set {
                NormalSuccessThrottled
            } else {
                NormalIdle
            }
        }

        NormalSuccessThrottled => match inputs.mode {
            Mode::Stopped => Stopped,
            Mode::DryRun => DryRunIdle,
            Mode::Running => {
                if inputs.success_throttled {
                    NormalSuccessThrottled
                } else {
                    NormalIdle
                }
            }
        },

        NormalFailure => {
            if inputs.mode == Mode::Running && inputs.active_matches_next {
                // Re-uploading an identical change would fail identically.
                NormalFailureThrottled
            } else {
                NormalIdle
            }
        }

        NormalFailureThrottled => match inputs.mode {
            Mode::Stopped => Stopped,
            Mode::DryRun => DryRunActive,
            Mode::Running => {
                if !inputs.active_matches_next {
                    NormalIdle
                } else if !inputs.failure_throttled {
                    NormalActive
                } else {
                    NormalFailureThrottled
                }
            }
        },

        NormalSafetyThrottled => {
            if inputs.mode == Mode::Running && inputs.safety_throttled {
                NormalSafetyThrottled
            } else {
                NormalIdle
            }
        }

        DryRunSuccess => {
            if inputs.active_matches_next {
                DryRunSuccessLeavingOpen
            } else {
                DryRunIdle
            }
        }

        DryRunSuccessLeavingOpen => match inputs.mode {
            Mode::Stopped => Stopped,
            Mode::Running => {
                if inputs.supports_promotion {
                    NormalActive
                } else {
                    DryRunIdle
                }
            }
            Mode::DryRun => {
                if inputs.active_matches_next {
                    DryRunSuccessLeavingOpen
                } else {
                    DryRunIdle
                }
            }
        },

        DryRunFailure => {
            if inputs.mode == Mode::DryRun && inputs.active_matches_next {
                DryRunFailureThrottled
            } else {
                DryRunIdle
            }
        }

        DryRunFailureThrottled => match inputs.mode {
            Mode::Stopped => Stopped,
            Mode::Running => {
                if inputs.supports_promotion {
                    NormalActive
                } else {
                    DryRunIdle
                }
            }
            Mode::DryRun => {
                if !inputs.active_matches_next {
                    DryRunIdle
                } else if !inputs.failure_throttled {
                    DryRunActive
                } else {
                    DryRunFailureThrottled
                }
            }
        },

        DryRunSafetyThrottled => {
            if inputs.mode == Mode::DryRun && inputs.safety_throttled {
                DryRunSafetyThrottled
            } else {
                DryRunIdle
            }
        }
    }
}

// ── Machine ──────────────────────────────────────────────────────────────

/// The state machine plus the capability objects its effects drive.
pub struct RollStateMachine {
    state: RollState,
    state_path: PathBuf,
    throttle: Throttler,
    review: Arc<dyn CodeReviewSystem>,
    repo: Arc<dyn RepoInspector>,
    store: RollRecordStore,
    events: EventBus,
    active: Option<ActiveRoll>,
    land_poll_interval: Duration,
}

/// The single roll the machine is currently tracking.
#[derive(Debug, Clone)]
pub struct ActiveRoll {
    pub handle: RollHandle,
    pub record: RollRecord,
}

impl RollStateMachine {
    /// Open the machine, restoring the persisted state label and, when
    /// the label names an active state, resurrecting the active roll from
    /// the newest incomplete record.
    pub async fn load_or_create(
        workdir: &Path,
        throttle: Throttler,
        review: Arc<dyn CodeReviewSystem>,
        repo: Arc<dyn RepoInspector>,
        store: RollRecordStore,
        events: EventBus,
    ) -> Result<Self> {
        let state_path = workdir.join(STATE_FILE);
        let mut state = match tokio::fs::read_to_string(&state_path).await {
            Ok(raw) => raw.parse()?,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => RollState::NormalIdle,
            Err(err) => return Err(err.into()),
        };

        let mut active = None;
        if state.requires_active_roll() {
            match store.get_incomplete().await.into_iter().next() {
                Some(record) => {
                    debug!(
                        roll = %record.roll_id,
                        issue = record.issue,
                        "resuming active roll from store"
                    );
                    active = Some(ActiveRoll {
                        handle: handle_from_record(&record),
                        record,
                    });
                }
                None => {
                    let fallback = if state.to_string().starts_with("dry-run") {
                        RollState::DryRunIdle
                    } else {
                        RollState::NormalIdle
                    };
                    warn!(
                        state = %state,
                        fallback = %fallback,
                        "persisted state requires an active roll but none was found"
                    );
                    state = fallback;
                }
            }
        }

        let machine = Self {
            state,
            state_path,
            throttle,
            review,
            repo,
            store,
            events,
            active,
            land_poll_interval: DEFAULT_LAND_POLL_INTERVAL,
        };
        machine.persist_state().await?;
        info!(state = %machine.state, "state machine ready");
        Ok(machine)
    }

    /// Override the wait-for-land poll cadence (tests).
    pub fn set_land_poll_interval(&mut self, interval: Duration) {
        self.land_poll_interval = interval;
    }

    pub fn current(&self) -> RollState {
        self.state
    }

    pub fn active(&self) -> Option<&ActiveRoll> {
        self.active.as_ref()
    }

    /// Run one decision tick: perform the chosen transition, then collapse
    /// any immediately following no-op transitions.
    ///
    /// On effect failure the machine stays in its pre-transition state and
    /// the error propagates; the next tick re-attempts the same route.
    pub async fn tick(&mut self, mode: Mode, cancel: &CancellationToken) -> Result<()> {
        self.step(mode, cancel).await?;

        let mut collapsed = 0;
        loop {
            let next = decide(self.state, &self.gather_inputs(mode).await);
            let Some(effect) = transition_effect(self.state, next) else {
                break;
            };
            if effect != Effect::Noop || next == self.state {
                break;
            }
            if collapsed >= MAX_NOOP_COLLAPSE {
                error!(
                    state = %self.state,
                    "{}: no-op collapsing exceeded {MAX_NOOP_COLLAPSE} iterations",
                    ErrorCode::StateCollapseOverrun.code_str()
                );
                break;
            }
            self.apply(next, Effect::Noop, cancel).await?;
            collapsed += 1;
        }
        Ok(())
    }

    async fn step(&mut self, mode: Mode, cancel: &CancellationToken) -> Result<()> {
        let inputs = self.gather_inputs(mode).await;
        let next = decide(self.state, &inputs);
        let Some(effect) = transition_effect(self.state, next) else {
            return Err(RollerError::fatal(format!(
                "{}: no transition from {} to {next}",
                ErrorCode::StateUndeclaredTransition.code_str(),
                self.state
            )));
        };
        self.apply(next, effect, cancel).await
    }

    async fn gather_inputs(&self, mode: Mode) -> DecisionInputs {
        let current = self.repo.current_rev().await;
        let next = self.repo.next_roll_rev().await;
        let handle = self.active.as_ref().map(|a| &a.handle);
        DecisionInputs {
            mode,
            up_to_date: current == next,
            safety_throttled: self.throttle.safety_throttled(),
            success_throttled: self.throttle.success_throttled(),
            failure_throttled: self.throttle.failure_throttled(),
            active_finished: handle.map(|h| h.is_finished()).unwrap_or(false),
            active_success: handle.map(|h| h.is_success()).unwrap_or(false),
            active_dry_finished: handle.map(|h| h.is_dry_run_finished()).unwrap_or(false),
            active_dry_success: handle.map(|h| h.is_dry_run_success()).unwrap_or(false),
            active_matches_next: handle.map(|h| h.rolling_to == next).unwrap_or(false),
            max_roll_frequency_set: !self.repo.max_roll_frequency().is_zero(),
            supports_promotion: self.review.supports_dry_run_promotion(),
        }
    }

    /// Perform `effect` and commit the transition to `next`.
    async fn apply(
        &mut self,
        next: RollState,
        effect: Effect,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let from = self.state;
        debug!(from = %from, to = %next, effect = %effect, "transition");
        self.perform_effect(from, next, effect, cancel).await?;
        self.state = next;
        self.persist_state().await?;
        if from != next {
            self.events.emit_transition(&from.to_string(), &next.to_string());
        }
        crate::metrics::set_current_state(&next.to_string());
        Ok(())
    }

    async fn perform_effect(
        &mut self,
        from: RollState,
        to: RollState,
        effect: Effect,
        cancel: &CancellationToken,
    ) -> Result<()> {
        let review = Arc::clone(&self.review);
        match effect {
            Effect::Noop => self.perform_noop_bookkeeping(from, to).await,
            Effect::UpdateRepos => self.repo.update_repos(cancel).await,
            Effect::UploadRoll => self.upload(false).await,
            Effect::UploadDryRun => self.upload(true).await,
            Effect::UpdateRoll => {
                self.refresh_active().await?;
                self.repo.update_repos(cancel).await
            }
            Effect::SwitchToDryRun => {
                review.switch_to_dry_run(&mut self.active_mut()?.handle).await?;
                self.update_active_record(|r| r.dry_run = true).await
            }
            Effect::SwitchToNormal => {
                review.switch_to_normal(&mut self.active_mut()?.handle).await?;
                self.update_active_record(|r| r.dry_run = false).await
            }
            Effect::CloseFailed => {
                self.close_active(
                    RollStatus::Failure,
                    "Commit queue failed; closing this roll.".to_string(),
                )
                .await
            }
            Effect::CloseStopped => {
                self.close_active(RollStatus::Failure, "AutoRoller is stopped".to_string())
                    .await
            }
            Effect::CloseDryRunFailed => {
                self.close_active(
                    RollStatus::DryRunFailure,
                    "Dry run failed; closing this roll.".to_string(),
                )
                .await
            }
            Effect::CloseDryRunOutdated => {
                let rev = self
                    .active
                    .as_ref()
                    .map(|a| a.handle.rolling_to.to_string())
                    .unwrap_or_default();
                self.close_active(
                    RollStatus::DryRunSuccess,
                    format!("Dry run passed for {rev}; closing in favor of a newer revision."),
                )
                .await
            }
            Effect::WaitForLand => self.wait_for_land(cancel).await,
            Effect::RetryFailedNormal => review.retry_cq(&mut self.active_mut()?.handle).await,
            Effect::RetryFailedDryRun => {
                review.retry_dry_run(&mut self.active_mut()?.handle).await
            }
        }
    }

    /// Book-keeping attached to specific no-op transitions: verdict
    /// observation happens here so counters move exactly once.
    async fn perform_noop_bookkeeping(&mut self, from: RollState, to: RollState) -> Result<()> {
        use RollState::*;
        match (from, to) {
            // A CQ failure was observed.
            (NormalActive, NormalFailure) | (DryRunActive, DryRunFailure) => {
                self.throttle.record_failure().await
            }
            // The commit queue landed the roll.
            (NormalActive, NormalSuccess) => {
                let issue = self.active.as_ref().map(|a| a.handle.issue).unwrap_or(0);
                info!(issue, "roll landed by the commit queue");
                self.events.emit_roll_landed(issue);
                crate::metrics::ROLLS_LANDED_TOTAL.inc();
                let (modified, try_results) = self
                    .active
                    .as_ref()
                    .map(|a| (a.handle.updated, a.handle.try_results.clone()))
                    .unwrap_or_else(|| (Utc::now(), Vec::new()));
                self.update_active_record(move |r| {
                    r.status = RollStatus::Success;
                    r.modified = modified;
                    r.try_results = try_results.clone();
                })
                .await
            }
            _ => Ok(()),
        }
    }

    async fn upload(&mut self, dry_run: bool) -> Result<()> {
        self.throttle.record_attempt().await?;

        let from = self.repo.current_rev().await;
        let to = self.repo.next_roll_rev().await;
        let handle = self.review.upload_new_roll(&from, &to, dry_run).await?;

        info!(
            issue = handle.issue,
            from = %from,
            to = %to,
            dry_run,
            "uploaded new roll"
        );
        let now = Utc::now();
        let record = RollRecord {
            roll_id: handle.issue.to_string(),
            issue: handle.issue,
            url: handle.url.clone(),
            subject: handle.subject.clone(),
            rolling_from: from,
            rolling_to: to,
            created: now,
            modified: now,
            db_modified: None,
            status: RollStatus::InProgress,
            dry_run,
            landed: false,
            try_results: Vec::new(),
            expectation_overrides: Default::default(),
        };
        let stored = self.store.put_if_fresh(record).await?;
        self.events
            .emit_roll_uploaded(handle.issue, &handle.url, dry_run);
        crate::metrics::ROLLS_UPLOADED_TOTAL
            .with_label_values(&[if dry_run { "dry_run" } else { "normal" }])
            .inc();
        self.active = Some(ActiveRoll {
            handle,
            record: stored,
        });
        Ok(())
    }

    async fn refresh_active(&mut self) -> Result<()> {
        let review = Arc::clone(&self.review);
        let Some(active) = self.active.as_mut() else {
            warn!("update-roll with no active roll");
            return Ok(());
        };
        review.update(&mut active.handle).await?;
        let (modified, try_results) = (active.handle.updated, active.handle.try_results.clone());
        self.update_active_record(move |r| {
            r.modified = modified;
            r.try_results = try_results.clone();
        })
        .await
    }

    async fn close_active(&mut self, status: RollStatus, message: String) -> Result<()> {
        let review = Arc::clone(&self.review);
        let Some(active) = self.active.as_mut() else {
            warn!("close requested with no active roll");
            return Ok(());
        };
        review.close(&mut active.handle, status, &message).await?;
        info!(issue = active.handle.issue, status = %status, "closed roll: {message}");
        self.update_active_record(move |r| {
            r.status = status;
            r.modified = Utc::now();
        })
        .await?;
        self.active = None;
        Ok(())
    }

    /// Poll the repo until the active roll's commit appears in the parent.
    async fn wait_for_land(&mut self, cancel: &CancellationToken) -> Result<()> {
        let Some(rolling_to) = self.active.as_ref().map(|a| a.handle.rolling_to.clone()) else {
            warn!("wait-for-land with no active roll");
            return Ok(());
        };
        loop {
            self.repo.update_repos(cancel).await?;
            if self.repo.rolled_past(&rolling_to).await? {
                break;
            }
            debug!(rev = %rolling_to, "waiting for the parent to pick up the roll");
            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(RollerError::transient_msg("wait-for-land cancelled"));
                }
                _ = tokio::time::sleep(self.land_poll_interval) => {}
            }
        }
        // Success-frequency accounting happens once per landed roll.
        if !self.repo.max_roll_frequency().is_zero() {
            self.throttle.record_success().await?;
        }
        self.active = None;
        Ok(())
    }

    fn active_mut(&mut self) -> Result<&mut ActiveRoll> {
        self.active
            .as_mut()
            .ok_or_else(|| RollerError::fatal("transition requires an active roll"))
    }

    /// Apply `mutate` to the active roll's stored record and persist it.
    /// A CAS loss (e.g. a racing reconciler) is retried once with a fresh
    /// read.
    async fn update_active_record<F>(&mut self, mutate: F) -> Result<()>
    where
        F: Fn(&mut RollRecord),
    {
        let Some(active) = self.active.as_mut() else {
            return Ok(());
        };
        let mut record = active.record.clone();
        mutate(&mut record);
        match self.store.put_if_fresh(record).await {
            Ok(stored) => {
                active.record = stored;
                Ok(())
            }
            Err(RollerError::ConcurrentUpdate { .. }) => {
                debug!(
                    roll = %active.record.roll_id,
                    "record advanced concurrently; retrying with a fresh read"
                );
                let mut fresh = self.store.get(&active.record.roll_id).await?;
                mutate(&mut fresh);
                let stored = self.store.put_if_fresh(fresh).await?;
                active.record = stored;
                Ok(())
            }
            Err(err) => Err(err),
        }
    }

    async fn persist_state(&self) -> Result<()> {
        let contents = format!("{}\n", self.state);
        let tmp = self.state_path.with_extension("tmp");
        tokio::fs::write(&tmp, contents).await?;
        tokio::fs::rename(&tmp, &self.state_path).await?;
        Ok(())
    }
}

/// Rebuild a review handle from a stored record (crash recovery). The
/// next update-roll refreshes the real verdicts from the server.
fn handle_from_record(record: &RollRecord) -> RollHandle {
    RollHandle {
        issue: record.issue,
        url: record.url.clone(),
        subject: record.subject.clone(),
        rolling_from: record.rolling_from.clone(),
        rolling_to: record.rolling_to.clone(),
        dry_run: record.dry_run,
        state: ChangeState::Open,
        cq: CheckState::Pending,
        dry: CheckState::Pending,
        updated: record.modified,
        try_results: record.try_results.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use roller_common::{MockCodeReview, MockRepoInspector, MockVerdict, SafetyThrottleConfig};

    fn inputs() -> DecisionInputs {
        DecisionInputs {
            mode: Mode::Running,
            up_to_date: false,
            safety_throttled: false,
            success_throttled: false,
            failure_throttled: false,
            active_finished: false,
            active_success: false,
            active_dry_finished: false,
            active_dry_success: false,
            active_matches_next: true,
            max_roll_frequency_set: false,
            supports_promotion: true,
        }
    }

    #[test]
    fn state_labels_round_trip() {
        for state in ALL_STATES {
            let parsed: RollState = state.to_string().parse().unwrap();
            assert_eq!(parsed, state);
        }
        assert!("normal-walking".parse::<RollState>().is_err());
    }

    #[test]
    fn safety_throttle_dominates_success_throttle() {
        let mut i = inputs();
        i.safety_throttled = true;
        i.success_throttled = true;
        assert_eq!(decide(RollState::NormalIdle, &i), RollState::NormalSafetyThrottled);
    }

    #[test]
    fn safety_throttled_idle_never_uploads() {
        // While the safety throttle holds, no decision from an idle state
        // may reach an active state.
        for mode in [Mode::Running, Mode::DryRun, Mode::Stopped] {
            for success in [false, true] {
                for up_to_date in [false, true] {
                    let mut i = inputs();
                    i.mode = mode;
                    i.safety_throttled = true;
                    i.success_throttled = success;
                    i.up_to_date = up_to_date;
                    for state in [RollState::NormalIdle, RollState::DryRunIdle] {
                        let next = decide(state, &i);
                        assert!(
                            !matches!(next, RollState::NormalActive | RollState::DryRunActive),
                            "{state} -> {next} while safety-throttled"
                        );
                    }
                }
            }
        }
    }

    #[test]
    fn failure_on_identical_revision_throttles_instead_of_reuploading() {
        let mut i = inputs();
        i.active_matches_next = true;
        assert_eq!(decide(RollState::NormalFailure, &i), RollState::NormalFailureThrottled);

        // A newer revision unblocks the close-and-retry path.
        i.active_matches_next = false;
        assert_eq!(decide(RollState::NormalFailure, &i), RollState::NormalIdle);
    }

    #[test]
    fn dry_run_success_for_wanted_revision_leaves_change_open() {
        let mut i = inputs();
        i.mode = Mode::DryRun;
        i.active_matches_next = true;
        assert_eq!(
            decide(RollState::DryRunSuccess, &i),
            RollState::DryRunSuccessLeavingOpen
        );
        // Remains there while nothing changes.
        assert_eq!(
            decide(RollState::DryRunSuccessLeavingOpen, &i),
            RollState::DryRunSuccessLeavingOpen
        );
        // A newer revision closes the stale dry run.
        i.active_matches_next = false;
        assert_eq!(
            decide(RollState::DryRunSuccessLeavingOpen, &i),
            RollState::DryRunIdle
        );
    }

    #[test]
    fn leaving_open_promotion_is_capability_gated() {
        let mut i = inputs();
        i.mode = Mode::Running;
        i.supports_promotion = true;
        assert_eq!(
            decide(RollState::DryRunSuccessLeavingOpen, &i),
            RollState::NormalActive
        );
        assert_eq!(
            transition_effect(RollState::DryRunSuccessLeavingOpen, RollState::NormalActive),
            Some(Effect::SwitchToNormal)
        );

        i.supports_promotion = false;
        assert_eq!(
            decide(RollState::DryRunSuccessLeavingOpen, &i),
            RollState::DryRunIdle
        );
        assert_eq!(
            transition_effect(RollState::DryRunSuccessLeavingOpen, RollState::DryRunIdle),
            Some(Effect::CloseDryRunOutdated)
        );
    }

    #[test]
    fn undeclared_transitions_are_refused() {
        assert!(transition_effect(RollState::Stopped, RollState::NormalActive).is_none());
        assert!(transition_effect(RollState::NormalSuccess, RollState::NormalFailure).is_none());
        assert!(
            transition_effect(RollState::NormalSafetyThrottled, RollState::DryRunIdle).is_none()
        );
    }

    proptest! {
        /// FSM closure: every decision lands on a declared transition.
        #[test]
        fn decision_always_picks_declared_transition(
            state_idx in 0usize..ALL_STATES.len(),
            mode_idx in 0usize..3,
            up_to_date in any::<bool>(),
            safety in any::<bool>(),
            success in any::<bool>(),
            failure in any::<bool>(),
            finished in any::<bool>(),
            won in any::<bool>(),
            dry_finished in any::<bool>(),
            dry_won in any::<bool>(),
            matches_next in any::<bool>(),
            freq_set in any::<bool>(),
            promotion in any::<bool>(),
        ) {
            let state = ALL_STATES[state_idx];
            let mode = [Mode::Running, Mode::DryRun, Mode::Stopped][mode_idx];
            let inputs = DecisionInputs {
                mode,
                up_to_date,
                safety_throttled: safety,
                success_throttled: success,
                failure_throttled: failure,
                active_finished: finished,
                active_success: won,
                active_dry_finished: dry_finished,
                active_dry_success: dry_won,
                active_matches_next: matches_next,
                max_roll_frequency_set: freq_set,
                supports_promotion: promotion,
            };
            let next = decide(state, &inputs);
            prop_assert!(
                transition_effect(state, next).is_some(),
                "decide({state}, ..) = {next} has no transition entry"
            );
        }
    }

    // ── Tick-level tests with mocks ──────────────────────────────────────

    struct Fixture {
        machine: RollStateMachine,
        review: MockCodeReview,
        repo: MockRepoInspector,
        cancel: CancellationToken,
        _dir: tempfile::TempDir,
    }

    async fn fixture_with(review: MockCodeReview, repo: MockRepoInspector) -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let throttle = Throttler::load_or_create(
            dir.path(),
            &SafetyThrottleConfig {
                limit: 3,
                window: Duration::from_secs(600),
            },
            Duration::ZERO,
        )
        .await
        .unwrap();
        let store = RollRecordStore::load_or_create(dir.path(), 10).await.unwrap();
        let mut machine = RollStateMachine::load_or_create(
            dir.path(),
            throttle,
            Arc::new(review.clone()),
            Arc::new(repo.clone()),
            store,
            EventBus::default(),
        )
        .await
        .unwrap();
        machine.set_land_poll_interval(Duration::from_millis(5));
        Fixture {
            machine,
            review,
            repo,
            cancel: CancellationToken::new(),
            _dir: dir,
        }
    }

    async fn fixture() -> Fixture {
        fixture_with(MockCodeReview::new(), MockRepoInspector::new("r1", "r2")).await
    }

    #[tokio::test]
    async fn idle_tick_uploads_when_revision_available() {
        let mut f = fixture().await;
        assert_eq!(f.machine.current(), RollState::NormalIdle);

        f.machine.tick(Mode::Running, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::NormalActive);
        let active = f.machine.active().unwrap();
        assert_eq!(active.handle.rolling_to.as_str(), "r2");
        assert!(!active.handle.dry_run);
        assert!(f.review.calls()[0].starts_with("upload_new_roll(r1,r2,false)"));
    }

    #[tokio::test]
    async fn idle_tick_stays_idle_when_up_to_date() {
        let mut f =
            fixture_with(MockCodeReview::new(), MockRepoInspector::new("r1", "r1")).await;
        f.machine.tick(Mode::Running, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::NormalIdle);
        // The self-loop refreshed the repos.
        assert_eq!(f.repo.update_calls(), 1);
    }

    #[tokio::test]
    async fn successful_roll_returns_to_idle_after_landing() {
        let mut f = fixture().await;
        f.machine.tick(Mode::Running, &f.cancel).await.unwrap();
        let issue = f.machine.active().unwrap().handle.issue;

        // The CQ lands the change.
        f.review.set_issue_verdict(
            issue,
            MockVerdict {
                state: Some(ChangeState::Landed),
                cq: Some(CheckState::Passed),
                ..Default::default()
            },
        );
        // Refresh the handle via the update-roll self-loop.
        f.machine.tick(Mode::Running, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::NormalSuccess);

        // wait-for-land sees the parent pick the commit up.
        f.repo.land_after_updates("r2", 1);
        f.machine.tick(Mode::Running, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::NormalIdle);
        assert!(f.machine.active().is_none());
    }

    #[tokio::test]
    async fn failure_on_same_revision_enters_failure_throttled() {
        let mut f = fixture().await;
        f.machine.tick(Mode::Running, &f.cancel).await.unwrap();
        let issue = f.machine.active().unwrap().handle.issue;

        f.review.set_issue_verdict(
            issue,
            MockVerdict {
                cq: Some(CheckState::Failed),
                ..Default::default()
            },
        );
        // The update-roll self-loop refreshes the verdict; the failure
        // no-ops collapse straight through to the throttled state.
        f.machine.tick(Mode::Running, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::NormalFailureThrottled);
        assert_eq!(f.machine.throttle.failure_count(), 1);

        // Throttled ticks self-loop via update-repos; the change stays
        // open and no new upload happens.
        f.machine.tick(Mode::Running, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::NormalFailureThrottled);
        assert_eq!(
            f.review
                .calls()
                .iter()
                .filter(|c| c.starts_with("upload_new_roll"))
                .count(),
            1
        );
    }

    #[tokio::test]
    async fn failure_with_newer_revision_closes_and_reuploads() {
        let mut f = fixture().await;
        f.machine.tick(Mode::Running, &f.cancel).await.unwrap();
        let issue = f.machine.active().unwrap().handle.issue;

        f.review.set_issue_verdict(
            issue,
            MockVerdict {
                cq: Some(CheckState::Failed),
                ..Default::default()
            },
        );
        // A newer revision appears before the failure is observed, so the
        // failure state routes to close-failed rather than throttling.
        f.repo.set_next("r3");
        f.machine.tick(Mode::Running, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::NormalFailure);

        f.machine.tick(Mode::Running, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::NormalIdle);
        assert!(f.machine.active().is_none());
        assert!(f.review.calls().iter().any(|c| c.starts_with(&format!("close({issue},failure"))));

        // Next tick uploads the newer revision.
        f.machine.tick(Mode::Running, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::NormalActive);
        assert_eq!(f.machine.active().unwrap().handle.rolling_to.as_str(), "r3");
    }

    #[tokio::test]
    async fn safety_throttle_blocks_idle_after_attempt_limit() {
        let mut f = fixture().await;
        // Exhaust the attempt budget.
        for _ in 0..3 {
            f.machine.throttle.record_attempt().await.unwrap();
        }
        f.machine.tick(Mode::Running, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::NormalSafetyThrottled);

        // Self-loops via update-repos while throttled.
        f.machine.tick(Mode::Running, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::NormalSafetyThrottled);
    }

    #[tokio::test]
    async fn mode_flip_switches_active_roll_without_closing() {
        let mut f = fixture().await;
        f.machine.tick(Mode::Running, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::NormalActive);
        let issue = f.machine.active().unwrap().handle.issue;

        f.machine.tick(Mode::DryRun, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::DryRunActive);
        assert!(f.machine.active().unwrap().handle.dry_run);
        assert!(
            f.review
                .calls()
                .iter()
                .any(|c| c == &format!("switch_to_dry_run({issue})"))
        );

        // Stopping closes the roll with the stop message.
        f.machine.tick(Mode::Stopped, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::Stopped);
        assert!(f.machine.active().is_none());
        assert!(
            f.review
                .calls()
                .iter()
                .any(|c| c == &format!("close({issue},failure,AutoRoller is stopped)"))
        );
    }

    #[tokio::test]
    async fn stopped_routes_to_idle_when_mode_resumes() {
        let mut f = fixture().await;
        f.machine.tick(Mode::Stopped, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::Stopped);

        f.machine.tick(Mode::DryRun, &f.cancel).await.unwrap();
        // noop to dry-run-idle, then collapse stops at the non-noop
        // upload transition.
        assert_eq!(f.machine.current(), RollState::DryRunIdle);
    }

    #[tokio::test]
    async fn dry_run_success_leaves_change_open_until_new_revision() {
        let mut f = fixture().await;
        // First tick routes normal-idle into the dry-run family; the
        // second uploads.
        f.machine.tick(Mode::DryRun, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::DryRunIdle);
        f.machine.tick(Mode::DryRun, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::DryRunActive);
        let issue = f.machine.active().unwrap().handle.issue;

        f.review.set_issue_verdict(
            issue,
            MockVerdict {
                dry: Some(CheckState::Passed),
                ..Default::default()
            },
        );
        // The refreshed verdict collapses through dry-run-success into
        // the leaving-open state.
        f.machine.tick(Mode::DryRun, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::DryRunSuccessLeavingOpen);

        // Stays put across ticks.
        f.machine.tick(Mode::DryRun, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::DryRunSuccessLeavingOpen);

        // A newer revision closes the now-outdated dry run.
        f.repo.set_next("r3");
        f.machine.tick(Mode::DryRun, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::DryRunIdle);
        assert!(
            f.review
                .calls()
                .iter()
                .any(|c| c.starts_with(&format!("close({issue},dry_run_success")))
        );

        // And the next tick uploads a dry run for it.
        f.machine.tick(Mode::DryRun, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::DryRunActive);
        assert_eq!(f.machine.active().unwrap().handle.rolling_to.as_str(), "r3");
    }

    #[tokio::test]
    async fn effect_failure_leaves_state_unchanged() {
        let mut f = fixture().await;
        f.review.fail_next("upload_new_roll");

        let err = f.machine.tick(Mode::Running, &f.cancel).await.unwrap_err();
        assert!(err.is_retryable());
        assert_eq!(f.machine.current(), RollState::NormalIdle);

        // The next tick retries the same transition and succeeds.
        f.machine.tick(Mode::Running, &f.cancel).await.unwrap();
        assert_eq!(f.machine.current(), RollState::NormalActive);
    }

    #[tokio::test]
    async fn state_survives_restart_with_active_roll_resurrected() {
        let dir = tempfile::tempdir().unwrap();
        let review = MockCodeReview::new();
        let repo = MockRepoInspector::new("r1", "r2");
        let cancel = CancellationToken::new();

        {
            let throttle = Throttler::load_or_create(
                dir.path(),
                &SafetyThrottleConfig {
                    limit: 3,
                    window: Duration::from_secs(600),
                },
                Duration::ZERO,
            )
            .await
            .unwrap();
            let store = RollRecordStore::load_or_create(dir.path(), 10).await.unwrap();
            let mut machine = RollStateMachine::load_or_create(
                dir.path(),
                throttle,
                Arc::new(review.clone()),
                Arc::new(repo.clone()),
                store,
                EventBus::default(),
            )
            .await
            .unwrap();
            machine.tick(Mode::Running, &cancel).await.unwrap();
            assert_eq!(machine.current(), RollState::NormalActive);
        }

        // Reopen from the same working directory.
        let throttle = Throttler::load_or_create(
            dir.path(),
            &SafetyThrottleConfig {
                limit: 3,
                window: Duration::from_secs(600),
            },
            Duration::ZERO,
        )
        .await
        .unwrap();
        let store = RollRecordStore::load_or_create(dir.path(), 10).await.unwrap();
        let machine = RollStateMachine::load_or_create(
            dir.path(),
            throttle,
            Arc::new(review),
            Arc::new(repo),
            store,
            EventBus::default(),
        )
        .await
        .unwrap();
        assert_eq!(machine.current(), RollState::NormalActive);
        let active = machine.active().unwrap();
        assert_eq!(active.handle.rolling_to.as_str(), "r2");
    }
}

//! Common types used across AutoRoll components.

use chrono::{DateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::errors::RollerError;

/// Opaque identifier for a child-repository revision (typically a content hash).
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct RevisionId(pub String);

impl RevisionId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl std::fmt::Display for RevisionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// A child-repository revision as seen by the repo inspector.
///
/// Immutable once produced; roll records reference revisions by id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Revision {
    /// Opaque identity, typically a commit hash.
    pub id: RevisionId,
    /// Display subject line.
    pub display: String,
    /// Author identity.
    pub author: String,
    /// Commit timestamp.
    pub timestamp: DateTime<Utc>,
    /// Bug references attached to the commit.
    #[serde(default)]
    pub bugs: Vec<String>,
    /// Tester references attached to the commit.
    #[serde(default)]
    pub testers: Vec<String>,
    /// When set, the revision must not be rolled and this explains why.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invalid_reason: Option<String>,
}

impl Revision {
    pub fn is_valid(&self) -> bool {
        self.invalid_reason.is_none()
    }
}

/// Terminal and non-terminal statuses of a roll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, schemars::JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum RollStatus {
    /// The roll is open at the code-review system.
    InProgress,
    /// The commit queue landed the roll.
    Success,
    /// The commit queue rejected the roll, or it was closed.
    Failure,
    /// A dry run of the pre-submit pipeline passed.
    DryRunSuccess,
    /// A dry run of the pre-submit pipeline failed.
    DryRunFailure,
}

impl RollStatus {
    /// Whether this status is terminal (append-only from here on).
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::InProgress)
    }
}

impl Default for RollStatus {
    fn default() -> Self {
        Self::InProgress
    }
}

impl std::fmt::Display for RollStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::InProgress => write!(f, "in_progress"),
            Self::Success => write!(f, "success"),
            Self::Failure => write!(f, "failure"),
            Self::DryRunSuccess => write!(f, "dry_run_success"),
            Self::DryRunFailure => write!(f, "dry_run_failure"),
        }
    }
}

/// Outcome of a single try job attached to a roll.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TryResult {
    /// Builder or check name.
    pub name: String,
    /// Status string as reported by the review system.
    pub status: String,
    /// Link to the try-job results, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
}

/// A single proposed roll of the parent's pinned child revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollRecord {
    /// System-assigned roll id.
    pub roll_id: String,
    /// Issue/change number assigned by the code-review system.
    pub issue: i64,
    /// Human-facing URL of the change.
    #[serde(default)]
    pub url: String,
    /// Subject line of the change.
    #[serde(default)]
    pub subject: String,
    /// Revision the parent pinned before this roll.
    pub rolling_from: RevisionId,
    /// Revision this roll pins.
    pub rolling_to: RevisionId,
    /// Creation time.
    pub created: DateTime<Utc>,
    /// Last CRS-side activity. Informational; moves independently of
    /// `db_modified`.
    pub modified: DateTime<Utc>,
    /// Compare-and-swap token owned by the roll record store.
    #[serde(default)]
    pub db_modified: Option<DateTime<Utc>>,
    /// Current status.
    #[serde(default)]
    pub status: RollStatus,
    /// Whether the roll was uploaded as a dry run rather than a CQ attempt.
    #[serde(default)]
    pub dry_run: bool,
    /// Set by the reconciler once the parent contains the roll's commit.
    #[serde(default)]
    pub landed: bool,
    /// Try-job summaries.
    #[serde(default)]
    pub try_results: Vec<TryResult>,
    /// Per-roll expectation overrides merged into the shared expectations
    /// store when the roll lands.
    #[serde(default)]
    pub expectation_overrides: std::collections::BTreeMap<String, String>,
}

impl RollRecord {
    /// Whether the record has reached a terminal status.
    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Validate the record against the store's invariants.
    pub fn validate(&self) -> Result<(), RollerError> {
        if self.roll_id.is_empty() {
            return Err(RollerError::validation("roll record has empty roll_id"));
        }
        if self.rolling_from.is_empty() || self.rolling_to.is_empty() {
            return Err(RollerError::validation(
                "roll record must name both rolling_from and rolling_to",
            ));
        }
        if self.issue <= 0 {
            return Err(RollerError::validation("roll record has no issue number"));
        }
        if self.landed && !self.is_terminal() {
            return Err(RollerError::validation(
                "landed roll record must carry a terminal status",
            ));
        }
        Ok(())
    }
}

/// Desired operating mode for the roller.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Mode {
    /// Upload and land rolls.
    Running,
    /// Upload rolls as dry runs only.
    DryRun,
    /// Do not upload; close any active roll.
    Stopped,
}

impl Default for Mode {
    fn default() -> Self {
        Self::Running
    }
}

impl std::fmt::Display for Mode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Running => write!(f, "running"),
            Self::DryRun => write!(f, "dry-run"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

impl std::str::FromStr for Mode {
    type Err = RollerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "running" => Ok(Self::Running),
            "dry-run" | "dry_run" => Ok(Self::DryRun),
            "stopped" => Ok(Self::Stopped),
            other => Err(RollerError::validation(format!(
                "unknown mode {other:?}; expected running, dry-run, or stopped"
            ))),
        }
    }
}

/// Status of an operator-requested manual roll.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualRollStatus {
    /// Waiting for the controller to pick the request up.
    Pending,
    /// A roll has been uploaded for the request.
    Running,
    /// The roll reached a terminal result.
    Complete,
}

impl std::fmt::Display for ManualRollStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Pending => write!(f, "pending"),
            Self::Running => write!(f, "running"),
            Self::Complete => write!(f, "complete"),
        }
    }
}

/// Result of a manual roll once complete.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ManualRollResult {
    Unknown,
    Success,
    Failure,
}

impl Default for ManualRollResult {
    fn default() -> Self {
        Self::Unknown
    }
}

/// An operator-requested one-off roll to a specific revision.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualRollRequest {
    /// Generated at first persist; empty before then.
    #[serde(default)]
    pub id: String,
    /// Operator who filed the request.
    pub requester: String,
    /// Target revision to roll to.
    pub revision: RevisionId,
    /// Name of the roller instance the request is addressed to.
    pub roller_name: String,
    /// Lifecycle status.
    pub status: ManualRollStatus,
    /// Terminal result; `Unknown` until complete.
    #[serde(default)]
    pub result: ManualRollResult,
    /// Request time, truncated to microsecond precision in UTC.
    pub timestamp: DateTime<Utc>,
    /// Review URL; filled once the request leaves `Pending`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    /// Compare-and-swap token; `None` until first persisted.
    #[serde(default)]
    pub db_modified: Option<DateTime<Utc>>,
}

impl ManualRollRequest {
    /// Build a new pending request. The id and CAS token are assigned by
    /// the queue at first `put`.
    pub fn new(
        requester: impl Into<String>,
        revision: RevisionId,
        roller_name: impl Into<String>,
    ) -> Self {
        Self {
            id: String::new(),
            requester: requester.into(),
            revision,
            roller_name: roller_name.into(),
            status: ManualRollStatus::Pending,
            result: ManualRollResult::Unknown,
            timestamp: truncate_to_micros(Utc::now()),
            url: None,
            db_modified: None,
        }
    }

    /// Validate the per-status invariants.
    pub fn validate(&self) -> Result<(), RollerError> {
        if self.requester.is_empty() {
            return Err(RollerError::validation("manual roll has empty requester"));
        }
        if self.revision.is_empty() {
            return Err(RollerError::validation("manual roll has empty revision"));
        }
        if self.roller_name.is_empty() {
            return Err(RollerError::validation("manual roll has empty roller name"));
        }
        match self.status {
            ManualRollStatus::Pending => {
                if self.result != ManualRollResult::Unknown {
                    return Err(RollerError::validation(
                        "pending manual roll must not carry a result",
                    ));
                }
                if self.url.is_some() {
                    return Err(RollerError::validation(
                        "pending manual roll must not carry a url",
                    ));
                }
            }
            ManualRollStatus::Running => {
                if self.result != ManualRollResult::Unknown {
                    return Err(RollerError::validation(
                        "running manual roll must carry an unknown result",
                    ));
                }
                if self.url.is_none() {
                    return Err(RollerError::validation(
                        "running manual roll must carry a url",
                    ));
                }
            }
            ManualRollStatus::Complete => {
                if self.result == ManualRollResult::Unknown {
                    return Err(RollerError::validation(
                        "complete manual roll must carry a result",
                    ));
                }
                if self.url.is_none() {
                    return Err(RollerError::validation(
                        "complete manual roll must carry a url",
                    ));
                }
            }
        }
        Ok(())
    }
}

/// Truncate a timestamp to microsecond precision.
///
/// Stored timestamps are compared for equality as CAS tokens, so they must
/// round-trip through serialization without losing precision.
pub fn truncate_to_micros(ts: DateTime<Utc>) -> DateTime<Utc> {
    let nanos = ts.nanosecond();
    ts.with_nanosecond(nanos - nanos % 1_000)
        .expect("truncation keeps nanoseconds in range")
}

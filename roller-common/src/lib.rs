//! Shared types and contracts for the AutoRoll daemon.
//!
//! The daemon crate (`rollerd`) owns the control loop; this crate holds
//! everything both sides of the contract boundary need: domain types,
//! the error taxonomy, configuration, and the code-review-system and
//! repo-inspector capability surfaces with their deterministic mocks.

pub mod config;
pub mod errors;
pub mod repo;
pub mod review;
pub mod types;

pub use config::{RepoConfig, ReviewConfig, RollConfig, RollerConfig, SafetyThrottleConfig};
pub use errors::{ErrorCategory, ErrorCode, Result, RollerError};
pub use repo::{MockRepoInspector, RepoInspector, RestRepoInspector};
pub use review::{
    ChangeState, CheckState, CodeReviewSystem, CqReviewClient, ExternalCiClient, MockCodeReview,
    MockVerdict, PullRequestClient, RollHandle, build_review_client,
};
pub use types::{
    ManualRollRequest, ManualRollResult, ManualRollStatus, Mode, Revision, RevisionId, RollRecord,
    RollStatus, TryResult, truncate_to_micros,
};

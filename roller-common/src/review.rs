//! Stable contract between the roller core and code-review systems.
//!
//! This module defines:
//! - the capability surface the state machine consumes (`CodeReviewSystem`)
//! - the uniform change handle (`RollHandle`) and its verdict predicates
//! - request/response wire schemas shared by the concrete variants
//! - three thin REST variants: commit-queue, pull-request, external-CI
//! - a deterministic in-memory mock for unit/integration tests
//!
//! The state machine treats every variant uniformly and never branches on
//! which one is in use; variant differences are confined to endpoint
//! shapes and the `supports_dry_run_promotion` capability flag.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::RngExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ReviewConfig;
use crate::errors::{ErrorCode, Result, RollerError};
use crate::types::{RevisionId, RollStatus, TryResult};

/// Schema version for the roller <-> review-service wire contract.
pub const REVIEW_CONTRACT_SCHEMA_VERSION: &str = "1.0.0";

/// Transient review calls are retried once after a short jittered delay.
const RETRY_BASE_DELAY_MS: u64 = 250;
const RETRY_JITTER_MS: u64 = 250;

// ── Change State ─────────────────────────────────────────────────────────

/// Lifecycle state of a change at the review system.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ChangeState {
    /// Open for review; checks may be running.
    Open,
    /// Merged into the parent by the commit queue.
    Landed,
    /// Closed without landing.
    Abandoned,
}

/// Verdict of a check pipeline (full CQ run or dry run).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum CheckState {
    /// Not started or still running.
    Pending,
    Passed,
    Failed,
}

impl Default for CheckState {
    fn default() -> Self {
        Self::Pending
    }
}

// ── Roll Handle ──────────────────────────────────────────────────────────

/// Uniform view of one uploaded roll at the review system.
///
/// The handle is a snapshot: `CodeReviewSystem::update` refreshes it in
/// place from the server. All verdict predicates read the snapshot only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RollHandle {
    /// Change/PR number at the review system.
    pub issue: i64,
    /// Human-facing URL of the change.
    pub url: String,
    /// Subject line.
    pub subject: String,
    /// Revision the roll moves away from.
    pub rolling_from: RevisionId,
    /// Revision the roll pins.
    pub rolling_to: RevisionId,
    /// Whether the change is currently running as a dry run.
    pub dry_run: bool,
    /// Lifecycle state at last refresh.
    pub state: ChangeState,
    /// Full commit-queue verdict at last refresh.
    pub cq: CheckState,
    /// Dry-run verdict at last refresh.
    pub dry: CheckState,
    /// Server-side last-modified time.
    pub updated: DateTime<Utc>,
    /// Try-job summaries at last refresh.
    pub try_results: Vec<TryResult>,
}

impl RollHandle {
    /// The full CQ attempt reached a verdict, or the change closed.
    pub fn is_finished(&self) -> bool {
        self.state != ChangeState::Open || self.cq != CheckState::Pending
    }

    /// The change landed.
    pub fn is_success(&self) -> bool {
        self.state == ChangeState::Landed
    }

    /// The dry run reached a verdict, or the change closed.
    pub fn is_dry_run_finished(&self) -> bool {
        self.state != ChangeState::Open || self.dry != CheckState::Pending
    }

    /// The dry run passed.
    pub fn is_dry_run_success(&self) -> bool {
        self.dry == CheckState::Passed
    }

    /// Revision this roll pins.
    pub fn rolling_to(&self) -> &RevisionId {
        &self.rolling_to
    }
}

// ── Wire Schemas ─────────────────────────────────────────────────────────

/// Upload request body shared by all variants.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WireUploadRequest {
    pub project: String,
    pub rolling_from: String,
    pub rolling_to: String,
    pub dry_run: bool,
}

/// Change representation returned by the review service.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WireChange {
    pub number: i64,
    pub url: String,
    pub subject: String,
    pub state: ChangeState,
    #[serde(default)]
    pub cq: CheckState,
    #[serde(default)]
    pub dry: CheckState,
    #[serde(default)]
    pub dry_run: bool,
    pub rolling_from: String,
    pub rolling_to: String,
    pub updated: DateTime<Utc>,
    #[serde(default)]
    pub try_results: Vec<WireTryResult>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WireTryResult {
    pub name: String,
    pub status: String,
    #[serde(default)]
    pub url: Option<String>,
}

impl WireChange {
    fn into_handle(self) -> RollHandle {
        RollHandle {
            issue: self.number,
            url: self.url,
            subject: self.subject,
            rolling_from: RevisionId::new(self.rolling_from),
            rolling_to: RevisionId::new(self.rolling_to),
            dry_run: self.dry_run,
            state: self.state,
            cq: self.cq,
            dry: self.dry,
            updated: self.updated,
            try_results: self
                .try_results
                .into_iter()
                .map(|t| TryResult {
                    name: t.name,
                    status: t.status,
                    url: t.url,
                })
                .collect(),
        }
    }

    fn apply_to(self, handle: &mut RollHandle) {
        *handle = self.into_handle();
    }
}

/// Body for closing a change with a terminal result and a human message.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WireCloseRequest {
    pub result: RollStatus,
    pub message: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct WireCommentRequest {
    pub message: String,
}

/// Commit-queue trigger state used by the `cq` variant.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum WireCqState {
    /// Full run: land on success.
    Full,
    /// Dry run: exercise checks without landing.
    Dry,
    /// Cancel any pending run.
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct WireCqRequest {
    state: WireCqState,
}

// ── Capability Surface ───────────────────────────────────────────────────

/// Capability set the state machine consumes.
///
/// Operations that mutate the change refresh the passed handle so the
/// caller observes the post-operation snapshot.
#[async_trait]
pub trait CodeReviewSystem: Send + Sync {
    /// Upload a new roll from `from` to `to`.
    async fn upload_new_roll(
        &self,
        from: &RevisionId,
        to: &RevisionId,
        dry_run: bool,
    ) -> Result<RollHandle>;

    /// Refresh the handle from the server.
    async fn update(&self, handle: &mut RollHandle) -> Result<()>;

    /// Demote an open change to a dry run.
    async fn switch_to_dry_run(&self, handle: &mut RollHandle) -> Result<()>;

    /// Promote an open dry-run change to a full CQ attempt.
    async fn switch_to_normal(&self, handle: &mut RollHandle) -> Result<()>;

    /// Re-trigger the full commit queue after a failure.
    async fn retry_cq(&self, handle: &mut RollHandle) -> Result<()>;

    /// Re-trigger the dry run after a failure.
    async fn retry_dry_run(&self, handle: &mut RollHandle) -> Result<()>;

    /// Close the change with a terminal result and a human message.
    async fn close(
        &self,
        handle: &mut RollHandle,
        result: RollStatus,
        message: &str,
    ) -> Result<()>;

    /// Attach a comment to the change.
    async fn add_comment(&self, handle: &RollHandle, message: &str) -> Result<()>;

    /// Find the change that produced the given parent commit.
    ///
    /// Absence is a normal outcome, not an error.
    async fn get_change_for_commit(&self, commit: &RevisionId) -> Result<Option<RollHandle>>;

    /// Whether an open dry-run change can be flipped into a full CQ
    /// attempt without a fresh upload.
    fn supports_dry_run_promotion(&self) -> bool;
}

// ── REST plumbing shared by the variants ─────────────────────────────────

async fn retry_jitter_delay() {
    let jitter = rand::rng().random_range(0..RETRY_JITTER_MS);
    tokio::time::sleep(Duration::from_millis(RETRY_BASE_DELAY_MS + jitter)).await;
}

/// Issue a request, retrying once on transport failure.
async fn send_with_retry(builder: reqwest::RequestBuilder) -> Result<reqwest::Response> {
    let retryable = builder.try_clone();
    match builder.send().await {
        Ok(resp) => Ok(resp),
        Err(first) => {
            let Some(retry) = retryable else {
                return Err(first.into());
            };
            warn!("review request failed, retrying once: {first}");
            retry_jitter_delay().await;
            Ok(retry.send().await?)
        }
    }
}

async fn expect_change(resp: reqwest::Response) -> Result<WireChange> {
    let status = resp.status();
    if status == reqwest::StatusCode::NOT_FOUND {
        return Err(RollerError::not_found("change", "(by request)"));
    }
    if !status.is_success() {
        return Err(RollerError::transient_msg(format!(
            "{}: review service returned {status}",
            ErrorCode::ReviewRequestFailed.code_str()
        )));
    }
    Ok(resp.json::<WireChange>().await?)
}

async fn expect_ok(resp: reqwest::Response) -> Result<()> {
    let status = resp.status();
    if !status.is_success() {
        return Err(RollerError::transient_msg(format!(
            "{}: review service returned {status}",
            ErrorCode::ReviewRequestFailed.code_str()
        )));
    }
    Ok(())
}

fn build_http_client(config: &ReviewConfig) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(config.timeout)
        .build()
        .map_err(RollerError::from)
}

/// Construct the configured review-system variant.
pub fn build_review_client(config: &ReviewConfig) -> Result<Arc<dyn CodeReviewSystem>> {
    match config.variant.as_str() {
        "cq" => Ok(Arc::new(CqReviewClient::new(config)?)),
        "pull_request" => Ok(Arc::new(PullRequestClient::new(config)?)),
        "external_ci" => Ok(Arc::new(ExternalCiClient::new(config)?)),
        other => Err(RollerError::validation(format!(
            "unknown review variant {other:?}"
        ))),
    }
}

// ── Variant: commit-queue review server ──────────────────────────────────

/// Review server with a native commit queue: uploads create a change and
/// immediately trigger either a full or a dry CQ run via a single
/// `cq` endpoint.
pub struct CqReviewClient {
    http: reqwest::Client,
    base_url: String,
    project: String,
}

impl CqReviewClient {
    pub fn new(config: &ReviewConfig) -> Result<Self> {
        Ok(Self {
            http: build_http_client(config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            project: config.project.clone(),
        })
    }

    fn change_url(&self, issue: i64) -> String {
        format!("{}/a/changes/{issue}", self.base_url)
    }
}

#[async_trait]
impl CodeReviewSystem for CqReviewClient {
    async fn upload_new_roll(
        &self,
        from: &RevisionId,
        to: &RevisionId,
        dry_run: bool,
    ) -> Result<RollHandle> {
        let body = WireUploadRequest {
            project: self.project.clone(),
            rolling_from: from.0.clone(),
            rolling_to: to.0.clone(),
            dry_run,
        };
        let resp = send_with_retry(
            self.http
                .post(format!("{}/a/changes", self.base_url))
                .json(&body),
        )
        .await?;
        let change = expect_change(resp).await?;
        debug!(issue = change.number, dry_run, "uploaded roll change");
        Ok(change.into_handle())
    }

    async fn update(&self, handle: &mut RollHandle) -> Result<()> {
        let resp = send_with_retry(self.http.get(self.change_url(handle.issue))).await?;
        expect_change(resp).await?.apply_to(handle);
        Ok(())
    }

    async fn switch_to_dry_run(&self, handle: &mut RollHandle) -> Result<()> {
        let resp = send_with_retry(
            self.http
                .post(format!("{}/cq", self.change_url(handle.issue)))
                .json(&WireCqRequest {
                    state: WireCqState::Dry,
                }),
        )
        .await?;
        expect_ok(resp).await?;
        handle.dry_run = true;
        handle.dry = CheckState::Pending;
        Ok(())
    }

    async fn switch_to_normal(&self, handle: &mut RollHandle) -> Result<()> {
        let resp = send_with_retry(
            self.http
                .post(format!("{}/cq", self.change_url(handle.issue)))
                .json(&WireCqRequest {
                    state: WireCqState::Full,
                }),
        )
        .await?;
        expect_ok(resp).await?;
        handle.dry_run = false;
        handle.cq = CheckState::Pending;
        Ok(())
    }

    async fn retry_cq(&self, handle: &mut RollHandle) -> Result<()> {
        self.switch_to_normal(handle).await
    }

    async fn retry_dry_run(&self, handle: &mut RollHandle) -> Result<()> {
        self.switch_to_dry_run(handle).await
    }

    async fn close(
        &self,
        handle: &mut RollHandle,
        result: RollStatus,
        message: &str,
    ) -> Result<()> {
        let resp = send_with_retry(
            self.http
                .post(format!("{}/abandon", self.change_url(handle.issue)))
                .json(&WireCloseRequest {
                    result,
                    message: message.to_string(),
                }),
        )
        .await?;
        expect_ok(resp).await?;
        handle.state = ChangeState::Abandoned;
        Ok(())
    }

    async fn add_comment(&self, handle: &RollHandle, message: &str) -> Result<()> {
        let resp = send_with_retry(
            self.http
                .post(format!("{}/comment", self.change_url(handle.issue)))
                .json(&WireCommentRequest {
                    message: message.to_string(),
                }),
        )
        .await?;
        expect_ok(resp).await
    }

    async fn get_change_for_commit(&self, commit: &RevisionId) -> Result<Option<RollHandle>> {
        let resp = send_with_retry(
            self.http
                .get(format!("{}/a/changes", self.base_url))
                .query(&[("commit", commit.as_str())]),
        )
        .await?;
        match expect_change(resp).await {
            Ok(change) => Ok(Some(change.into_handle())),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn supports_dry_run_promotion(&self) -> bool {
        true
    }
}

// ── Variant: pull-request service ────────────────────────────────────────

/// Pull-request style service: a dry run is a draft PR whose checks run
/// without auto-merge; promotion marks the PR ready for review.
pub struct PullRequestClient {
    http: reqwest::Client,
    base_url: String,
    project: String,
}

impl PullRequestClient {
    pub fn new(config: &ReviewConfig) -> Result<Self> {
        Ok(Self {
            http: build_http_client(config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            project: config.project.clone(),
        })
    }

    fn pull_url(&self, issue: i64) -> String {
        format!("{}/repos/{}/pulls/{issue}", self.base_url, self.project)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
struct WireDraftRequest {
    draft: bool,
}

#[async_trait]
impl CodeReviewSystem for PullRequestClient {
    async fn upload_new_roll(
        &self,
        from: &RevisionId,
        to: &RevisionId,
        dry_run: bool,
    ) -> Result<RollHandle> {
        let body = WireUploadRequest {
            project: self.project.clone(),
            rolling_from: from.0.clone(),
            rolling_to: to.0.clone(),
            dry_run,
        };
        let resp = send_with_retry(
            self.http
                .post(format!("{}/repos/{}/pulls", self.base_url, self.project))
                .json(&body),
        )
        .await?;
        let change = expect_change(resp).await?;
        debug!(number = change.number, dry_run, "opened roll pull request");
        Ok(change.into_handle())
    }

    async fn update(&self, handle: &mut RollHandle) -> Result<()> {
        let resp = send_with_retry(self.http.get(self.pull_url(handle.issue))).await?;
        expect_change(resp).await?.apply_to(handle);
        Ok(())
    }

    async fn switch_to_dry_run(&self, handle: &mut RollHandle) -> Result<()> {
        let resp = send_with_retry(
            self.http
                .put(format!("{}/draft", self.pull_url(handle.issue)))
                .json(&WireDraftRequest { draft: true }),
        )
        .await?;
        expect_ok(resp).await?;
        handle.dry_run = true;
        handle.dry = CheckState::Pending;
        Ok(())
    }

    async fn switch_to_normal(&self, handle: &mut RollHandle) -> Result<()> {
        let resp = send_with_retry(
            self.http
                .put(format!("{}/draft", self.pull_url(handle.issue)))
                .json(&WireDraftRequest { draft: false }),
        )
        .await?;
        expect_ok(resp).await?;
        handle.dry_run = false;
        handle.cq = CheckState::Pending;
        Ok(())
    }

    async fn retry_cq(&self, handle: &mut RollHandle) -> Result<()> {
        let resp = send_with_retry(
            self.http
                .post(format!("{}/checks/rerun", self.pull_url(handle.issue))),
        )
        .await?;
        expect_ok(resp).await?;
        handle.cq = CheckState::Pending;
        Ok(())
    }

    async fn retry_dry_run(&self, handle: &mut RollHandle) -> Result<()> {
        let resp = send_with_retry(
            self.http
                .post(format!("{}/checks/rerun", self.pull_url(handle.issue))),
        )
        .await?;
        expect_ok(resp).await?;
        handle.dry = CheckState::Pending;
        Ok(())
    }

    async fn close(
        &self,
        handle: &mut RollHandle,
        result: RollStatus,
        message: &str,
    ) -> Result<()> {
        let resp = send_with_retry(
            self.http
                .post(format!("{}/close", self.pull_url(handle.issue)))
                .json(&WireCloseRequest {
                    result,
                    message: message.to_string(),
                }),
        )
        .await?;
        expect_ok(resp).await?;
        handle.state = ChangeState::Abandoned;
        Ok(())
    }

    async fn add_comment(&self, handle: &RollHandle, message: &str) -> Result<()> {
        let resp = send_with_retry(
            self.http
                .post(format!("{}/comments", self.pull_url(handle.issue)))
                .json(&WireCommentRequest {
                    message: message.to_string(),
                }),
        )
        .await?;
        expect_ok(resp).await
    }

    async fn get_change_for_commit(&self, commit: &RevisionId) -> Result<Option<RollHandle>> {
        let resp = send_with_retry(self.http.get(format!(
            "{}/repos/{}/commits/{}/pulls",
            self.base_url,
            self.project,
            commit.as_str()
        )))
        .await?;
        match expect_change(resp).await {
            Ok(change) => Ok(Some(change.into_handle())),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn supports_dry_run_promotion(&self) -> bool {
        true
    }
}

// ── Variant: external-CI handoff ─────────────────────────────────────────

/// Handoff service where an external CI pipeline owns the change after
/// upload. A dry-run handoff cannot be promoted in place; landing the
/// same revision requires a fresh handoff.
pub struct ExternalCiClient {
    http: reqwest::Client,
    base_url: String,
    project: String,
}

impl ExternalCiClient {
    pub fn new(config: &ReviewConfig) -> Result<Self> {
        Ok(Self {
            http: build_http_client(config)?,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            project: config.project.clone(),
        })
    }

    fn handoff_url(&self, issue: i64) -> String {
        format!("{}/v1/handoffs/{issue}", self.base_url)
    }
}

#[async_trait]
impl CodeReviewSystem for ExternalCiClient {
    async fn upload_new_roll(
        &self,
        from: &RevisionId,
        to: &RevisionId,
        dry_run: bool,
    ) -> Result<RollHandle> {
        let body = WireUploadRequest {
            project: self.project.clone(),
            rolling_from: from.0.clone(),
            rolling_to: to.0.clone(),
            dry_run,
        };
        let resp = send_with_retry(
            self.http
                .post(format!("{}/v1/handoffs", self.base_url))
                .json(&body),
        )
        .await?;
        let change = expect_change(resp).await?;
        debug!(handoff = change.number, dry_run, "handed roll to external CI");
        Ok(change.into_handle())
    }

    async fn update(&self, handle: &mut RollHandle) -> Result<()> {
        let resp = send_with_retry(self.http.get(self.handoff_url(handle.issue))).await?;
        expect_change(resp).await?.apply_to(handle);
        Ok(())
    }

    async fn switch_to_dry_run(&self, handle: &mut RollHandle) -> Result<()> {
        let resp = send_with_retry(
            self.http
                .post(format!("{}/cq", self.handoff_url(handle.issue)))
                .json(&WireCqRequest {
                    state: WireCqState::Dry,
                }),
        )
        .await?;
        expect_ok(resp).await?;
        handle.dry_run = true;
        handle.dry = CheckState::Pending;
        Ok(())
    }

    async fn switch_to_normal(&self, _handle: &mut RollHandle) -> Result<()> {
        // The external pipeline owns a handoff once submitted; the caller
        // must close and re-upload instead.
        Err(RollerError::policy(format!(
            "{}: external-CI handoffs cannot be promoted in place",
            ErrorCode::ReviewCapabilityUnsupported.code_str()
        )))
    }

    async fn retry_cq(&self, handle: &mut RollHandle) -> Result<()> {
        let resp = send_with_retry(
            self.http
                .post(format!("{}/retrigger", self.handoff_url(handle.issue))),
        )
        .await?;
        expect_ok(resp).await?;
        handle.cq = CheckState::Pending;
        Ok(())
    }

    async fn retry_dry_run(&self, handle: &mut RollHandle) -> Result<()> {
        let resp = send_with_retry(
            self.http
                .post(format!("{}/retrigger", self.handoff_url(handle.issue))),
        )
        .await?;
        expect_ok(resp).await?;
        handle.dry = CheckState::Pending;
        Ok(())
    }

    async fn close(
        &self,
        handle: &mut RollHandle,
        result: RollStatus,
        message: &str,
    ) -> Result<()> {
        let resp = send_with_retry(
            self.http
                .post(format!("{}/cancel", self.handoff_url(handle.issue)))
                .json(&WireCloseRequest {
                    result,
                    message: message.to_string(),
                }),
        )
        .await?;
        expect_ok(resp).await?;
        handle.state = ChangeState::Abandoned;
        Ok(())
    }

    async fn add_comment(&self, handle: &RollHandle, message: &str) -> Result<()> {
        let resp = send_with_retry(
            self.http
                .post(format!("{}/notes", self.handoff_url(handle.issue)))
                .json(&WireCommentRequest {
                    message: message.to_string(),
                }),
        )
        .await?;
        expect_ok(resp).await
    }

    async fn get_change_for_commit(&self, commit: &RevisionId) -> Result<Option<RollHandle>> {
        let resp = send_with_retry(
            self.http
                .get(format!("{}/v1/handoffs", self.base_url))
                .query(&[("commit", commit.as_str())]),
        )
        .await?;
        match expect_change(resp).await {
            Ok(change) => Ok(Some(change.into_handle())),
            Err(err) if err.is_not_found() => Ok(None),
            Err(err) => Err(err),
        }
    }

    fn supports_dry_run_promotion(&self) -> bool {
        false
    }
}

// ── Mock ─────────────────────────────────────────────────────────────────

#[derive(Debug, Default)]
struct MockReviewState {
    next_issue: i64,
    /// Verdict applied to handles on the next `update`.
    scripted_updates: Vec<MockVerdict>,
    /// Transient errors injected ahead of specific operations.
    fail_next: Vec<&'static str>,
    /// Every operation invoked, in order.
    calls: Vec<String>,
    /// Changes discoverable via `get_change_for_commit`.
    changes_by_commit: HashMap<String, RollHandle>,
    /// Per-issue server-side state consulted by `update`.
    server_state: HashMap<i64, MockVerdict>,
    supports_promotion: bool,
}

/// Server-side verdict a mock `update` applies to a handle.
#[derive(Debug, Clone, Copy, Default)]
pub struct MockVerdict {
    pub state: Option<ChangeState>,
    pub cq: Option<CheckState>,
    pub dry: Option<CheckState>,
}

/// Deterministic in-memory review system for unit and integration tests.
///
/// Scripted verdicts are consumed FIFO by `update`; per-issue verdicts set
/// with `set_issue_verdict` take precedence. Every call is recorded for
/// assertion.
#[derive(Clone)]
pub struct MockCodeReview {
    state: Arc<Mutex<MockReviewState>>,
}

impl Default for MockCodeReview {
    fn default() -> Self {
        Self::new()
    }
}

impl MockCodeReview {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(MockReviewState {
                next_issue: 100,
                supports_promotion: true,
                ..Default::default()
            })),
        }
    }

    pub fn without_promotion() -> Self {
        let mock = Self::new();
        mock.state.lock().unwrap().supports_promotion = false;
        mock
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockReviewState> {
        self.state.lock().expect("mock review mutex poisoned")
    }

    fn record(&self, call: impl Into<String>) -> Result<()> {
        let mut state = self.lock();
        let call = call.into();
        let op = call.split('(').next().unwrap_or("").to_string();
        state.calls.push(call);
        if let Some(pos) = state.fail_next.iter().position(|f| *f == op) {
            state.fail_next.remove(pos);
            return Err(RollerError::transient_msg(format!(
                "mock review injected failure for {op}"
            )));
        }
        Ok(())
    }

    /// Queue a verdict consumed by the next `update`.
    pub fn push_update(&self, verdict: MockVerdict) {
        self.lock().scripted_updates.push(verdict);
    }

    /// Pin the verdict `update` applies for a specific issue.
    pub fn set_issue_verdict(&self, issue: i64, verdict: MockVerdict) {
        self.lock().server_state.insert(issue, verdict);
    }

    /// Inject one transient failure before the named operation.
    pub fn fail_next(&self, op: &'static str) {
        self.lock().fail_next.push(op);
    }

    /// Make a change discoverable through `get_change_for_commit`.
    pub fn add_change_for_commit(&self, commit: &str, handle: RollHandle) {
        self.lock()
            .changes_by_commit
            .insert(commit.to_string(), handle);
    }

    /// Snapshot of all recorded calls.
    pub fn calls(&self) -> Vec<String> {
        self.lock().calls.clone()
    }

    fn apply_verdict(handle: &mut RollHandle, verdict: MockVerdict) {
        if let Some(state) = verdict.state {
            handle.state = state;
        }
        if let Some(cq) = verdict.cq {
            handle.cq = cq;
        }
        if let Some(dry) = verdict.dry {
            handle.dry = dry;
        }
        handle.updated = Utc::now();
    }
}

#[async_trait]
impl CodeReviewSystem for MockCodeReview {
    async fn upload_new_roll(
        &self,
        from: &RevisionId,
        to: &RevisionId,
        dry_run: bool,
    ) -> Result<RollHandle> {
        self.record(format!("upload_new_roll({from},{to},{dry_run})"))?;
        let issue = {
            let mut state = self.lock();
            state.next_issue += 1;
            state.next_issue
        };
        Ok(RollHandle {
            issue,
            url: format!("https://review.example.com/c/{issue}"),
            subject: format!("Roll child from {from} to {to}"),
            rolling_from: from.clone(),
            rolling_to: to.clone(),
            dry_run,
            state: ChangeState::Open,
            cq: CheckState::Pending,
            dry: CheckState::Pending,
            updated: Utc::now(),
            try_results: Vec::new(),
        })
    }

    async fn update(&self, handle: &mut RollHandle) -> Result<()> {
        self.record(format!("update({})", handle.issue))?;
        let verdict = {
            let mut state = self.lock();
            if let Some(v) = state.server_state.get(&handle.issue) {
                Some(*v)
            } else if state.scripted_updates.is_empty() {
                None
            } else {
                Some(state.scripted_updates.remove(0))
            }
        };
        if let Some(verdict) = verdict {
            Self::apply_verdict(handle, verdict);
        }
        Ok(())
    }

    async fn switch_to_dry_run(&self, handle: &mut RollHandle) -> Result<()> {
        self.record(format!("switch_to_dry_run({})", handle.issue))?;
        handle.dry_run = true;
        handle.dry = CheckState::Pending;
        Ok(())
    }

    async fn switch_to_normal(&self, handle: &mut RollHandle) -> Result<()> {
        self.record(format!("switch_to_normal({})", handle.issue))?;
        handle.dry_run = false;
        handle.cq = CheckState::Pending;
        Ok(())
    }

    async fn retry_cq(&self, handle: &mut RollHandle) -> Result<()> {
        self.record(format!("retry_cq({})", handle.issue))?;
        handle.cq = CheckState::Pending;
        Ok(())
    }

    async fn retry_dry_run(&self, handle: &mut RollHandle) -> Result<()> {
        self.record(format!("retry_dry_run({})", handle.issue))?;
        handle.dry = CheckState::Pending;
        Ok(())
    }

    async fn close(
        &self,
        handle: &mut RollHandle,
        result: RollStatus,
        message: &str,
    ) -> Result<()> {
        self.record(format!("close({},{result},{message})", handle.issue))?;
        handle.state = ChangeState::Abandoned;
        Ok(())
    }

    async fn add_comment(&self, handle: &RollHandle, message: &str) -> Result<()> {
        self.record(format!("add_comment({},{message})", handle.issue))
    }

    async fn get_change_for_commit(&self, commit: &RevisionId) -> Result<Option<RollHandle>> {
        self.record(format!("get_change_for_commit({commit})"))?;
        Ok(self.lock().changes_by_commit.get(commit.as_str()).cloned())
    }

    fn supports_dry_run_promotion(&self) -> bool {
        self.lock().supports_promotion
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handle(issue: i64) -> RollHandle {
        RollHandle {
            issue,
            url: format!("https://review.example.com/c/{issue}"),
            subject: "Roll child from aaaa to bbbb".to_string(),
            rolling_from: RevisionId::new("aaaa"),
            rolling_to: RevisionId::new("bbbb"),
            dry_run: false,
            state: ChangeState::Open,
            cq: CheckState::Pending,
            dry: CheckState::Pending,
            updated: Utc::now(),
            try_results: Vec::new(),
        }
    }

    #[test]
    fn handle_predicates_follow_snapshot() {
        let mut h = handle(1);
        assert!(!h.is_finished());
        assert!(!h.is_success());

        h.cq = CheckState::Failed;
        assert!(h.is_finished());
        assert!(!h.is_success());

        h.cq = CheckState::Passed;
        h.state = ChangeState::Landed;
        assert!(h.is_finished());
        assert!(h.is_success());

        let mut d = handle(2);
        d.dry_run = true;
        assert!(!d.is_dry_run_finished());
        d.dry = CheckState::Passed;
        assert!(d.is_dry_run_finished());
        assert!(d.is_dry_run_success());
    }

    #[tokio::test]
    async fn mock_scripted_updates_consumed_fifo() {
        let mock = MockCodeReview::new();
        let mut h = mock
            .upload_new_roll(&RevisionId::new("aaaa"), &RevisionId::new("bbbb"), false)
            .await
            .unwrap();

        mock.push_update(MockVerdict {
            cq: Some(CheckState::Failed),
            ..Default::default()
        });
        mock.push_update(MockVerdict {
            state: Some(ChangeState::Landed),
            cq: Some(CheckState::Passed),
            ..Default::default()
        });

        mock.update(&mut h).await.unwrap();
        assert!(h.is_finished());
        assert!(!h.is_success());

        mock.update(&mut h).await.unwrap();
        assert!(h.is_success());
    }

    #[tokio::test]
    async fn mock_injected_failures_are_transient_and_one_shot() {
        let mock = MockCodeReview::new();
        let mut h = handle(7);
        mock.fail_next("update");

        let err = mock.update(&mut h).await.unwrap_err();
        assert!(err.is_retryable());
        // Next call goes through.
        mock.update(&mut h).await.unwrap();
    }

    #[tokio::test]
    async fn mock_records_calls_in_order() {
        let mock = MockCodeReview::new();
        let mut h = mock
            .upload_new_roll(&RevisionId::new("aaaa"), &RevisionId::new("bbbb"), true)
            .await
            .unwrap();
        mock.switch_to_normal(&mut h).await.unwrap();
        mock.close(&mut h, RollStatus::Failure, "stopped").await.unwrap();

        let calls = mock.calls();
        assert_eq!(calls.len(), 3);
        assert!(calls[0].starts_with("upload_new_roll("));
        assert!(calls[1].starts_with("switch_to_normal("));
        assert!(calls[2].starts_with("close("));
    }

    #[test]
    fn promotion_capability_is_configurable() {
        assert!(MockCodeReview::new().supports_dry_run_promotion());
        assert!(!MockCodeReview::without_promotion().supports_dry_run_promotion());
    }

    #[tokio::test]
    async fn mock_lookup_by_commit_returns_none_when_unknown() {
        let mock = MockCodeReview::new();
        let found = mock
            .get_change_for_commit(&RevisionId::new("cafe"))
            .await
            .unwrap();
        assert!(found.is_none());

        mock.add_change_for_commit("cafe", handle(9));
        let found = mock
            .get_change_for_commit(&RevisionId::new("cafe"))
            .await
            .unwrap();
        assert_eq!(found.unwrap().issue, 9);
    }
}

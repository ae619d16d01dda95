//! Contract between the roller core and the parent/child repository view.
//!
//! The heavy inspector plumbing (gclient/DEPS/git checkouts) runs behind
//! its own service; the core consumes this capability surface only,
//! through a thin REST client. The mock inspector drives every
//! state-machine and controller test.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

use crate::config::RepoConfig;
use crate::errors::{ErrorCode, Result, RollerError};
use crate::types::RevisionId;

/// Read-side view of the parent and child repositories.
#[async_trait]
pub trait RepoInspector: Send + Sync {
    /// Refresh the inspector's view of both repositories. May block on
    /// I/O; implementations must abort promptly when `cancel` fires.
    async fn update_repos(&self, cancel: &CancellationToken) -> Result<()>;

    /// Revision the parent currently pins for the child.
    async fn current_rev(&self) -> RevisionId;

    /// Revision the roller would like to land next. Equals
    /// `current_rev` when the parent is already up to date.
    async fn next_roll_rev(&self) -> RevisionId;

    /// Whether the parent contains the given revision.
    async fn rolled_past(&self, rev: &RevisionId) -> Result<bool>;

    /// Number of child revisions newer than the current pin.
    async fn not_rolled_count(&self) -> usize;

    /// Drain the parent commits that appeared since the last call. Feeds
    /// landed-commit reconciliation.
    async fn new_parent_commits(&self) -> Vec<RevisionId>;

    /// Minimum spacing between landed rolls. Zero disables the
    /// success-frequency throttle.
    fn max_roll_frequency(&self) -> Duration;
}

/// Repository view returned by the inspector service.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WireRepoState {
    pub current_rev: String,
    pub next_roll_rev: String,
    #[serde(default)]
    pub not_rolled_count: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireContains {
    contains: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct WireNewCommits {
    #[serde(default)]
    commits: Vec<String>,
}

/// REST client for the repo-inspector service.
///
/// `update_repos` asks the service to refresh its checkouts and caches
/// the resulting view; the read accessors serve the cached view so a
/// decision tick never blocks on repository I/O.
pub struct RestRepoInspector {
    http: reqwest::Client,
    base_url: String,
    max_roll_frequency: Duration,
    view: Mutex<WireRepoState>,
}

impl RestRepoInspector {
    pub fn new(config: &RepoConfig, max_roll_frequency: Duration) -> Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(RollerError::from)?;
        Ok(Self {
            http,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            max_roll_frequency,
            view: Mutex::new(WireRepoState::default()),
        })
    }

    fn view(&self) -> WireRepoState {
        self.view.lock().expect("repo view mutex poisoned").clone()
    }

    async fn fetch_json<T: serde::de::DeserializeOwned>(
        &self,
        request: reqwest::RequestBuilder,
    ) -> Result<T> {
        let resp = request.send().await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(RollerError::transient_msg(format!(
                "{}: repo inspector returned {status}",
                ErrorCode::RepoUpdateFailed.code_str()
            )));
        }
        Ok(resp.json::<T>().await?)
    }
}

#[async_trait]
impl RepoInspector for RestRepoInspector {
    async fn update_repos(&self, cancel: &CancellationToken) -> Result<()> {
        let request = self.http.post(format!("{}/v1/update", self.base_url));
        let state: WireRepoState = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(RollerError::transient_msg("repo update cancelled"));
            }
            result = self.fetch_json(request) => result?,
        };
        *self.view.lock().expect("repo view mutex poisoned") = state;
        Ok(())
    }

    async fn current_rev(&self) -> RevisionId {
        RevisionId::new(self.view().current_rev)
    }

    async fn next_roll_rev(&self) -> RevisionId {
        RevisionId::new(self.view().next_roll_rev)
    }

    async fn rolled_past(&self, rev: &RevisionId) -> Result<bool> {
        let request = self
            .http
            .get(format!("{}/v1/contains", self.base_url))
            .query(&[("rev", rev.as_str())]);
        let result: WireContains = self.fetch_json(request).await?;
        Ok(result.contains)
    }

    async fn not_rolled_count(&self) -> usize {
        self.view().not_rolled_count
    }

    async fn new_parent_commits(&self) -> Vec<RevisionId> {
        let request = self.http.post(format!("{}/v1/new_commits", self.base_url));
        match self.fetch_json::<WireNewCommits>(request).await {
            Ok(result) => result.commits.into_iter().map(RevisionId::new).collect(),
            Err(err) => {
                tracing::warn!("failed to fetch new parent commits: {err}");
                Vec::new()
            }
        }
    }

    fn max_roll_frequency(&self) -> Duration {
        self.max_roll_frequency
    }
}

#[derive(Debug, Default)]
struct MockRepoState {
    current: RevisionId,
    next: RevisionId,
    rolled: HashSet<String>,
    not_rolled: usize,
    update_calls: usize,
    fail_next_update: bool,
    /// Revisions that enter the parent after N further `update_repos` calls.
    land_after: Vec<(String, usize)>,
    /// Commits waiting to be drained by `new_parent_commits`.
    pending_commits: Vec<RevisionId>,
}

/// Deterministic in-memory inspector for unit and integration tests.
#[derive(Clone)]
pub struct MockRepoInspector {
    state: Arc<Mutex<MockRepoState>>,
    max_roll_frequency: Duration,
}

impl MockRepoInspector {
    pub fn new(current: &str, next: &str) -> Self {
        let mut rolled = HashSet::new();
        rolled.insert(current.to_string());
        Self {
            state: Arc::new(Mutex::new(MockRepoState {
                current: RevisionId::new(current),
                next: RevisionId::new(next),
                rolled,
                not_rolled: usize::from(current != next),
                ..Default::default()
            })),
            max_roll_frequency: Duration::ZERO,
        }
    }

    pub fn with_max_roll_frequency(mut self, freq: Duration) -> Self {
        self.max_roll_frequency = freq;
        self
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MockRepoState> {
        self.state.lock().expect("mock repo mutex poisoned")
    }

    /// Move the parent pin (e.g. after a roll lands).
    pub fn set_current(&self, rev: &str) {
        let mut state = self.lock();
        state.current = RevisionId::new(rev);
        state.rolled.insert(rev.to_string());
    }

    /// Change the revision the roller wants to land next.
    pub fn set_next(&self, rev: &str) {
        self.lock().next = RevisionId::new(rev);
    }

    pub fn set_not_rolled_count(&self, count: usize) {
        self.lock().not_rolled = count;
    }

    /// Mark a revision as already contained in the parent.
    pub fn mark_rolled(&self, rev: &str) {
        self.lock().rolled.insert(rev.to_string());
    }

    /// Make `rev` appear in the parent after `updates` further
    /// `update_repos` calls (drives wait-for-land loops).
    pub fn land_after_updates(&self, rev: &str, updates: usize) {
        self.lock().land_after.push((rev.to_string(), updates));
    }

    /// Fail the next `update_repos` call with a transient error.
    pub fn fail_next_update(&self) {
        self.lock().fail_next_update = true;
    }

    /// Queue a parent commit for the next `new_parent_commits` drain.
    pub fn push_parent_commit(&self, rev: &str) {
        self.lock().pending_commits.push(RevisionId::new(rev));
    }

    pub fn update_calls(&self) -> usize {
        self.lock().update_calls
    }
}

#[async_trait]
impl RepoInspector for MockRepoInspector {
    async fn update_repos(&self, cancel: &CancellationToken) -> Result<()> {
        if cancel.is_cancelled() {
            return Err(RollerError::transient_msg("repo update cancelled"));
        }
        let mut state = self.lock();
        state.update_calls += 1;
        if state.fail_next_update {
            state.fail_next_update = false;
            return Err(RollerError::transient_msg("mock repo injected failure"));
        }
        let mut landed = Vec::new();
        for entry in &mut state.land_after {
            if entry.1 == 0 {
                landed.push(entry.0.clone());
            } else {
                entry.1 -= 1;
            }
        }
        state.land_after.retain(|(rev, _)| !landed.contains(rev));
        for rev in landed {
            state.rolled.insert(rev.clone());
            state.current = RevisionId::new(rev);
        }
        Ok(())
    }

    async fn current_rev(&self) -> RevisionId {
        self.lock().current.clone()
    }

    async fn next_roll_rev(&self) -> RevisionId {
        self.lock().next.clone()
    }

    async fn rolled_past(&self, rev: &RevisionId) -> Result<bool> {
        Ok(self.lock().rolled.contains(rev.as_str()))
    }

    async fn not_rolled_count(&self) -> usize {
        self.lock().not_rolled
    }

    async fn new_parent_commits(&self) -> Vec<RevisionId> {
        std::mem::take(&mut self.lock().pending_commits)
    }

    fn max_roll_frequency(&self) -> Duration {
        self.max_roll_frequency
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn mock_tracks_current_and_next() {
        let repo = MockRepoInspector::new("r1", "r2");
        assert_eq!(repo.current_rev().await.as_str(), "r1");
        assert_eq!(repo.next_roll_rev().await.as_str(), "r2");
        assert!(repo.rolled_past(&RevisionId::new("r1")).await.unwrap());
        assert!(!repo.rolled_past(&RevisionId::new("r2")).await.unwrap());
    }

    #[tokio::test]
    async fn land_after_updates_flips_rolled_past() {
        let repo = MockRepoInspector::new("r1", "r2");
        let cancel = CancellationToken::new();
        repo.land_after_updates("r2", 2);

        repo.update_repos(&cancel).await.unwrap();
        assert!(!repo.rolled_past(&RevisionId::new("r2")).await.unwrap());
        repo.update_repos(&cancel).await.unwrap();
        assert!(!repo.rolled_past(&RevisionId::new("r2")).await.unwrap());
        repo.update_repos(&cancel).await.unwrap();
        assert!(repo.rolled_past(&RevisionId::new("r2")).await.unwrap());
        assert_eq!(repo.current_rev().await.as_str(), "r2");
    }

    #[tokio::test]
    async fn cancelled_update_aborts() {
        let repo = MockRepoInspector::new("r1", "r2");
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(repo.update_repos(&cancel).await.is_err());
        assert_eq!(repo.update_calls(), 0);
    }

    #[tokio::test]
    async fn injected_update_failure_is_one_shot() {
        let repo = MockRepoInspector::new("r1", "r2");
        let cancel = CancellationToken::new();
        repo.fail_next_update();
        assert!(repo.update_repos(&cancel).await.is_err());
        assert!(repo.update_repos(&cancel).await.is_ok());
    }
}

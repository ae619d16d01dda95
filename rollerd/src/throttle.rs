//! Throttle policy over the persistent counters.
//!
//! Three independent policies gate the state machine:
//! - attempt safety: at most `limit` uploads per window
//! - failure cooldown: back off for an hour after a CQ failure
//! - success frequency: spacing between landed rolls (zero disables)

use roller_common::{Result, SafetyThrottleConfig};
use std::path::Path;
use std::time::Duration;

use crate::counter::PersistentCounter;

/// Failure cooldown window.
const FAILURE_WINDOW: Duration = Duration::from_secs(60 * 60);

const ATTEMPT_COUNTER_FILE: &str = "attempt_counter";
const FAIL_COUNTER_FILE: &str = "fail_counter";
const SUCCESS_COUNTER_FILE: &str = "success_counter";

/// Counter-backed throttle predicates consumed by the state machine.
#[derive(Clone)]
pub struct Throttler {
    attempt: PersistentCounter,
    fail: PersistentCounter,
    success: PersistentCounter,
    attempt_limit: usize,
    success_window: Duration,
}

impl Throttler {
    /// Open (or create) the three counters under `workdir`.
    ///
    /// `success_window` is the configured maximum roll frequency; zero
    /// disables success throttling entirely.
    pub async fn load_or_create(
        workdir: &Path,
        safety: &SafetyThrottleConfig,
        success_window: Duration,
    ) -> Result<Self> {
        let attempt =
            PersistentCounter::load_or_create(workdir.join(ATTEMPT_COUNTER_FILE), safety.window)
                .await?;
        let fail =
            PersistentCounter::load_or_create(workdir.join(FAIL_COUNTER_FILE), FAILURE_WINDOW)
                .await?;
        let success =
            PersistentCounter::load_or_create(workdir.join(SUCCESS_COUNTER_FILE), success_window)
                .await?;
        Ok(Self {
            attempt,
            fail,
            success,
            attempt_limit: safety.limit,
            success_window,
        })
    }

    /// Too many upload attempts within the safety window.
    pub fn safety_throttled(&self) -> bool {
        self.attempt.get() >= self.attempt_limit
    }

    /// A CQ failure occurred within the cooldown window.
    pub fn failure_throttled(&self) -> bool {
        self.fail.get() > 0
    }

    /// A roll landed more recently than the configured frequency allows.
    pub fn success_throttled(&self) -> bool {
        !self.success_window.is_zero() && self.success.get() > 0
    }

    /// Record an upload attempt.
    pub async fn record_attempt(&self) -> Result<()> {
        self.attempt.inc().await
    }

    /// Record a CQ failure.
    pub async fn record_failure(&self) -> Result<()> {
        self.fail.inc().await
    }

    /// Record a landed roll. Callers must only do this when success
    /// throttling is enabled.
    pub async fn record_success(&self) -> Result<()> {
        self.success.inc().await
    }

    pub async fn reset_attempts(&self) -> Result<()> {
        self.attempt.reset().await
    }

    pub async fn reset_failures(&self) -> Result<()> {
        self.fail.reset().await
    }

    pub fn attempt_count(&self) -> usize {
        self.attempt.get()
    }

    pub fn failure_count(&self) -> usize {
        self.fail.get()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn safety(limit: usize, window: Duration) -> SafetyThrottleConfig {
        SafetyThrottleConfig { limit, window }
    }

    #[tokio::test]
    async fn safety_throttles_at_limit() {
        let dir = tempfile::tempdir().unwrap();
        let throttle = Throttler::load_or_create(
            dir.path(),
            &safety(3, Duration::from_secs(600)),
            Duration::ZERO,
        )
        .await
        .unwrap();

        assert!(!throttle.safety_throttled());
        throttle.record_attempt().await.unwrap();
        throttle.record_attempt().await.unwrap();
        assert!(!throttle.safety_throttled());
        throttle.record_attempt().await.unwrap();
        assert!(throttle.safety_throttled());

        throttle.reset_attempts().await.unwrap();
        assert!(!throttle.safety_throttled());
    }

    #[tokio::test]
    async fn failure_throttle_follows_fail_counter() {
        let dir = tempfile::tempdir().unwrap();
        let throttle = Throttler::load_or_create(
            dir.path(),
            &safety(3, Duration::from_secs(600)),
            Duration::ZERO,
        )
        .await
        .unwrap();

        assert!(!throttle.failure_throttled());
        throttle.record_failure().await.unwrap();
        assert!(throttle.failure_throttled());
        throttle.reset_failures().await.unwrap();
        assert!(!throttle.failure_throttled());
    }

    #[tokio::test]
    async fn zero_window_disables_success_throttle() {
        let dir = tempfile::tempdir().unwrap();
        let throttle = Throttler::load_or_create(
            dir.path(),
            &safety(3, Duration::from_secs(600)),
            Duration::ZERO,
        )
        .await
        .unwrap();
        assert!(!throttle.success_throttled());
    }

    #[tokio::test]
    async fn success_throttle_decays_with_window() {
        let dir = tempfile::tempdir().unwrap();
        let throttle = Throttler::load_or_create(
            dir.path(),
            &safety(3, Duration::from_secs(600)),
            Duration::from_millis(50),
        )
        .await
        .unwrap();

        throttle.record_success().await.unwrap();
        assert!(throttle.success_throttled());

        tokio::time::sleep(Duration::from_millis(200)).await;
        assert!(!throttle.success_throttled());
    }

    #[tokio::test]
    async fn counters_share_the_workdir_layout() {
        let dir = tempfile::tempdir().unwrap();
        let throttle = Throttler::load_or_create(
            dir.path(),
            &safety(3, Duration::from_secs(600)),
            Duration::from_secs(600),
        )
        .await
        .unwrap();
        throttle.record_attempt().await.unwrap();
        throttle.record_failure().await.unwrap();
        throttle.record_success().await.unwrap();

        assert!(dir.path().join("attempt_counter").exists());
        assert!(dir.path().join("fail_counter").exists());
        assert!(dir.path().join("success_counter").exists());
    }
}

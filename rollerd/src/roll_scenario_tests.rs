//! End-to-end roller scenarios.
//!
//! These tests exercise the cross-module composition of:
//! - `state` (decision function and transition effects)
//! - `controller` (tick driver, status, manual handoff)
//! - `throttle` + `counter` (attempt/failure/success policies)
//! - `store` (roll records)
//! - `reconciler` (landed-commit correlation)
//!
//! driven end to end through mock review and repo services.

#[cfg(test)]
mod tests {
    use crate::controller::Controller;
    use crate::events::EventBus;
    use crate::manual::ManualRollQueue;
    use crate::mode::ModeSource;
    use crate::reconciler::ExpectationsStore;
    use crate::state::RollStateMachine;
    use crate::store::RollRecordStore;
    use crate::throttle::Throttler;
    use roller_common::{
        ChangeState, CheckState, ManualRollRequest, ManualRollStatus, MockCodeReview,
        MockRepoInspector, MockVerdict, Mode, RevisionId, SafetyThrottleConfig,
    };
    use std::sync::Arc;
    use std::time::Duration;

    struct Roller {
        controller: Arc<Controller>,
        review: MockCodeReview,
        repo: MockRepoInspector,
        mode: Arc<ModeSource>,
        throttle: Throttler,
        store: RollRecordStore,
        _dir: tempfile::TempDir,
    }

    async fn roller(current: &str, next: &str) -> Roller {
        let dir = tempfile::tempdir().unwrap();
        let review = MockCodeReview::new();
        let repo = MockRepoInspector::new(current, next);
        let mode = ModeSource::fixed(Mode::Running);
        let events = EventBus::default();
        let expectations = ExpectationsStore::new();

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
            throttle.clone(),
            Arc::new(review.clone()),
            Arc::new(repo.clone()),
            store.clone(),
            events.clone(),
        )
        .await
        .unwrap();
        machine.set_land_poll_interval(Duration::from_millis(5));

        let controller = Controller::new(
            "child-roller".to_string(),
            machine,
            Arc::new(repo.clone()),
            Arc::new(review.clone()),
            store.clone(),
            ManualRollQueue::new(),
            Arc::clone(&mode),
            expectations,
            events,
        );
        Roller {
            controller,
            review,
            repo,
            mode,
            throttle,
            store,
            _dir: dir,
        }
    }

    fn state_of(r: &Roller) -> String {
        r.controller.status(true).state
    }

    /// S1: a clean roll uploads, the CQ lands it, and the roller returns
    /// to idle once the parent picks the commit up.
    #[tokio::test]
    async fn s1_clean_roll() {
        let r = roller("r1", "r2").await;

        r.controller.tick_once().await;
        assert_eq!(state_of(&r), "normal-active");
        let roll = r.controller.status(true).current_roll.unwrap();
        assert_eq!(roll.rolling_to.as_str(), "r2");
        let issue = roll.issue;

        r.review.set_issue_verdict(
            issue,
            MockVerdict {
                state: Some(ChangeState::Landed),
                cq: Some(CheckState::Passed),
                ..Default::default()
            },
        );
        r.controller.tick_once().await;
        assert_eq!(state_of(&r), "normal-success");

        r.repo.land_after_updates("r2", 0);
        r.controller.tick_once().await;
        assert_eq!(state_of(&r), "normal-idle");
        assert!(r.controller.status(true).current_roll.is_none());
    }

    /// S2: a failure followed by a newer child revision closes the failed
    /// roll and uploads the newer revision.
    #[tokio::test]
    async fn s2_failure_then_different_rev() {
        let r = roller("r1", "r2").await;

        r.controller.tick_once().await;
        let issue = r.controller.status(true).current_roll.unwrap().issue;

        r.review.set_issue_verdict(
            issue,
            MockVerdict {
                cq: Some(CheckState::Failed),
                ..Default::default()
            },
        );
        r.repo.set_next("r3");
        r.controller.tick_once().await;
        assert_eq!(state_of(&r), "normal-failure");

        r.controller.tick_once().await;
        assert_eq!(state_of(&r), "normal-idle");
        assert!(
            r.review
                .calls()
                .iter()
                .any(|c| c.starts_with(&format!("close({issue},failure")))
        );

        r.controller.tick_once().await;
        assert_eq!(state_of(&r), "normal-active");
        let roll = r.controller.status(true).current_roll.unwrap();
        assert_eq!(roll.rolling_to.as_str(), "r3");
    }

    /// S3: a failure with the same next revision throttles instead of
    /// re-uploading; once the cooldown elapses the CQ is retried.
    #[tokio::test]
    async fn s3_failure_on_same_rev() {
        let r = roller("r1", "r2").await;

        r.controller.tick_once().await;
        let issue = r.controller.status(true).current_roll.unwrap().issue;

        r.review.set_issue_verdict(
            issue,
            MockVerdict {
                cq: Some(CheckState::Failed),
                ..Default::default()
            },
        );
        r.controller.tick_once().await;
        assert_eq!(state_of(&r), "normal-failure-throttled");
        assert_eq!(r.throttle.failure_count(), 1);

        // Ticks self-loop while the cooldown holds; no new upload.
        r.controller.tick_once().await;
        assert_eq!(state_of(&r), "normal-failure-throttled");
        assert_eq!(
            r.review
                .calls()
                .iter()
                .filter(|c| c.starts_with("upload_new_roll"))
                .count(),
            1
        );

        // The cooldown window elapses; the same change is retried.
        r.throttle.reset_failures().await.unwrap();
        r.review.set_issue_verdict(issue, MockVerdict::default());
        r.controller.tick_once().await;
        assert_eq!(state_of(&r), "normal-active");
        assert!(
            r.review
                .calls()
                .iter()
                .any(|c| c == &format!("retry_cq({issue})"))
        );
    }

    /// S4: three failed upload attempts exhaust the safety budget; the
    /// roller refuses further uploads until the window elapses.
    #[tokio::test]
    async fn s4_safety_throttle() {
        let r = roller("r1", "r2").await;

        for _ in 0..3 {
            r.review.fail_next("upload_new_roll");
            r.controller.tick_once().await;
            assert!(!r.controller.status(true).error.is_empty());
        }
        // Attempts were recorded even though the uploads failed.
        assert!(r.throttle.safety_throttled());

        r.controller.tick_once().await;
        assert_eq!(state_of(&r), "normal-safety-throttled");

        // Remains throttled across ticks.
        r.controller.tick_once().await;
        assert_eq!(state_of(&r), "normal-safety-throttled");

        // Window elapses (simulated via reset); the throttled state
        // steps back to idle, and the next tick uploads again.
        r.throttle.reset_attempts().await.unwrap();
        r.controller.tick_once().await;
        assert_eq!(state_of(&r), "normal-idle");
        r.controller.tick_once().await;
        assert_eq!(state_of(&r), "normal-active");
    }

    /// S5: flipping the mode mid-roll switches the active change between
    /// CQ and dry run rather than closing it; stopping closes it.
    #[tokio::test]
    async fn s5_mode_flip_mid_roll() {
        let r = roller("r1", "r2").await;

        r.controller.tick_once().await;
        assert_eq!(state_of(&r), "normal-active");
        let issue = r.controller.status(true).current_roll.unwrap().issue;

        r.mode.set(Mode::DryRun);
        r.controller.tick_once().await;
        assert_eq!(state_of(&r), "dry-run-active");
        assert!(
            r.review
                .calls()
                .iter()
                .any(|c| c == &format!("switch_to_dry_run({issue})"))
        );

        r.mode.set(Mode::Stopped);
        r.controller.tick_once().await;
        assert_eq!(state_of(&r), "stopped");
        assert!(
            r.review
                .calls()
                .iter()
                .any(|c| c == &format!("close({issue},failure,AutoRoller is stopped)"))
        );
        // The closed roll is recorded as a failure.
        let record = r.store.get(&issue.to_string()).await.unwrap();
        assert_eq!(record.status, roller_common::RollStatus::Failure);
    }

    /// S6: with the roller idle and up to date, a pending manual request
    /// is uploaded directly, bypassing next-revision selection.
    #[tokio::test]
    async fn s6_manual_roll_handoff() {
        let r = roller("r1", "r1").await;
        r.controller
            .add_manual_roll(ManualRollRequest::new(
                "alice",
                RevisionId::new("rX"),
                "child-roller",
            ))
            .unwrap();

        r.controller.tick_once().await;
        assert_eq!(state_of(&r), "normal-idle");
        assert!(
            r.review
                .calls()
                .iter()
                .any(|c| c.starts_with("upload_new_roll(r1,rX,false)"))
        );

        let open = r.controller.manual_queue().get_incomplete();
        assert_eq!(open.len(), 1);
        assert_eq!(open[0].status, ManualRollStatus::Running);
        let url = open[0].url.clone().unwrap();
        assert!(url.starts_with("https://review.example.com/c/"));
    }

    /// Restart midway through a roll: the persisted state and the stored
    /// record bring the roller back to the same active roll.
    #[tokio::test]
    async fn restart_resumes_active_roll() {
        let dir = tempfile::tempdir().unwrap();
        let review = MockCodeReview::new();
        let repo = MockRepoInspector::new("r1", "r2");
        let issue;

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
            let machine = RollStateMachine::load_or_create(
                dir.path(),
                throttle,
                Arc::new(review.clone()),
                Arc::new(repo.clone()),
                store.clone(),
                EventBus::default(),
            )
            .await
            .unwrap();
            let controller = Controller::new(
                "child-roller".to_string(),
                machine,
                Arc::new(repo.clone()),
                Arc::new(review.clone()),
                store,
                ManualRollQueue::new(),
                ModeSource::fixed(Mode::Running),
                ExpectationsStore::new(),
                EventBus::default(),
            );
            controller.tick_once().await;
            issue = controller.status(true).current_roll.unwrap().issue;
        }

        // New process, same working directory.
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
            Arc::new(review.clone()),
            Arc::new(repo.clone()),
            store.clone(),
            EventBus::default(),
        )
        .await
        .unwrap();
        let controller = Controller::new(
            "child-roller".to_string(),
            machine,
            Arc::new(repo),
            Arc::new(review.clone()),
            store,
            ManualRollQueue::new(),
            ModeSource::fixed(Mode::Running),
            ExpectationsStore::new(),
            EventBus::default(),
        );

        // The resumed roll finishes normally.
        review.set_issue_verdict(
            issue,
            MockVerdict {
                state: Some(ChangeState::Landed),
                cq: Some(CheckState::Passed),
                ..Default::default()
            },
        );
        controller.tick_once().await;
        assert_eq!(controller.status(true).state, "normal-success");
    }
}

//! Phase timeouts and STOPPING status polls.

use chrono::Duration;
use dm_core::distributor::RunOutcome;
use dm_core::models::{
    AbnormalStatus, AttemptId, Quest, RetryPolicy, Timeouts, MAX_PHASE_TIMEOUT_SECS,
};
use dm_core::mutation::MergeQuest;
use dm_core::orchestration::EnsureGraphDataRequest;
use dm_core::test_helpers::TestHarness;
use dm_core::{AttemptState, Clock, DmError, ExecutionResult, ExecutionState, GraphStore};
use serde_json::json;
use std::collections::BTreeSet;

fn timeouts(start_secs: u64, run_secs: u64, stop_secs: u64) -> Timeouts {
    Timeouts {
        start_secs,
        run_secs,
        stop_secs,
    }
}

async fn abnormal_reason(h: &TestHarness, attempt: &AttemptId) -> (AbnormalStatus, String) {
    let done = h.attempt(attempt).await.unwrap();
    assert_eq!(done.state, AttemptState::AbnormalFinished);
    let abnormal = done.result.unwrap().abnormal_finish.unwrap();
    (abnormal.status, abnormal.reason)
}

#[tokio::test]
async fn test_scheduling_timeout_fires_at_deadline() {
    let h = TestHarness::new();
    let attempt = h
        .start(TestHarness::desc_with_timeouts(json!({"t": 1}), timeouts(60, 0, 0)))
        .await
        .unwrap();
    assert_eq!(h.pending_journal().await.unwrap(), 1);

    h.advance(Duration::seconds(59)).await.unwrap();
    assert_eq!(
        h.current_execution(&attempt).await.unwrap().state,
        ExecutionState::Scheduling
    );

    h.advance(Duration::seconds(1)).await.unwrap();
    let (status, reason) = abnormal_reason(&h, &attempt).await;
    assert_eq!(status, AbnormalStatus::TimedOut);
    assert_eq!(reason, "DM timeout (SCHEDULING)");
    assert_eq!(h.distributor.cancels(), vec!["tok-1".to_string()]);
    assert_eq!(h.pending_journal().await.unwrap(), 0);
}

#[tokio::test]
async fn test_activation_rearms_for_running() {
    let h = TestHarness::new();
    let attempt = h
        .start(TestHarness::desc_with_timeouts(json!({"t": 2}), timeouts(60, 300, 0)))
        .await
        .unwrap();

    h.advance(Duration::seconds(50)).await.unwrap();
    h.activate(&attempt).await.unwrap();

    // the SCHEDULING deadline at 60s no longer applies
    h.advance(Duration::seconds(20)).await.unwrap();
    assert_eq!(
        h.current_execution(&attempt).await.unwrap().state,
        ExecutionState::Running
    );

    h.advance(Duration::seconds(279)).await.unwrap();
    assert_eq!(
        h.current_execution(&attempt).await.unwrap().state,
        ExecutionState::Running
    );

    h.advance(Duration::seconds(1)).await.unwrap();
    let (status, reason) = abnormal_reason(&h, &attempt).await;
    assert_eq!(status, AbnormalStatus::TimedOut);
    assert_eq!(reason, "DM timeout (RUNNING)");
}

#[tokio::test]
async fn test_timed_out_execution_is_retried_by_policy() {
    let h = TestHarness::new();
    let mut desc = TestHarness::desc_with_timeouts(json!({"t": 3}), timeouts(10, 0, 0));
    desc.meta.retry = RetryPolicy {
        timed_out: 1,
        ..RetryPolicy::default()
    };
    let attempt = h.start(desc).await.unwrap();

    h.advance(Duration::seconds(10)).await.unwrap();
    let retried = h.attempt(&attempt).await.unwrap();
    assert_eq!(retried.state, AttemptState::Executing);
    assert_eq!(retried.cur_execution, 2);
    assert_eq!(retried.retry_state.timed_out, 1);

    h.advance(Duration::seconds(10)).await.unwrap();
    let (status, _) = abnormal_reason(&h, &attempt).await;
    assert_eq!(status, AbnormalStatus::TimedOut);
    assert_eq!(h.distributor.run_count(), 2);
}

#[tokio::test]
async fn test_stopping_polls_back_off_then_time_out() {
    let h = TestHarness::new();
    let attempt = h
        .start(TestHarness::desc_with_timeouts(json!({"t": 4}), timeouts(0, 0, 10)))
        .await
        .unwrap();
    let auth = h.activate(&attempt).await.unwrap();
    h.service
        .finish_attempt(auth, json!({"partial": true}))
        .await
        .unwrap();

    // first poll after stop_secs, then 30s, 60s and 120s apart
    for wait in [10, 30, 60] {
        h.advance(Duration::seconds(wait - 1)).await.unwrap();
        h.advance(Duration::seconds(1)).await.unwrap();
        assert_eq!(
            h.current_execution(&attempt).await.unwrap().state,
            ExecutionState::Stopping
        );
    }

    h.advance(Duration::seconds(119)).await.unwrap();
    assert_eq!(
        h.current_execution(&attempt).await.unwrap().state,
        ExecutionState::Stopping
    );
    h.advance(Duration::seconds(1)).await.unwrap();

    let (status, reason) = abnormal_reason(&h, &attempt).await;
    assert_eq!(status, AbnormalStatus::TimedOut);
    assert!(reason.contains("no status after 3 polls"), "{reason}");
}

#[tokio::test]
async fn test_status_poll_result_finishes_execution() {
    let h = TestHarness::new();
    let attempt = h
        .start(TestHarness::desc_with_timeouts(json!({"t": 5}), timeouts(0, 0, 10)))
        .await
        .unwrap();
    let auth = h.activate(&attempt).await.unwrap();
    h.service
        .finish_attempt(auth, json!({"artifact": "out.tar"}))
        .await
        .unwrap();
    h.distributor.set_status("tok-1", ExecutionResult::default());

    h.advance(Duration::seconds(10)).await.unwrap();
    let done = h.attempt(&attempt).await.unwrap();
    assert_eq!(done.state, AttemptState::Finished);
    // the reported result stands in for a verdict without data
    assert_eq!(done.result.unwrap().data, Some(json!({"artifact": "out.tar"})));
    assert_eq!(h.pending_journal().await.unwrap(), 0);
}

#[tokio::test]
async fn test_pollback_hint_is_a_floor_for_poll_delay() {
    let h = TestHarness::new();
    h.distributor.push_run_outcome(Ok(RunOutcome {
        token: "slow".to_string(),
        pollback_secs: Some(300),
    }));
    let attempt = h
        .start(TestHarness::desc_with_timeouts(json!({"t": 6}), timeouts(0, 0, 10)))
        .await
        .unwrap();
    let auth = h.activate(&attempt).await.unwrap();
    h.service.finish_attempt(auth, json!({})).await.unwrap();

    h.advance(Duration::seconds(10)).await.unwrap();
    h.distributor
        .set_status("slow", ExecutionResult::success(json!({"late": true})));

    h.advance(Duration::seconds(299)).await.unwrap();
    assert_eq!(
        h.current_execution(&attempt).await.unwrap().state,
        ExecutionState::Stopping
    );

    h.advance(Duration::seconds(1)).await.unwrap();
    assert_eq!(h.attempt(&attempt).await.unwrap().state, AttemptState::Finished);
}

#[tokio::test]
async fn test_finished_execution_leaves_no_timer() {
    let h = TestHarness::new();
    let attempt = h
        .start(TestHarness::desc_with_timeouts(json!({"t": 7}), timeouts(60, 60, 60)))
        .await
        .unwrap();
    h.run_to_success(&attempt).await.unwrap();

    assert_eq!(h.pending_journal().await.unwrap(), 0);
    h.advance(Duration::hours(1)).await.unwrap();
    assert_eq!(h.attempt(&attempt).await.unwrap().state, AttemptState::Finished);
}

#[tokio::test]
async fn test_oversized_timeouts_are_rejected_up_front() {
    let h = TestHarness::new();
    let desc = TestHarness::desc_with_timeouts(json!({"t": 8}), timeouts(1 << 50, 0, 0));

    let err = h.start(desc.clone()).await.unwrap_err();
    assert!(matches!(err, DmError::InvalidArgument(_)));

    let request = EnsureGraphDataRequest {
        quests: vec![desc],
        quest_attempts: vec![vec![1]],
        ..Default::default()
    };
    let err = h
        .service
        .ensure_graph_data(&TestHarness::writer(), request)
        .await
        .unwrap_err();
    assert!(matches!(err, DmError::InvalidArgument(_)), "{err}");
    assert_eq!(h.pending_journal().await.unwrap(), 0);

    let longest = TestHarness::desc_with_timeouts(
        json!({"t": 9}),
        timeouts(MAX_PHASE_TIMEOUT_SECS, MAX_PHASE_TIMEOUT_SECS, MAX_PHASE_TIMEOUT_SECS),
    );
    let attempt = h.start(longest).await.unwrap();
    assert_eq!(h.attempt(&attempt).await.unwrap().state, AttemptState::Executing);
}

#[tokio::test]
async fn test_unrepresentable_deadline_dead_letters_instead_of_panicking() {
    let h = TestHarness::new();
    // stored before timeouts were bounded
    let desc = TestHarness::desc_with_timeouts(json!({"t": 10}), timeouts(1 << 50, 0, 0));
    let quest = Quest {
        id: desc.quest_id().unwrap(),
        desc,
        built_by: BTreeSet::new(),
        created: h.clock.now(),
    };
    let attempt = quest.id.attempt(1);
    h.engine()
        .journal(vec![MergeQuest {
            quest,
            attempts: BTreeSet::from([1]),
        }
        .into()])
        .await
        .unwrap();

    h.run_until_idle().await.unwrap();
    assert_eq!(h.store.dead_letters().await.unwrap().len(), 1);
    assert_eq!(h.attempt(&attempt).await.unwrap().state, AttemptState::Scheduling);
    assert_eq!(h.distributor.run_count(), 0);
}

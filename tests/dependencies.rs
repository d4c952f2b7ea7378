//! Dependency registration, propagation and unblocking.

use dm_core::models::{AttemptId, FwdDep, QuestDesc};
use dm_core::orchestration::{EnsureGraphDataRequest, IncludeOptions, WalkLimits};
use dm_core::test_helpers::TestHarness;
use dm_core::{AttemptState, DmError, ExecutionAuth, ExecutionResult, ExecutionState};
use serde_json::json;
use std::collections::{BTreeMap, BTreeSet};

fn named(name: &str) -> QuestDesc {
    TestHarness::desc(json!({ "name": name }))
}

/// Block `auth`'s execution on attempt 1 of each descriptor.
async fn depend_on(
    h: &TestHarness,
    auth: &ExecutionAuth,
    deps: Vec<QuestDesc>,
) -> Vec<AttemptId> {
    let count = deps.len();
    let request = EnsureGraphDataRequest {
        quests: deps,
        quest_attempts: vec![vec![1]; count],
        for_execution: Some(auth.clone()),
        ..Default::default()
    };
    let response = h
        .service
        .ensure_graph_data(&TestHarness::reader(), request)
        .await
        .unwrap();
    assert!(response.accepted);
    assert!(response.should_halt);
    response
        .quest_ids
        .into_iter()
        .map(|quest| quest.attempt(1))
        .collect()
}

#[tokio::test]
async fn test_depender_unblocks_after_all_dependees_finish() {
    let h = TestHarness::new();
    let a = h.start(named("a")).await.unwrap();
    let auth = h.activate(&a).await.unwrap();

    let deps = depend_on(&h, &auth, vec![named("b"), named("c")]).await;
    let (b, c) = (deps[0].clone(), deps[1].clone());

    let blocked = h.attempt(&a).await.unwrap();
    assert_eq!(blocked.dep_map.size(), 2);
    assert_eq!(blocked.dep_map.count_set(), 0);
    let execution = h.current_execution(&a).await.unwrap();
    assert_eq!(execution.state, ExecutionState::Stopping);
    assert!(execution.token.is_none());

    h.run_until_idle().await.unwrap();
    assert_eq!(h.attempt(&b).await.unwrap().state, AttemptState::Executing);
    assert_eq!(h.attempt(&c).await.unwrap().state, AttemptState::Executing);

    // the distributor confirms the blocked execution exited
    h.finish(&auth, ExecutionResult::default()).await.unwrap();
    assert_eq!(h.attempt(&a).await.unwrap().state, AttemptState::Waiting);

    h.run_to_success(&b).await.unwrap();
    let partial = h.attempt(&a).await.unwrap();
    assert_eq!(partial.state, AttemptState::Waiting);
    assert_eq!(partial.dep_map.count_set(), 1);

    h.run_to_success(&c).await.unwrap();
    let rescheduled = h.attempt(&a).await.unwrap();
    assert_eq!(rescheduled.state, AttemptState::Executing);
    assert_eq!(rescheduled.cur_execution, 2);
    assert!(rescheduled.dep_map.is_empty());

    h.run_to_success(&a).await.unwrap();
    assert_eq!(h.attempt(&a).await.unwrap().state, AttemptState::Finished);
}

#[tokio::test]
async fn test_dependees_finishing_first_reschedule_on_exit() {
    let h = TestHarness::new();
    let a = h.start(named("a")).await.unwrap();
    let auth = h.activate(&a).await.unwrap();
    let deps = depend_on(&h, &auth, vec![named("b")]).await;
    h.run_until_idle().await.unwrap();

    h.run_to_success(&deps[0]).await.unwrap();
    let still_executing = h.attempt(&a).await.unwrap();
    assert_eq!(still_executing.state, AttemptState::Executing);
    assert!(still_executing.dep_map.all_set());

    h.finish(&auth, ExecutionResult::default()).await.unwrap();
    let rescheduled = h.attempt(&a).await.unwrap();
    assert_eq!(rescheduled.state, AttemptState::Executing);
    assert_eq!(rescheduled.cur_execution, 2);
}

#[tokio::test]
async fn test_finished_dependencies_do_not_block() {
    let h = TestHarness::new();
    let b = h.start(named("b")).await.unwrap();
    h.run_to_success(&b).await.unwrap();

    let a = h.start(named("a")).await.unwrap();
    let auth = h.activate(&a).await.unwrap();

    let request = EnsureGraphDataRequest {
        raw_attempts: BTreeMap::from([(b.quest.clone(), vec![1])]),
        for_execution: Some(auth.clone()),
        ..Default::default()
    };
    let response = h
        .service
        .ensure_graph_data(&TestHarness::reader(), request.clone())
        .await
        .unwrap();
    assert!(response.accepted);
    assert!(!response.should_halt);
    h.run_until_idle().await.unwrap();

    let edge: FwdDep = dm_core::store::fetch(h.store.as_ref(), &FwdDep::key_for(&a, &b))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(edge.bit_index, None);
    assert_eq!(
        h.current_execution(&a).await.unwrap().state,
        ExecutionState::Running
    );

    // asking again finds the edge recorded and journals nothing
    let again = h
        .service
        .ensure_graph_data(&TestHarness::reader(), request)
        .await
        .unwrap();
    assert!(!again.should_halt);
    assert_eq!(h.pending_journal().await.unwrap(), 0);

    h.complete(&auth, json!({"used": "b"})).await.unwrap();
    assert_eq!(h.attempt(&a).await.unwrap().state, AttemptState::Finished);
}

#[tokio::test]
async fn test_dependency_requests_need_a_running_execution() {
    let h = TestHarness::new();
    let a = h.start(named("a")).await.unwrap();
    let scheduling = h.scheduling_auth(&a).await.unwrap();

    let request = EnsureGraphDataRequest {
        quests: vec![named("b")],
        quest_attempts: vec![vec![1]],
        for_execution: Some(scheduling),
        ..Default::default()
    };
    let err = h
        .service
        .ensure_graph_data(&TestHarness::writer(), request)
        .await
        .unwrap_err();
    assert!(matches!(err, DmError::PermissionDenied(_)));
}

#[tokio::test]
async fn test_self_dependency_is_rejected() {
    let h = TestHarness::new();
    let a = h.start(named("a")).await.unwrap();
    let auth = h.activate(&a).await.unwrap();

    let request = EnsureGraphDataRequest {
        raw_attempts: BTreeMap::from([(a.quest.clone(), vec![1])]),
        for_execution: Some(auth),
        ..Default::default()
    };
    let err = h
        .service
        .ensure_graph_data(&TestHarness::reader(), request)
        .await
        .unwrap_err();
    assert!(matches!(err, DmError::InvalidArgument(_)));
    assert_eq!(h.pending_journal().await.unwrap(), 0);
}

#[tokio::test]
async fn test_completion_propagates_in_batches() {
    let mut config = dm_core::DmConfig::default();
    config.engine.completion_batch_size = 1;
    let h = TestHarness::with_config(config);

    let b = h.start(named("b")).await.unwrap();
    let mut dependers = Vec::new();
    for name in ["a1", "a2", "a3"] {
        let a = h.start(named(name)).await.unwrap();
        let auth = h.activate(&a).await.unwrap();
        let request = EnsureGraphDataRequest {
            raw_attempts: BTreeMap::from([(b.quest.clone(), vec![1])]),
            for_execution: Some(auth.clone()),
            ..Default::default()
        };
        let response = h
            .service
            .ensure_graph_data(&TestHarness::reader(), request)
            .await
            .unwrap();
        assert!(response.should_halt);
        h.run_until_idle().await.unwrap();
        h.finish(&auth, ExecutionResult::default()).await.unwrap();
        dependers.push(a);
    }

    h.run_to_success(&b).await.unwrap();
    for a in &dependers {
        let attempt = h.attempt(a).await.unwrap();
        assert_eq!(attempt.state, AttemptState::Executing);
        assert_eq!(attempt.cur_execution, 2);
    }
}

#[tokio::test]
async fn test_walk_follows_dependency_edges() {
    let h = TestHarness::new();
    let a = h.start(named("a")).await.unwrap();
    let auth = h.activate(&a).await.unwrap();
    let deps = depend_on(&h, &auth, vec![named("b"), named("c")]).await;
    h.run_until_idle().await.unwrap();

    let roots = BTreeMap::from([(a.quest.clone(), BTreeSet::from([1]))]);
    let include = IncludeOptions {
        fwd_deps: true,
        ..Default::default()
    };

    let shallow = h
        .service
        .walk_graph(&TestHarness::reader(), &roots, &WalkLimits::default(), include)
        .await
        .unwrap();
    assert_eq!(shallow.quests.len(), 1);
    let mut expected = deps.clone();
    expected.sort();
    assert_eq!(shallow.attempt(&a).unwrap().fwd_deps, expected);

    let limits = WalkLimits {
        max_depth: 1,
        max_nodes: None,
    };
    let deep = h
        .service
        .walk_graph(&TestHarness::reader(), &roots, &limits, include)
        .await
        .unwrap();
    assert_eq!(deep.quests.len(), 3);
    for dep in &deps {
        assert_eq!(
            deep.attempt(dep).unwrap().state,
            Some(AttemptState::Executing)
        );
    }
    assert!(!deep.truncated);

    let nobody = dm_core::Identity::new("nobody", Vec::<String>::new());
    let err = h
        .service
        .walk_graph(&nobody, &roots, &limits, include)
        .await
        .unwrap_err();
    assert!(matches!(err, DmError::PermissionDenied(_)));
}

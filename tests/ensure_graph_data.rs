//! EnsureGraphData without an execution: creation, templates and validation.

use dm_core::config::TemplateConfig;
use dm_core::models::{Quest, QuestDesc, TemplateSpec};
use dm_core::orchestration::{EnsureGraphDataRequest, TemplateInstance};
use dm_core::store::fetch;
use dm_core::test_helpers::{TestHarness, TEST_DISTRIBUTOR};
use dm_core::{AttemptState, Clock, DmConfig, DmError};
use serde_json::json;
use std::collections::BTreeMap;

fn template(version: &str) -> TemplateConfig {
    TemplateConfig {
        distributor_config_name: TEST_DISTRIBUTOR.to_string(),
        version: version.to_string(),
        defaults: json!({"target": "//app"}),
        distributor_parameters: json!({"pool": "default"}),
        required: vec![],
    }
}

fn harness_with_templates() -> TestHarness {
    let mut config = DmConfig::default();
    config.templates.insert("build".to_string(), template("1"));
    config.templates.insert("build-alias".to_string(), template("1"));
    TestHarness::with_config(config)
}

fn instance(name: &str) -> TemplateInstance {
    TemplateInstance {
        name: name.to_string(),
        parameters: json!({}),
    }
}

#[tokio::test]
async fn test_creates_quests_and_attempts() {
    let h = TestHarness::new();
    let request = EnsureGraphDataRequest {
        quests: vec![
            TestHarness::desc(json!({"step": "fetch"})),
            TestHarness::desc(json!({"step": "build"})),
        ],
        quest_attempts: vec![vec![1, 2]],
        ..Default::default()
    };
    let response = h
        .service
        .ensure_graph_data(&TestHarness::writer(), request)
        .await
        .unwrap();
    assert!(response.accepted);
    assert!(!response.should_halt);
    assert_eq!(response.quest_ids.len(), 2);

    h.run_until_idle().await.unwrap();
    let fetch_quest = &response.quest_ids[0];
    for n in [1, 2] {
        let attempt = h.attempt(&fetch_quest.attempt(n)).await.unwrap();
        assert_eq!(attempt.state, AttemptState::Executing);
    }
    // a quest without requested attempts exists but runs nothing
    let build: Option<Quest> = fetch(h.store.as_ref(), &Quest::key_for(&response.quest_ids[1]))
        .await
        .unwrap();
    assert!(build.is_some());
    assert!(h.attempt(&response.quest_ids[1].attempt(1)).await.is_err());
    assert_eq!(h.distributor.run_count(), 2);
}

#[tokio::test]
async fn test_repeated_requests_are_idempotent() {
    let h = TestHarness::new();
    let request = EnsureGraphDataRequest {
        quests: vec![TestHarness::desc(json!({"step": "test"}))],
        quest_attempts: vec![vec![1]],
        ..Default::default()
    };
    h.service
        .ensure_graph_data(&TestHarness::writer(), request.clone())
        .await
        .unwrap();
    h.run_until_idle().await.unwrap();

    let second = h
        .service
        .ensure_graph_data(&TestHarness::writer(), request.clone())
        .await
        .unwrap();
    assert_eq!(h.pending_journal().await.unwrap(), 0);
    let third = h
        .service
        .ensure_graph_data(&TestHarness::writer(), request)
        .await
        .unwrap();
    assert_eq!(second, third);

    let attempt = second.quest_ids[0].attempt(1);
    let node = second.result.attempt(&attempt).unwrap();
    assert!(!node.dne);
    assert_eq!(node.state, Some(AttemptState::Executing));
    assert_eq!(h.distributor.run_count(), 1);
}

#[tokio::test]
async fn test_missing_attempts_are_reported_before_creation() {
    let h = TestHarness::new();
    let request = EnsureGraphDataRequest {
        quests: vec![TestHarness::desc(json!({"step": "lint"}))],
        quest_attempts: vec![vec![1]],
        ..Default::default()
    };
    let response = h
        .service
        .ensure_graph_data(&TestHarness::writer(), request)
        .await
        .unwrap();

    let node = response
        .result
        .attempt(&response.quest_ids[0].attempt(1))
        .unwrap();
    assert!(node.dne);
    assert_eq!(node.state, None);
}

#[tokio::test]
async fn test_readers_cannot_create() {
    let h = TestHarness::new();
    let request = EnsureGraphDataRequest {
        quests: vec![TestHarness::desc(json!({"step": "deploy"}))],
        quest_attempts: vec![vec![1]],
        ..Default::default()
    };
    let err = h
        .service
        .ensure_graph_data(&TestHarness::reader(), request)
        .await
        .unwrap_err();
    assert!(matches!(err, DmError::PermissionDenied(_)));
    assert_eq!(h.pending_journal().await.unwrap(), 0);
}

#[tokio::test]
async fn test_template_errors_reject_the_whole_request() {
    let h = harness_with_templates();
    let request = EnsureGraphDataRequest {
        quests: vec![TestHarness::desc(json!({"step": "package"}))],
        quest_attempts: vec![vec![1]],
        template_quests: vec![instance("build"), instance("no-such-template")],
        template_attempts: vec![vec![1], vec![1]],
        ..Default::default()
    };
    let response = h
        .service
        .ensure_graph_data(&TestHarness::writer(), request)
        .await
        .unwrap();

    assert!(!response.accepted);
    assert_eq!(response.template_errors.len(), 1);
    assert_eq!(response.template_errors[0].index, 1);
    assert!(response.template_errors[0].error.contains("unknown template"));
    assert_eq!(h.pending_journal().await.unwrap(), 0);
}

#[tokio::test]
async fn test_template_provenance_merges_onto_existing_quest() {
    let h = harness_with_templates();
    let first = h
        .service
        .ensure_graph_data(
            &TestHarness::writer(),
            EnsureGraphDataRequest {
                template_quests: vec![instance("build")],
                template_attempts: vec![vec![1]],
                ..Default::default()
            },
        )
        .await
        .unwrap();
    assert!(first.accepted);
    h.run_until_idle().await.unwrap();

    let alias_request = EnsureGraphDataRequest {
        template_quests: vec![instance("build-alias")],
        ..Default::default()
    };
    let second = h
        .service
        .ensure_graph_data(&TestHarness::writer(), alias_request.clone())
        .await
        .unwrap();
    assert_eq!(first.template_ids, second.template_ids);
    h.run_until_idle().await.unwrap();

    let quest: Quest = fetch(h.store.as_ref(), &Quest::key_for(&first.template_ids[0]))
        .await
        .unwrap()
        .unwrap();
    let names: Vec<&str> = quest.built_by.iter().map(|s| s.name.as_str()).collect();
    assert_eq!(names, vec!["build", "build-alias"]);
    assert!(quest.built_by.contains(&TemplateSpec {
        name: "build".to_string(),
        version: "1".to_string(),
    }));

    // provenance already recorded: nothing to merge
    h.service
        .ensure_graph_data(&TestHarness::writer(), alias_request)
        .await
        .unwrap();
    assert_eq!(h.pending_journal().await.unwrap(), 0);
    assert_eq!(h.distributor.run_count(), 1);
}

#[tokio::test]
async fn test_invalid_arguments() {
    let h = TestHarness::new();
    let writer = TestHarness::writer();

    let mut rejected: QuestDesc = TestHarness::desc(json!({"step": "x"}));
    rejected.distributor_parameters = json!({"reject": true});
    let unknown_distributor = QuestDesc::new("nowhere", json!({}));
    let unknown_quest = Quest::new(TestHarness::desc(json!({"never": "stored"})), h.clock.now())
        .unwrap()
        .id;

    let requests = vec![
        EnsureGraphDataRequest {
            quests: vec![rejected],
            ..Default::default()
        },
        EnsureGraphDataRequest {
            quests: vec![unknown_distributor],
            ..Default::default()
        },
        EnsureGraphDataRequest {
            quests: vec![TestHarness::desc(json!({"step": "y"}))],
            quest_attempts: vec![vec![0]],
            ..Default::default()
        },
        EnsureGraphDataRequest {
            quests: vec![TestHarness::desc(json!({"step": "z"}))],
            quest_attempts: vec![vec![1], vec![1]],
            ..Default::default()
        },
        EnsureGraphDataRequest {
            raw_attempts: BTreeMap::from([(unknown_quest, vec![1])]),
            ..Default::default()
        },
    ];
    for request in requests {
        let err = h
            .service
            .ensure_graph_data(&writer, request)
            .await
            .unwrap_err();
        assert!(matches!(err, DmError::InvalidArgument(_)), "{err}");
    }
    assert_eq!(h.pending_journal().await.unwrap(), 0);
}

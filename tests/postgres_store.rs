//! PostgreSQL graph store. Needs a database:
//!
//! ```bash
//! DATABASE_URL=postgres://localhost/dm_test cargo test --features test-utils --test postgres_store -- --ignored
//! ```

#![cfg(feature = "postgres")]

use chrono::Utc;
use dm_core::models::{Attempt, GroupKey, Model, QuestId};
use dm_core::orchestration::EnsureGraphDataRequest;
use dm_core::registry::DistributorRegistry;
use dm_core::store::{fetch, NewJournalEntry, PgGraphStore};
use dm_core::test_helpers::{ScriptedDistributor, TestHarness, TEST_DISTRIBUTOR, WRITER_GROUP};
use dm_core::{AttemptState, DmConfig, DmService, GraphStore, ManualClock};
use serde_json::json;
use std::sync::Arc;

async fn connect() -> PgGraphStore {
    let url = std::env::var("DATABASE_URL").expect("DATABASE_URL must be set");
    let store = PgGraphStore::connect(&url, 5).await.unwrap();
    store.migrate().await.unwrap();
    store
}

fn unique_quest() -> QuestId {
    QuestId::new(format!("pg-{}", uuid::Uuid::new_v4().simple())).unwrap()
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_transaction_writes_commit_together() {
    let store = connect().await;
    let id = unique_quest().attempt(1);
    let root = GroupKey::Attempt(id.clone());
    let attempt = Attempt::new(id.clone(), Utc::now());

    let mut txn = store.begin(&root).await.unwrap();
    txn.put(&attempt).unwrap();
    txn.put_named(
        "probe",
        NewJournalEntry {
            root: root.clone(),
            name: None,
            body: json!({"type": "noop"}),
            process_after: Some(Utc::now() + chrono::Duration::days(1)),
        },
    );
    store.commit(txn).await.unwrap();

    let stored: Attempt = fetch(&store, &attempt.key()).await.unwrap().unwrap();
    assert_eq!(stored, attempt);
    let named = store
        .pending()
        .await
        .unwrap()
        .into_iter()
        .filter(|e| e.root == root && e.name.as_deref() == Some("probe"))
        .count();
    assert_eq!(named, 1);

    let mut txn = store.begin(&root).await.unwrap();
    txn.cancel_named("probe");
    store.commit(txn).await.unwrap();
    assert!(!store
        .pending()
        .await
        .unwrap()
        .iter()
        .any(|e| e.root == root));
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_dropped_transaction_leaves_no_trace() {
    let store = connect().await;
    let id = unique_quest().attempt(1);
    let attempt = Attempt::new(id.clone(), Utc::now());

    let mut txn = store.begin(&GroupKey::Attempt(id)).await.unwrap();
    txn.put(&attempt).unwrap();
    drop(txn);

    assert!(!store.exists(&attempt.key()).await.unwrap());
}

#[tokio::test]
#[ignore = "requires DATABASE_URL"]
async fn test_attempt_runs_to_finished_on_postgres() {
    let store = Arc::new(connect().await);
    let mut config = DmConfig::default();
    config.acl.writer_groups.insert(WRITER_GROUP.to_string());
    let config = Arc::new(config);

    let distributor = Arc::new(ScriptedDistributor::new());
    let registry = Arc::new(DistributorRegistry::new(config.distributors.clone()));
    registry.register_instance(TEST_DISTRIBUTOR, "1", distributor.clone());
    let clock = Arc::new(ManualClock::new(Utc::now()));
    let service = DmService::from_config(config, store.clone(), registry, clock);

    let request = EnsureGraphDataRequest {
        quests: vec![TestHarness::desc(json!({"run": uuid::Uuid::new_v4().to_string()}))],
        quest_attempts: vec![vec![1]],
        ..Default::default()
    };
    let response = service
        .ensure_graph_data(&TestHarness::writer(), request)
        .await
        .unwrap();
    service.engine().run_until_idle().await.unwrap();

    let id = response.quest_ids[0].attempt(1);
    let execution_id = id.execution(1);
    let auth = distributor
        .runs()
        .into_iter()
        .find(|run| run.auth.id == execution_id)
        .unwrap()
        .auth;
    service
        .activate_execution(auth.clone(), "pg-running")
        .await
        .unwrap();
    let running = dm_core::ExecutionAuth {
        id: auth.id,
        token: "pg-running".to_string(),
    };
    service
        .finish_attempt(running.clone(), json!({"rows": 3}))
        .await
        .unwrap();
    service
        .engine()
        .run_mutation(&dm_core::mutation::FinishExecution {
            execution: running.id,
            result: Default::default(),
        }
        .into())
        .await
        .unwrap();
    service.engine().run_until_idle().await.unwrap();

    let attempt: Attempt = fetch(store.as_ref(), &Attempt::key_for(&id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(attempt.state, AttemptState::Finished);
    assert_eq!(attempt.result.unwrap().data, Some(json!({"rows": 3})));
}

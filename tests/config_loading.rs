//! Layered configuration feeding a running service.

use dm_core::config::{ConfigManager, ConfigurationError};
use dm_core::orchestration::{EnsureGraphDataRequest, TemplateInstance};
use dm_core::test_helpers::{TestHarness, READER_GROUP, WRITER_GROUP};
use serde_json::json;
use std::fs;
use tempfile::TempDir;

const BASE_TOML: &str = r#"
[engine]
worker_count = 2
completion_batch_size = 16

[timeouts]
max_status_polls = 5

[acl]
reader_groups = ["dm-readers"]
writer_groups = ["dm-writers"]

[distributors.test]
kind = "scripted"
version = "1"

[templates.build]
distributor_config_name = "test"
version = "3"
required = ["target"]

[templates.build.defaults]
opt = "release"
"#;

fn write_config(dir: &TempDir, name: &str, contents: &str) {
    fs::write(dir.path().join(name), contents).unwrap();
}

#[test]
fn test_full_file_loads() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "dm.toml", BASE_TOML);

    let manager =
        ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
            .unwrap();
    let config = manager.config();
    assert_eq!(config.engine.worker_count, 2);
    assert_eq!(config.engine.completion_batch_size, 16);
    assert_eq!(config.timeouts.max_status_polls, 5);
    assert!(config.acl.reader_groups.contains(READER_GROUP));
    assert!(config.acl.writer_groups.contains(WRITER_GROUP));

    let template = &config.templates["build"];
    assert_eq!(template.version, "3");
    assert_eq!(template.required, vec!["target".to_string()]);
    assert_eq!(template.defaults, json!({"opt": "release"}));
    assert_eq!(manager.config_directory(), dir.path());
}

#[test]
fn test_environment_variables_override_files() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "dm.toml", "[graph]\nmax_walk_nodes = 50\n");

    std::env::set_var("DM__GRAPH__MAX_WALK_NODES", "75");
    let loaded =
        ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test");
    std::env::remove_var("DM__GRAPH__MAX_WALK_NODES");

    assert_eq!(loaded.unwrap().config().graph.max_walk_nodes, 75);
}

#[test]
fn test_template_for_unknown_distributor_is_rejected() {
    let dir = TempDir::new().unwrap();
    write_config(
        &dir,
        "dm.toml",
        r#"
[distributors.swarming]
kind = "scripted"

[templates.build]
distributor_config_name = "buildbucket"
"#,
    );

    let result =
        ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test");
    assert!(matches!(
        result,
        Err(ConfigurationError::InvalidValue { .. })
    ));
}

#[tokio::test]
async fn test_loaded_templates_render_through_the_service() {
    let dir = TempDir::new().unwrap();
    write_config(&dir, "dm.toml", BASE_TOML);
    let manager =
        ConfigManager::load_from_directory_with_env(Some(dir.path().to_path_buf()), "test")
            .unwrap();
    let h = TestHarness::with_config(manager.config().clone());

    let missing_target = EnsureGraphDataRequest {
        template_quests: vec![TemplateInstance {
            name: "build".to_string(),
            parameters: json!({}),
        }],
        ..Default::default()
    };
    let response = h
        .service
        .ensure_graph_data(&TestHarness::writer(), missing_target)
        .await
        .unwrap();
    assert!(!response.accepted);
    assert!(response.template_errors[0].error.contains("target"));

    let request = EnsureGraphDataRequest {
        template_quests: vec![TemplateInstance {
            name: "build".to_string(),
            parameters: json!({"target": "//server"}),
        }],
        template_attempts: vec![vec![1]],
        ..Default::default()
    };
    let response = h
        .service
        .ensure_graph_data(&TestHarness::writer(), request)
        .await
        .unwrap();
    assert!(response.accepted);
    h.run_until_idle().await.unwrap();

    let runs = h.distributor.runs();
    assert_eq!(runs.len(), 1);
    assert_eq!(
        runs[0].desc.parameters,
        json!({"opt": "release", "target": "//server"})
    );
}

use std::io::Write;

use stepwise_core::config::AppConfig;
use stepwise_engine::workflow::{self, dump, parse, Format};
use stepwise_engine::WorkflowRuntime;
use stepwise_test_utils::{write_workflow, ECHO_WORKFLOW, FANOUT_WORKFLOW, LOOP_WORKFLOW};

#[test]
fn test_load_engine_config_from_file() {
    let toml_content = r#"
workspace = "/tmp/stepwise-test"

[model]
provider = "openai"
model_id = "gpt-4o"
api_key = "sk-test-key"
temperature = 0.2

[model.retry]
max_retries = 2

[execution]
max_iterations = 12
max_parallel = 8

[storage]
path = "/tmp/stepwise-test/custom.db"

[registry]
enabled = true
ttl_secs = 30
endpoint = "http://10.0.0.5:7000"
"#;
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(toml_content.as_bytes()).unwrap();

    let config = AppConfig::load(file.path()).unwrap();
    assert_eq!(config.model.model_id, "gpt-4o");
    assert_eq!(config.model.api_key.as_deref(), Some("sk-test-key"));
    assert_eq!(config.model.retry.as_ref().unwrap().max_retries, 2);
    assert_eq!(config.execution.max_iterations, 12);
    assert_eq!(config.execution.max_parallel, 8);
    // Unset fields keep their defaults.
    assert_eq!(config.execution.node_timeout_secs, 300);
    assert!(config.storage.enabled);
    assert_eq!(
        config.storage_path(),
        std::path::PathBuf::from("/tmp/stepwise-test/custom.db")
    );
    assert!(config.registry.enabled);
    assert_eq!(config.registry.ttl_secs, 30);
    assert_eq!(config.registry.heartbeat_interval_secs, 20);
}

#[test]
fn test_engine_config_env_expansion() {
    std::env::set_var("STEPWISE_TEST_LOADING_KEY", "sk-from-env");
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(b"[model]\napi_key = \"${STEPWISE_TEST_LOADING_KEY}\"\n")
        .unwrap();

    let config = AppConfig::load(file.path()).unwrap();
    assert_eq!(config.model.api_key.as_deref(), Some("sk-from-env"));
}

#[test]
fn test_missing_engine_config_is_an_error() {
    assert!(AppConfig::load(std::path::Path::new("/nonexistent/stepwise.toml")).is_err());
}

#[test]
fn test_workflow_survives_yaml_and_json_reload() {
    for source in [ECHO_WORKFLOW, LOOP_WORKFLOW, FANOUT_WORKFLOW] {
        let original = parse(source, Format::Yaml).unwrap();
        let expected = serde_json::to_value(&original).unwrap();

        for format in [Format::Yaml, Format::Json] {
            let text = dump(&original, format).unwrap();
            let reloaded = parse(&text, format).unwrap();
            assert_eq!(serde_json::to_value(&reloaded).unwrap(), expected);
        }
    }
}

#[test]
fn test_json_workflow_file_compiles() {
    let dir = tempfile::tempdir().unwrap();
    let config = parse(LOOP_WORKFLOW, Format::Yaml).unwrap();
    let path = write_workflow(
        dir.path(),
        "refine.json",
        &dump(&config, Format::Json).unwrap(),
    );

    let loaded = workflow::load(&path).unwrap();
    assert_eq!(loaded.flow.name, "refine");

    let runtime = WorkflowRuntime::new(AppConfig::default());
    assert!(runtime.validate_workflow(&path));
    let graph = runtime.compile(&loaded).unwrap();
    assert_eq!(graph.entry(), "judge");
    assert!(graph.describe().contains("[score >= 8] -> END"));
}

#[test]
fn test_unknown_extension_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_workflow(dir.path(), "echo.txt", ECHO_WORKFLOW);
    assert!(workflow::load(&path).is_err());
    assert!(!WorkflowRuntime::new(AppConfig::default()).validate_workflow(&path));
}

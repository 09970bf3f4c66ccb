use std::time::Duration;

use weft::{EngineConfig, FlowEngine, Phase, RuleAction, WeftError};
use weft_test_utils::config_file;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[engine]
max_steps = 50

[batch]
item_key = "record"
parallel_timeout_ms = 1500
max_concurrency = 8

[recovery]
initial_backoff_ms = 50
max_backoff_ms = 800
jitter = false

[[recovery.rules]]
category = "timeout"
phase = "execute"
action = "retry"
attempts = 5

[[recovery.rules]]
category = "key_not_found"
phase = "prepare"
action = "skip"

[store]
backend = "memory"

[monitoring]
enabled = false
max_records = 10

[events]
capacity = 64
"#;
    let file = config_file(toml_content);
    let config = EngineConfig::load(file.path()).unwrap();

    assert_eq!(config.engine.max_steps, 50);
    assert_eq!(config.batch.item_key, "record");
    assert_eq!(config.batch.parallel_timeout(), Duration::from_millis(1500));
    assert_eq!(config.batch.max_concurrency, 8);
    assert_eq!(config.recovery.max_backoff_ms, 800);
    assert_eq!(config.recovery.rules.len(), 2);
    assert_eq!(config.recovery.rules[0].attempts, 5);
    assert_eq!(config.recovery.rules[1].action, RuleAction::Skip);
    assert_eq!(config.recovery.rules[1].phase, Phase::Prepare);
    assert!(!config.monitoring.enabled);
    assert_eq!(config.monitoring.max_records, 10);
    assert_eq!(config.events.capacity, 64);

    let engine = FlowEngine::from_config(&config).unwrap();
    assert!(engine.monitor().is_none());
}

#[test]
fn test_env_var_expansion_in_file() {
    std::env::set_var("WEFT_TEST_ITEM_KEY", "from_env");
    let file = config_file("[batch]\nitem_key = \"${WEFT_TEST_ITEM_KEY}\"\n");
    let config = EngineConfig::load(file.path()).unwrap();
    assert_eq!(config.batch.item_key, "from_env");
    std::env::remove_var("WEFT_TEST_ITEM_KEY");
}

#[test]
fn test_unknown_store_backend() {
    let file = config_file("[store]\nbackend = \"redis\"\n");
    let config = EngineConfig::load(file.path()).unwrap();
    let err = FlowEngine::from_config(&config).err().unwrap();
    assert!(matches!(err, WeftError::Config(ref m) if m.contains("redis")));
}

#[test]
fn test_bad_rule_action() {
    let err = EngineConfig::from_toml(
        "[[recovery.rules]]\ncategory = \"timeout\"\nphase = \"execute\"\naction = \"explode\"\n",
    )
    .unwrap_err();
    assert!(matches!(err, WeftError::Config(_)));
}

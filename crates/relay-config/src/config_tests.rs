use super::*;
use tempfile::tempdir;

#[test]
fn test_load_nonexistent_returns_none() {
    let dir = tempdir().unwrap();
    let result = RelayConfig::load(&dir.path().join("relay.toml")).unwrap();
    assert!(result.is_none());
}

#[test]
fn test_empty_file_uses_defaults() {
    let config = RelayConfig::from_toml("").unwrap();
    assert_eq!(config.schema_version, CURRENT_SCHEMA_VERSION);
    assert_eq!(config.queue.max_concurrent, 10);
    assert_eq!(config.queue.wait_timeout_seconds, 300);
    assert!(config.queue.max_pending.is_none());
    assert_eq!(config.retry.per_model_retries, 1);
    assert_eq!(config.credentials.cooldown_seconds, 300);
    assert!(config.credentials.honor_retry_after);
    assert_eq!(config.compaction.strategy, CompactionStrategyName::KeepRecent);
    assert_eq!(config.compaction.keep_first, 1);
    assert_eq!(config.compaction.keep_last, 20);
}

#[test]
fn test_parse_full_config() {
    let toml_str = r#"
schema_version = 1

[queue]
max_concurrent = 4
wait_timeout_seconds = 30
max_pending = 100

[retry]
per_model_retries = 2
backoff_initial_ms = 250
backoff_max_ms = 4000

[credentials]
cooldown_seconds = 60
honor_retry_after = false

[[credentials.profiles]]
id = "anthropic-primary"
family = "anthropic"
secret_ref = "env:ANTHROPIC_API_KEY"

[[credentials.profiles]]
id = "openai-primary"
family = "openai"
secret_ref = "env:OPENAI_API_KEY"

[model]
primary = "anthropic/claude-opus-4-5"
fallbacks = ["openai/gpt-4o", "gemini/gemini-pro"]

[compaction]
strategy = "sliding-window"
token_budget = 8000
keep_first = 2
keep_last = 6
overflow_budget_ratio = 0.5
"#;
    let config = RelayConfig::from_toml(toml_str).unwrap();
    assert_eq!(config.queue.max_concurrent, 4);
    assert_eq!(config.queue.wait_timeout(), Duration::from_secs(30));
    assert_eq!(config.queue.max_pending, Some(100));
    assert_eq!(config.retry.per_model_retries, 2);
    assert_eq!(config.retry.backoff_initial(), Duration::from_millis(250));
    assert_eq!(config.credentials.cooldown(), Duration::from_secs(60));
    assert!(!config.credentials.honor_retry_after);
    assert_eq!(config.credentials.profiles.len(), 2);
    assert_eq!(config.credentials.profiles[1].family, "openai");
    assert_eq!(
        config.compaction.strategy,
        CompactionStrategyName::SlidingWindow
    );

    let chain = config.model.chain().unwrap();
    assert_eq!(chain.len(), 3);
    assert_eq!(chain.primary().to_string(), "anthropic/claude-opus-4-5");
    assert_eq!(chain.get(2).unwrap().family(), "gemini");
}

#[test]
fn test_invalid_fallback_reports_entry() {
    let config = RelayConfig::from_toml(
        r#"
[model]
primary = "anthropic/claude"
fallbacks = ["openai/"]
"#,
    )
    .unwrap();
    let err = config.model.chain().unwrap_err();
    assert!(format!("{err:#}").contains("openai/"));
}

#[test]
fn test_unknown_strategy_is_rejected() {
    let result = RelayConfig::from_toml(
        r#"
[compaction]
strategy = "drop-everything"
"#,
    );
    assert!(result.is_err());
}

#[test]
fn test_save_and_load_roundtrip() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("nested").join("relay.toml");

    let mut config = RelayConfig::default();
    config.queue.max_concurrent = 3;
    config.model.fallbacks = vec!["openai/gpt-4o".to_string()];
    config.credentials.profiles.push(CredentialProfileConfig {
        id: "a".to_string(),
        family: "anthropic".to_string(),
        secret_ref: "env:A".to_string(),
    });
    config.save(&path).unwrap();

    let loaded = RelayConfig::load(&path).unwrap().unwrap();
    assert_eq!(loaded.queue.max_concurrent, 3);
    assert_eq!(loaded.model.fallbacks, vec!["openai/gpt-4o".to_string()]);
    assert_eq!(loaded.credentials.profiles, config.credentials.profiles);
}

#[test]
fn test_load_reports_parse_errors_with_path() {
    let dir = tempdir().unwrap();
    let path = dir.path().join("relay.toml");
    std::fs::write(&path, "[queue\nmax_concurrent = ").unwrap();
    let err = RelayConfig::load(&path).unwrap_err();
    assert!(format!("{err:#}").contains("relay.toml"));
}

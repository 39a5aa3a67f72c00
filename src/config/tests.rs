//! Config module tests

use std::io::Write;

use super::*;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("PERCH_TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${PERCH_TEST_VAR_SIMPLE}\"").unwrap();
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("PERCH_TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    // Unset var should use default
    std::env::remove_var("PERCH_TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${PERCH_TEST_VAR_UNSET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"fallback\"");

    // Set var should use env value
    std::env::set_var("PERCH_TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${PERCH_TEST_VAR_SET:-fallback}\"").unwrap();
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("PERCH_TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("PERCH_TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${PERCH_TEST_VAR_MISSING}\"").unwrap();
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_default_config() {
    let config = Config::default();
    assert_eq!(config.server.bind.port(), 42069);
    assert_eq!(config.server.backlog, 10);
    assert_eq!(config.limits.max_connections, 128);
    assert_eq!(config.limits.outbound_channel_capacity, 1024);
    assert_eq!(
        config.handshake.connect_policy(),
        RetryPolicy::new(10, Duration::from_millis(100))
    );
    assert_eq!(config.collector.interval, Duration::from_millis(100));
    assert!(!config.topics.prune_empty);
    config.validate().unwrap();
}

#[test]
fn test_parse_full_config() {
    let toml = r#"
[log]
level = "debug"

[server]
bind = "127.0.0.1:42070"
backlog = 64

[limits]
max_connections = 4
outbound_channel_capacity = 16

[handshake]
connect_retries = 3
connect_interval = "250ms"
disconnect_retries = 5
disconnect_interval = "1s"

[collector]
interval = "50ms"

[topics]
prune_empty = true
"#;

    let config = Config::parse(toml).unwrap();
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:42070");
    assert_eq!(config.limits.max_connections, 4);

    let broker = config.broker_config();
    assert_eq!(broker.backlog, 64);
    assert_eq!(broker.outbound_channel_capacity, 16);
    assert_eq!(
        broker.connect_policy,
        RetryPolicy::new(3, Duration::from_millis(250))
    );
    assert_eq!(
        broker.disconnect_policy,
        RetryPolicy::new(5, Duration::from_secs(1))
    );
    assert_eq!(broker.collector_interval, Duration::from_millis(50));
    assert!(broker.prune_empty_topics);
}

#[test]
fn test_parse_partial_config_keeps_defaults() {
    let config = Config::parse("[limits]\nmax_connections = 2\n").unwrap();
    assert_eq!(config.limits.max_connections, 2);
    assert_eq!(config.limits.outbound_channel_capacity, 1024);
    assert_eq!(config.handshake.disconnect_retries, 10);
}

#[test]
fn test_validation_errors() {
    for toml in [
        "[limits]\nmax_connections = 0\n",
        "[limits]\noutbound_channel_capacity = 0\n",
        "[handshake]\nconnect_retries = 0\n",
        "[handshake]\ndisconnect_interval = \"0s\"\n",
        "[collector]\ninterval = \"0ms\"\n",
        "[log]\nlevel = \"loud\"\n",
    ] {
        let err = Config::parse(toml).unwrap_err();
        assert!(
            matches!(err, ConfigError::Validation(_)),
            "{} gave {}",
            toml,
            err
        );
    }
}

#[test]
fn test_bad_duration_is_parse_error() {
    let err = Config::parse("[collector]\ninterval = \"soon\"\n").unwrap_err();
    assert!(matches!(err, ConfigError::Parse(_)));
}

#[test]
fn test_load_config_with_env_substitution() {
    std::env::set_var("PERCH_TEST_BIND_HOST", "127.0.0.1");
    std::env::set_var("PERCH_TEST_BIND_PORT", "42071");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[server]
bind = "${{PERCH_TEST_BIND_HOST}}:${{PERCH_TEST_BIND_PORT}}"

[handshake]
connect_retries = ${{PERCH_TEST_RETRIES:-4}}
"#
    )
    .unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.server.bind.to_string(), "127.0.0.1:42071");
    assert_eq!(config.handshake.connect_retries, 4);
    assert_eq!(config.handshake.connect_interval, Duration::from_millis(100));

    std::env::remove_var("PERCH_TEST_BIND_HOST");
    std::env::remove_var("PERCH_TEST_BIND_PORT");
}

#[test]
fn test_load_env_override() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "[topics]\nprune_empty = false").unwrap();

    std::env::set_var("PERCHMQ__TOPICS__PRUNE_EMPTY", "true");
    let config = Config::load(file.path());
    std::env::remove_var("PERCHMQ__TOPICS__PRUNE_EMPTY");

    assert!(config.unwrap().topics.prune_empty);
}

#[test]
fn test_load_missing_file_uses_defaults() {
    let dir = tempfile::tempdir().unwrap();
    let config = Config::load(dir.path().join("absent.toml")).unwrap();
    assert_eq!(config.server.bind.port(), 42069);
    assert_eq!(config.limits.max_connections, 128);
}

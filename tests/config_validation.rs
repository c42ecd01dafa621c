//! Integration tests for configuration validation and loading

#![allow(clippy::expect_used, clippy::unwrap_used)]

use fastsocket::config::{
    ClientConfig, DuplicateKeyPolicy, LoggingConfig, NetworkConfig, ServerConfig, TransportConfig,
};
use std::time::Duration;
use tracing::Level;

#[test]
fn test_default_config_validates() {
    let config = NetworkConfig::default();
    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Default config should be valid, but got errors: {:?}",
        errors
    );
}

#[test]
fn test_invalid_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = "invalid_address".to_string();

    let errors = config.validate();
    assert!(!errors.is_empty(), "Should have validation errors");
    assert!(errors.iter().any(|e| e.contains("Invalid server address")));
}

#[test]
fn test_empty_server_address() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("cannot be empty")));
}

#[test]
fn test_short_connection_timeout() {
    let mut config = NetworkConfig::default();
    config.server.connection_timeout = Duration::from_millis(50);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connection timeout too short")));
}

#[test]
fn test_long_connection_timeout() {
    let mut config = NetworkConfig::default();
    config.server.connection_timeout = Duration::from_secs(400);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Connection timeout too long")));
}

#[test]
fn test_shutdown_timeout_bounds() {
    let mut config = NetworkConfig::default();
    config.server.shutdown_timeout = Duration::from_millis(200);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Shutdown timeout too short")));

    config.server.shutdown_timeout = Duration::from_secs(120);
    assert!(config
        .validate()
        .iter()
        .any(|e| e.contains("Shutdown timeout too long")));
}

#[test]
fn test_zero_max_connections() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connections must be greater than 0")));
}

#[test]
fn test_high_max_connections_warning() {
    let mut config = NetworkConfig::default();
    config.server.max_connections = 150_000;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max connections very high")));
}

#[test]
fn test_invalid_client_address() {
    let mut config = NetworkConfig::default();
    config.client.address = "not:a:valid:address".to_string();

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Invalid client address")));
}

#[test]
fn test_overlong_connection_key() {
    let mut config = NetworkConfig::default();
    config.client.connection_key = Some("k".repeat(300));

    let errors = config.validate();
    assert!(errors.iter().any(|e| e.contains("Connection key too long")));
}

#[test]
fn test_short_response_timeout() {
    let mut config = NetworkConfig::default();
    config.client.response_timeout = Duration::from_millis(1);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Response timeout too short")));
}

#[test]
fn test_zero_max_payload_size() {
    let mut config = NetworkConfig::default();
    config.transport.max_payload_size = 0;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max payload size cannot be 0")));
}

#[test]
fn test_tiny_max_payload_size() {
    let mut config = NetworkConfig::default();
    config.transport.max_payload_size = 512;

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Max payload size too small")));
}

#[test]
fn test_empty_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name cannot be empty")));
}

#[test]
fn test_long_app_name() {
    let mut config = NetworkConfig::default();
    config.logging.app_name = "a".repeat(100);

    let errors = config.validate();
    assert!(errors
        .iter()
        .any(|e| e.contains("Application name too long")));
}

#[test]
fn test_validate_strict_with_valid_config() {
    let config = NetworkConfig::default();
    assert!(config.validate_strict().is_ok());
}

#[test]
fn test_validate_strict_with_invalid_config() {
    let mut config = NetworkConfig::default();
    config.server.address = String::new();

    let result = config.validate_strict();
    assert!(result.is_err());

    if let Err(e) = result {
        let error_str = e.to_string();
        assert!(error_str.contains("Configuration validation failed"));
    }
}

#[test]
fn test_multiple_validation_errors() {
    let mut config = NetworkConfig::default();

    config.server.address = String::new();
    config.server.max_connections = 0;
    config.client.address = String::new();
    config.transport.max_payload_size = 0;
    config.logging.app_name = String::new();

    let errors = config.validate();
    assert!(
        errors.len() >= 5,
        "Expected at least 5 errors, got {}: {:?}",
        errors.len(),
        errors
    );
}

#[test]
fn test_valid_production_config() {
    let config = NetworkConfig {
        server: ServerConfig {
            address: "0.0.0.0:8765".to_string(),
            connection_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
            max_connections: 10_000,
            duplicate_key_policy: DuplicateKeyPolicy::Reject,
        },
        client: ClientConfig {
            address: "10.0.0.5:8765".to_string(),
            connection_key: Some("/workers/7".to_string()),
            connection_timeout: Duration::from_secs(5),
            response_timeout: Duration::from_secs(30),
        },
        transport: TransportConfig {
            max_payload_size: 4 * 1024 * 1024,
            send_timeout: Duration::from_secs(5),
        },
        logging: LoggingConfig {
            app_name: "production-server".to_string(),
            log_level: Level::INFO,
            json_format: true,
        },
    };

    let errors = config.validate();
    assert!(
        errors.is_empty(),
        "Production config should be valid, got: {:?}",
        errors
    );
}

#[test]
fn test_toml_roundtrip_preserves_settings() {
    let config = NetworkConfig::default_with_overrides(|c| {
        c.server.duplicate_key_policy = DuplicateKeyPolicy::Reject;
        c.client.connection_key = Some("lobby".to_string());
        c.client.response_timeout = Duration::from_millis(1500);
        c.logging.log_level = Level::DEBUG;
    });

    let text = config.to_toml().expect("config should serialize");
    assert!(text.contains("duplicate_key_policy = \"reject\""));
    assert!(text.contains("response_timeout = 1500"));

    let parsed = NetworkConfig::from_toml(&text).expect("config should parse");
    assert_eq!(parsed.server.duplicate_key_policy, DuplicateKeyPolicy::Reject);
    assert_eq!(parsed.client.connection_key.as_deref(), Some("lobby"));
    assert_eq!(parsed.client.response_timeout, Duration::from_millis(1500));
    assert_eq!(parsed.logging.log_level, Level::DEBUG);
}

#[test]
fn test_partial_toml_falls_back_to_defaults() {
    let parsed = NetworkConfig::from_toml(
        r#"
        [server]
        address = "127.0.0.1:9000"
        connection_timeout = 2000
        shutdown_timeout = 5000
        max_connections = 10
        "#,
    )
    .expect("partial config should parse");

    assert_eq!(parsed.server.address, "127.0.0.1:9000");
    assert_eq!(parsed.server.max_connections, 10);
    assert_eq!(
        parsed.server.duplicate_key_policy,
        DuplicateKeyPolicy::ReplaceExisting
    );
    assert_eq!(parsed.client.address, ClientConfig::default().address);
    assert!(parsed.client.connection_key.is_none());
}

#[test]
fn test_invalid_toml_is_config_error() {
    let result = NetworkConfig::from_toml("[server\naddress = ");
    assert!(matches!(
        result,
        Err(fastsocket::ProtocolError::ConfigError(_))
    ));
}

#[test]
fn test_example_config_parses() {
    let example = NetworkConfig::example_config().expect("default config should render");
    assert!(example.contains("[server]"));
    let parsed = NetworkConfig::from_toml(&example).expect("example config should parse");
    assert!(parsed.validate().is_empty());
}

use switchboard_logging::{init_logging_from_config, init_simple_tracing, LogFormat, LogLevel, LoggingConfig};

#[test]
fn test_logging_config_integration() {
    let yaml_config = r#"
level: debug
format: json
include_location: true
"#;

    let config: LoggingConfig = serde_yaml::from_str(yaml_config).unwrap();

    assert_eq!(config.level, LogLevel::Debug);
    assert_eq!(config.format, LogFormat::Json);
    assert!(config.include_location);
    assert!(config.include_target);

    init_logging_from_config(&config).unwrap();
    tracing::info!(tenant_id = "acme", "logging initialised");
}

#[test]
fn test_repeated_initialisation_is_harmless() {
    let config = LoggingConfig {
        format: LogFormat::Compact,
        ..Default::default()
    };
    init_logging_from_config(&config).unwrap();
    init_logging_from_config(&config).unwrap();
    init_simple_tracing("warn").unwrap();
}

#[test]
fn test_minimal_logging_config() {
    let config = LoggingConfig::default();

    assert_eq!(config.level, LogLevel::Info);
    assert_eq!(config.format, LogFormat::Text);
    assert!(config.filter.is_none());
}

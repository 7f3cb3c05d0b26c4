//! Integration tests for logging and configuration wiring

use std::collections::HashMap;

use bridge_traits::time::LogLevel;
use core_runtime::config::{properties, UploadConfig};
use core_runtime::logging::{init_logging, redact_if_sensitive, LogFormat, LoggingConfig};

#[test]
fn test_logging_config_from_properties() {
    let mut props = HashMap::new();
    props.insert(properties::DEBUG_LOG.to_string(), "true".to_string());
    let upload = UploadConfig::from_properties("/srv/content", &props).unwrap();

    let config = LoggingConfig::from(&upload).with_format(LogFormat::Compact);

    assert_eq!(config.level, LogLevel::Debug);
    assert_eq!(config.format, LogFormat::Compact);
    assert!(config.redact_secrets);
}

#[test]
fn test_credential_fields_are_redacted() {
    assert_eq!(redact_if_sensitive("secret_key", "abc"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("access_key", "AKIA"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("credentials", "x"), "[REDACTED]");
    assert_eq!(redact_if_sensitive("media_name", "live/a.mp4"), "live/a.mp4");
}

#[test]
fn test_init_logging_twice_fails() {
    let config = LoggingConfig::default().with_format(LogFormat::Compact);
    assert!(init_logging(config.clone()).is_ok());
    assert!(init_logging(config).is_err());
}

//! 配置模块集成测试
//!
//! 测试 YAML / TOML 加载与校验

use creditron::config::{ChargingConfig, ConflictPolicy, RequestPolicy};
use creditron::error::ChargingError;
use std::io::Write;

/// 从 YAML 加载
#[test]
fn test_load_yaml() {
    let yaml = r#"
usage_threshold: 0.9
request_policy:
  type: fixed
  units: 1048576
enforcement_lag_tolerance_bytes: 2048
reauth_conflict_policy: reject
retry:
  max_attempts: 5
"#;
    let config = ChargingConfig::from_yaml_str(yaml).unwrap();
    assert_eq!(config.usage_threshold, 0.9);
    assert_eq!(config.request_policy, RequestPolicy::Fixed { units: 1_048_576 });
    assert_eq!(config.enforcement_lag_tolerance_bytes, 2048);
    assert_eq!(config.reauth_conflict_policy, ConflictPolicy::Reject);
    assert_eq!(config.retry.max_attempts, 5);
    assert_eq!(config.ccr_timeout_ms, ChargingConfig::default().ccr_timeout_ms);
}

/// 从 TOML 文件加载
#[test]
fn test_load_toml_file() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
usage_threshold = 0.75
idle_timeout_secs = 60

[logging]
filter = "creditron=debug"
"#
    )
    .unwrap();

    let config = ChargingConfig::from_file(file.path()).unwrap();
    assert_eq!(config.usage_threshold, 0.75);
    assert_eq!(config.idle_timeout().as_secs(), 60);
    assert_eq!(config.logging.filter, "creditron=debug");
}

/// 非法配置被拒绝
#[test]
fn test_invalid_config_rejected() {
    assert!(matches!(
        ChargingConfig::from_yaml_str("usage_threshold: 1.5"),
        Err(ChargingError::ConfigError(_))
    ));
    assert!(matches!(
        ChargingConfig::from_toml_str("ccr_timeout_ms = 0"),
        Err(ChargingError::ConfigError(_))
    ));
    assert!(matches!(
        ChargingConfig::from_yaml_str("usage_threshold: [1"),
        Err(ChargingError::YamlError(_))
    ));

    let file = tempfile::Builder::new().suffix(".ini").tempfile().unwrap();
    assert!(matches!(
        ChargingConfig::from_file(file.path()),
        Err(ChargingError::ConfigError(_))
    ));
}
